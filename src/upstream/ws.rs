use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::logging::{log, obj, v_str, Domain, Level};
use crate::scheduler::TaskHandle;
use crate::upstream::{parse_quantity, HeightSubscription};

const SUBSCRIBE_ID: u64 = 1;

#[derive(Debug, Deserialize)]
struct Notification {
    method: String,
    params: NotificationParams,
}

#[derive(Debug, Deserialize)]
struct NotificationParams {
    subscription: String,
    result: HeadPayload,
}

#[derive(Debug, Deserialize)]
struct HeadPayload {
    number: String,
}

/// `eth_subscribe("newHeads")` over a WebSocket. Resolves once the node has
/// acknowledged the subscription; afterwards each head's height is forwarded.
pub async fn subscribe_new_heads(url: &Url, capacity: usize) -> Result<HeightSubscription> {
    let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .with_context(|| format!("ws connect {}", url))?;
    let (mut write, mut read) = socket.split();

    let request = json!({
        "jsonrpc": "2.0",
        "id": SUBSCRIBE_ID,
        "method": "eth_subscribe",
        "params": ["newHeads"],
    });
    write.send(Message::Text(request.to_string())).await?;

    let subscription = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                if let Some(id) = parse_ack(&text)? {
                    break id;
                }
            }
            Some(Ok(Message::Close(_))) | None => bail!("socket closed before subscription ack"),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    };

    log(
        Level::Info,
        Domain::Feed,
        "ws_subscribed",
        obj(&[("url", v_str(url.as_str())), ("subscription", v_str(&subscription))]),
    );

    let (tx, rx) = mpsc::channel(capacity);
    let task = TaskHandle::spawn(move |live| async move {
        // Held so the sink half lives as long as the reader.
        let _write = write;
        loop {
            let msg = tokio::select! {
                biased;
                _ = live.cancelled() => break,
                msg = read.next() => msg,
            };
            match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(height) = parse_new_head(&text, &subscription) {
                        if !live.is_alive() || tx.send(height).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log(
                        Level::Warn,
                        Domain::Feed,
                        "ws_error",
                        obj(&[("error", v_str(&e.to_string()))]),
                    );
                    break;
                }
            }
        }
    });

    Ok(HeightSubscription::new(rx, Some(task)))
}

/// `Ok(Some(id))` for our ack, `Ok(None)` for unrelated frames, `Err` if the
/// node refused.
fn parse_ack(text: &str) -> Result<Option<String>> {
    let value: Value = serde_json::from_str(text).context("malformed ws frame")?;
    if value.get("id").and_then(Value::as_u64) != Some(SUBSCRIBE_ID) {
        return Ok(None);
    }
    if let Some(err) = value.get("error") {
        bail!("eth_subscribe refused: {}", err);
    }
    value
        .get("result")
        .and_then(Value::as_str)
        .map(|s| Some(s.to_string()))
        .ok_or_else(|| anyhow!("eth_subscribe ack without id"))
}

fn parse_new_head(text: &str, subscription: &str) -> Option<u64> {
    let note: Notification = serde_json::from_str(text).ok()?;
    if note.method != "eth_subscription" || note.params.subscription != subscription {
        return None;
    }
    parse_quantity(&note.params.result.number).ok()
}
