use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use url::Url;

use crate::config::Config;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::scheduler::{delayed_interval, TaskHandle};
use crate::upstream::retry::{
    is_permanent, is_retryable_http_error, is_retryable_network_error, Permanent,
};
use crate::upstream::{
    format_quantity, parse_quantity, ws, BlockHead, HeightSubscription, UpstreamFeed,
};

pub const HEIGHT_CHANNEL_CAPACITY: usize = 64;

const MIN_REQUEST_TIMEOUT: Duration = Duration::from_millis(50);

/// Heights replayed at most per poll when the node jumps ahead.
const MAX_CATCH_UP: u64 = 16;

/// Ethereum JSON-RPC upstream: HTTP for block queries, polling or a
/// WebSocket `newHeads` subscription for new heights.
pub struct RpcFeed {
    inner: Arc<RpcClient>,
    ws_url: Option<Url>,
    poll_interval: Duration,
    max_poll_failures: u32,
}

struct RpcClient {
    client: Client,
    endpoints: Vec<Url>,
    /// Index of the endpoint that last answered.
    active: AtomicUsize,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcBlock {
    hash: Option<String>,
    number: Option<String>,
}

impl RpcFeed {
    pub fn new(cfg: &Config) -> Result<Self> {
        let endpoints = cfg
            .rpc_urls
            .iter()
            .map(|raw| parse_endpoint(raw, &["http", "https"]))
            .collect::<Result<Vec<_>>>()?;
        if endpoints.is_empty() {
            bail!("no JSON-RPC endpoints configured");
        }
        let ws_url = cfg
            .ws_url
            .as_deref()
            .map(|raw| parse_endpoint(raw, &["ws", "wss"]))
            .transpose()?;
        // The caller's budget covers one pass over every endpoint, so a hung
        // endpoint must give up in time for the next one to answer.
        let request_timeout = (Duration::from_millis(cfg.connect_timeout_ms)
            / endpoints.len() as u32)
            .max(MIN_REQUEST_TIMEOUT);
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("building http client")?;

        Ok(Self {
            inner: Arc::new(RpcClient {
                client,
                endpoints,
                active: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
            }),
            ws_url,
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            max_poll_failures: cfg.max_fetch_failures.max(1),
        })
    }

    fn poll_heights(&self) -> HeightSubscription {
        let (tx, rx) = mpsc::channel(HEIGHT_CHANNEL_CAPACITY);
        let inner = self.inner.clone();
        let period = self.poll_interval;
        let max_failures = self.max_poll_failures;

        let task = TaskHandle::spawn(move |live| async move {
            let mut ticker = delayed_interval(period);
            let mut last: Option<u64> = None;
            let mut failures = 0u32;
            loop {
                tokio::select! {
                    biased;
                    _ = live.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match inner.block_number().await {
                    Ok(height) => {
                        failures = 0;
                        let from = match last {
                            Some(prev) if height <= prev => continue,
                            Some(prev) => (prev + 1).max(height.saturating_sub(MAX_CATCH_UP - 1)),
                            None => height,
                        };
                        for h in from..=height {
                            if !live.is_alive() || tx.send(h).await.is_err() {
                                return;
                            }
                        }
                        last = Some(height);
                    }
                    Err(e) => {
                        failures += 1;
                        log(
                            Level::Warn,
                            Domain::Feed,
                            "poll_failed",
                            obj(&[
                                ("error", v_str(&format!("{:#}", e))),
                                ("consecutive", json!(failures)),
                            ]),
                        );
                        // Dropping the sender closes the subscription.
                        if failures >= max_failures {
                            break;
                        }
                    }
                }
            }
        });

        HeightSubscription::new(rx, Some(task))
    }
}

impl RpcClient {
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let count = self.endpoints.len();
        let start = self.active.load(Ordering::Relaxed) % count;
        let mut retryable: Option<anyhow::Error> = None;
        let mut permanent: Option<anyhow::Error> = None;

        for offset in 0..count {
            let idx = (start + offset) % count;
            let endpoint = &self.endpoints[idx];
            match self.call_at(endpoint, method, &params).await {
                Ok(value) => {
                    if idx != start {
                        self.active.store(idx, Ordering::Relaxed);
                        log(
                            Level::Info,
                            Domain::Feed,
                            "endpoint_failover",
                            obj(&[
                                ("from", v_str(self.endpoints[start].as_str())),
                                ("to", v_str(endpoint.as_str())),
                            ]),
                        );
                    }
                    return Ok(value);
                }
                Err(e) => {
                    let e = e.context(format!("{} via {}", method, endpoint));
                    if is_permanent(&e) {
                        permanent = Some(e);
                    } else {
                        retryable = Some(e);
                    }
                }
            }
        }

        // Worth another attempt if any endpoint might still come good.
        Err(retryable
            .or(permanent)
            .unwrap_or_else(|| anyhow!("no endpoints configured")))
    }

    async fn call_at<T: DeserializeOwned>(
        &self,
        url: &Url,
        method: &str,
        params: &Value,
    ) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let resp = self
            .client
            .post(url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if is_retryable_network_error(&e) {
                    anyhow!("request failed: {}", e)
                } else {
                    Permanent(format!("request failed: {}", e)).into()
                }
            })?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            let detail = format!("http {}: {}", status, text.chars().take(200).collect::<String>());
            if is_retryable_http_error(status) {
                bail!(detail);
            }
            return Err(Permanent(detail).into());
        }

        let parsed: RpcResponse<T> = resp
            .json()
            .await
            .map_err(|e| Permanent(format!("malformed JSON-RPC response: {}", e)))?;
        if let Some(err) = parsed.error {
            return Err(Permanent(format!("rpc error {}: {}", err.code, err.message)).into());
        }
        parsed
            .result
            .ok_or_else(|| anyhow!("{} returned no result", method))
    }

    async fn block(&self, tag: &str) -> Result<BlockHead> {
        let block: RpcBlock = self.call("eth_getBlockByNumber", json!([tag, false])).await?;
        block_head(block)
    }

    async fn block_number(&self) -> Result<u64> {
        let raw: String = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&raw)
    }
}

fn block_head(block: RpcBlock) -> Result<BlockHead> {
    let hash = block.hash.ok_or_else(|| anyhow!("block without hash"))?;
    let number = block.number.ok_or_else(|| anyhow!("block without number"))?;
    Ok(BlockHead {
        hash,
        height: parse_quantity(&number)?,
    })
}

fn parse_endpoint(raw: &str, schemes: &[&str]) -> Result<Url> {
    let url = Url::parse(raw.trim()).with_context(|| format!("invalid endpoint {:?}", raw))?;
    if !schemes.contains(&url.scheme()) {
        bail!("endpoint {} must use one of {:?}", url, schemes);
    }
    Ok(url)
}

#[async_trait]
impl UpstreamFeed for RpcFeed {
    async fn latest_block(&self) -> Result<BlockHead> {
        self.inner.block("latest").await
    }

    async fn block_by_height(&self, height: u64) -> Result<BlockHead> {
        self.inner.block(&format_quantity(height)).await
    }

    async fn subscribe_new_heights(&self) -> Result<HeightSubscription> {
        match &self.ws_url {
            Some(url) => ws::subscribe_new_heads(url, HEIGHT_CHANNEL_CAPACITY).await,
            None => Ok(self.poll_heights()),
        }
    }

    fn describe(&self) -> String {
        let idx = self.inner.active.load(Ordering::Relaxed) % self.inner.endpoints.len();
        self.inner.endpoints[idx].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::stub::{self, Reply};
    use tokio::time::timeout;

    fn hash_of(n: u8) -> String {
        format!("0x{}", hex::encode([n; 32]))
    }

    fn cfg_for(urls: &[&str], connect_timeout_ms: u64) -> Config {
        Config {
            rpc_urls: urls.iter().map(|u| u.to_string()).collect(),
            connect_timeout_ms,
            poll_interval_ms: 20,
            max_fetch_failures: 2,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_hung_endpoint_fails_over_within_connect_budget() {
        let hung = stub::hanging().await;
        let healthy = stub::fixed_block(&hash_of(7), 100).await;
        let cfg = cfg_for(&[hung.url.as_str(), healthy.url.as_str()], 600);
        let feed = RpcFeed::new(&cfg).unwrap();
        let budget = cfg.feed().connect_timeout;

        let head = timeout(budget, feed.latest_block())
            .await
            .expect("failover must finish inside the connect timeout")
            .unwrap();
        assert_eq!(head.height, 100);
        assert_eq!(head.hash, hash_of(7));
        assert_eq!(feed.describe(), format!("{}/", healthy.url));

        // later calls start from the endpoint that answered
        let again = timeout(budget, feed.latest_block()).await.unwrap().unwrap();
        assert_eq!(again.height, 100);
        assert_eq!(hung.hits(), 1);
        assert_eq!(healthy.hits(), 2);
    }

    #[tokio::test]
    async fn test_fails_over_on_error_status() {
        let busy = stub::serve(|_, _, _| Reply::Status(503)).await;
        let healthy = stub::fixed_block(&hash_of(2), 42).await;
        let urls = [busy.url.as_str(), healthy.url.as_str()];
        let feed = RpcFeed::new(&cfg_for(&urls, 2_000)).unwrap();

        let head = feed.block_by_height(42).await.unwrap();
        assert_eq!(head.height, 42);
        assert_eq!(feed.describe(), format!("{}/", healthy.url));
        assert_eq!(busy.hits(), 1);
    }

    #[tokio::test]
    async fn test_error_classification() {
        let bad_request = stub::serve(|_, _, _| Reply::Status(400)).await;
        let busy = stub::serve(|_, _, _| Reply::Status(503)).await;
        let refused = stub::serve(|_, _, _| Reply::RpcError(-32000, "header not found")).await;
        let garbled = stub::serve(|_, _, _| Reply::Result(json!("not a block"))).await;

        let latest = |urls: &[&str]| {
            let feed = RpcFeed::new(&cfg_for(urls, 2_000)).unwrap();
            async move { feed.latest_block().await.unwrap_err() }
        };

        assert!(is_permanent(&latest(&[bad_request.url.as_str()]).await));
        assert!(is_permanent(&latest(&[refused.url.as_str()]).await));
        assert!(is_permanent(&latest(&[garbled.url.as_str()]).await));
        assert!(!is_permanent(&latest(&[busy.url.as_str()]).await));
        // one endpoint worth retrying keeps the whole call retryable
        assert!(!is_permanent(&latest(&[bad_request.url.as_str(), busy.url.as_str()]).await));
    }

    #[tokio::test]
    async fn test_poll_catches_up_within_window_then_closes() {
        let node = stub::serve(|n, method, _| match (method, n) {
            ("eth_blockNumber", 0) | ("eth_blockNumber", 1) => Reply::Result(json!("0x64")),
            ("eth_blockNumber", 2) => Reply::Result(json!("0x80")),
            _ => Reply::Status(503),
        })
        .await;
        let feed = RpcFeed::new(&cfg_for(&[node.url.as_str()], 1_000)).unwrap();
        let mut sub = feed.subscribe_new_heights().await.unwrap();

        let mut seen = Vec::new();
        while let Some(h) = timeout(Duration::from_secs(5), sub.next()).await.unwrap() {
            seen.push(h);
        }
        // 100, then a jump to 128 replays only the last MAX_CATCH_UP heights
        let mut expected = vec![100];
        expected.extend(113..=128);
        assert_eq!(seen, expected);
        // three answers, then two failed polls close the stream
        assert_eq!(node.hits(), 5);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_polling() {
        let node = stub::fixed_block(&hash_of(1), 10).await;
        let feed = RpcFeed::new(&cfg_for(&[node.url.as_str()], 1_000)).unwrap();
        let mut sub = feed.subscribe_new_heights().await.unwrap();
        assert_eq!(timeout(Duration::from_secs(5), sub.next()).await.unwrap(), Some(10));

        sub.unsubscribe();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let settled = node.hits();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(node.hits(), settled);
    }

    #[test]
    fn test_block_head_requires_hash_and_number() {
        let ok = block_head(RpcBlock {
            hash: Some("0xabc".into()),
            number: Some("0x10".into()),
        })
        .unwrap();
        assert_eq!(ok.height, 16);
        assert_eq!(ok.hash, "0xabc");

        assert!(block_head(RpcBlock { hash: None, number: Some("0x1".into()) }).is_err());
        assert!(block_head(RpcBlock { hash: Some("0x1".into()), number: None }).is_err());
    }

    #[test]
    fn test_response_parsing() {
        let ok: RpcResponse<RpcBlock> = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"result":{"hash":"0x01","number":"0x2a","miner":"0x0"}}"#,
        )
        .unwrap();
        assert_eq!(ok.result.unwrap().number.as_deref(), Some("0x2a"));

        let err: RpcResponse<RpcBlock> = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"header not found"}}"#,
        )
        .unwrap();
        assert!(err.result.is_none());
        assert_eq!(err.error.unwrap().code, -32000);

        let null: RpcResponse<RpcBlock> =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap();
        assert!(null.result.is_none());
    }

    #[test]
    fn test_endpoint_validation() {
        let mut cfg = Config::default();
        cfg.rpc_urls = vec!["https://rpc.example.org".into()];
        cfg.ws_url = Some("wss://rpc.example.org/ws".into());
        let feed = RpcFeed::new(&cfg).unwrap();
        assert_eq!(feed.describe(), "https://rpc.example.org/");

        cfg.rpc_urls = vec!["ftp://rpc.example.org".into()];
        assert!(RpcFeed::new(&cfg).is_err());

        cfg.rpc_urls = vec!["https://rpc.example.org".into()];
        cfg.ws_url = Some("https://not-a-socket".into());
        assert!(RpcFeed::new(&cfg).is_err());

        cfg.rpc_urls.clear();
        cfg.ws_url = None;
        assert!(RpcFeed::new(&cfg).is_err());
    }
}
