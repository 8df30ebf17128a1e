//! Loopback JSON-RPC endpoint for exercising the HTTP feed.
//!
//! One request per connection, answered with `Connection: close`.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub enum Reply {
    Result(Value),
    RpcError(i64, &'static str),
    Status(u16),
    /// Accept the request and never answer.
    Hang,
}

pub struct StubEndpoint {
    pub url: String,
    hits: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl StubEndpoint {
    /// Requests received so far, answered or not.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for StubEndpoint {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// `handler(n, method, params)` decides the reply for the `n`th request (0-based).
pub async fn serve<F>(handler: F) -> StubEndpoint
where
    F: Fn(usize, &str, &Value) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let hits = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(handler);

    let counter = hits.clone();
    let task = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = handler.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                let _ = answer(stream, counter, handler.as_ref()).await;
            });
        }
    });

    StubEndpoint { url, hits, task }
}

/// Endpoint that accepts every request and never replies.
pub async fn hanging() -> StubEndpoint {
    serve(|_, _, _| Reply::Hang).await
}

/// Endpoint answering `eth_getBlockByNumber` with a fixed block.
pub async fn fixed_block(hash: &str, height: u64) -> StubEndpoint {
    let block = json!({ "hash": hash, "number": format!("0x{:x}", height) });
    serve(move |_, method, _| match method {
        "eth_getBlockByNumber" => Reply::Result(block.clone()),
        "eth_blockNumber" => Reply::Result(json!(format!("0x{:x}", height))),
        _ => Reply::RpcError(-32601, "method not found"),
    })
    .await
}

async fn answer<F>(
    mut stream: TcpStream,
    hits: Arc<AtomicUsize>,
    handler: &F,
) -> std::io::Result<()>
where
    F: Fn(usize, &str, &Value) -> Reply,
{
    let Some(request) = read_request(&mut stream).await? else {
        return Ok(());
    };
    let n = hits.fetch_add(1, Ordering::SeqCst);
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    let (status, body) = match handler(n, method, &params) {
        Reply::Result(result) => (200, json!({ "jsonrpc": "2.0", "id": id, "result": result })),
        Reply::RpcError(code, message) => (
            200,
            json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } }),
        ),
        Reply::Status(code) => (code, json!({ "error": "stub" })),
        Reply::Hang => {
            std::future::pending::<()>().await;
            return Ok(());
        }
    };

    let text = body.to_string();
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        if status == 200 { "OK" } else { "Error" },
        text.len(),
        text
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<Value>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
    let length = head
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let body_start = header_end + 4;
    while buf.len() < body_start + length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(serde_json::from_slice(&buf[body_start..body_start + length]).ok())
}
