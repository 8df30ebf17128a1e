use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::scheduler::TaskHandle;

pub mod retry;
pub mod rpc;
pub mod ws;

#[cfg(test)]
pub(crate) mod stub;

/// A block as reported upstream. The hash is raw text here; it only becomes a
/// [`crate::hash::Hash`] once the feed has normalized it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BlockHead {
    pub hash: String,
    pub height: u64,
}

/// Live stream of new block heights. Heights arrive in notification order and
/// may repeat; the consumer dedups.
#[derive(Debug)]
pub struct HeightSubscription {
    rx: mpsc::Receiver<u64>,
    task: Option<TaskHandle>,
}

impl HeightSubscription {
    /// `task` is whatever produces into `rx`; it is canceled on unsubscribe.
    pub fn new(rx: mpsc::Receiver<u64>, task: Option<TaskHandle>) -> Self {
        Self { rx, task }
    }

    /// `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<u64> {
        self.rx.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.rx.close();
        if let Some(mut task) = self.task.take() {
            task.cancel();
        }
    }
}

/// Anything that can answer "latest block", "block at height" and "tell me
/// about new heights".
#[async_trait]
pub trait UpstreamFeed: Send + Sync {
    async fn latest_block(&self) -> Result<BlockHead>;
    async fn block_by_height(&self, height: u64) -> Result<BlockHead>;
    async fn subscribe_new_heights(&self) -> Result<HeightSubscription>;

    /// Endpoint label for logs.
    fn describe(&self) -> String;
}

/// Parse a `0x`-prefixed JSON-RPC quantity.
pub fn parse_quantity(raw: &str) -> Result<u64> {
    let digits = raw
        .strip_prefix("0x")
        .ok_or_else(|| anyhow::anyhow!("quantity without 0x prefix: {}", raw))?;
    if digits.is_empty() {
        anyhow::bail!("empty quantity");
    }
    Ok(u64::from_str_radix(digits, 16)?)
}

pub fn format_quantity(value: u64) -> String {
    format!("0x{:x}", value)
}
