//! The hash source: Connecting → Live, falling back to Simulating.
//!
//! ```text
//!              ok                     lost (closed / stalled / breaker open)
//! Connecting ──────▶ Live ─────────────────────────────▶ Connecting (retry)
//!     │                                                       │
//!     │ unreachable / malformed / timeout      reconnects used up
//!     ▼                                                       ▼
//! Simulating ◀────────────────────────────────────────────────┘
//! ```
//!
//! Simulating is terminal for the session. The block number never decreases
//! across any of these transitions.

use anyhow::{anyhow, bail, Result};
use serde_json::json;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{timeout, Duration};

use crate::config::FeedConfig;
use crate::error::FateError;
use crate::feed::simulator::SyntheticGenerator;
use crate::feed::{FeedMode, FeedState};
use crate::hash::Hash;
use crate::logging::{log, log_block, log_feed_skip, log_mode_change, obj, v_str, Domain, Level};
use crate::reliability::circuit::CircuitBreaker;
use crate::scheduler::{spawn_interval, Liveness, TaskHandle};
use crate::upstream::retry::{retry_async, RetryConfig};
use crate::upstream::{HeightSubscription, UpstreamFeed};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Owns the [`FeedState`]; everyone else gets a read-only receiver.
pub struct HashSource {
    state: watch::Receiver<FeedState>,
    task: Option<TaskHandle>,
}

impl HashSource {
    /// Starts in Connecting. With no upstream the source simulates right away.
    pub fn start(cfg: FeedConfig, upstream: Option<Arc<dyn UpstreamFeed>>) -> Self {
        let (tx, rx) = watch::channel(FeedState::genesis());
        let writer = Arc::new(FeedWriter { tx });
        let task = TaskHandle::spawn(move |live| run(cfg, upstream, writer, live));
        Self {
            state: rx,
            task: Some(task),
        }
    }

    pub fn state(&self) -> FeedState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedState> {
        self.state.clone()
    }

    /// Releases the subscription or cancels the simulation timer. Nothing
    /// publishes after this returns.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.shutdown(SHUTDOWN_GRACE).await;
        }
        log(Level::Info, Domain::Feed, "shutdown", obj(&[]));
    }
}

/// Single writer of the feed state; enforces the publication invariants.
struct FeedWriter {
    tx: watch::Sender<FeedState>,
}

impl FeedWriter {
    fn block_number(&self) -> u64 {
        self.tx.borrow().block_number
    }

    fn set_mode(&self, to: FeedMode, reason: &str) {
        let mut from = to;
        self.tx.send_if_modified(|state| {
            if state.mode == to {
                return false;
            }
            from = state.mode;
            state.mode = to;
            state.is_live = to == FeedMode::Live;
            true
        });
        if from != to {
            log_mode_change(from, to, reason);
        }
    }

    /// Publishes only while `live` and only if the height doesn't go
    /// backwards. Returns whether the state changed.
    fn publish(&self, hash: Hash, height: u64, live: &Liveness) -> bool {
        let mut published = false;
        self.tx.send_if_modified(|state| {
            if !live.is_alive() {
                return false;
            }
            published = advance(state, &hash, height);
            published
        });
        if published {
            log_block(&hash, height, self.tx.borrow().is_live);
        }
        published
    }

    /// Switch to Live and publish the connect-time head in one send, so no
    /// reader sees `is_live` next to a hash from before the connection.
    fn go_live(&self, hash: Hash, height: u64, live: &Liveness) {
        let mut from = FeedMode::Live;
        let mut published = false;
        self.tx.send_if_modified(|state| {
            if !live.is_alive() {
                return false;
            }
            from = state.mode;
            state.mode = FeedMode::Live;
            state.is_live = true;
            published = advance(state, &hash, height);
            published || from != FeedMode::Live
        });
        if from != FeedMode::Live {
            log_mode_change(from, FeedMode::Live, "connected");
        }
        if published {
            log_block(&hash, height, true);
        }
    }
}

/// Moves the state to `height` unless that would go backwards. Equal heights
/// are only accepted before anything has been published.
fn advance(state: &mut FeedState, hash: &Hash, height: u64) -> bool {
    let first = state.revision == 0;
    if height < state.block_number || (height == state.block_number && !first) {
        return false;
    }
    state.current_hash = hash.clone();
    state.block_number = height;
    state.revision += 1;
    true
}

enum LiveExit {
    Shutdown,
    Lost(String),
}

async fn run(
    cfg: FeedConfig,
    upstream: Option<Arc<dyn UpstreamFeed>>,
    feed: Arc<FeedWriter>,
    live: Liveness,
) {
    let fallback_reason = match upstream {
        Some(upstream) => {
            let mut reconnects = 0u32;
            loop {
                let connected = tokio::select! {
                    biased;
                    _ = live.cancelled() => return,
                    r = connect(&cfg, upstream.as_ref()) => r,
                };
                let (hash, height, sub) = match connected {
                    Ok(session) => session,
                    Err(e) => {
                        break FateError::FeedUnavailable {
                            reason: format!("{} via {}", e, upstream.describe()),
                        };
                    }
                };

                feed.go_live(hash, height, &live);

                match run_live(&cfg, upstream.as_ref(), &feed, sub, &live).await {
                    LiveExit::Shutdown => return,
                    LiveExit::Lost(reason) if reconnects < cfg.max_reconnects => {
                        reconnects += 1;
                        let why = format!("reconnect {}: {}", reconnects, reason);
                        feed.set_mode(FeedMode::Connecting, &why);
                    }
                    LiveExit::Lost(reason) => {
                        break FateError::FeedUnavailable {
                            reason: format!("{} after {} reconnects", reason, reconnects),
                        };
                    }
                }
            }
        }
        None => FateError::FeedUnavailable {
            reason: "no upstream configured".to_string(),
        },
    };

    log(
        Level::Warn,
        Domain::Feed,
        fallback_reason.kind(),
        obj(&[("reason", v_str(&fallback_reason.to_string()))]),
    );
    run_simulation(&cfg, feed, &live).await;
}

/// Latest head plus a live subscription, or an error if either can't be had.
async fn connect(
    cfg: &FeedConfig,
    upstream: &dyn UpstreamFeed,
) -> Result<(Hash, u64, HeightSubscription)> {
    let limit = cfg.connect_timeout;
    let retry = RetryConfig::with_retries(cfg.connect_retries);
    let head = retry_async(&retry, "latest_block", || async move {
        match timeout(limit, upstream.latest_block()).await {
            Ok(head) => head,
            Err(_) => Err(anyhow!("latest_block timed out after {:?}", limit)),
        }
    })
    .await?;
    let hash = Hash::parse(&head.hash)?;

    let sub = match timeout(limit, upstream.subscribe_new_heights()).await {
        Ok(sub) => sub?,
        Err(_) => bail!("subscribe timed out after {:?}", limit),
    };
    Ok((hash, head.height, sub))
}

async fn run_live(
    cfg: &FeedConfig,
    upstream: &dyn UpstreamFeed,
    feed: &FeedWriter,
    mut sub: HeightSubscription,
    live: &Liveness,
) -> LiveExit {
    let mut breaker = CircuitBreaker::new(cfg.max_fetch_failures);

    let exit = loop {
        let next = tokio::select! {
            biased;
            _ = live.cancelled() => break LiveExit::Shutdown,
            n = timeout(cfg.stall_timeout, sub.next()) => n,
        };
        let height = match next {
            Ok(Some(h)) => h,
            Ok(None) => break LiveExit::Lost("subscription closed".to_string()),
            Err(_) => break LiveExit::Lost(format!("no new height for {:?}", cfg.stall_timeout)),
        };

        if height <= feed.block_number() {
            log(
                Level::Debug,
                Domain::Feed,
                "duplicate_height",
                obj(&[("height", json!(height)), ("current", json!(feed.block_number()))]),
            );
            continue;
        }

        let fetched = tokio::select! {
            biased;
            _ = live.cancelled() => break LiveExit::Shutdown,
            r = timeout(cfg.connect_timeout, upstream.block_by_height(height)) => r,
        };
        let head = fetched
            .map_err(|_| anyhow!("fetch timed out after {:?}", cfg.connect_timeout))
            .and_then(|r| r)
            .and_then(|head| Ok((Hash::parse(&head.hash)?, head.height)));

        match head {
            Ok((hash, h)) => {
                breaker.record_success();
                if !feed.publish(hash, h, live) {
                    log_feed_skip(h, "stale_height", "upstream returned an already-seen height");
                }
            }
            Err(e) => {
                let err = FateError::FeedTransient {
                    height,
                    reason: format!("{:#}", e),
                };
                log_feed_skip(height, err.kind(), &err.to_string());
                breaker.record_failure(height);
                if !breaker.allow() {
                    break LiveExit::Lost(format!(
                        "{} consecutive fetch failures, last at height {}",
                        breaker.failures(),
                        breaker.last_failed_height().unwrap_or(height)
                    ));
                }
            }
        }
    };

    sub.unsubscribe();
    exit
}

async fn run_simulation(cfg: &FeedConfig, feed: Arc<FeedWriter>, live: &Liveness) {
    feed.set_mode(FeedMode::Simulating, "fallback");

    let mut generator = SyntheticGenerator::new(cfg.sim_seed);
    log(
        Level::Info,
        Domain::Feed,
        "simulation_start",
        obj(&[
            ("from_height", json!(feed.block_number())),
            ("period_ms", json!(cfg.sim_period.as_millis() as u64)),
            ("seeded", json!(generator.is_seeded())),
        ]),
    );
    let writer = feed.clone();
    let source_live = live.clone();
    let mut timer = spawn_interval(cfg.sim_period, move |_| {
        let height = writer.block_number() + 1;
        if writer.publish(generator.hash_for(height), height, &source_live) {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        }
    });

    live.cancelled().await;
    timer.cancel();
}
