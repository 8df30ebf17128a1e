//! Composition root: one hash source feeding one reveal sequencer.

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::Duration;

use crate::config::Config;
use crate::feed::{FeedMode, FeedState, HashSource};
use crate::hash::Hash;
use crate::hexagram::Hexagram;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::reveal::{RevealEvent, RevealSequencer, RevealState};
use crate::scheduler::{Liveness, TaskHandle};
use crate::upstream::rpc::RpcFeed;
use crate::upstream::UpstreamFeed;

const FORWARDER_GRACE: Duration = Duration::from_millis(500);

/// Process-wide "consumers may produce output" switch, flipped on the first
/// user interaction. Cloned into whoever needs it; starts off.
#[derive(Debug, Clone, Default)]
pub struct OutputGate(Arc<AtomicBool>);

impl OutputGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true only for the call that actually opened the gate.
    pub fn enable(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a renderer needs, read in one go.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub current_hash: Hash,
    pub block_number: u64,
    pub is_live: bool,
    pub mode: FeedMode,
    pub display_hexagram: Option<Hexagram>,
    pub is_revealing: bool,
    pub step_count: u32,
    pub reveal_cycle: u64,
    pub fault: Option<String>,
    pub output_enabled: bool,
}

impl EngineSnapshot {
    fn compose(feed: &FeedState, reveal: &RevealState, output_enabled: bool) -> Self {
        Self {
            current_hash: feed.current_hash.clone(),
            block_number: feed.block_number,
            is_live: feed.is_live,
            mode: feed.mode,
            display_hexagram: reveal.displayed_hexagram.clone(),
            is_revealing: reveal.is_revealing,
            step_count: reveal.step_count,
            reveal_cycle: reveal.cycle,
            fault: reveal.fault.as_ref().map(|e| e.to_string()),
            output_enabled,
        }
    }
}

pub struct FateEngine {
    feed: Option<HashSource>,
    forwarder: Option<TaskHandle>,
    feed_rx: watch::Receiver<FeedState>,
    reveal_rx: watch::Receiver<RevealState>,
    reveal_events: broadcast::Sender<RevealEvent>,
    output: OutputGate,
}

impl FateEngine {
    /// Builds the JSON-RPC upstream from `cfg` unless running offline.
    pub fn start(cfg: &Config) -> Result<Self> {
        let upstream: Option<Arc<dyn UpstreamFeed>> = if cfg.offline {
            None
        } else {
            Some(Arc::new(RpcFeed::new(cfg)?))
        };
        Ok(Self::with_upstream(cfg, upstream))
    }

    pub fn with_upstream(cfg: &Config, upstream: Option<Arc<dyn UpstreamFeed>>) -> Self {
        let label = match &upstream {
            Some(u) => u.describe(),
            None => "offline".to_string(),
        };
        log(
            Level::Info,
            Domain::System,
            "engine_start",
            obj(&[("upstream", v_str(&label))]),
        );

        let feed = HashSource::start(cfg.feed(), upstream);
        let sequencer = RevealSequencer::new(cfg.reveal());
        let feed_rx = feed.subscribe();
        let reveal_rx = sequencer.watch();
        let reveal_events = sequencer.event_sender();

        let forward_rx = feed.subscribe();
        let forwarder = TaskHandle::spawn(move |live| forward(forward_rx, sequencer, live));

        Self {
            feed: Some(feed),
            forwarder: Some(forwarder),
            feed_rx,
            reveal_rx,
            reveal_events,
            output: OutputGate::new(),
        }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let feed = self.feed_rx.borrow().clone();
        let reveal = self.reveal_rx.borrow().clone();
        EngineSnapshot::compose(&feed, &reveal, self.output.is_enabled())
    }

    /// Waits for the next change on either side and returns the new snapshot.
    /// `None` once the engine has been torn down.
    pub async fn changed(&mut self) -> Option<EngineSnapshot> {
        let ok = tokio::select! {
            r = self.feed_rx.changed() => r.is_ok(),
            r = self.reveal_rx.changed() => r.is_ok(),
        };
        if ok {
            Some(self.snapshot())
        } else {
            None
        }
    }

    pub fn feed_state(&self) -> watch::Receiver<FeedState> {
        self.feed_rx.clone()
    }

    pub fn reveal_state(&self) -> watch::Receiver<RevealState> {
        self.reveal_rx.clone()
    }

    /// Every reveal publication in order, one event per decoy.
    pub fn subscribe_reveals(&self) -> broadcast::Receiver<RevealEvent> {
        self.reveal_events.subscribe()
    }

    pub fn output_gate(&self) -> OutputGate {
        self.output.clone()
    }

    pub fn enable_output(&self) {
        if self.output.enable() {
            log(Level::Info, Domain::System, "output_enabled", obj(&[]));
        }
    }

    pub fn output_enabled(&self) -> bool {
        self.output.is_enabled()
    }

    /// Stops the forwarder (and with it the reveal timer), then the feed.
    /// No state changes after this returns.
    pub async fn shutdown(mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.shutdown(FORWARDER_GRACE).await;
        }
        if let Some(feed) = self.feed.take() {
            feed.shutdown().await;
        }
        log(Level::Info, Domain::System, "engine_stopped", obj(&[]));
    }
}

/// Feeds every new revision into the sequencer. The initial state (genesis,
/// or whatever was already published) gets revealed too.
async fn forward(
    mut feed: watch::Receiver<FeedState>,
    mut sequencer: RevealSequencer,
    live: Liveness,
) {
    let initial = feed.borrow_and_update().clone();
    let mut last_revision = initial.revision;
    sequencer.begin(initial.current_hash.as_str());

    loop {
        tokio::select! {
            biased;
            _ = live.cancelled() => break,
            r = feed.changed() => {
                if r.is_err() {
                    break;
                }
            }
        }
        let state = feed.borrow_and_update().clone();
        // mode flips alone don't warrant a reveal
        if state.revision == last_revision {
            continue;
        }
        last_revision = state.revision;
        let cycle = sequencer.begin(state.current_hash.as_str());
        log(
            Level::Debug,
            Domain::Reveal,
            "reveal_begin",
            obj(&[
                ("cycle", json!(cycle)),
                ("block", json!(state.block_number)),
                ("hash", v_str(&state.current_hash.short())),
            ]),
        );
    }
    sequencer.cancel();
}
