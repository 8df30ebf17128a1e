//! End-to-end engine behaviour against a scripted upstream, in virtual time.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Duration};

use fate_engine::config::Config;
use fate_engine::engine::FateEngine;
use fate_engine::feed::FeedMode;
use fate_engine::hash::Hash;
use fate_engine::hexagram::decode;
use fate_engine::reveal::RevealEvent;
use fate_engine::upstream::{BlockHead, HeightSubscription, UpstreamFeed};

fn hash_of(n: u8) -> String {
    format!("0x{}", hex::encode([n; 32]))
}

#[derive(Default)]
struct ScriptedUpstream {
    latest: Option<BlockHead>,
    blocks: Mutex<HashMap<u64, String>>,
    streams: Mutex<VecDeque<mpsc::Receiver<u64>>>,
}

impl ScriptedUpstream {
    fn unreachable() -> Self {
        Self::default()
    }

    fn at(hash: String, height: u64) -> Self {
        Self {
            latest: Some(BlockHead { hash, height }),
            ..Self::default()
        }
    }

    fn block(&self, height: u64, hash: String) {
        self.blocks.lock().unwrap().insert(height, hash);
    }

    fn stream(&self) -> mpsc::Sender<u64> {
        let (tx, rx) = mpsc::channel(16);
        self.streams.lock().unwrap().push_back(rx);
        tx
    }
}

#[async_trait]
impl UpstreamFeed for ScriptedUpstream {
    async fn latest_block(&self) -> Result<BlockHead> {
        self.latest.clone().ok_or_else(|| anyhow!("connection refused"))
    }

    async fn block_by_height(&self, height: u64) -> Result<BlockHead> {
        let hash = self
            .blocks
            .lock()
            .unwrap()
            .get(&height)
            .cloned()
            .ok_or_else(|| anyhow!("unknown block {}", height))?;
        Ok(BlockHead { hash, height })
    }

    async fn subscribe_new_heights(&self) -> Result<HeightSubscription> {
        let rx = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("subscribe refused"))?;
        Ok(HeightSubscription::new(rx, None))
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

fn test_config() -> Config {
    Config {
        connect_retries: 0,
        max_reconnects: 0,
        sim_seed: Some(11),
        decoy_seed: Some(11),
        ..Config::default()
    }
}

fn drain(rx: &mut broadcast::Receiver<RevealEvent>) -> Vec<RevealEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn failed_connect_falls_back_to_simulated_blocks() {
    let upstream: Arc<dyn UpstreamFeed> = Arc::new(ScriptedUpstream::unreachable());
    let engine = FateEngine::with_upstream(&test_config(), Some(upstream));
    sleep(Duration::from_millis(50)).await;

    let snap = engine.snapshot();
    assert!(!snap.is_live);
    assert_eq!(snap.mode, FeedMode::Simulating);
    assert_eq!(snap.block_number, 0);

    // one synthetic period later there is a fresh hash, fully revealed
    sleep(Duration::from_millis(12_000 + 1_000)).await;
    let snap = engine.snapshot();
    assert_eq!(snap.block_number, 1);
    assert_ne!(snap.current_hash, Hash::genesis());
    assert!(!snap.is_revealing);
    assert_eq!(
        snap.display_hexagram,
        Some(decode(snap.current_hash.as_str()).unwrap())
    );

    sleep(Duration::from_millis(12_000)).await;
    assert_eq!(engine.snapshot().block_number, 2);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn live_block_is_revealed_and_supersedes_genesis() {
    let upstream = Arc::new(ScriptedUpstream::at(hash_of(0xa1), 100));
    let _heights = upstream.stream();
    let engine = FateEngine::with_upstream(&test_config(), Some(upstream));
    let mut events = engine.subscribe_reveals();
    sleep(Duration::from_millis(2_000)).await;

    let snap = engine.snapshot();
    assert!(snap.is_live);
    assert_eq!(snap.mode, FeedMode::Live);
    assert_eq!(snap.block_number, 100);
    assert_eq!(snap.current_hash.as_str(), hash_of(0xa1));
    assert_eq!(snap.display_hexagram, Some(decode(&hash_of(0xa1)).unwrap()));
    assert!(!snap.is_revealing);
    assert_eq!(snap.step_count, 15);

    let settled: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| e.is_final())
        .collect();
    assert_eq!(settled.len(), 1);
    assert_eq!(
        settled[0],
        RevealEvent::Settled {
            cycle: snap.reveal_cycle,
            hexagram: decode(&hash_of(0xa1)).unwrap(),
        }
    );
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rapid_blocks_settle_only_on_the_newest() {
    let upstream = Arc::new(ScriptedUpstream::at(hash_of(1), 100));
    let heights = upstream.stream();
    upstream.block(101, hash_of(2));
    upstream.block(102, hash_of(3));
    let engine = FateEngine::with_upstream(&test_config(), Some(upstream));
    sleep(Duration::from_millis(2_000)).await;
    let mut events = engine.subscribe_reveals();

    heights.send(101).await.unwrap();
    sleep(Duration::from_millis(10)).await;
    heights.send(102).await.unwrap();
    sleep(Duration::from_millis(2_000)).await;

    let seen = drain(&mut events);
    let finals: Vec<_> = seen.iter().filter(|e| e.is_final()).collect();
    assert_eq!(finals.len(), 1);
    match finals[0] {
        RevealEvent::Settled { hexagram, .. } => {
            assert_eq!(*hexagram, decode(&hash_of(3)).unwrap());
        }
        other => panic!("expected settled, got {:?}", other),
    }
    assert_eq!(
        seen.iter()
            .filter(|e| matches!(e, RevealEvent::Aborted { .. }))
            .count(),
        1
    );

    let snap = engine.snapshot();
    assert_eq!(snap.block_number, 102);
    assert_eq!(snap.display_hexagram, Some(decode(&hash_of(3)).unwrap()));
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_every_publication() {
    let upstream = Arc::new(ScriptedUpstream::at(hash_of(7), 500));
    let heights = upstream.stream();
    upstream.block(501, hash_of(8));
    let engine = FateEngine::with_upstream(&test_config(), Some(upstream));
    sleep(Duration::from_millis(5)).await;

    let feed = engine.feed_state();
    let reveal = engine.reveal_state();
    engine.shutdown().await;

    let block_at_stop = feed.borrow().block_number;
    let reveal_at_stop = reveal.borrow().clone();
    assert!(heights.is_closed());
    assert!(heights.send(501).await.is_err());

    sleep(Duration::from_secs(60)).await;
    assert_eq!(feed.borrow().block_number, block_at_stop);
    assert_eq!(*reveal.borrow(), reveal_at_stop);
}

#[tokio::test(start_paused = true)]
async fn seeded_offline_engines_agree() {
    let cfg = Config {
        offline: true,
        ..test_config()
    };
    let a = FateEngine::start(&cfg).unwrap();
    let b = FateEngine::start(&cfg).unwrap();
    sleep(Duration::from_millis(12_000 * 3 + 1_000)).await;

    let (sa, sb) = (a.snapshot(), b.snapshot());
    assert_eq!(sa.block_number, 3);
    assert_eq!(sa.current_hash, sb.current_hash);
    assert_eq!(sa.display_hexagram, sb.display_hexagram);
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn changed_yields_snapshots_until_shutdown() {
    let cfg = Config {
        offline: true,
        ..test_config()
    };
    let mut engine = FateEngine::start(&cfg).unwrap();
    let mut steps = Vec::new();
    while steps.len() < 16 {
        let snap = engine.changed().await.unwrap();
        if snap.is_revealing && snap.step_count > 0 {
            steps.push(snap.step_count);
        }
        if !snap.is_revealing && snap.reveal_cycle == 1 && snap.step_count == 15 {
            break;
        }
    }
    assert!(!steps.is_empty());
    assert!(steps.windows(2).all(|w| w[0] <= w[1]));
    assert!(!engine.output_enabled());
    engine.enable_output();
    assert!(engine.snapshot().output_enabled);
    engine.shutdown().await;
}
