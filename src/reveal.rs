//! Timed reveal: `steps` random decoy hexagrams, then the real one.
//!
//! Each call to [`RevealSequencer::begin`] opens a new cycle. Publications
//! happen under the state lock and carry their cycle number; anything from a
//! cycle other than the current one is dropped there, so a preempted reveal
//! can never publish after its successor started.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use serde_json::json;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::config::RevealConfig;
use crate::error::FateError;
use crate::hash::Hash;
use crate::hexagram::{decode_hash, Hexagram};
use crate::logging::{log, log_settled, obj, v_str, Domain, Level};
use crate::scheduler::{spawn_interval, TaskHandle};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealState {
    pub cycle: u64,
    /// Target text as captured when the cycle began.
    pub target: Option<String>,
    pub displayed_hexagram: Option<Hexagram>,
    pub is_revealing: bool,
    pub step_count: u32,
    #[serde(skip)]
    pub fault: Option<FateError>,
}

impl RevealState {
    fn idle() -> Self {
        Self {
            cycle: 0,
            target: None,
            displayed_hexagram: None,
            is_revealing: false,
            step_count: 0,
            fault: None,
        }
    }
}

/// Ordered record of every publication, for consumers that need each step
/// (audio triggers) rather than the latest value.
#[derive(Debug, Clone, PartialEq)]
pub enum RevealEvent {
    Started { cycle: u64, target: String },
    Decoy { cycle: u64, step: u32, hexagram: Hexagram },
    Settled { cycle: u64, hexagram: Hexagram },
    Fault { cycle: u64, error: FateError },
    Aborted { cycle: u64 },
}

impl RevealEvent {
    pub fn cycle(&self) -> u64 {
        match self {
            RevealEvent::Started { cycle, .. }
            | RevealEvent::Decoy { cycle, .. }
            | RevealEvent::Settled { cycle, .. }
            | RevealEvent::Fault { cycle, .. }
            | RevealEvent::Aborted { cycle } => *cycle,
        }
    }

    /// Settled or Fault: the one terminal publication of a cycle.
    pub fn is_final(&self) -> bool {
        matches!(self, RevealEvent::Settled { .. } | RevealEvent::Fault { .. })
    }
}

pub struct RevealSequencer {
    cfg: RevealConfig,
    state: Arc<watch::Sender<RevealState>>,
    events: broadcast::Sender<RevealEvent>,
    rng: StdRng,
    active: Option<TaskHandle>,
}

impl RevealSequencer {
    pub fn new(cfg: RevealConfig) -> Self {
        let (state, _) = watch::channel(RevealState::idle());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let rng = match cfg.decoy_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            cfg,
            state: Arc::new(state),
            events,
            rng,
            active: None,
        }
    }

    pub fn watch(&self) -> watch::Receiver<RevealState> {
        self.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<RevealEvent> {
        self.events.subscribe()
    }

    /// Lets an owner hand out event receivers after the sequencer itself has
    /// moved into a task.
    pub(crate) fn event_sender(&self) -> broadcast::Sender<RevealEvent> {
        self.events.clone()
    }

    pub fn state(&self) -> RevealState {
        self.state.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.as_ref().map_or(false, |t| t.is_alive())
    }

    /// Start revealing `target`, abandoning any reveal in progress. The target
    /// is captured here and not re-read. Returns the new cycle number.
    pub fn begin(&mut self, target: &str) -> u64 {
        let preempted = match self.active.take() {
            Some(mut task) => {
                let running = task.is_alive();
                task.cancel();
                running
            }
            None => false,
        };

        let mut cycle = 0;
        let events = &self.events;
        self.state.send_modify(|s| {
            if preempted {
                let _ = events.send(RevealEvent::Aborted { cycle: s.cycle });
            }
            s.cycle += 1;
            s.target = Some(target.to_string());
            s.is_revealing = true;
            s.step_count = 0;
            s.fault = None;
            cycle = s.cycle;
            let _ = events.send(RevealEvent::Started {
                cycle,
                target: target.to_string(),
            });
        });
        if preempted {
            let aborted = FateError::RevealAborted { cycle: cycle - 1 };
            log(
                Level::Debug,
                Domain::Reveal,
                aborted.kind(),
                obj(&[("cycle", json!(cycle - 1)), ("next", json!(cycle))]),
            );
        }

        let rng = StdRng::from_rng(&mut self.rng).unwrap_or_else(|_| StdRng::from_entropy());
        let mut tick = RevealTick {
            cycle,
            steps: self.cfg.steps,
            target: target.to_string(),
            rng,
            state: self.state.clone(),
            events: self.events.clone(),
        };
        self.active = Some(spawn_interval(self.cfg.interval, move |n| tick.step(n)));
        cycle
    }

    /// Stop the current reveal without starting another.
    pub fn cancel(&mut self) {
        if let Some(mut task) = self.active.take() {
            task.cancel();
        }
    }
}

/// One cycle's worth of tick state, owned by its timer.
struct RevealTick {
    cycle: u64,
    steps: u32,
    target: String,
    rng: StdRng,
    state: Arc<watch::Sender<RevealState>>,
    events: broadcast::Sender<RevealEvent>,
}

impl RevealTick {
    fn step(&mut self, n: u64) -> ControlFlow<()> {
        if n <= self.steps as u64 {
            self.decoy(n as u32)
        } else {
            self.settle();
            ControlFlow::Break(())
        }
    }

    fn decoy(&mut self, step: u32) -> ControlFlow<()> {
        let hexagram = decode_hash(&Hash::random(&mut self.rng));
        let cycle = self.cycle;
        let events = &self.events;
        let published = self.state.send_if_modified(|s| {
            if s.cycle != cycle {
                return false;
            }
            s.displayed_hexagram = Some(hexagram.clone());
            s.is_revealing = true;
            s.step_count = step;
            let _ = events.send(RevealEvent::Decoy { cycle, step, hexagram });
            true
        });
        if published {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        }
    }

    fn settle(&mut self) {
        let cycle = self.cycle;
        let outcome = Hash::parse(&self.target).map(|hash| {
            let hexagram = decode_hash(&hash);
            (hash, hexagram)
        });
        let events = &self.events;
        let published = self.state.send_if_modified(|s| {
            if s.cycle != cycle {
                return false;
            }
            match &outcome {
                Ok((_, hexagram)) => {
                    s.displayed_hexagram = Some(hexagram.clone());
                    s.fault = None;
                    let _ = events.send(RevealEvent::Settled {
                        cycle,
                        hexagram: hexagram.clone(),
                    });
                }
                Err(error) => {
                    // No decoy may linger as if it were the answer.
                    s.displayed_hexagram = None;
                    s.fault = Some(error.clone());
                    let _ = events.send(RevealEvent::Fault {
                        cycle,
                        error: error.clone(),
                    });
                }
            }
            s.is_revealing = false;
            true
        });
        if !published {
            return;
        }
        match &outcome {
            Ok((hash, hexagram)) => log_settled(cycle, hash, hexagram),
            Err(error) => log(
                Level::Error,
                Domain::Reveal,
                "target_fault",
                obj(&[
                    ("cycle", json!(cycle)),
                    ("target", v_str(&self.target)),
                    ("error", v_str(&error.to_string())),
                ]),
            ),
        }
    }
}
