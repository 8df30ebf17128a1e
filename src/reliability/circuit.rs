#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
}

/// Breaker over consecutive failed block fetches while live. Opening it is
/// the signal that the subscription is no longer trustworthy.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    failures: u32,
    threshold: u32,
    last_failed_height: Option<u64>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            threshold: threshold.max(1),
            last_failed_height: None,
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.last_failed_height = None;
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self, height: u64) {
        self.failures = self.failures.saturating_add(1);
        self.last_failed_height = Some(height);
        if self.failures >= self.threshold {
            self.state = CircuitState::Open;
        }
    }

    pub fn allow(&self) -> bool {
        self.state == CircuitState::Closed
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn last_failed_height(&self) -> Option<u64> {
        self.last_failed_height
    }
}
