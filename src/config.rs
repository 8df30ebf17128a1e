use tokio::time::Duration;

pub const DEFAULT_RPC_URLS: [&str; 3] = [
    "https://eth.public-rpc.com",
    "https://rpc.ankr.com/eth",
    "https://cloudflare-eth.com",
];

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP JSON-RPC endpoints, tried in order.
    pub rpc_urls: Vec<String>,
    /// WebSocket endpoint for `newHeads`; polling is used when unset.
    pub ws_url: Option<String>,
    /// Skip the upstream entirely and simulate from the start.
    pub offline: bool,
    pub connect_timeout_ms: u64,
    pub connect_retries: u32,
    pub poll_interval_ms: u64,
    /// Live subscription with no notification for this long is treated as lost.
    pub stall_timeout_secs: u64,
    pub max_fetch_failures: u32,
    pub max_reconnects: u32,
    pub sim_period_ms: u64,
    pub sim_seed: Option<u64>,
    pub reveal_steps: u32,
    pub reveal_interval_ms: u64,
    pub decoy_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_urls: DEFAULT_RPC_URLS.iter().map(|s| s.to_string()).collect(),
            ws_url: None,
            offline: false,
            connect_timeout_ms: 8_000,
            connect_retries: 2,
            poll_interval_ms: 4_000,
            stall_timeout_secs: 120,
            max_fetch_failures: 5,
            max_reconnects: 3,
            sim_period_ms: 12_000,
            sim_seed: None,
            reveal_steps: 15,
            reveal_interval_ms: 60,
            decoy_seed: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            rpc_urls: std::env::var("FATE_RPC_URLS")
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(d.rpc_urls),
            ws_url: std::env::var("FATE_WS_URL").ok().filter(|s| !s.trim().is_empty()),
            offline: matches!(
                std::env::var("FATE_OFFLINE").as_deref(),
                Ok("1") | Ok("true") | Ok("yes")
            ),
            connect_timeout_ms: env_parse("FATE_CONNECT_TIMEOUT_MS")
                .unwrap_or(d.connect_timeout_ms),
            connect_retries: env_parse("FATE_CONNECT_RETRIES").unwrap_or(d.connect_retries),
            poll_interval_ms: env_parse("FATE_POLL_MS").unwrap_or(d.poll_interval_ms),
            stall_timeout_secs: env_parse("FATE_STALL_SECS").unwrap_or(d.stall_timeout_secs),
            max_fetch_failures: env_parse("FATE_MAX_FETCH_FAILURES")
                .unwrap_or(d.max_fetch_failures),
            max_reconnects: env_parse("FATE_MAX_RECONNECTS").unwrap_or(d.max_reconnects),
            sim_period_ms: env_parse("FATE_SIM_PERIOD_MS").unwrap_or(d.sim_period_ms),
            sim_seed: env_parse("FATE_SIM_SEED"),
            reveal_steps: env_parse("FATE_REVEAL_STEPS").unwrap_or(d.reveal_steps),
            reveal_interval_ms: env_parse("FATE_REVEAL_INTERVAL_MS")
                .unwrap_or(d.reveal_interval_ms),
            decoy_seed: env_parse("FATE_DECOY_SEED"),
        }
    }

    pub fn feed(&self) -> FeedConfig {
        FeedConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            connect_retries: self.connect_retries,
            stall_timeout: Duration::from_secs(self.stall_timeout_secs),
            max_fetch_failures: self.max_fetch_failures.max(1),
            max_reconnects: self.max_reconnects,
            sim_period: Duration::from_millis(self.sim_period_ms),
            sim_seed: self.sim_seed,
        }
    }

    pub fn reveal(&self) -> RevealConfig {
        RevealConfig {
            steps: self.reveal_steps,
            interval: Duration::from_millis(self.reveal_interval_ms),
            decoy_seed: self.decoy_seed,
        }
    }
}

/// Timing and fallback policy for the hash source.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub connect_timeout: Duration,
    pub connect_retries: u32,
    pub stall_timeout: Duration,
    pub max_fetch_failures: u32,
    pub max_reconnects: u32,
    pub sim_period: Duration,
    pub sim_seed: Option<u64>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Config::default().feed()
    }
}

#[derive(Debug, Clone)]
pub struct RevealConfig {
    pub steps: u32,
    pub interval: Duration,
    pub decoy_seed: Option<u64>,
}

impl Default for RevealConfig {
    fn default() -> Self {
        Config::default().reveal()
    }
}
