//! Runs the engine and prints snapshots as JSON lines on stdout.
//!
//! Usage:
//!   fate-engine [--every]
//!
//! By default a line is printed when a reveal settles (or faults); `--every`
//! prints every decoy step as well. Ctrl-C shuts down cleanly.

use anyhow::Result;
use fate_engine::config::Config;
use fate_engine::engine::FateEngine;
use fate_engine::logging::{log, obj, v_str, Domain, Level};

#[tokio::main]
async fn main() -> Result<()> {
    let every = std::env::args().skip(1).any(|a| a == "--every");
    let cfg = Config::from_env();
    let mut engine = FateEngine::start(&cfg)?;
    // Launching the CLI is the interaction that turns output on.
    engine.enable_output();

    let mut last_printed = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log(Level::Info, Domain::System, "signal", obj(&[("kind", v_str("ctrl_c"))]));
                break;
            }
            snap = engine.changed() => {
                let Some(snap) = snap else { break };
                let key = (snap.reveal_cycle, snap.step_count, snap.is_revealing);
                if (!every && snap.is_revealing) || last_printed == Some(key) {
                    continue;
                }
                last_printed = Some(key);
                println!("{}", serde_json::to_string(&snap)?);
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}
