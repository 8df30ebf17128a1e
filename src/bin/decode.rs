//! Decode block hashes into hexagrams.
//!
//! Usage:
//!   decode <hash> [<hash> ...]
//!
//! Prints one JSON object per argument. Exits non-zero if any argument is not
//! a valid 32-byte hex hash.

use anyhow::{bail, Result};
use fate_engine::hexagram::decode;
use fate_engine::logging::{log, obj, v_num, v_str, Domain, Level};
use serde_json::json;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("usage: decode <hash> [<hash> ...]");
        std::process::exit(2);
    }

    let mut failed = 0;
    for raw in &args {
        // Shell quoting can leave stray whitespace; the decoder itself is strict.
        match decode(raw.trim()) {
            Ok(hexagram) => {
                let ritual: Vec<u8> = hexagram
                    .lines()
                    .iter()
                    .map(|l| l.kind().ritual_value())
                    .collect();
                let out = json!({
                    "input": raw,
                    "hexagram": hexagram,
                    "ritual": ritual,
                    "changing": hexagram.changing_lines(),
                    "relatingKey": hexagram.relating().key(),
                    "energy": v_num(hexagram.energy()),
                });
                println!("{}", serde_json::to_string(&out)?);
            }
            Err(e) => {
                log(
                    Level::Warn,
                    Domain::Decode,
                    e.kind(),
                    obj(&[("input", v_str(raw)), ("error", v_str(&e.to_string()))]),
                );
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} inputs failed to decode", failed, args.len());
    }
    Ok(())
}
