//! `admin-nonce` operator tool.
//!
//! Subcommands:
//! - `inspect <address>` – print the stored nonce record as JSON
//! - `release <address> --nonce <n>` – force-unlock an address left locked by a crashed holder
//! - `watch` – log every wake-up the configured unlock feed delivers
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `CONFIG` path of the JSON config (default `config.json`)
//! - `RUST_LOG` log filter, `OTEL_*` variables enable OpenTelemetry export

mod run;

use std::process;

use crate::run::run;

#[tokio::main]
async fn main() {
    let result = run().await;
    if let Err(e) = result {
        eprintln!("{e}");
        process::exit(1)
    }
}
