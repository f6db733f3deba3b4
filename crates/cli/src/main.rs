//! # CLI - DeltaKV Interactive Shell
//!
//! A REPL over one DeltaKV domain. Changes are staged with `PUT`, `DEL` and
//! `ABSENT`, written to remote storage as a new version with `PUBLISH`, and
//! pulled into the local serving directory with `UPDATE`. Reads go through
//! the version each partition currently serves. Designed for both
//! interactive use and scripted testing (pipe commands via stdin).
//!
//! ## Commands
//!
//! ```text
//! PUT key value          Stage a write for the next version
//! DEL key                Stage a delete (deltas only)
//! ABSENT key             Stage an ABSENT marker for the key's hash (deltas only)
//! PUBLISH [base|delta]   Write the staged changes as the next version
//! VERSIONS               List published versions and what each partition serves
//! UPDATE [n]             Move every partition to version n (default: latest)
//! GET key                Look a key up in the served version (prints "(nil)" on a miss)
//! COMPACT                Fold each served delta chain into a base
//! STATS                  Print updater statistics
//! DROP                   Stop serving and delete the local partitions
//! EXIT / QUIT            Shut down
//! ```
//!
//! ## Configuration
//!
//! ```text
//! DELTAKV_REMOTE_ROOT   remote storage directory   (default: "data/remote")
//! DELTAKV_LOCAL_ROOT    local serving directory    (default: "data/local")
//! DELTAKV_DOMAIN        domain name                (default: "default")
//! DELTAKV_PARTITIONS    partitions in the domain   (default: 1)
//! DELTAKV_LOG           tracing filter, falls back to RUST_LOG, then "info"
//! ```
//!
//! Storage and updater tunables (`DELTAKV_BLOCK_KB`, `DELTAKV_CODEC`, ...) are
//! read by [`config::Config::from_env`].
//!
//! ## Example
//!
//! ```text
//! $ cargo run -p deltakv
//! DeltaKV started (domain=default, partitions=1, remote=data/remote, local=data/local)
//! > PUT name Alice
//! OK (1 staged)
//! > PUBLISH
//! published v1 (base, 1 records across 1 partitions)
//! > UPDATE
//! partition 0: v1 (fetched 1 pairs, 182 bytes)
//! > GET name
//! Alice
//! > EXIT
//! bye
//! ```

mod shell;

use anyhow::{Context, Result};
use config::Config;
use shell::{Reply, Settings, Shell};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Reads a configuration value from the environment, falling back to `default`.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// `DELTAKV_LOG` > `RUST_LOG` > `info`. Logs go to stderr so stdout stays
/// scriptable.
fn init_tracing() {
    let filter = std::env::var("DELTAKV_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    init_tracing();

    let settings = Settings {
        remote_root: PathBuf::from(env_or("DELTAKV_REMOTE_ROOT", "data/remote")),
        local_root: PathBuf::from(env_or("DELTAKV_LOCAL_ROOT", "data/local")),
        domain: env_or("DELTAKV_DOMAIN", "default"),
        partitions: env_or("DELTAKV_PARTITIONS", "1")
            .parse()
            .context("DELTAKV_PARTITIONS must be a positive integer")?,
    };
    let config = Config::from_env().context("invalid DELTAKV_* configuration")?;
    let mut shell = Shell::open(settings, config)?;

    let s = shell.settings();
    let serving: Vec<String> = shell
        .serving()
        .iter()
        .map(|v| v.map_or("-".to_string(), |v| format!("v{}", v)))
        .collect();
    println!(
        "DeltaKV started (domain={}, partitions={}, remote={}, local={}, serving={})",
        s.domain,
        s.partitions,
        s.remote_root.display(),
        s.local_root.display(),
        serving.join(",")
    );
    println!("Commands: PUT key value | DEL key | ABSENT key | PUBLISH [base|delta]");
    println!("          VERSIONS | UPDATE [n] | GET key | COMPACT | STATS | DROP | EXIT");
    print!("> ");
    io::stdout().flush().ok();

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        match shell.execute(&line) {
            Ok(Some(Reply::Text(text))) => println!("{}", text),
            Ok(Some(Reply::Exit)) => {
                println!("bye");
                break;
            }
            Ok(None) => {}
            Err(e) => println!("ERR {:#}", e),
        }

        print!("> ");
        io::stdout().flush().ok();
    }

    Ok(())
}
