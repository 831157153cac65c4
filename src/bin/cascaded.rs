//! cascaded - cascade pipeline daemon
//!
//! This daemon:
//! 1. Loads `DaemonConfig` and builds the runtime context (MQTT, blob store, inference)
//! 2. Compiles and starts the configured cascade files
//! 3. Serves the status / control API
//! 4. Stops every cascade on Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use cascade_runtime::api::{ApiConfig, ApiServer};
use cascade_runtime::config::DaemonConfig;
use cascade_runtime::{ElementRegistry, Supervisor};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run cascade pipelines and serve their status")]
struct Args {
    /// Daemon config file (JSON, or TOML by extension).
    #[arg(long, env = "CASCADE_CONFIG")]
    config: Option<PathBuf>,

    /// Cascade files to run, in addition to the configured ones.
    #[arg(long = "cascade")]
    cascades: Vec<PathBuf>,

    /// Status API address.
    #[arg(long)]
    api_addr: Option<String>,

    /// Exit once every cascade has run to completion.
    #[arg(long)]
    exit_when_done: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = DaemonConfig::load_from(args.config.as_deref())?;
    config.cascades.extend(args.cascades);
    if let Some(addr) = args.api_addr {
        config.api_addr = addr;
    }

    let ctx = config.runtime_context()?;
    let supervisor = Arc::new(Supervisor::new(ctx, ElementRegistry::builtin()));
    supervisor.mark_waiting();

    let api_handle = ApiServer::new(
        ApiConfig {
            addr: config.api_addr.clone(),
        },
        supervisor.clone(),
    )
    .spawn()?;

    if config.cascades.is_empty() {
        log::info!("no cascade files configured; waiting for POST /cascades");
    } else {
        let cascades = config.load_cascades()?;
        if let Err(err) = supervisor.apply(&cascades) {
            log::error!("initial cascades failed to start: {:#}", err);
        }
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("cascaded waiting for shutdown signal (Ctrl-C)...");
    loop {
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if args.exit_when_done && all_finished(&supervisor) {
                    log::info!("every cascade has finished");
                    break;
                }
            }
        }
    }

    log::info!("shutting down...");
    supervisor.stop();
    api_handle.stop()?;
    Ok(())
}

fn all_finished(supervisor: &Supervisor) -> bool {
    let running = supervisor.snapshot().pipelines.len();
    running > 0 && supervisor.finished().len() == running
}
