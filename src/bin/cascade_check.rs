//! cascade_check - compile cascade files without running them.
//!
//! Prints each cascade's topological order and wiring. Exits non-zero when any
//! file fails to parse or compile.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cascade_runtime::export::{BlobStore, TelemetryPublisher};
use cascade_runtime::{compile, CascadeConfig, ConfigError, ElementRegistry, RuntimeContext};

#[derive(Parser, Debug)]
#[command(author, version, about = "Validate cascade files and print their wiring")]
struct Args {
    /// Cascade files (JSON, or TOML by extension).
    #[arg(required_unless_present = "list_elements")]
    files: Vec<PathBuf>,

    /// Print the registered element names and exit.
    #[arg(long)]
    list_elements: bool,
}

/// Accepts and discards everything; sinks only need a collaborator to exist.
struct Discard;

impl TelemetryPublisher for Discard {
    fn publish(&self, _topic: &str, _payload: &[u8]) -> Result<()> {
        Ok(())
    }
}

impl BlobStore for Discard {
    fn put(&self, path: &str, _content_type: &str, _bytes: &[u8]) -> Result<String> {
        Ok(path.to_string())
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let registry = ElementRegistry::builtin();

    if args.list_elements {
        for (node_type, name) in registry.names() {
            println!("{:<10} {}", node_type, name);
        }
        return Ok(());
    }

    let ctx = RuntimeContext::new()
        .with_telemetry(Arc::new(Discard))
        .with_blob_store(Arc::new(Discard));

    let mut failures = 0usize;
    for path in &args.files {
        match check(path, &registry, &ctx) {
            Ok(()) => {}
            Err(err) => {
                failures += 1;
                let kind = if err.downcast_ref::<ConfigError>().is_some() {
                    "config error"
                } else {
                    "error"
                };
                eprintln!("{}: {}: {:#}", path.display(), kind, err);
            }
        }
    }
    if failures > 0 {
        return Err(anyhow!("{} of {} cascade file(s) failed", failures, args.files.len()));
    }
    Ok(())
}

fn check(path: &Path, registry: &ElementRegistry, ctx: &RuntimeContext) -> Result<()> {
    let cfg = CascadeConfig::load(path)?;
    let graph = compile(&cfg, registry, ctx)?;
    println!("{} ({}): {} elements", graph.name(), path.display(), graph.len());
    for id in graph.order() {
        let children = graph.children_of(id).unwrap_or(&[]);
        if children.is_empty() {
            println!("  {}", id);
        } else {
            println!("  {} -> {}", id, children.join(", "));
        }
    }
    Ok(())
}
