#![warn(missing_docs)]

//! dsync-repl: runs replication domains from a config file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dirsync_repl::backend::InMemoryBackend;
use dirsync_repl::csn::Csn;
use dirsync_repl::domain::DomainChannels;
use dirsync_repl::server_state::ServerState;
use dirsync_repl::{Backend, DomainRegistry, ReplConfig, ReplicationDomain};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "dsync-repl")]
#[command(about = "dirsync multi-master replication", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the configured replication domains until interrupted.
    Run {
        #[arg(short, long, default_value = "/etc/dirsync/repl.toml")]
        config: PathBuf,
    },
    /// Print a saved state vector.
    State { file: PathBuf },
    /// Decode a CSN from its text form.
    Csn { csn: String },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => run(&config).await,
        Command::State { file } => {
            init_tracing(false);
            print_state(&file)
        }
        Command::Csn { csn } => {
            init_tracing(false);
            let csn: Csn = csn.parse().context("invalid CSN")?;
            println!("timestamp_ms: {}", csn.timestamp());
            println!("seqnum:       {}", csn.seqnum());
            println!("replica_id:   {}", csn.replica_id());
            Ok(())
        }
    }
}

fn print_state(path: &Path) -> Result<()> {
    let state = ServerState::load(path)
        .with_context(|| format!("reading state file {}", path.display()))?;
    let vector = state.snapshot();
    if vector.is_empty() {
        println!("(empty)");
    }
    for (replica_id, csn) in vector.iter() {
        println!("{replica_id:>5}  {csn}");
    }
    Ok(())
}

async fn run(config_path: &Path) -> Result<()> {
    let config = if config_path.exists() {
        ReplConfig::from_file(config_path)?
    } else {
        ReplConfig::default()
    };
    init_tracing(config.log_json);
    if !config_path.exists() {
        tracing::warn!("Config file not found, using defaults: {}", config_path.display());
    }
    tracing::info!(domains = config.domains.len(), "dirsync replication starting");

    let registry = Arc::new(DomainRegistry::new());
    for domain_config in config.domains {
        let base = domain_config.base()?;
        let backend: Arc<dyn Backend> = Arc::new(InMemoryBackend::new(base));
        let (domain, channels) = ReplicationDomain::new(domain_config, backend)?;
        domain.start().await?;
        tokio::spawn(drain(Arc::clone(&domain), channels));
        registry.register(domain)?;
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("interrupt received, shutting down");

    registry.shutdown_all().await;
    Ok(())
}

/// Log what a domain publishes; no peers are attached in standalone mode.
async fn drain(domain: Arc<ReplicationDomain>, mut channels: DomainChannels) {
    loop {
        tokio::select! {
            Some(msg) = channels.outbound.recv() => {
                tracing::debug!(base_dn = %domain.base_dn(), csn = %msg.csn, kind = %msg.kind(), dn = %msg.dn(), "update published");
            }
            Some(msg) = channels.recovery.recv() => {
                tracing::debug!(base_dn = %domain.base_dn(), csn = %msg.csn, "recovery update published");
            }
            else => break,
        }
    }
}
