//! armadad: the Armada director daemon.
//!
//! Single binary that assembles the director:
//! - State store (redb)
//! - CPI registry, seeded from `[[cpis]]`
//! - Agent hub and secret store
//! - Task runner + director
//! - REST API
//!
//! # Usage
//!
//! ```text
//! armadad serve --config /etc/armada/armada.toml
//! armadad check-config --config /etc/armada/armada.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use armada_core::config::CpiSection;
use armada_core::{CpiEntry, DirectorConfig};
use armada_cpi::{CloudProvider, CpiRegistry, DummyCloud};
use armada_director::{Director, DummyAgentHub, MemorySecretStore};
use armada_state::StateStore;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "armadad", about = "Armada director daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the director and serve the API.
    Serve {
        /// Director configuration (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on; overrides `server.port`.
        #[arg(long)]
        port: Option<u16>,

        /// Data directory; overrides `director.data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Validate a configuration file and print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(dir) = data_dir {
                config.director.data_dir = dir;
            }
            serve(config).await
        }
        Command::CheckConfig { config } => {
            let config = load_config(Some(&config))?;
            for section in &config.cpis {
                cpi_entry(section)?;
            }
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,armadad=debug,armada=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<DirectorConfig> {
    match path {
        Some(path) => DirectorConfig::from_file(path)
            .with_context(|| format!("loading director config {}", path.display())),
        None => Ok(DirectorConfig::default()),
    }
}

fn cpi_entry(section: &CpiSection) -> anyhow::Result<CpiEntry> {
    if section.kind != "dummy" {
        anyhow::bail!("unknown CPI type '{}' for CPI '{}'", section.kind, section.name);
    }
    Ok(CpiEntry {
        name: section.name.clone(),
        kind: section.kind.clone(),
        properties: serde_json::to_value(&section.properties)?,
        migrated_from: Vec::new(),
    })
}

/// Build the registry. The first `[[cpis]]` entry is the director default
/// used by AZs that name no CPI.
fn build_cpis(config: &DirectorConfig) -> anyhow::Result<(CpiRegistry, Vec<CpiEntry>)> {
    let entries = config.cpis.iter().map(cpi_entry).collect::<anyhow::Result<Vec<_>>>()?;

    let mut providers: Vec<Arc<dyn CloudProvider>> = Vec::new();
    for entry in &entries {
        providers.push(DummyCloud::build(entry)?);
    }
    let default = match providers.first() {
        Some(p) => p.clone(),
        None => {
            warn!("no [[cpis]] configured, using an in-memory dummy cloud");
            Arc::new(DummyCloud::new("default"))
        }
    };

    let registry = CpiRegistry::new(default);
    for (entry, provider) in entries.iter().zip(providers) {
        registry.insert(entry.clone(), provider);
    }
    Ok((registry, entries))
}

async fn serve(config: DirectorConfig) -> anyhow::Result<()> {
    info!(name = %config.director.name, "Armada director starting");

    std::fs::create_dir_all(&config.director.data_dir)
        .with_context(|| format!("creating {}", config.director.data_dir.display()))?;
    let db_path = config.director.data_dir.join("armada.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let (cpis, boot_cpis) = build_cpis(&config)?;
    info!(cpis = boot_cpis.len(), "cpi registry initialized");

    let port = config.server.port;
    let director = Director::new(
        store,
        Arc::new(cpis),
        Arc::new(DummyAgentHub::new()),
        Arc::new(MemorySecretStore::new()),
        config,
    );

    // Boot CPIs become the first CPI config; uploads replace it later.
    if !boot_cpis.is_empty() && director.latest_config("cpi", "default").is_err() {
        let content = serde_json::json!({ "cpis": boot_cpis }).to_string();
        let upload = director.upload_config("cpi", "default", &content)?;
        info!(id = upload.config.id, "seeded cpi config from director configuration");
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
        }
        let _ = shutdown_tx.send(true);
    });

    // ── Start API server ───────────────────────────────────────

    let router = armada_api::build_router(director);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
        })
        .await?;

    info!("Armada director stopped");
    Ok(())
}
