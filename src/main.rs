// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Axis: game server orchestration
//!
//! One binary, two roles:
//! - `axis node` runs the daemon that owns the containers on a host
//! - `axis panel` runs the central panel that users and schedules talk to
//!
//! `axis pair` links a fresh node to a panel, `axis panel-user` bootstraps
//! panel accounts.

mod api;
mod auth;
mod backup;
mod config;
mod containers;
mod error;
mod files;
mod lifecycle;
mod logbus;
mod modpack;
mod monitoring;
mod pairing;
mod panel;
mod protocol;
mod ssrf;

use actix_web::{web, App, HttpServer};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::{NodeConfig, PanelConfig, NODE_CONFIG_PATH, PANEL_CONFIG_PATH};
use containers::docker::DockerRuntime;
use lifecycle::Engine;
use logbus::LogBus;
use pairing::{generate_code, Pairing, PairPrompt, CODE_TTL};

/// Axis: game servers in containers, managed from one panel
#[derive(Parser)]
#[command(name = "axis", version, about = "Game server orchestration: panel and node daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node daemon
    Node {
        #[arg(long, default_value = NODE_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Wait for a panel to pair with this node, then exit
    Pair {
        #[arg(long, default_value = NODE_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Run the panel
    Panel {
        #[arg(long, default_value = PANEL_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Create a panel user (or issue a new token for an existing one)
    PanelUser {
        #[arg(long)]
        username: String,
        #[arg(long)]
        admin: bool,
        #[arg(long, default_value = PANEL_CONFIG_PATH)]
        config: PathBuf,
    },
}

fn init_logging(level: Option<&str>) {
    let mut filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("axis=info,actix_web=info"));
    if let Some(level) = level {
        match level.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Ignoring log_level '{}': {}", level, e),
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn config_error(e: String) -> std::io::Error {
    error!("{}", e);
    std::io::Error::other(e)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Node { config } => run_node(&config).await,
        Command::Pair { config } => run_pair(&config).await,
        Command::Panel { config } => run_panel(&config).await,
        Command::PanelUser { username, admin, config } => create_panel_user(&config, &username, admin),
    }
}

// ─── Node daemon ───

async fn run_node(path: &Path) -> std::io::Result<()> {
    let config = NodeConfig::load(path).map_err(std::io::Error::other)?;
    init_logging(config.log_level.as_deref());

    info!("🐺 Axis node v{}", env!("CARGO_PKG_VERSION"));
    info!("  Config:  {}", path.display());
    info!("  Volumes: {}", config.data_dir.display());
    info!("  Backups: {}", config.backup_dir.display());

    let docker = Arc::new(DockerRuntime::new(&config.docker_bin, &config.docker_socket));
    match docker.version().await {
        Some(v) => info!("  Docker:  {}", v),
        None => warn!("  Docker is not reachable at {}; servers will fail to start", config.docker_socket),
    }

    let bus = Arc::new(LogBus::new());
    bus.spawn_janitor();
    let engine = Arc::new(Engine::new(docker.clone(), bus, config.data_dir.clone()));
    engine.spawn_stats_refresher();
    let backups = Arc::new(
        backup::BackupEngine::new(engine.clone(), config.backup_dir.clone())
            .accept_invalid_certs(config.accept_invalid_node_certs),
    );

    let tls_paths = config.tls_cert.clone().zip(config.tls_key.clone());
    let bind = format!("{}:{}", config.bind, config.port);

    let state = match api::AppState::new(config, docker, engine, backups) {
        Ok(s) => web::Data::new(s),
        Err(e) => {
            error!("{}", e);
            return Err(std::io::Error::other(e.to_string()));
        }
    };
    api::spawn_heartbeat(state.clone());

    // Fall back to plain HTTP if the certificate cannot be loaded
    let ssl_builder = tls_paths.as_ref().and_then(|(cert_path, key_path)| {
        use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};

        let mut builder = match SslAcceptor::mozilla_intermediate(SslMethod::tls()) {
            Ok(b) => b,
            Err(e) => {
                warn!("Failed to create SSL acceptor: {}, falling back to HTTP", e);
                return None;
            }
        };
        if let Err(e) = builder.set_certificate_chain_file(cert_path) {
            warn!("Cannot load TLS cert '{}': {}, falling back to HTTP", cert_path, e);
            return None;
        }
        if let Err(e) = builder.set_private_key_file(key_path, SslFiletype::PEM) {
            warn!("Cannot load TLS key '{}': {}, falling back to HTTP", key_path, e);
            return None;
        }
        Some(builder)
    });

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(api::configure)
    });

    match ssl_builder {
        Some(ssl) => {
            info!("  🔒 TLS enabled, listening on https://{}", bind);
            server
                .bind_openssl(&bind, ssl)
                .map_err(|e| {
                    error!("❌ Failed to bind HTTPS on {}: {}", bind, e);
                    e
                })?
                .run()
                .await
        }
        None => {
            info!("  ⚡ HTTP mode, listening on http://{}", bind);
            server
                .bind(&bind)
                .map_err(|e| {
                    error!("❌ Failed to bind HTTP on {}: {}", bind, e);
                    e
                })?
                .run()
                .await
        }
    }
}

// ─── Pairing mode ───

/// Ask the operator on stdin; anything but y/yes rejects
async fn answer_prompts(mut prompts: tokio::sync::mpsc::Receiver<PairPrompt>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(prompt) = prompts.recv().await {
        println!();
        println!("Panel {} wants to pair with this node. Accept? [y/N]", prompt.panel_url);
        let accepted = match lines.next_line().await {
            Ok(Some(line)) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            _ => false,
        };
        let _ = prompt.reply.send(accepted);
    }
}

async fn run_pair(path: &Path) -> std::io::Result<()> {
    let config = NodeConfig::load(path).map_err(std::io::Error::other)?;
    init_logging(config.log_level.as_deref());

    let config_path = path.to_path_buf();
    let code = generate_code();
    let (pairing, prompts) = Pairing::new(code, CODE_TTL, move |issued, panel_url| {
        let mut cfg = NodeConfig::load(&config_path).map_err(error::AxisError::Internal)?;
        cfg.token_id = issued.token_id.clone();
        cfg.token = issued.token.clone();
        cfg.panel_url = Some(panel_url.to_string());
        cfg.save(&config_path).map_err(error::AxisError::Internal)
    });
    let pairing = Arc::new(pairing);
    tokio::spawn(answer_prompts(prompts));

    let bind = format!("{}:{}", config.bind, config.port);
    println!();
    println!("  Pairing code: {}", pairing.code());
    println!("  Enter it in the panel within {} minutes.", CODE_TTL.as_secs() / 60);
    println!("  Listening on http://{}", bind);
    println!();

    let data = web::Data::new(pairing.clone());
    let server = HttpServer::new(move || {
        App::new().app_data(data.clone()).configure(api::configure_pairing)
    })
    .workers(1)
    .bind(&bind)?
    .run();
    let handle = server.handle();

    tokio::select! {
        res = server => res,
        _ = pairing.finished() => {
            info!("Pairing complete, token saved to {}", path.display());
            handle.stop(true).await;
            Ok(())
        }
        _ = tokio::time::sleep(CODE_TTL) => {
            warn!("Pairing code expired");
            handle.stop(false).await;
            Err(std::io::Error::other("pairing code expired"))
        }
    }
}

// ─── Panel ───

async fn run_panel(path: &Path) -> std::io::Result<()> {
    let config = PanelConfig::load(path).map_err(std::io::Error::other)?;
    init_logging(config.log_level.as_deref());

    info!("🐺 Axis panel v{}", env!("CARGO_PKG_VERSION"));
    info!("  Config: {}", path.display());
    info!("  State:  {}", config.state_file.display());
    info!("  Public: {}", config.public_url);

    let store = panel::store::PanelStore::load(&config.state_file)
        .map_err(|e| config_error(e.to_string()))?;
    let sql = Arc::new(panel::databases::MysqlExecutor);
    let bind = format!("{}:{}", config.bind, config.port);
    let state = panel::PanelState::new(config, Arc::new(store), sql)
        .map_err(|e| config_error(e.to_string()))?;
    let state = web::Data::new(state);
    state.spawn_background();

    info!("  Listening on http://{}", bind);
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(panel::api::configure)
    })
    .bind(&bind)
    .map_err(|e| {
        error!("❌ Failed to bind {}: {}", bind, e);
        e
    })?
    .run()
    .await
}

fn create_panel_user(path: &Path, username: &str, admin: bool) -> std::io::Result<()> {
    let config = PanelConfig::load(path).map_err(std::io::Error::other)?;
    init_logging(config.log_level.as_deref());

    let username = username.trim();
    if username.is_empty() {
        return Err(std::io::Error::other("username must not be empty"));
    }
    let store = panel::store::PanelStore::load(&config.state_file)
        .map_err(|e| config_error(e.to_string()))?;
    let (user, token) = panel::upsert_user(&store, username, admin)
        .map_err(|e| config_error(e.to_string()))?;

    println!("User:  {} ({}){}", user.username, user.id, if user.is_admin { " [admin]" } else { "" });
    println!("Token: {}", token);
    println!("The token is shown only once.");
    Ok(())
}
