//! Tether Server
//!
//! A single binary that exposes a target CLI's PTY sessions over one
//! persistent connection, plus a small auxiliary HTTP surface for session
//! discovery, directory browsing, and a dev-server preview proxy.

mod auth;
mod proxy;
mod routes;
mod state;
mod ws;

use anyhow::{Context, Result};
use axum::middleware;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use colored::Colorize;
use std::net::SocketAddr;
use std::sync::Arc;
use tether_core::protocol::ServerEvent;
use tether_engine::{Scheduler, SessionManager};
use tokio::sync::broadcast;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use state::AppState;

const STATUS_BROADCAST_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "tether-server")]
#[command(author, version, about = "Serves a target CLI's sessions over the network", long_about = None)]
struct Cli {
    /// Name of the CLI binary to spawn and supervise (e.g. "claude")
    #[arg(long, env = "TETHER_BINARY", default_value = "claude")]
    binary: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 3456)]
    port: u16,

    /// Force debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()));
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        eprintln!("[PANIC] at {location:?}: {payload}");
        tracing::error!("panic at {:?}: {}", location, payload);
    }));

    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("[FATAL] failed to initialize logging: {e}");
        std::process::exit(1);
    }

    info!(
        "tether-server v{} starting (pid {})",
        env!("CARGO_PKG_VERSION"),
        std::process::id()
    );

    if let Err(e) = run(cli).await {
        error!("server failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let binary = tether_engine::resolve_binary(&cli.binary).context("resolving target binary")?;
    info!(binary = %binary.display(), "resolved target binary");

    let home = tether_core::config::tether_home().context("resolving dot-directory")?;
    std::fs::create_dir_all(&home).context("creating dot-directory")?;

    let token = auth::resolve_token(&cli.binary);
    info!("auth token: {token}");

    let sessions = Arc::new(SessionManager::new(binary.clone(), cli.binary.clone()));
    let scheduler = Arc::new(
        Scheduler::new(home.clone(), binary.clone())
            .await
            .context("initializing scheduler")?,
    );

    let (broadcast_tx, _) = broadcast::channel::<ServerEvent>(256);
    relay_schedule_events(scheduler.clone(), broadcast_tx.clone());

    let state = AppState {
        sessions: sessions.clone(),
        scheduler,
        auth_token: Arc::from(token.as_str()),
        preferences_home: home,
        broadcast_tx: broadcast_tx.clone(),
    };

    spawn_status_broadcaster(sessions, broadcast_tx);

    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    print_banner(cli.port, &token);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server loop failed")?;

    info!("shut down cleanly");
    Ok(())
}

fn build_router(state: AppState) -> Router {
    let api_routes = routes::router()
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_token));

    let preview_routes = Router::new()
        .route("/preview/:port/*rest", get(proxy::proxy))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_token));

    let static_dir = std::env::var("TETHER_STATIC_DIR").unwrap_or_else(|_| "static".into());
    let static_service = ServeDir::new(&static_dir)
        .not_found_service(ServeFile::new(format!("{static_dir}/index.html")));

    Router::new()
        .route("/ws", get(ws::handler))
        .merge(api_routes)
        .merge(preview_routes)
        .fallback_service(static_service)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn spawn_status_broadcaster(sessions: Arc<SessionManager>, tx: broadcast::Sender<ServerEvent>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATUS_BROADCAST_INTERVAL);
        loop {
            interval.tick().await;
            let mut infos = Vec::new();
            for session in sessions.list().await {
                infos.push(session.get_info().await);
            }
            let external_sessions = sessions.discover_external().await;

            let _ = tx.send(ServerEvent::SessionStatus {
                sessions: infos,
                external_sessions,
            });
        }
    });
}

/// Forward the scheduler's own event channel onto the connection-facing
/// broadcast channel so `schedule:run_complete` reaches every client the
/// same way `session:status` does.
fn relay_schedule_events(scheduler: Arc<Scheduler>, tx: broadcast::Sender<ServerEvent>) {
    let mut rx = scheduler.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn print_banner(port: u16, token: &str) {
    println!();
    println!("  {}", "tether-server".bold());
    println!("  local:  {}", format!("http://localhost:{port}").cyan());
    println!("  token:  {}", token.yellow());
    println!();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to install ctrl-c handler: {e}");
        return;
    }
    info!("received shutdown signal");
}
