mod assets;
mod config;
mod credentials;
mod guard;
mod logging;
mod request;
mod response;
mod sandbox;
mod server;
mod session;
mod storage;
mod tls;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use config::Config;
use credentials::Credential;
use server::AppState;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Create the upload root and one directory per usable username. Returns how
/// many user directories exist afterwards.
async fn prepare_user_dirs(root: &Path, users: &[Credential]) -> anyhow::Result<usize> {
    tokio::fs::create_dir_all(root)
        .await
        .with_context(|| format!("failed to create upload root {}", root.display()))?;

    let mut prepared = 0;
    for user in users {
        if !credentials::is_valid_username(&user.username) {
            warn!(target: "server", username = %user.username, "skipping unusable username");
            continue;
        }
        let dir = root.join(&user.username);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        prepared += 1;
    }
    Ok(prepared)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::parse();
    logging::init_logging().context("invalid RUST_LOG filter")?;

    let users = credentials::load_credentials(&cfg.users).await?;
    let prepared = prepare_user_dirs(&cfg.uploads, &users).await?;
    info!(target: "server", users = prepared, root = %cfg.uploads.display(), "user directories ready");

    let acceptor = tls::load_acceptor(&cfg.cert, &cfg.key)?;
    let state = Arc::new(AppState::new(&cfg));

    let addr = cfg.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(target: "server", %addr, "listening for TLS connections");

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<&'static str>();

    #[cfg(unix)]
    {
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
                return;
            };
            if sigterm.recv().await.is_some() {
                let _ = tx.send("SIGTERM");
            }
        });
    }

    {
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send("Ctrl+C");
            }
        });
    }

    tokio::select! {
        _ = server::accept_loop(listener, acceptor, state) => {}
        reason = shutdown_rx.recv() => {
            info!(target: "server", reason = reason.unwrap_or("signal"), "shutting down");
        }
    }
    Ok(())
}
