// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tb_daemon::{AppState, build_app};
use tb_engine::{ProcessEngine, ProcessEngineSpec};
use tb_store::Store;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tb-daemon", version, about = "TestBase agent execution control plane")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind address; overrides the configured port.
    #[arg(long)]
    bind: Option<String>,

    /// Enable request/response debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("tb=debug,tb_daemon=debug")
    } else {
        EnvFilter::try_from_env("TB_LOG").unwrap_or_else(|_| EnvFilter::new("tb=info,tb_daemon=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = tb_config::load_config(args.config.as_deref()).context("load config")?;
    for warning in tb_config::validate_config(&config).context("validate config")? {
        warn!(%warning, "config warning");
    }

    // Startup checks: database, object mount, auth source, engine.
    let store = Store::connect(std::path::Path::new(&config.storage.database_path))
        .await
        .context("open database")?;

    let mount = PathBuf::from(&config.storage.object_mount_path);
    tokio::fs::create_dir_all(&mount)
        .await
        .with_context(|| format!("create object mount {}", mount.display()))?;
    let probe = mount.join(".startup-probe");
    tokio::fs::write(&probe, b"ok")
        .await
        .context("object mount is not writable")?;
    let _ = tokio::fs::remove_file(&probe).await;

    let active_keys = store.keys().count_active().await.context("count keys")?;
    let has_auth_source = active_keys > 0
        || !config.auth.legacy_key_allowlist.is_empty()
        || config.auth.open_mode;
    if !has_auth_source {
        bail!(
            "no authentication source: create a key, configure an allow-list, \
             or explicitly enable open mode"
        );
    }

    let Some(command) = config.engine.command.clone() else {
        bail!("engine.command is required");
    };
    if config.engine.credential.is_none() {
        bail!("engine.credential is required (or set TB_ENGINE_CREDENTIAL)");
    }
    let engine = Arc::new(ProcessEngine::new(ProcessEngineSpec {
        command,
        args: config.engine.args.clone(),
        credential: config.engine.credential.clone(),
    }));

    let bind = args
        .bind
        .unwrap_or_else(|| format!("0.0.0.0:{}", config.http.port));
    let state = Arc::new(AppState::new(config, store, engine));
    let app = build_app(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(bind = %bind, active_keys, "tb-daemon listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serve")
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}
