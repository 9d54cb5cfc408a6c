use std::net::SocketAddr;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

use knowledge_refinery::{config, routes, server, state};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::AppConfig::from_env();

    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir).ok();

    // File appender: daily rotated log files next to the store.
    let file_appender = tracing_appender::rolling::daily(&log_dir, "refineryd.log");
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "knowledge_refinery=info,tower_http=info".into());

    // Stdout layer (captured by the desktop supervisor)
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    // Log panics before aborting; the supervisor only sees our stdout.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        error!(target: "knowledge_refinery::panic", location = %location, payload = %payload, "PANIC: thread panicked");
        default_panic(info);
    }));

    routes::health::init_start_time();

    let addr: SocketAddr = config.listen_addr.parse()?;
    info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir,
        lm_studio_url = %config.lm_studio_url,
        max_file_size = config.max_file_size_bytes,
        embed_batch_size = config.embed_batch_size,
        "knowledge refinery daemon starting"
    );

    let app_state = state::AppState::new(config.clone())?;

    // One PID file per workspace so the supervisor can find us.
    let pid_path = config.pid_path();
    std::fs::write(&pid_path, std::process::id().to_string())?;

    let app = server::create_app(app_state);

    // Bind and serve before anything slow: /health must answer immediately
    // so the supervisor and UI don't time out during cache warm-up.
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = std::fs::remove_file(&pid_path) {
        error!(error = %e, "failed to remove PID file");
    }
    info!("daemon shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, initiating shutdown"); },
        _ = terminate => { info!("received terminate signal, initiating shutdown"); },
    }
}
