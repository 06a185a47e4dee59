use std::path::Path;

use anyhow::Context;
use gameserver_agent::{api, config, state};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = config::config_path();
    let cfg = config::load_config(&config_path).await?;
    let bind_address = cfg.agent.bind_address.clone();
    let public_dir = cfg.agent.public_dir.clone();

    let state = state::AppState::new(cfg.clone(), config_path);
    state.load_servers().await;
    tracing::info!("Loaded {} server definition(s)", state.servers.len());

    // Autostart servers
    for server in cfg.servers.iter().filter(|s| s.autostart) {
        let Some(runtime) = state.server(&server.id) else {
            continue;
        };
        tokio::spawn(async move {
            if let Err(e) = runtime.start().await {
                tracing::error!("Autostart failed for '{}': {}", runtime.id(), e);
            }
        });
    }

    let app = api::router(state.clone(), public_dir.as_deref().map(Path::new));

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    tracing::info!("Listening on {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down servers...");
    state.dispose_all().await;

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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
