use std::io::IsTerminal;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use agent_backup_control_plane::broker::s3::S3Broker;
use agent_backup_control_plane::config::{Settings, StoreMode};
use agent_backup_control_plane::state::AppState;
use agent_backup_control_plane::store::dynamo::DynamoStore;
use agent_backup_control_plane::store::sqlite::SqliteStore;
use agent_backup_control_plane::store::Store;
use agent_backup_control_plane::{purge, routes};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    setup_tracing();

    let settings = Arc::new(Settings::from_env());

    let store: Arc<dyn Store> = match settings.store_mode {
        StoreMode::Sql => Arc::new(SqliteStore::open(&settings.database_path).await?),
        StoreMode::Kv => Arc::new(DynamoStore::from_settings(&settings).await),
    };

    let broker = Arc::new(S3Broker::new(&settings).await);
    let app_state = AppState::new(store.clone(), broker.clone(), settings.clone());

    tokio::spawn(purge::run(
        store,
        broker,
        app_state.register_limiter.clone(),
        std::time::Duration::from_secs(settings.purge_interval_seconds),
    ));

    let app = routes::router(app_state);

    let listener = tokio::net::TcpListener::bind(&settings.listen_addr).await?;
    let local_addr = listener.local_addr()?;
    info!("server is running at http://{local_addr}");

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let serve_task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    // spec §5: stop accepting, allow in-flight requests up to 10s, then
    // terminate regardless of whether they finished.
    if tokio::time::timeout(std::time::Duration::from_secs(10), serve_task)
        .await
        .is_err()
    {
        tracing::warn!("graceful shutdown grace period elapsed, terminating");
    }

    info!("server is stopped");
    Ok(())
}

fn setup_tracing() {
    let env_filter = EnvFilter::from_default_env();
    let enable_color = std::io::stdout().is_terminal();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(env_filter)
        .with_ansi(enable_color)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let _ = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
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
