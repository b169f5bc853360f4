use tracing_subscriber::EnvFilter;

use hubex_server::config::ServerConfig;
use hubex_server::router::build_router;
use hubex_server::shutdown::shutdown_signal;
use hubex_server::state::AppState;
use hubex_server::vars::effects::run_effects_once;

const EFFECT_WORKER_INTERVAL_SECS: u64 = 5;
const EFFECT_WORKER_BATCH: i64 = 20;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config = ServerConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.max_db_connections)
        .connect(&config.database_url)
        .await?;

    sqlx::migrate!().run(&pool).await?;

    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(pool, config);

    // Shutdown coordination: the effect worker stops when the server does
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

    let worker_db = state.db.clone();
    let worker_id = format!("worker:{}", uuid::Uuid::new_v4());
    tokio::spawn(async move {
        loop {
            match run_effects_once(&worker_db, EFFECT_WORKER_BATCH, &worker_id).await {
                Ok(summary) if summary.processed > 0 => {
                    tracing::info!(
                        processed = summary.processed,
                        done = summary.done,
                        failed = summary.failed,
                        "effect worker pass"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e.0, "effect worker pass failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(EFFECT_WORKER_INTERVAL_SECS)) => {}
                _ = shutdown_rx.changed() => {
                    tracing::info!("effect worker shutting down");
                    break;
                }
            }
        }
    });

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);

    Ok(())
}
