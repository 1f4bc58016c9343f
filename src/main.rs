use signalhub::config::Config;
use signalhub::server::{self, AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Load .env before anything else so SIGNALHUB_LOG_LEVEL is available.
    let _ = dotenvy::dotenv();

    let log_level =
        std::env::var("SIGNALHUB_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .init();

    let config = Config::from_env();
    let bind_addr = config.bind_addr.clone();

    let state = AppState::new(config);
    let app = server::router(state);

    info!("signaling server listening on http://{bind_addr}");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind listener");
    axum::serve(listener, app).await.unwrap();
}
