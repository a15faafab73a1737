use std::sync::Arc;

use statecast::config::ServerConfig;
use statecast::reducer::{ClientRegistry, MergeReducer};
use statecast::state::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let _ = dotenvy::dotenv();

    let config = ServerConfig::from_env().expect("invalid configuration");
    let port = config.port;
    let reducer = Arc::new(ClientRegistry::new(MergeReducer::default()));

    let state = AppState::bootstrap(config, reducer)
        .await
        .expect("store init failed");

    let app = statecast::routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "statecast listening");
    axum::serve(listener, app).await.expect("server failed");
}
