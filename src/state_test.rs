use super::*;
use crate::reducer::{ClientRegistry, MergeReducer};
use std::time::Duration;

fn reducer() -> Arc<dyn Reducer> {
    Arc::new(ClientRegistry::new(MergeReducer::default()))
}

#[tokio::test]
async fn bootstrap_defaults_to_local_queue() {
    let state = AppState::bootstrap(ServerConfig::default(), reducer())
        .await
        .expect("bootstrap");
    assert_eq!(state.engine.get_state().version, 0);
    assert!(!state.config.replicated);
    state.engine.stop();
}

#[tokio::test]
async fn bootstrap_replicated_without_database_uses_memory_backend() {
    let config = ServerConfig { replicated: true, prefix: "boot".into(), ..ServerConfig::default() };
    let state = AppState::bootstrap(config, reducer()).await.expect("bootstrap");
    assert_eq!(state.engine.get_state().version, 0);
    state.engine.stop();
}

#[tokio::test]
async fn bootstrap_rejects_invalid_config() {
    let config = ServerConfig { poll_interval: Duration::ZERO, ..ServerConfig::default() };
    let result = AppState::bootstrap(config, reducer()).await;
    assert!(matches!(result, Err(StartupError::Config(ConfigError::ZeroPollInterval))));
}
