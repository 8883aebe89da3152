#![allow(dead_code)]

use std::time::Duration;

use kalix_session::EngineConfig;

/// Route tracing output through the test harness. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Launch configuration pointing at the in-tree mock engine.
pub fn mock_engine() -> EngineConfig {
    EngineConfig::new(env!("CARGO_BIN_EXE_mock-kalixcli"))
}

/// Poll `condition` until it holds or ten seconds pass.
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
