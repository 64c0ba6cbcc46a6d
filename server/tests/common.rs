//! Common utilities for integration tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tempfile::TempDir;

use audio_cache::{ArtifactStore, ProviderError, SpeechProvider, SynthesisGateway, UsageLedger};
use server::config::ServerConfig;
use server::{build_router, AppState};

/// Deterministic provider: counts calls, returns `mp3:<text>` bytes.
pub struct MockProvider {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl SpeechProvider for MockProvider {
    async fn synthesize(&self, text: &str, _voice: &str) -> Result<Vec<u8>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("mp3:{text}").into_bytes())
    }
}

/// Create a test app instance backed by a temp dir and a mock "openai"
/// provider. The temp dir must outlive the returned router.
pub async fn create_test_app() -> (Router, Arc<AtomicUsize>, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::open(dir.path().join("audio-cache"))
        .await
        .unwrap();
    let ledger = UsageLedger::with_debounce(
        dir.path().join("tts-usage.json"),
        Duration::from_millis(20),
    );

    let calls = Arc::new(AtomicUsize::new(0));
    let mut gateway = SynthesisGateway::new(store, ledger);
    gateway.register_provider(
        "openai",
        Box::new(MockProvider {
            calls: Arc::clone(&calls),
        }),
    );

    let config = ServerConfig {
        data_dir: dir.path().to_path_buf(),
        ..ServerConfig::default()
    };
    let state = AppState::new(Arc::new(gateway), config);

    (build_router(state), calls, dir)
}
