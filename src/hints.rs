/// Device client-hints cache
///
/// The hints probe resolves asynchronously and may land after the main
/// resolution path has already decided to proceed. Its result is stored for
/// use by future resolution calls and never blocks current delivery.
use crate::storage::{Backend, DualStore};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Storage key of the cached client-hints blob
pub const CLIENT_HINTS_KEY: &str = "_pid_ch";

/// Host-supplied probe for device/browser client-hints
#[async_trait]
pub trait HintsProvider: Send + Sync {
    /// Resolve the high-entropy client-hints blob, if the platform offers one
    async fn probe(&self) -> Option<String>;
}

/// Read the already-cached hints blob; never triggers a probe
pub async fn cached_hints(store: &DualStore, allowed: &[Backend]) -> Option<String> {
    store.read(CLIENT_HINTS_KEY, allowed).await
}

/// Kick off a detached probe whose result is persisted for future calls
pub fn spawn_probe(provider: Arc<dyn HintsProvider>, store: DualStore, allowed: Vec<Backend>) {
    tokio::spawn(async move {
        if let Some(blob) = provider.probe().await {
            debug!("Client-hints probe resolved, caching for future calls");
            store.write(CLIENT_HINTS_KEY, &blob, &allowed).await;
        }
    });
}
