//! Cache-or-generate front over the artifact store.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{CacheError, ProviderError};
use crate::evict::{EvictionBudget, EvictionPlanner};
use crate::fingerprint::Fingerprint;
use crate::ledger::{LedgerAnalytics, UsageLedger};
use crate::store::{ArtifactStore, StoreError};

/// Abstract synthesis capability. Request shaping, auth and voice-ID
/// mapping are the implementor's concern, not the cache's.
#[async_trait]
pub trait SpeechProvider: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: String,
    pub provider: String,
    /// Logical owner (instruction-set id) for bulk invalidation and
    /// frequency analytics.
    pub owner_id: Option<String>,
    /// First-in-a-playback-sequence access.
    pub is_starting: bool,
}

impl SynthesisRequest {
    pub fn new(
        text: impl Into<String>,
        voice: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            voice: voice.into(),
            provider: provider.into(),
            owner_id: None,
            is_starting: false,
        }
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn starting(mut self, is_starting: bool) -> Self {
        self.is_starting = is_starting;
        self
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::derive(&self.text, &self.voice, &self.provider)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub file_count: u64,
    pub total_size_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct OptimizeOptions {
    pub max_size_mb: Option<u64>,
    pub max_age_days: Option<f64>,
    pub keep_high_priority: bool,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            max_size_mb: None,
            max_age_days: None,
            keep_high_priority: true,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeReport {
    pub before_count: u64,
    pub after_count: u64,
    pub before_size_bytes: u64,
    pub after_size_bytes: u64,
    pub deleted_count: u64,
    pub bytes_freed: u64,
    pub errors: Vec<String>,
}

/// Fronts the artifact store with a cache-or-generate contract against
/// pluggable TTS providers, recording analytics on every access.
pub struct SynthesisGateway {
    store: ArtifactStore,
    ledger: UsageLedger,
    providers: HashMap<String, Box<dyn SpeechProvider>>,
}

impl SynthesisGateway {
    pub fn new(store: ArtifactStore, ledger: UsageLedger) -> Self {
        Self {
            store,
            ledger,
            providers: HashMap::new(),
        }
    }

    pub fn register_provider(
        &mut self,
        name: impl Into<String>,
        provider: Box<dyn SpeechProvider>,
    ) {
        let name = name.into();
        info!(provider = %name, "speech provider registered");
        self.providers.insert(name, provider);
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    /// Return cached audio for the request, synthesizing and caching it
    /// on a miss. Every successful call advances the usage ledger; a
    /// failed synthesis leaves no artifact and no ledger entry.
    pub async fn get_or_synthesize(&self, req: &SynthesisRequest) -> Result<Vec<u8>, CacheError> {
        let id = req.fingerprint();

        if self.store.has(&id).await? {
            match self.store.read(&id).await {
                Ok(bytes) => {
                    debug!(%id, provider = %req.provider, "tts cache hit");
                    self.ledger
                        .record_access(&id, req.owner_id.as_deref(), req.is_starting);
                    return Ok(bytes);
                }
                // Raced an eviction between has() and read(); fall through
                // and re-synthesize.
                Err(StoreError::NotFound(_)) => {
                    debug!(%id, "artifact vanished before read, re-synthesizing");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let provider = self
            .providers
            .get(&req.provider)
            .ok_or_else(|| CacheError::ProviderUnavailable(req.provider.clone()))?;

        debug!(%id, provider = %req.provider, "tts cache miss, synthesizing");
        let bytes = provider
            .synthesize(&req.text, &req.voice)
            .await
            .map_err(|source| CacheError::ProviderFailed {
                provider: req.provider.clone(),
                source,
            })?;

        self.store.write(&id, &bytes).await?;
        self.ledger
            .record_access(&id, req.owner_id.as_deref(), req.is_starting);
        Ok(bytes)
    }

    pub async fn status(&self) -> Result<CacheStatus, CacheError> {
        let (file_count, total_size_bytes) = self.store.usage().await?;
        Ok(CacheStatus {
            file_count,
            total_size_bytes,
        })
    }

    pub fn analytics(&self) -> LedgerAnalytics {
        self.ledger.analytics()
    }

    /// Drop everything the owner tracked: its usage counters, the access
    /// records of its fingerprints, and the artifacts no other owner
    /// still references. Returns the number of artifacts deleted.
    ///
    /// A failed delete does not abort the sweep; the remaining artifacts
    /// are still attempted and the first failure is reported afterwards.
    pub async fn invalidate_owner(&self, owner_id: &str) -> Result<u64, CacheError> {
        let mut deleted = 0u64;
        let mut first_failure: Option<StoreError> = None;
        for inv in self.ledger.invalidate_owner(owner_id) {
            if inv.shared {
                continue;
            }
            match self.store.delete(&inv.id).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    warn!(id = %inv.id, "owner invalidation delete failed: {e}");
                    first_failure.get_or_insert(e);
                }
            }
        }
        info!(owner_id, deleted, "owner cache invalidated");
        match first_failure {
            Some(e) => Err(e.into()),
            None => Ok(deleted),
        }
    }

    /// Full cache reset: every artifact and all ledger state.
    pub async fn clear_all(&self) -> Result<u64, CacheError> {
        let deleted = self.store.delete_all().await?;
        self.ledger.clear();
        info!(deleted, "tts cache cleared");
        Ok(deleted)
    }

    /// Run the eviction planner against the given budget and report what
    /// changed. Partial deletion failures are reported, not fatal.
    pub async fn optimize(&self, opts: OptimizeOptions) -> Result<OptimizeReport, CacheError> {
        let before = self.status().await?;

        let budget = EvictionBudget {
            max_total_bytes: opts.max_size_mb.map(|mb| mb * 1024 * 1024),
            max_age_days: opts.max_age_days,
        };
        let planner = EvictionPlanner::new(&self.store, &self.ledger);
        let plan = planner.plan(budget, opts.keep_high_priority).await?;
        let outcome = planner.execute(plan).await;

        let after = self.status().await?;
        info!(
            deleted = outcome.deleted_count,
            bytes_freed = outcome.bytes_freed,
            "cache optimize finished"
        );
        Ok(OptimizeReport {
            before_count: before.file_count,
            after_count: after.file_count,
            before_size_bytes: before.total_size_bytes,
            after_size_bytes: after.total_size_bytes,
            deleted_count: outcome.deleted_count,
            bytes_freed: outcome.bytes_freed,
            errors: outcome.errors,
        })
    }
}
