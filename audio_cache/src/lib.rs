//! Content-addressed cache for synthesized speech.
//!
//! Audio is stored under a fingerprint of the synthesis inputs, usage is
//! tracked in a debounced ledger, and eviction is planned from usage
//! scores rather than raw recency. The gateway ties these together with
//! the cache-first synthesis path; the pre-fetch scheduler layers
//! progressive loading on top of the gateway.

pub mod error;
pub mod evict;
pub mod fingerprint;
pub mod gateway;
pub mod ledger;
pub mod prefetch;
pub mod store;

pub use error::{CacheError, ProviderError};
pub use evict::{EvictionBudget, EvictionOutcome, EvictionPlan, EvictionPlanner};
pub use fingerprint::Fingerprint;
pub use gateway::{
    CacheStatus, OptimizeOptions, OptimizeReport, SpeechProvider, SynthesisGateway,
    SynthesisRequest,
};
pub use ledger::{LedgerAnalytics, OwnerInvalidation, UsageLedger};
pub use prefetch::{PrefetchPlan, PrefetchScheduler, PrimeSummary};
pub use store::{ArtifactMeta, ArtifactStore, StoreError};
