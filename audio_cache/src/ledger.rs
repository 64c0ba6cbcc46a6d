//! Usage analytics ledger with debounced persistence.
//!
//! Tracks per-fingerprint access counts, last-access times and derived
//! priority scores, plus per-instruction frequency counters and the
//! instruction -> fingerprints index used for bulk invalidation. All
//! mutation goes through this type; the maps are never exposed for
//! direct writes.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, warn};

use crate::fingerprint::Fingerprint;

/// Even month-old accesses keep 10% of their weight.
const RECENCY_FLOOR: f64 = 0.1;
/// Days over which the recency factor decays linearly to the floor.
const RECENCY_WINDOW_DAYS: f64 = 30.0;
const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Trailing window during which repeated writes coalesce into one persist.
pub const FLUSH_DEBOUNCE: Duration = Duration::from_secs(5);

/// Durable snapshot shape. The field names are the wire format and must
/// round-trip exactly; do not rename them.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct LedgerState {
    #[serde(rename = "accessCount")]
    access_count: HashMap<String, u64>,
    #[serde(rename = "lastAccessed")]
    last_accessed: HashMap<String, i64>,
    #[serde(rename = "priorityScores")]
    priority_scores: HashMap<String, f64>,
    #[serde(rename = "instructionFrequency")]
    instruction_frequency: HashMap<String, u64>,
    #[serde(rename = "startingInstructions")]
    starting_instructions: HashMap<String, u64>,
    #[serde(rename = "instructionAudioMap", default)]
    instruction_audio_map: HashMap<String, Vec<String>>,
}

/// Pending-flush state machine: Clean -> Dirty(deadline) -> Flushing -> Clean.
/// A write during Flushing schedules exactly one follow-up flush.
#[derive(Debug, Clone, Copy)]
enum FlushState {
    Clean,
    Dirty { deadline: Instant },
    Flushing { dirty_again: bool },
}

/// A fingerprint's ledger entry, as seen by callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRecord {
    pub access_count: u64,
    pub last_accessed_at: DateTime<Utc>,
    pub priority_score: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintStat {
    pub id: String,
    pub access_count: u64,
    pub last_accessed_at: DateTime<Utc>,
    pub priority_score: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerStat {
    pub owner_id: String,
    pub count: u64,
}

/// Size-bounded top-K projections of the ledger. Serialized with the
/// same camelCase field names the REST surface uses everywhere else.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerAnalytics {
    pub top_accessed: Vec<FingerprintStat>,
    pub recently_accessed: Vec<FingerprintStat>,
    pub highest_priority: Vec<FingerprintStat>,
    pub top_owners_by_frequency: Vec<OwnerStat>,
    pub top_owners_by_starting_frequency: Vec<OwnerStat>,
}

/// Result of invalidating one tracked fingerprint of an owner.
#[derive(Debug, Clone)]
pub struct OwnerInvalidation {
    pub id: Fingerprint,
    /// Still referenced by another owner; the artifact must be kept.
    pub shared: bool,
}

struct LedgerInner {
    state: Mutex<LedgerState>,
    flush: Mutex<FlushState>,
    snapshot_path: PathBuf,
    debounce: Duration,
}

#[derive(Clone)]
pub struct UsageLedger {
    inner: Arc<LedgerInner>,
}

impl UsageLedger {
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self::with_debounce(snapshot_path, FLUSH_DEBOUNCE)
    }

    pub fn with_debounce(snapshot_path: impl Into<PathBuf>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                state: Mutex::new(LedgerState::default()),
                flush: Mutex::new(FlushState::Clean),
                snapshot_path: snapshot_path.into(),
                debounce,
            }),
        }
    }

    /// Load the snapshot from disk. A missing or corrupt snapshot resets
    /// to empty state with a warning; startup never fails here.
    pub async fn load(&self) {
        match tokio::fs::read(&self.inner.snapshot_path).await {
            Ok(bytes) => match serde_json::from_slice::<LedgerState>(&bytes) {
                Ok(state) => {
                    let entries = state.access_count.len();
                    *self.inner.state.lock().unwrap() = state;
                    debug!(entries, "usage ledger loaded");
                }
                Err(e) => {
                    warn!("usage ledger snapshot is corrupt, starting empty: {e}");
                    *self.inner.state.lock().unwrap() = LedgerState::default();
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no usage ledger snapshot yet, starting empty");
            }
            Err(e) => {
                warn!("could not read usage ledger snapshot, starting empty: {e}");
            }
        }
    }

    /// Write the snapshot to disk immediately, bypassing the debounce.
    pub async fn persist(&self) -> std::io::Result<()> {
        write_snapshot(&self.inner).await
    }

    /// Record one access (hit or miss-then-populate) for `id`.
    ///
    /// Must be called from within a tokio runtime: the debounced flush
    /// task is spawned from here.
    pub fn record_access(&self, id: &Fingerprint, owner_id: Option<&str>, is_starting: bool) {
        self.record_access_at(id, owner_id, is_starting, Utc::now());
    }

    /// As [`record_access`](Self::record_access), with an explicit clock.
    pub fn record_access_at(
        &self,
        id: &Fingerprint,
        owner_id: Option<&str>,
        is_starting: bool,
        now: DateTime<Utc>,
    ) {
        {
            let mut state = self.inner.state.lock().unwrap();
            let key = id.as_str().to_string();
            let count = {
                let count = state.access_count.entry(key.clone()).or_insert(0);
                *count += 1;
                *count
            };
            let now_ms = now.timestamp_millis();
            state.last_accessed.insert(key.clone(), now_ms);
            state
                .priority_scores
                .insert(key.clone(), score_for(count, now_ms, now));

            if let Some(owner) = owner_id {
                *state
                    .instruction_frequency
                    .entry(owner.to_string())
                    .or_insert(0) += 1;
                if is_starting {
                    *state
                        .starting_instructions
                        .entry(owner.to_string())
                        .or_insert(0) += 1;
                }
                let tracked = state
                    .instruction_audio_map
                    .entry(owner.to_string())
                    .or_default();
                if !tracked.contains(&key) {
                    tracked.push(key);
                }
            }
        }
        self.mark_dirty();
    }

    pub fn record(&self, id: &Fingerprint) -> Option<AccessRecord> {
        let state = self.inner.state.lock().unwrap();
        let count = *state.access_count.get(id.as_str())?;
        let last_ms = *state.last_accessed.get(id.as_str())?;
        Some(AccessRecord {
            access_count: count,
            last_accessed_at: millis_to_datetime(last_ms),
            priority_score: *state.priority_scores.get(id.as_str()).unwrap_or(&0.0),
        })
    }

    /// Priority score recomputed against the current clock. Age moves
    /// even without new accesses, so eviction planning always recomputes.
    pub fn priority_score(&self, id: &Fingerprint) -> Option<f64> {
        self.priority_score_at(id, Utc::now())
    }

    pub fn priority_score_at(&self, id: &Fingerprint, now: DateTime<Utc>) -> Option<f64> {
        let state = self.inner.state.lock().unwrap();
        let count = *state.access_count.get(id.as_str())?;
        let last_ms = *state.last_accessed.get(id.as_str())?;
        Some(score_for(count, last_ms, now))
    }

    /// `(score recomputed at `now`, last-access unix millis)` for eviction
    /// planning. `None` when the ledger has no entry for the id.
    pub fn planning_entry(&self, id: &Fingerprint, now: DateTime<Utc>) -> Option<(f64, i64)> {
        let state = self.inner.state.lock().unwrap();
        let count = *state.access_count.get(id.as_str())?;
        let last_ms = *state.last_accessed.get(id.as_str())?;
        Some((score_for(count, last_ms, now), last_ms))
    }

    /// Remove the access record for `id`. Owner lists are untouched; use
    /// [`detach`](Self::detach) when the artifact itself goes away.
    pub fn invalidate(&self, id: &Fingerprint) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.access_count.remove(id.as_str());
            state.last_accessed.remove(id.as_str());
            state.priority_scores.remove(id.as_str());
        }
        self.mark_dirty();
    }

    /// Drop `id` from every owner's fingerprint list, removing lists
    /// that become empty.
    pub fn detach(&self, id: &Fingerprint) {
        {
            let mut state = self.inner.state.lock().unwrap();
            for tracked in state.instruction_audio_map.values_mut() {
                tracked.retain(|k| k != id.as_str());
            }
            state
                .instruction_audio_map
                .retain(|_, tracked| !tracked.is_empty());
        }
        self.mark_dirty();
    }

    /// Remove the owner's usage counters and access records for every
    /// fingerprint it tracked. Returns the tracked fingerprints with a
    /// flag telling whether another owner still references each one, so
    /// the caller can decide which artifacts to delete.
    pub fn invalidate_owner(&self, owner_id: &str) -> Vec<OwnerInvalidation> {
        let result = {
            let mut state = self.inner.state.lock().unwrap();
            state.instruction_frequency.remove(owner_id);
            state.starting_instructions.remove(owner_id);
            let tracked = state
                .instruction_audio_map
                .remove(owner_id)
                .unwrap_or_default();

            tracked
                .into_iter()
                .filter_map(|key| {
                    state.access_count.remove(&key);
                    state.last_accessed.remove(&key);
                    state.priority_scores.remove(&key);
                    let shared = state
                        .instruction_audio_map
                        .values()
                        .any(|list| list.contains(&key));
                    Fingerprint::from_hex(&key).map(|id| OwnerInvalidation { id, shared })
                })
                .collect()
        };
        self.mark_dirty();
        result
    }

    /// Reset all ledger state (full cache clear).
    pub fn clear(&self) {
        *self.inner.state.lock().unwrap() = LedgerState::default();
        self.mark_dirty();
    }

    pub fn analytics(&self) -> LedgerAnalytics {
        self.analytics_at(Utc::now())
    }

    pub fn analytics_at(&self, now: DateTime<Utc>) -> LedgerAnalytics {
        let state = self.inner.state.lock().unwrap();
        let mut stats: Vec<FingerprintStat> = state
            .access_count
            .iter()
            .map(|(key, &count)| {
                let last_ms = *state.last_accessed.get(key).unwrap_or(&0);
                FingerprintStat {
                    id: key.clone(),
                    access_count: count,
                    last_accessed_at: millis_to_datetime(last_ms),
                    priority_score: score_for(count, last_ms, now),
                }
            })
            .collect();

        let top_accessed = top_by(&mut stats, 10, |a, b| {
            b.access_count
                .cmp(&a.access_count)
                .then_with(|| a.id.cmp(&b.id))
        });
        let recently_accessed = top_by(&mut stats, 10, |a, b| {
            b.last_accessed_at
                .cmp(&a.last_accessed_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let highest_priority = top_by(&mut stats, 10, |a, b| {
            b.priority_score
                .total_cmp(&a.priority_score)
                .then_with(|| a.id.cmp(&b.id))
        });

        let top_owners_by_frequency = top_owners(&state.instruction_frequency, 5);
        let top_owners_by_starting_frequency = top_owners(&state.starting_instructions, 5);

        LedgerAnalytics {
            top_accessed,
            recently_accessed,
            highest_priority,
            top_owners_by_frequency,
            top_owners_by_starting_frequency,
        }
    }

    /// Number of tracked fingerprints (diagnostics).
    pub fn tracked_count(&self) -> usize {
        self.inner.state.lock().unwrap().access_count.len()
    }

    fn mark_dirty(&self) {
        let mut flush = self.inner.flush.lock().unwrap();
        match &mut *flush {
            FlushState::Clean => {
                *flush = FlushState::Dirty {
                    deadline: Instant::now() + self.inner.debounce,
                };
                let inner = Arc::clone(&self.inner);
                tokio::spawn(flush_task(inner));
            }
            // Timer armed: push the deadline out (trailing debounce).
            FlushState::Dirty { deadline } => {
                *deadline = Instant::now() + self.inner.debounce;
            }
            // Flush in flight: schedule exactly one follow-up.
            FlushState::Flushing { dirty_again } => {
                *dirty_again = true;
            }
        }
    }
}

async fn flush_task(inner: Arc<LedgerInner>) {
    loop {
        // Wait out the trailing window; each new write pushes the deadline.
        loop {
            let deadline = {
                let flush = inner.flush.lock().unwrap();
                match *flush {
                    FlushState::Dirty { deadline } => deadline,
                    // Lost state (clear during shutdown paths); nothing to do.
                    _ => return,
                }
            };
            if Instant::now() >= deadline {
                *inner.flush.lock().unwrap() = FlushState::Flushing { dirty_again: false };
                break;
            }
            sleep_until(deadline).await;
        }

        if let Err(e) = write_snapshot(&inner).await {
            warn!("failed to persist usage ledger: {e}");
        }

        let mut flush = inner.flush.lock().unwrap();
        match *flush {
            FlushState::Flushing { dirty_again: true } => {
                *flush = FlushState::Dirty {
                    deadline: Instant::now() + inner.debounce,
                };
            }
            _ => {
                *flush = FlushState::Clean;
                return;
            }
        }
    }
}

async fn write_snapshot(inner: &LedgerInner) -> std::io::Result<()> {
    let json = {
        let state = inner.state.lock().unwrap();
        serde_json::to_vec_pretty(&*state)?
    };
    if let Some(parent) = inner.snapshot_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&inner.snapshot_path, json).await?;
    debug!(path = %inner.snapshot_path.display(), "usage ledger persisted");
    Ok(())
}

/// `accessCount * max(0.1, 1 - daysSinceLastAccess/30)`.
fn score_for(count: u64, last_access_ms: i64, now: DateTime<Utc>) -> f64 {
    let age_ms = (now.timestamp_millis() - last_access_ms).max(0) as f64;
    let days = age_ms / MILLIS_PER_DAY;
    let recency = (1.0 - days / RECENCY_WINDOW_DAYS).max(RECENCY_FLOOR);
    count as f64 * recency
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
}

fn top_by<F>(stats: &mut [FingerprintStat], k: usize, cmp: F) -> Vec<FingerprintStat>
where
    F: FnMut(&FingerprintStat, &FingerprintStat) -> std::cmp::Ordering,
{
    stats.sort_by(cmp);
    stats.iter().take(k).cloned().collect()
}

fn top_owners(counters: &HashMap<String, u64>, k: usize) -> Vec<OwnerStat> {
    let mut owners: Vec<OwnerStat> = counters
        .iter()
        .map(|(owner_id, &count)| OwnerStat {
            owner_id: owner_id.clone(),
            count,
        })
        .collect();
    owners.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.owner_id.cmp(&b.owner_id)));
    owners.truncate(k);
    owners
}
