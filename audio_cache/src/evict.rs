//! Usage-weighted eviction planning.
//!
//! Eviction runs only on explicit invocation; there is no background
//! trigger. The ledger is the source of truth for last-access times;
//! filesystem mtime is used only for artifacts the ledger never saw.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::fingerprint::Fingerprint;
use crate::ledger::UsageLedger;
use crate::store::{ArtifactStore, StoreError};

/// Candidates scoring above this are kept by the keep-high-priority
/// policy even when the size budget remains unmet.
pub const HIGH_PRIORITY_THRESHOLD: f64 = 5.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct EvictionBudget {
    pub max_total_bytes: Option<u64>,
    pub max_age_days: Option<f64>,
}

#[derive(Debug)]
pub struct EvictionPlan {
    victims: Vec<Victim>,
}

impl EvictionPlan {
    pub fn victim_ids(&self) -> impl Iterator<Item = &Fingerprint> {
        self.victims.iter().map(|v| &v.id)
    }

    pub fn len(&self) -> usize {
        self.victims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.victims.is_empty()
    }
}

#[derive(Debug)]
struct Victim {
    id: Fingerprint,
    size_bytes: u64,
}

#[derive(Debug, Default)]
pub struct EvictionOutcome {
    pub deleted_count: u64,
    pub bytes_freed: u64,
    /// Per-file failures; the rest of the plan still ran.
    pub errors: Vec<String>,
}

pub struct EvictionPlanner<'a> {
    store: &'a ArtifactStore,
    ledger: &'a UsageLedger,
}

struct Candidate {
    id: Fingerprint,
    size_bytes: u64,
    score: f64,
    last_access_ms: i64,
}

impl<'a> EvictionPlanner<'a> {
    pub fn new(store: &'a ArtifactStore, ledger: &'a UsageLedger) -> Self {
        Self { store, ledger }
    }

    pub async fn plan(
        &self,
        budget: EvictionBudget,
        keep_high_priority: bool,
    ) -> Result<EvictionPlan, StoreError> {
        self.plan_at(budget, keep_high_priority, Utc::now()).await
    }

    pub async fn plan_at(
        &self,
        budget: EvictionBudget,
        keep_high_priority: bool,
        now: DateTime<Utc>,
    ) -> Result<EvictionPlan, StoreError> {
        let now_ms = now.timestamp_millis();
        let mut candidates = Vec::new();
        for meta in self.store.list_all().await? {
            let (score, last_access_ms) = match self.ledger.planning_entry(&meta.id, now) {
                Some(entry) => entry,
                // Untracked artifact: score 0, age from storage mtime.
                None => (0.0, system_time_millis(meta.modified)),
            };
            candidates.push(Candidate {
                id: meta.id,
                size_bytes: meta.size_bytes,
                score,
                last_access_ms,
            });
        }

        let mut victims = Vec::new();

        // Age pass first; unconditional, not subject to keep_high_priority.
        let mut remaining = Vec::new();
        for c in candidates {
            let age_days = (now_ms - c.last_access_ms).max(0) as f64 / 86_400_000.0;
            if budget.max_age_days.is_some_and(|max| age_days > max) {
                victims.push(Victim {
                    id: c.id,
                    size_bytes: c.size_bytes,
                });
            } else {
                remaining.push(c);
            }
        }

        // Size pass over whatever the age pass left behind.
        if let Some(max_bytes) = budget.max_total_bytes {
            let mut total: u64 = remaining.iter().map(|c| c.size_bytes).sum();
            if total > max_bytes {
                remaining.sort_by(|a, b| {
                    a.score
                        .total_cmp(&b.score)
                        .then_with(|| a.last_access_ms.cmp(&b.last_access_ms))
                        .then_with(|| a.id.cmp(&b.id))
                });
                for c in remaining {
                    if total <= max_bytes {
                        break;
                    }
                    if keep_high_priority && c.score > HIGH_PRIORITY_THRESHOLD {
                        // Under-shooting the budget is accepted here.
                        continue;
                    }
                    total -= c.size_bytes;
                    victims.push(Victim {
                        id: c.id,
                        size_bytes: c.size_bytes,
                    });
                }
            }
        }

        debug!(victims = victims.len(), "eviction plan ready");
        Ok(EvictionPlan { victims })
    }

    /// Delete every planned victim, removing its access record and
    /// detaching it from owner lists. Per-file failures are collected,
    /// not fatal; "already gone" is tolerated.
    pub async fn execute(&self, plan: EvictionPlan) -> EvictionOutcome {
        let mut outcome = EvictionOutcome::default();
        for victim in plan.victims {
            // Eviction may interleave with other deleters; re-check.
            match self.store.has(&victim.id).await {
                Ok(true) => match self.store.delete(&victim.id).await {
                    Ok(()) => {
                        outcome.deleted_count += 1;
                        outcome.bytes_freed += victim.size_bytes;
                    }
                    Err(e) => {
                        warn!(id = %victim.id, "eviction delete failed: {e}");
                        outcome.errors.push(format!("{}: {e}", victim.id));
                        continue;
                    }
                },
                Ok(false) => {}
                Err(e) => {
                    outcome.errors.push(format!("{}: {e}", victim.id));
                    continue;
                }
            }
            self.ledger.invalidate(&victim.id);
            self.ledger.detach(&victim.id);
        }
        outcome
    }
}

fn system_time_millis(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;
    use tokio::time::Duration;

    fn fp(text: &str) -> Fingerprint {
        Fingerprint::derive(text, "alloy", "openai")
    }

    async fn fixture() -> (ArtifactStore, UsageLedger, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path().join("audio-cache"))
            .await
            .unwrap();
        let ledger = UsageLedger::with_debounce(
            dir.path().join("tts-usage.json"),
            Duration::from_millis(20),
        );
        (store, ledger, dir)
    }

    #[tokio::test]
    async fn age_pass_deletes_regardless_of_priority() {
        let (store, ledger, _dir) = fixture().await;
        let now = Utc::now();

        // 2 MB file accessed heavily, but 10 days old.
        let old = fp("old but popular");
        store.write(&old, &vec![0u8; 2 * 1024 * 1024]).await.unwrap();
        for _ in 0..20 {
            ledger.record_access_at(&old, None, false, now - ChronoDuration::days(10));
        }

        // 0.5 MB file accessed yesterday.
        let fresh = fp("fresh");
        store.write(&fresh, &vec![0u8; 512 * 1024]).await.unwrap();
        ledger.record_access_at(&fresh, None, false, now - ChronoDuration::days(1));

        let planner = EvictionPlanner::new(&store, &ledger);
        let plan = planner
            .plan_at(
                EvictionBudget {
                    max_total_bytes: Some(1024 * 1024),
                    max_age_days: Some(7.0),
                },
                true,
                now,
            )
            .await
            .unwrap();

        let victims: Vec<_> = plan.victim_ids().cloned().collect();
        assert_eq!(victims, vec![old.clone()]);

        let outcome = planner.execute(plan).await;
        assert_eq!(outcome.deleted_count, 1);
        assert_eq!(outcome.bytes_freed, 2 * 1024 * 1024);
        assert!(outcome.errors.is_empty());
        assert!(!store.has(&old).await.unwrap());
        assert!(store.has(&fresh).await.unwrap());
        assert!(ledger.record(&old).is_none());
    }

    #[tokio::test]
    async fn size_pass_evicts_lowest_score_first() {
        let (store, ledger, _dir) = fixture().await;
        let now = Utc::now();

        let cold = fp("cold");
        let warm = fp("warm");
        let hot = fp("hot");
        for id in [&cold, &warm, &hot] {
            store.write(id, &vec![0u8; 1000]).await.unwrap();
        }
        ledger.record_access_at(&cold, None, false, now);
        for _ in 0..3 {
            ledger.record_access_at(&warm, None, false, now);
        }
        for _ in 0..5 {
            ledger.record_access_at(&hot, None, false, now);
        }

        let planner = EvictionPlanner::new(&store, &ledger);
        let plan = planner
            .plan_at(
                EvictionBudget {
                    max_total_bytes: Some(1500),
                    max_age_days: None,
                },
                false,
                now,
            )
            .await
            .unwrap();

        let victims: Vec<_> = plan.victim_ids().cloned().collect();
        assert_eq!(victims, vec![cold.clone(), warm.clone()]);

        planner.execute(plan).await;
        let (_, total) = store.usage().await.unwrap();
        assert!(total <= 1500);
        assert!(store.has(&hot).await.unwrap());
    }

    #[tokio::test]
    async fn keep_high_priority_may_undershoot_budget() {
        let (store, ledger, _dir) = fixture().await;
        let now = Utc::now();

        let precious = fp("precious");
        store.write(&precious, &vec![0u8; 4000]).await.unwrap();
        // Score 10 at zero age, well above the threshold.
        for _ in 0..10 {
            ledger.record_access_at(&precious, None, false, now);
        }

        let planner = EvictionPlanner::new(&store, &ledger);
        let plan = planner
            .plan_at(
                EvictionBudget {
                    max_total_bytes: Some(1000),
                    max_age_days: None,
                },
                true,
                now,
            )
            .await
            .unwrap();
        assert!(plan.is_empty());

        // Without the policy the same artifact is fair game.
        let plan = planner
            .plan_at(
                EvictionBudget {
                    max_total_bytes: Some(1000),
                    max_age_days: None,
                },
                false,
                now,
            )
            .await
            .unwrap();
        assert_eq!(plan.len(), 1);
    }

    #[tokio::test]
    async fn untracked_artifacts_score_zero_and_use_mtime() {
        let (store, ledger, _dir) = fixture().await;
        let now = Utc::now();

        let untracked = fp("never recorded");
        store.write(&untracked, &vec![0u8; 100]).await.unwrap();
        let tracked = fp("recorded");
        store.write(&tracked, &vec![0u8; 100]).await.unwrap();
        ledger.record_access_at(&tracked, None, false, now);

        let planner = EvictionPlanner::new(&store, &ledger);
        let plan = planner
            .plan_at(
                EvictionBudget {
                    max_total_bytes: Some(150),
                    max_age_days: None,
                },
                true,
                now,
            )
            .await
            .unwrap();

        let victims: Vec<_> = plan.victim_ids().cloned().collect();
        assert_eq!(victims, vec![untracked]);
    }

    #[tokio::test]
    async fn execute_tolerates_already_gone() {
        let (store, ledger, _dir) = fixture().await;
        let id = fp("vanishing");
        store.write(&id, b"bytes").await.unwrap();
        ledger.record_access(&id, None, false);

        let planner = EvictionPlanner::new(&store, &ledger);
        let plan = planner
            .plan(
                EvictionBudget {
                    max_total_bytes: Some(0),
                    max_age_days: None,
                },
                false,
            )
            .await
            .unwrap();

        // Someone else deletes the file between plan and execute.
        store.delete(&id).await.unwrap();

        let outcome = planner.execute(plan).await;
        assert_eq!(outcome.deleted_count, 0);
        assert!(outcome.errors.is_empty());
        // Ledger state is still purged.
        assert!(ledger.record(&id).is_none());
    }
}
