//! Progressive pre-fetch for playback sequences.
//!
//! Meditation instructions play front-to-back, so the first few lines
//! dominate perceived latency: the head window is synthesized eagerly
//! before playback is declared ready, and the tail trickles in through
//! a single throttled background worker. One synthesis is in flight at
//! a time, in both phases.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::fingerprint::Fingerprint;
use crate::gateway::{SynthesisGateway, SynthesisRequest};

/// Lines synthesized eagerly before signaling ready.
pub const DEFAULT_HEAD_COUNT: usize = 3;
/// Fixed pause between background items, to go easy on the provider.
pub const BACKGROUND_THROTTLE: Duration = Duration::from_millis(300);

/// One session's worth of lines to pre-fetch, in playback order.
#[derive(Debug, Clone)]
pub struct PrefetchPlan {
    pub lines: Vec<String>,
    pub voice: String,
    pub provider: String,
    pub owner_id: Option<String>,
    pub head_count: usize,
}

impl PrefetchPlan {
    pub fn new(lines: Vec<String>, voice: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            lines,
            voice: voice.into(),
            provider: provider.into(),
            owner_id: None,
            head_count: DEFAULT_HEAD_COUNT,
        }
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn head_count(mut self, head_count: usize) -> Self {
        self.head_count = head_count;
        self
    }
}

/// What `prime` accomplished before returning.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PrimeSummary {
    pub head_ready: usize,
    pub head_failed: usize,
    pub queued: usize,
    pub skipped: usize,
}

struct QueuedItem {
    epoch: u64,
    id: Fingerprint,
    req: SynthesisRequest,
}

struct SchedulerInner {
    epoch: u64,
    queue: VecDeque<QueuedItem>,
    /// Local read-through cache of fingerprints known to be synthesized.
    known: HashSet<Fingerprint>,
    worker_running: bool,
}

#[derive(Clone)]
pub struct PrefetchScheduler {
    gateway: Arc<SynthesisGateway>,
    throttle: Duration,
    inner: Arc<Mutex<SchedulerInner>>,
}

impl PrefetchScheduler {
    pub fn new(gateway: Arc<SynthesisGateway>) -> Self {
        Self::with_throttle(gateway, BACKGROUND_THROTTLE)
    }

    pub fn with_throttle(gateway: Arc<SynthesisGateway>, throttle: Duration) -> Self {
        Self {
            gateway,
            throttle,
            inner: Arc::new(Mutex::new(SchedulerInner {
                epoch: 0,
                queue: VecDeque::new(),
                known: HashSet::new(),
                worker_running: false,
            })),
        }
    }

    /// Synthesize the head window sequentially, queue the tail for the
    /// background worker, and return once the head is ready. A failed
    /// item is logged and skipped; it never aborts the batch. Priming a
    /// new session discards anything a previous session left queued.
    pub async fn prime(&self, plan: PrefetchPlan) -> PrimeSummary {
        let epoch = self.reset();
        let head_count = plan.head_count.min(plan.lines.len());
        let mut summary = PrimeSummary::default();

        debug!(
            total = plan.lines.len(),
            head = head_count,
            "progressive pre-fetch: eager head, queued tail"
        );

        for line in &plan.lines[..head_count] {
            let req = self.request_for(&plan, line, true);
            let id = req.fingerprint();
            if self.is_known(&id) {
                summary.skipped += 1;
                continue;
            }
            match self.gateway.get_or_synthesize(&req).await {
                Ok(_) => {
                    self.mark_known(id);
                    summary.head_ready += 1;
                }
                Err(e) => {
                    warn!("pre-fetch of head item failed, continuing: {e}");
                    summary.head_failed += 1;
                }
            }
        }

        let spawn_worker = {
            let mut inner = self.inner.lock().unwrap();
            // A reset between head and tail means this plan is stale.
            if inner.epoch != epoch {
                return summary;
            }
            for line in &plan.lines[head_count..] {
                let req = self.request_for(&plan, line, false);
                let id = req.fingerprint();
                if inner.known.contains(&id) {
                    summary.skipped += 1;
                    continue;
                }
                inner.queue.push_back(QueuedItem { epoch, id, req });
                summary.queued += 1;
            }
            if !inner.worker_running && !inner.queue.is_empty() {
                inner.worker_running = true;
                true
            } else {
                false
            }
        };

        if spawn_worker {
            let gateway = Arc::clone(&self.gateway);
            let inner = Arc::clone(&self.inner);
            let throttle = self.throttle;
            tokio::spawn(run_background(gateway, inner, throttle));
        }

        summary
    }

    /// Discard the pending background queue. In-flight work completes
    /// and still populates the cache, but nothing further is processed
    /// from the old session. Returns the new epoch.
    pub fn reset(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.epoch += 1;
        inner.queue.clear();
        inner.epoch
    }

    /// Items still waiting in the background queue.
    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    fn is_known(&self, id: &Fingerprint) -> bool {
        self.inner.lock().unwrap().known.contains(id)
    }

    fn mark_known(&self, id: Fingerprint) {
        self.inner.lock().unwrap().known.insert(id);
    }

    fn request_for(&self, plan: &PrefetchPlan, line: &str, is_starting: bool) -> SynthesisRequest {
        let mut req = SynthesisRequest::new(line, &plan.voice, &plan.provider).starting(is_starting);
        req.owner_id = plan.owner_id.clone();
        req
    }
}

async fn run_background(
    gateway: Arc<SynthesisGateway>,
    inner: Arc<Mutex<SchedulerInner>>,
    throttle: Duration,
) {
    debug!("background pre-fetch worker started");
    loop {
        let item = {
            let mut inner = inner.lock().unwrap();
            loop {
                match inner.queue.pop_front() {
                    // Stale items from a discarded session are dropped.
                    Some(item) if item.epoch != inner.epoch => continue,
                    Some(item) => break Some(item),
                    None => {
                        inner.worker_running = false;
                        break None;
                    }
                }
            }
        };
        let Some(item) = item else {
            debug!("background pre-fetch worker drained");
            return;
        };

        match gateway.get_or_synthesize(&item.req).await {
            Ok(_) => {
                inner.lock().unwrap().known.insert(item.id);
            }
            Err(e) => {
                warn!("background pre-fetch failed, continuing: {e}");
            }
        }

        sleep(throttle).await;
    }
}
