// Presence Trigger Dispatch
//
// Stands in for the trigger infrastructure around the reconciler:
// - matches ephemeral keys against `{status_root}/{userId}`
// - one lane per user: in order within a user, parallel across users
// - the intake loop never waits on a lane; a full lane keeps its newest change
// - redelivers transient failures up to `max_attempts`
// - lanes shut down after `lane_idle_ms` without work

use crate::reconciler::{PresenceReconciler, Reconciliation};
use chatpresence_core::store::ChangeStream;
use chatpresence_core::{ChangeEvent, EphemeralChange, PresenceChange, TriggerConfig};
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle, JoinSet};

/// Delivery totals, summed over all lanes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub applied: usize,
    pub suppressed: usize,
    pub failed: usize,
    pub retries: usize,
    /// Changes on keys that are not presence records
    pub ignored: usize,
    /// Queued changes replaced by a newer one for the same user
    pub coalesced: usize,
    /// Changes the store dropped before the dispatcher could see them
    pub lagged: u64,
    pub lanes_opened: usize,
    /// Lanes shut down after sitting idle
    pub lanes_retired: usize,
}

impl DispatchReport {
    fn merge(&mut self, other: &DispatchReport) {
        self.applied += other.applied;
        self.suppressed += other.suppressed;
        self.failed += other.failed;
        self.retries += other.retries;
        self.ignored += other.ignored;
        self.coalesced += other.coalesced;
        self.lagged += other.lagged;
        self.lanes_opened += other.lanes_opened;
        self.lanes_retired += other.lanes_retired;
    }
}

/// Map a raw store change onto the trigger payload, if the key matches.
pub fn match_trigger(
    reconciler: &PresenceReconciler,
    change: EphemeralChange,
) -> Option<PresenceChange> {
    let user_id = reconciler.paths().user_id_for(&change.key)?;
    Some(PresenceChange {
        user_id,
        before: change.before,
        after: change.after,
    })
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PresenceChange>,
    /// Set once the lane task has stopped taking work
    closed: bool,
    /// Drain what is queued, then stop
    finishing: bool,
}

/// Pending changes of one user, shared by the intake loop and the lane task
struct LaneQueue {
    state: Mutex<QueueState>,
    ready: Notify,
    capacity: usize,
}

enum Push {
    Queued,
    Coalesced,
    /// The lane already stopped; the change is handed back
    Closed(PresenceChange),
}

enum Next {
    Deliver(PresenceChange),
    Finished,
    Retired,
}

impl LaneQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, change: PresenceChange) -> Push {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return Push::Closed(change);
            }
            let full = state.pending.len() >= self.capacity;
            match state.pending.back_mut() {
                // Each change re-reads current state, so the newest one subsumes the last queued
                Some(last) if full => {
                    *last = change;
                    Push::Coalesced
                }
                _ => {
                    state.pending.push_back(change);
                    Push::Queued
                }
            }
        };
        self.ready.notify_one();
        outcome
    }

    fn finish(&self) {
        self.lock().finishing = true;
        self.ready.notify_one();
    }

    fn close(&self) {
        self.lock().closed = true;
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    async fn next(&self, idle: Duration) -> Next {
        loop {
            {
                let mut state = self.lock();
                if let Some(change) = state.pending.pop_front() {
                    return Next::Deliver(change);
                }
                if state.finishing {
                    state.closed = true;
                    return Next::Finished;
                }
            }
            if tokio::time::timeout(idle, self.ready.notified()).await.is_err() {
                let mut state = self.lock();
                if state.pending.is_empty() && !state.finishing {
                    state.closed = true;
                    return Next::Retired;
                }
            }
        }
    }
}

/// Closes the queue however the lane task ends, so no change is parked on a dead lane
struct LaneGuard(Arc<LaneQueue>);

impl Drop for LaneGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

struct LaneExit {
    user_id: String,
    queue: Arc<LaneQueue>,
    report: DispatchReport,
    retired: bool,
}

pub struct TriggerDispatcher {
    reconciler: Arc<PresenceReconciler>,
    config: TriggerConfig,
}

impl TriggerDispatcher {
    pub fn new(reconciler: Arc<PresenceReconciler>, config: TriggerConfig) -> Self {
        Self { reconciler, config }
    }

    /// Deliver every change until the stream ends, then drain all lanes.
    pub async fn run(self, mut changes: ChangeStream) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut lanes: HashMap<String, Arc<LaneQueue>> = HashMap::new();
        let mut tasks: JoinSet<LaneExit> = JoinSet::new();

        tracing::info!("Presence trigger dispatcher started");

        loop {
            tokio::select! {
                event = changes.next() => match event {
                    Some(ChangeEvent::Change(raw)) => {
                        self.route(raw, &mut lanes, &mut tasks, &mut report);
                    }
                    Some(ChangeEvent::Lagged(skipped)) => {
                        tracing::error!("Change stream lagged, {} presence changes were lost", skipped);
                        report.lagged += skipped;
                    }
                    None => break,
                },
                Some(joined) = tasks.join_next() => {
                    reap(joined, &mut lanes, &mut report);
                }
            }
        }

        for queue in lanes.values() {
            queue.finish();
        }
        while let Some(joined) = tasks.join_next().await {
            reap(joined, &mut lanes, &mut report);
        }

        tracing::info!(
            "Presence trigger dispatcher stopped: {} applied, {} suppressed, {} failed",
            report.applied,
            report.suppressed,
            report.failed
        );
        report
    }

    pub fn spawn(self, changes: ChangeStream) -> JoinHandle<DispatchReport> {
        tokio::spawn(self.run(changes))
    }

    fn route(
        &self,
        raw: EphemeralChange,
        lanes: &mut HashMap<String, Arc<LaneQueue>>,
        tasks: &mut JoinSet<LaneExit>,
        report: &mut DispatchReport,
    ) {
        let Some(mut change) = match_trigger(&self.reconciler, raw.clone()) else {
            tracing::debug!("Ignoring change on non-presence key {}", raw.key);
            report.ignored += 1;
            return;
        };

        loop {
            let queue = lanes
                .entry(change.user_id.clone())
                .or_insert_with(|| self.open_lane(&change.user_id, tasks, report));
            match queue.push(change) {
                Push::Queued => return,
                Push::Coalesced => {
                    report.coalesced += 1;
                    return;
                }
                Push::Closed(returned) => {
                    lanes.remove(&returned.user_id);
                    change = returned;
                }
            }
        }
    }

    fn open_lane(
        &self,
        user_id: &str,
        tasks: &mut JoinSet<LaneExit>,
        report: &mut DispatchReport,
    ) -> Arc<LaneQueue> {
        let queue = Arc::new(LaneQueue::new(self.config.lane_capacity));
        let guard = LaneGuard(queue.clone());
        let reconciler = self.reconciler.clone();
        let config = self.config.clone();
        let user_id = user_id.to_string();
        tracing::debug!("Opening trigger lane for user {}", user_id);
        report.lanes_opened += 1;

        tasks.spawn(async move {
            let mut report = DispatchReport::default();
            let idle = config.lane_idle();
            let retired = loop {
                match guard.0.next(idle).await {
                    Next::Deliver(change) => deliver(&reconciler, &config, &change, &mut report).await,
                    Next::Finished => break false,
                    Next::Retired => break true,
                }
            };
            LaneExit {
                user_id,
                queue: guard.0.clone(),
                report,
                retired,
            }
        });

        queue
    }
}

fn reap(
    joined: Result<LaneExit, JoinError>,
    lanes: &mut HashMap<String, Arc<LaneQueue>>,
    report: &mut DispatchReport,
) {
    match joined {
        Ok(exit) => {
            if exit.retired {
                tracing::debug!("Retiring idle trigger lane for user {}", exit.user_id);
                report.lanes_retired += 1;
            }
            if lanes
                .get(&exit.user_id)
                .is_some_and(|queue| Arc::ptr_eq(queue, &exit.queue))
            {
                lanes.remove(&exit.user_id);
            }
            report.merge(&exit.report);
        }
        Err(e) => {
            tracing::error!("Trigger lane panicked: {}", e);
            lanes.retain(|_, queue| !queue.is_closed());
        }
    }
}

/// One change, with redelivery of transient failures.
async fn deliver(
    reconciler: &PresenceReconciler,
    config: &TriggerConfig,
    change: &PresenceChange,
    report: &mut DispatchReport,
) {
    let mut attempt = 1;
    loop {
        match reconciler.handle(change).await {
            Ok(Reconciliation::Apply(_)) => {
                report.applied += 1;
                return;
            }
            Ok(Reconciliation::Stale { .. }) => {
                report.suppressed += 1;
                return;
            }
            Err(e) if e.is_transient() && attempt < config.max_attempts => {
                tracing::warn!(
                    "Presence event for user {} failed (attempt {}/{}): {}",
                    change.user_id,
                    attempt,
                    config.max_attempts,
                    e
                );
                report.retries += 1;
                attempt += 1;
                tokio::time::sleep(config.retry_backoff()).await;
            }
            Err(e) => {
                tracing::error!(
                    "Presence event for user {} failed after {} attempt(s): {}",
                    change.user_id,
                    attempt,
                    e
                );
                report.failed += 1;
                return;
            }
        }
    }
}
