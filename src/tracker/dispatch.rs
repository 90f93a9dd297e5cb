//! Ordered fan-out of accounting events over a fixed set of workers.
//!
//! Events are routed to a lane by NAS address, and each lane's worker applies
//! its events one at a time in submission order. Every event of a session,
//! and any NAS reset covering it, shares a lane, so a STOP can never overtake
//! the START it ends. Different NASes proceed in parallel.

use crate::tracker::event::AccountingEvent;
use crate::tracker::processor::{Outcome, SessionTracker};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Events buffered per lane before `submit` waits.
const LANE_CAPACITY: usize = 256;

/// Outcome counts for a batch of events.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub applied: usize,
    pub ignored: usize,
    pub unavailable: usize,
}

impl Tally {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Applied => self.applied += 1,
            Outcome::Ignored => self.ignored += 1,
            Outcome::Unavailable => self.unavailable += 1,
        }
    }

    fn merge(&mut self, other: Tally) {
        self.applied += other.applied;
        self.ignored += other.ignored;
        self.unavailable += other.unavailable;
    }
}

/// Lane for events from `nas_ip`. Events without a NAS address share a lane.
pub(crate) fn lane_for(nas_ip: Option<&str>, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    nas_ip.unwrap_or_default().hash(&mut hasher);
    (hasher.finish() % lanes.max(1) as u64) as usize
}

async fn apply_in_order(
    tracker: Arc<SessionTracker>,
    mut events: mpsc::Receiver<AccountingEvent>,
) -> Tally {
    let mut tally = Tally::default();
    while let Some(event) = events.recv().await {
        tally.record(tracker.handle(&event).await);
    }
    tally
}

/// Applies events concurrently across NASes while keeping per-NAS order.
pub struct Dispatcher {
    lanes: Vec<mpsc::Sender<AccountingEvent>>,
    workers: JoinSet<Tally>,
    dropped: usize,
}

impl Dispatcher {
    /// Starts `lanes` workers (at least one) on the current runtime.
    pub fn new(tracker: Arc<SessionTracker>, lanes: usize) -> Self {
        let mut workers = JoinSet::new();
        let lanes = (0..lanes.max(1))
            .map(|_| {
                let (tx, rx) = mpsc::channel(LANE_CAPACITY);
                workers.spawn(apply_in_order(tracker.clone(), rx));
                tx
            })
            .collect();

        Self {
            lanes,
            workers,
            dropped: 0,
        }
    }

    /// Queues `event` behind every earlier event from the same NAS, waiting
    /// while that lane is full.
    pub async fn submit(&mut self, event: AccountingEvent) {
        let lane = lane_for(event.nas(), self.lanes.len());
        let Some(tx) = self.lanes.get(lane) else {
            return;
        };
        if tx.send(event).await.is_err() {
            tracing::error!(lane, "accounting worker gone, event dropped");
            self.dropped += 1;
        }
    }

    /// Closes every lane, waits for queued events to be applied and returns
    /// the combined counts. Dropped events count as unavailable.
    pub async fn finish(self) -> Tally {
        let Self {
            lanes,
            mut workers,
            dropped,
        } = self;
        drop(lanes);

        let mut total = Tally {
            unavailable: dropped,
            ..Tally::default()
        };
        while let Some(done) = workers.join_next().await {
            match done {
                Ok(tally) => total.merge(tally),
                Err(e) => tracing::error!(error = %e, "accounting worker failed"),
            }
        }
        total
    }
}

#[cfg(test)]
#[path = "tests/dispatch_tests.rs"]
mod tests;
