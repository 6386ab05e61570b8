//! Reconciliation sweep: re-publish events that were stored but never queued.
//!
//! Ingestion commits on the store write and treats publishing as best effort.
//! The sweep closes that gap by scanning for un-queued events older than a grace
//! period (so in-flight requests are left alone), publishing each and marking it
//! queued. Failures are logged and retried on the next sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use pulse_events::EventQueue;

use crate::event_store::{EventStore, EventStoreError};
use crate::retry::sleep_or_cancel;

pub const DEFAULT_SWEEP_LIMIT: usize = 500;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub republished: usize,
    pub failed: usize,
}

pub struct Reconciler {
    store: Arc<dyn EventStore>,
    queue: Arc<dyn EventQueue>,
    grace: Duration,
    interval: Duration,
    limit: usize,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn EventStore>,
        queue: Arc<dyn EventQueue>,
        grace: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            grace,
            interval,
            limit: DEFAULT_SWEEP_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// One pass over the store.
    #[instrument(skip(self), err)]
    pub async fn sweep_once(&self) -> Result<SweepReport, EventStoreError> {
        let grace = chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::zero());
        let cutoff = Utc::now() - grace;
        let pending = self.store.list_unqueued(cutoff, self.limit).await?;

        let mut report = SweepReport {
            scanned: pending.len(),
            ..SweepReport::default()
        };

        for event in pending {
            if let Err(err) = self.queue.publish(&event).await {
                warn!(event_id = %event.id, error = %err, "republish failed");
                report.failed += 1;
                continue;
            }
            match self.store.mark_queued(&event.id).await {
                Ok(()) => report.republished += 1,
                Err(err) => {
                    // Published but not marked: the next sweep publishes it again.
                    warn!(event_id = %event.id, error = %err, "failed to mark republished event");
                    report.failed += 1;
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                republished = report.republished,
                failed = report.failed,
                "reconciliation sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweep every `interval` until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        loop {
            if let Err(err) = self.sweep_once().await {
                error!(error = %err, "reconciliation sweep failed");
            }
            if !sleep_or_cancel(self.interval, &token).await {
                break;
            }
        }
        info!("reconciler stopped");
    }
}
