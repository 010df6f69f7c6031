//! Outbox relay: drains pending events to the broker.
//!
//! The relay runs decoupled from command handling. A broker outage makes
//! events pile up as `pending` (or `failed` past the retry ceiling) without
//! ever affecting task-state correctness; once the broker recovers the
//! backlog drains in creation order per aggregate. Multiple relay workers
//! may run concurrently; the lease taken by `claim_due_events` keeps them
//! off each other's rows.

use crate::broker::{Broker, PublishError};
use crate::db::outbox::RetryPolicy;
use crate::db::{Database, now_ms};
use crate::error::TaskResult;
use crate::types::OutboxStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Tuning for a relay worker.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Identifies this worker on claimed rows.
    pub worker_id: String,
    pub poll_interval_ms: u64,
    pub batch_size: i64,
    /// How long a claim stays valid before other workers may steal the row.
    pub lease_ms: i64,
    /// Per-publish timeout; an elapsed timeout counts as a failed attempt.
    pub publish_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("relay-{}", std::process::id()),
            poll_interval_ms: 1_000,
            batch_size: 50,
            lease_ms: 30_000,
            publish_timeout_ms: 5_000,
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of one relay pass, for logging and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayPass {
    pub claimed: usize,
    pub published: usize,
    /// Failures left pending for another attempt.
    pub retried: usize,
    /// Failures parked as `failed` at the retry ceiling.
    pub parked: usize,
}

/// Background publisher for the outbox table.
pub struct OutboxRelay {
    db: Database,
    broker: Arc<dyn Broker>,
    config: RelayConfig,
}

impl OutboxRelay {
    pub fn new(db: Database, broker: Arc<dyn Broker>, config: RelayConfig) -> Self {
        Self { db, broker, config }
    }

    /// Run until the shutdown signal flips to `true`.
    ///
    /// Database errors in a pass are logged and the loop keeps going; the
    /// next poll retries from durable state.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        info!(worker = %self.config.worker_id, "outbox relay started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(pass) if pass.claimed > 0 => {
                            debug!(
                                claimed = pass.claimed,
                                published = pass.published,
                                retried = pass.retried,
                                parked = pass.parked,
                                "relay pass"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "relay pass failed"),
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender also stops the relay.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(worker = %self.config.worker_id, "outbox relay stopped");
    }

    /// Claim one batch of due events and publish them.
    ///
    /// Each event is marked `published` only after the broker acknowledged
    /// it; any failure (nack, unavailable, timeout) goes through the
    /// per-event backoff bookkeeping instead.
    pub async fn run_once(&self) -> TaskResult<RelayPass> {
        let now = now_ms();
        let batch = self.db.claim_due_events(
            &self.config.worker_id,
            self.config.batch_size,
            now,
            self.config.lease_ms,
        )?;

        let mut pass = RelayPass {
            claimed: batch.len(),
            ..RelayPass::default()
        };

        for event in batch {
            let result = tokio::time::timeout(
                Duration::from_millis(self.config.publish_timeout_ms),
                self.broker.publish(&event.routing_key, &event.payload),
            )
            .await
            .unwrap_or(Err(PublishError::Timeout(self.config.publish_timeout_ms)));

            match result {
                Ok(()) => {
                    self.db.mark_published(&event.event_id, now_ms())?;
                    pass.published += 1;
                }
                Err(e) => {
                    let status = self.db.mark_publish_failed(
                        &event.event_id,
                        &e.to_string(),
                        now_ms(),
                        &self.config.retry,
                    )?;
                    match status {
                        OutboxStatus::Failed => {
                            warn!(
                                event = %event.event_id,
                                error = %e,
                                "event parked as failed after retry ceiling"
                            );
                            pass.parked += 1;
                        }
                        _ => {
                            debug!(event = %event.event_id, error = %e, "publish failed, will retry");
                            pass.retried += 1;
                        }
                    }
                }
            }
        }

        Ok(pass)
    }
}
