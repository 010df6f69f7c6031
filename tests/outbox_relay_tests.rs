//! Integration tests for the outbox store and relay.
//!
//! A scripted fake broker stands in for the real one so publish failures,
//! timeouts, and recovery can be driven deterministically through
//! `OutboxRelay::run_once`.

use async_trait::async_trait;
use fieldtask::broker::{Broker, PublishError};
use fieldtask::db::Database;
use fieldtask::db::outbox::RetryPolicy;
use fieldtask::relay::{OutboxRelay, RelayConfig};
use fieldtask::types::{NewTask, OutboxStatus};
use serde_json::Value;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

fn setup_db() -> Database {
    Database::open_in_memory().expect("Failed to create in-memory database")
}

/// Create a task and run it through a few commands to fill the outbox.
fn seed_events(db: &Database) -> String {
    let task = db
        .create_task(&NewTask {
            title: "Canal dredging".to_string(),
            created_by: "dispatch".to_string(),
            ..Default::default()
        })
        .unwrap();
    db.assign_task(&task.public_id, "alice", "dispatch", None)
        .unwrap();
    db.start_task(&task.public_id, "alice").unwrap();
    task.public_id
}

/// Broker that fails the first `failures` publishes, then acknowledges,
/// recording everything it accepted.
struct ScriptedBroker {
    failures: AtomicUsize,
    published: Mutex<Vec<(String, Value)>>,
}

impl ScriptedBroker {
    fn new(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            published: Mutex::new(Vec::new()),
        }
    }

    fn published_routing_keys(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }
}

#[async_trait]
impl Broker for ScriptedBroker {
    async fn publish(&self, routing_key: &str, payload: &Value) -> Result<(), PublishError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PublishError::Unavailable("connection refused".to_string()));
        }
        self.published
            .lock()
            .unwrap()
            .push((routing_key.to_string(), payload.clone()));
        Ok(())
    }
}

/// Broker that never answers within any reasonable publish timeout.
struct StalledBroker;

#[async_trait]
impl Broker for StalledBroker {
    async fn publish(&self, _routing_key: &str, _payload: &Value) -> Result<(), PublishError> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok(())
    }
}

/// Relay config with zero backoff so failed events are immediately due again.
fn fast_retry_config(max_attempts: i32) -> RelayConfig {
    RelayConfig {
        worker_id: "test-relay".to_string(),
        retry: RetryPolicy {
            max_attempts,
            base_backoff_ms: 0,
            max_backoff_ms: 0,
        },
        ..RelayConfig::default()
    }
}

mod relay_tests {
    use super::*;

    #[tokio::test]
    async fn publishes_pending_events_in_creation_order() {
        let db = setup_db();
        seed_events(&db);
        let broker = Arc::new(ScriptedBroker::new(0));
        let relay = OutboxRelay::new(db.clone(), broker.clone(), fast_retry_config(3));

        let pass = relay.run_once().await.unwrap();

        assert_eq!(pass.claimed, 3);
        assert_eq!(pass.published, 3);
        assert_eq!(
            broker.published_routing_keys(),
            vec!["tasks.created", "tasks.assigned", "tasks.started"]
        );

        for event in db.outbox_backlog(None).unwrap() {
            assert_eq!(event.status, OutboxStatus::Published);
            assert!(event.published_at.is_some());
        }
    }

    #[tokio::test]
    async fn failed_publish_keeps_event_pending_with_error() {
        let db = setup_db();
        seed_events(&db);
        let broker = Arc::new(ScriptedBroker::new(usize::MAX));
        let relay = OutboxRelay::new(db.clone(), broker, fast_retry_config(5));

        let pass = relay.run_once().await.unwrap();

        assert_eq!(pass.published, 0);
        assert_eq!(pass.retried, 3);

        for event in db.outbox_backlog(None).unwrap() {
            assert_eq!(event.status, OutboxStatus::Pending);
            assert_eq!(event.attempts, 1);
            assert!(event.published_at.is_none());
            assert!(
                event
                    .last_error
                    .as_deref()
                    .unwrap()
                    .contains("connection refused")
            );
        }
    }

    #[tokio::test]
    async fn broker_recovery_drains_backlog() {
        let db = setup_db();
        seed_events(&db);
        // Fail the whole first pass, then recover.
        let broker = Arc::new(ScriptedBroker::new(3));
        let relay = OutboxRelay::new(db.clone(), broker.clone(), fast_retry_config(5));

        relay.run_once().await.unwrap();
        let pass = relay.run_once().await.unwrap();

        assert_eq!(pass.published, 3);
        assert_eq!(broker.published_routing_keys().len(), 3);
        assert!(
            db.outbox_backlog(Some(OutboxStatus::Pending))
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn event_parks_as_failed_at_retry_ceiling() {
        let db = setup_db();
        let task = db
            .create_task(&NewTask {
                title: "Canal dredging".to_string(),
                created_by: "dispatch".to_string(),
                ..Default::default()
            })
            .unwrap();
        let broker = Arc::new(ScriptedBroker::new(usize::MAX));
        let relay = OutboxRelay::new(db.clone(), broker, fast_retry_config(3));

        relay.run_once().await.unwrap();
        relay.run_once().await.unwrap();
        let pass = relay.run_once().await.unwrap();
        assert_eq!(pass.parked, 1);

        let failed = db.outbox_backlog(Some(OutboxStatus::Failed)).unwrap();
        assert_eq!(failed.len(), 1);
        let event = &failed[0];
        assert_eq!(event.attempts, 3);
        assert_eq!(event.aggregate_id, task.public_id);
        assert!(event.last_error.is_some());

        // Parked events are no longer claimed
        let pass = relay.run_once().await.unwrap();
        assert_eq!(pass.claimed, 0);
    }

    #[tokio::test]
    async fn publish_timeout_counts_as_failure() {
        let db = setup_db();
        seed_events(&db);
        let config = RelayConfig {
            publish_timeout_ms: 20,
            ..fast_retry_config(3)
        };
        let relay = OutboxRelay::new(db.clone(), Arc::new(StalledBroker), config);

        let pass = relay.run_once().await.unwrap();

        assert_eq!(pass.published, 0);
        assert_eq!(pass.retried, 3);
        let event = &db.outbox_backlog(None).unwrap()[0];
        assert!(event.last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn backlog_survives_process_restart() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tasks.db");

        {
            let db = Database::open(&db_path).unwrap();
            seed_events(&db);
        }

        // Fresh handle on the same file, as after a restart
        let db = Database::open(&db_path).unwrap();
        let backlog = db.outbox_backlog(Some(OutboxStatus::Pending)).unwrap();
        assert_eq!(backlog.len(), 3);

        let broker = Arc::new(ScriptedBroker::new(0));
        let relay = OutboxRelay::new(db.clone(), broker, fast_retry_config(3));
        let pass = relay.run_once().await.unwrap();
        assert_eq!(pass.published, 3);
    }

    #[tokio::test]
    async fn relay_loop_stops_on_shutdown_signal() {
        let db = setup_db();
        let broker = Arc::new(ScriptedBroker::new(0));
        let config = RelayConfig {
            poll_interval_ms: 10,
            ..fast_retry_config(3)
        };
        let relay = OutboxRelay::new(db, broker, config);

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(async move { relay.run(shutdown_rx).await });

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("relay did not stop after shutdown")
            .unwrap();
    }
}

mod claim_tests {
    use super::*;
    use fieldtask::db::now_ms;

    #[test]
    fn competing_workers_never_claim_the_same_row() {
        let db = setup_db();
        seed_events(&db);
        let now = now_ms();

        let first = db.claim_due_events("worker-a", 10, now, 30_000).unwrap();
        assert_eq!(first.len(), 3);

        let second = db.claim_due_events("worker-b", 10, now, 30_000).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn same_worker_id_claims_do_not_overlap() {
        let db = setup_db();
        seed_events(&db);
        let now = now_ms();

        // Two relays sharing a worker id (the default id is process-scoped)
        // claiming at the same instant must still see disjoint rows.
        let first = db.claim_due_events("relay-1", 10, now, 30_000).unwrap();
        assert_eq!(first.len(), 3);

        let second = db.claim_due_events("relay-1", 10, now, 30_000).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn expired_lease_is_claimable_again() {
        let db = setup_db();
        seed_events(&db);
        let now = now_ms();

        db.claim_due_events("worker-a", 10, now, 1_000).unwrap();

        // worker-a stalls; after the lease runs out worker-b takes over
        let later = now + 1_001;
        let stolen = db.claim_due_events("worker-b", 10, later, 1_000).unwrap();
        assert_eq!(stolen.len(), 3);
        assert!(stolen.iter().all(|e| e.claimed_by.as_deref() == Some("worker-b")));
    }

    #[test]
    fn backoff_schedule_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff_ms: 1_000,
            max_backoff_ms: 8_000,
        };

        assert_eq!(policy.backoff_ms(1), 1_000);
        assert_eq!(policy.backoff_ms(2), 2_000);
        assert_eq!(policy.backoff_ms(3), 4_000);
        assert_eq!(policy.backoff_ms(4), 8_000);
        assert_eq!(policy.backoff_ms(5), 8_000);
    }

    #[test]
    fn failed_attempt_schedules_future_retry() {
        let db = setup_db();
        seed_events(&db);
        let now = now_ms();
        let policy = RetryPolicy {
            max_attempts: 5,
            base_backoff_ms: 60_000,
            max_backoff_ms: 600_000,
        };

        let claimed = db.claim_due_events("worker-a", 1, now, 30_000).unwrap();
        let event_id = claimed[0].event_id.clone();
        db.mark_publish_failed(&event_id, "nack", now, &policy)
            .unwrap();

        let event = db.get_outbox_event(&event_id).unwrap().unwrap();
        assert_eq!(event.status, OutboxStatus::Pending);
        assert!(event.next_attempt_at >= now + 60_000);

        // Not due yet, so it cannot be claimed
        let reclaimed = db.claim_due_events("worker-a", 10, now, 30_000).unwrap();
        assert!(reclaimed.iter().all(|e| e.event_id != event_id));
    }

    #[test]
    fn release_expired_leases_clears_stale_claims() {
        let db = setup_db();
        seed_events(&db);

        // Zero-length lease: expired the moment it is taken
        let claimed = db.claim_due_events("worker-a", 10, now_ms(), 0).unwrap();
        assert_eq!(claimed.len(), 3);

        let released = db.release_expired_leases().unwrap();
        assert_eq!(released, 3);

        let backlog = db.outbox_backlog(Some(OutboxStatus::Pending)).unwrap();
        assert!(backlog.iter().all(|e| e.claimed_by.is_none()));
    }

    #[test]
    fn mark_published_requires_no_second_delivery() {
        let db = setup_db();
        seed_events(&db);
        let now = now_ms();

        let claimed = db.claim_due_events("worker-a", 10, now, 30_000).unwrap();
        for event in &claimed {
            db.mark_published(&event.event_id, now).unwrap();
        }

        let again = db.claim_due_events("worker-a", 10, now + 60_000, 30_000).unwrap();
        assert!(again.is_empty());
    }
}
