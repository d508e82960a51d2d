//! Drain loop for the durable mutation queue.
//!
//! Each drain pass claims due records one at a time, sends them over the
//! transport, and moves them through the state machine:
//!
//! ```text
//! pending -> in_flight -> completed (deleted)
//!                      -> failed -> pending (due again after backoff)
//!                      -> failed, never due (terminal, needs attention)
//! ```
//!
//! A conflict is not a failure: the server's version wins, the local view
//! adopts it, and the losing mutation is deleted. Transient errors are
//! absorbed into the retry schedule and never surface to the user here.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::db::{LocalMealRepository, QueueRepository};
use crate::models::{MutationRecord, OperationType};

use super::backoff::BackoffPolicy;
use super::connectivity::ConnectivityObserver;
use super::transport::{MutationOutcome, MutationTransport};

/// Counters for one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub completed: usize,
    pub conflicts: usize,
    pub rescheduled: usize,
    pub failed_terminal: usize,
}

pub struct SyncQueueProcessor {
    queue: QueueRepository,
    local: LocalMealRepository,
    transport: Arc<dyn MutationTransport>,
    backoff: BackoffPolicy,
}

impl SyncQueueProcessor {
    pub fn new(
        queue: QueueRepository,
        local: LocalMealRepository,
        transport: Arc<dyn MutationTransport>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            queue,
            local,
            transport,
            backoff,
        }
    }

    /// Processes every currently-due queue entry once.
    pub async fn drain(&self) -> Result<DrainReport, sqlx::Error> {
        self.drain_at(Utc::now()).await
    }

    /// Drain with an explicit clock, so tests never wait on wall time.
    ///
    /// Safe to invoke concurrently with itself: each record is claimed via a
    /// conditional status transition, so a record is sent at most once and
    /// two mutations for the same meal are never in flight together.
    pub async fn drain_at(&self, now: DateTime<Utc>) -> Result<DrainReport, sqlx::Error> {
        let mut report = DrainReport::default();

        for mut record in self.queue.list_due(now).await? {
            if !self.queue.mark_in_flight(record.operation_id).await? {
                // Another drain claimed it between listing and here.
                continue;
            }
            report.attempted += 1;

            // The conflict token must reflect what this client last saw at
            // send time, not at enqueue time: an update queued offline behind
            // a create picks up the token from the create's acknowledgment.
            if record.operation_type != OperationType::Create {
                if let Some(token) = self.local.conflict_token(record.target_id).await? {
                    record.payload.base_updated_at = Some(token);
                }
            }

            match self.transport.send(&record).await {
                Ok(MutationOutcome::Applied(meal)) => {
                    match meal {
                        Some(meal) => self.local.adopt_server(&meal).await?,
                        None => {
                            if record.operation_type == OperationType::Delete {
                                self.local.remove(record.target_id).await?;
                            }
                        }
                    }
                    self.queue.complete(record.operation_id).await?;
                    report.completed += 1;
                    debug!(
                        operation = %record.operation_type,
                        target = %record.target_id,
                        "mutation delivered"
                    );
                }
                Ok(MutationOutcome::MissingRemote) => {
                    // The meal was deleted elsewhere; nothing left to apply.
                    if record.operation_type != OperationType::Create {
                        self.local.remove(record.target_id).await?;
                    }
                    self.queue.complete(record.operation_id).await?;
                    report.completed += 1;
                    debug!(target = %record.target_id, "target already gone server-side");
                }
                Ok(MutationOutcome::Conflict(server_version)) => {
                    // Server wins: adopt its record, drop the local edit.
                    self.local.adopt_server(&server_version).await?;
                    self.queue.complete(record.operation_id).await?;
                    report.conflicts += 1;
                    info!(
                        target = %record.target_id,
                        server_updated_at = %server_version.updated_at,
                        "conflict: local mutation superseded by server version"
                    );
                }
                Ok(MutationOutcome::Invalid(reason)) => {
                    self.queue
                        .mark_failed_terminal(record.operation_id, &reason)
                        .await?;
                    report.failed_terminal += 1;
                    warn!(
                        operation = %record.operation_type,
                        target = %record.target_id,
                        %reason,
                        "mutation rejected, needs attention"
                    );
                }
                Ok(MutationOutcome::Unauthorized) => {
                    self.queue
                        .mark_failed_terminal(record.operation_id, "unauthorized")
                        .await?;
                    report.failed_terminal += 1;
                    warn!(target = %record.target_id, "unauthorized, re-authentication required");
                }
                Err(e) => {
                    let retry_count = record.retry_count + 1;
                    let next = self.backoff.next_attempt(now, retry_count as u32);
                    self.queue
                        .reschedule(record.operation_id, next, retry_count, &e.to_string())
                        .await?;
                    report.rescheduled += 1;
                    debug!(
                        target = %record.target_id,
                        retry_count,
                        next_attempt = %next,
                        error = %e,
                        "transient failure, rescheduled"
                    );
                }
            }
        }

        Ok(report)
    }

    /// Long-running drive loop: drains on a fixed interval while online and
    /// immediately when connectivity returns. Abandoned `in_flight` records
    /// from a previous process are recovered first.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        connectivity: Arc<dyn ConnectivityObserver>,
    ) {
        match self.queue.recover_in_flight().await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "recovered abandoned in-flight mutations"),
            Err(e) => warn!(error = %e, "failed to recover in-flight mutations"),
        }

        let mut ticker = tokio::time::interval(interval);
        let mut online = connectivity.watch();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if connectivity.is_online() {
                        if let Err(e) = self.drain().await {
                            warn!(error = %e, "drain failed");
                        }
                    }
                }
                changed = online.changed() => {
                    if changed.is_err() {
                        // Connectivity source dropped; stop driving.
                        break;
                    }
                    if *online.borrow() {
                        debug!("connectivity regained, draining queue");
                        if let Err(e) = self.drain().await {
                            warn!(error = %e, "drain failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_client_db;
    use crate::models::{Meal, MealItem, MealSnapshot, MealTotals, MealType, MutationStatus};
    use crate::sync::transport::TransportError;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::tempdir;
    use uuid::Uuid;

    /// Transport scripted with one outcome per send; records what was sent.
    struct FakeTransport {
        script: Mutex<VecDeque<Result<MutationOutcome, TransportError>>>,
        sent: Mutex<Vec<(OperationType, Uuid, Option<DateTime<Utc>>)>>,
    }

    impl FakeTransport {
        fn new(script: Vec<Result<MutationOutcome, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<(OperationType, Uuid, Option<DateTime<Utc>>)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MutationTransport for FakeTransport {
        async fn send(&self, record: &MutationRecord) -> Result<MutationOutcome, TransportError> {
            self.sent.lock().unwrap().push((
                record.operation_type,
                record.target_id,
                record.payload.base_updated_at,
            ));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(TransportError::Network("script exhausted".into())))
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        queue: QueueRepository,
        local: LocalMealRepository,
        transport: Arc<FakeTransport>,
        processor: SyncQueueProcessor,
    }

    async fn harness(script: Vec<Result<MutationOutcome, TransportError>>) -> Harness {
        let dir = tempdir().unwrap();
        let pool = init_client_db(Some(dir.path().join("sync.db")))
            .await
            .unwrap();
        let transport = FakeTransport::new(script);
        let processor = SyncQueueProcessor::new(
            QueueRepository::new(pool.clone()),
            LocalMealRepository::new(pool.clone()),
            transport.clone(),
            BackoffPolicy::new(
                ChronoDuration::seconds(2),
                ChronoDuration::minutes(5),
                ChronoDuration::zero(),
            ),
        );
        Harness {
            _dir: dir,
            queue: QueueRepository::new(pool.clone()),
            local: LocalMealRepository::new(pool),
            transport,
            processor,
        }
    }

    fn items() -> Vec<MealItem> {
        vec![
            MealItem::basic("oatmeal", 150.0, "g", 180.0, 6.0, 32.0, 3.0),
            MealItem::basic("banana", 1.0, "unit", 105.0, 1.3, 27.0, 0.4),
        ]
    }

    fn snapshot(token: Option<DateTime<Utc>>) -> MealSnapshot {
        MealSnapshot {
            timestamp: Utc::now(),
            meal_type: MealType::Breakfast,
            photo_id: None,
            items: items(),
            base_updated_at: token,
        }
    }

    fn server_meal(id: Uuid, updated_at: DateTime<Utc>) -> Meal {
        let items = items();
        let totals = MealTotals::from_items(&items);
        Meal {
            id,
            user_id: "u1".to_string(),
            timestamp: Utc::now(),
            updated_at,
            meal_type: MealType::Breakfast,
            photo_id: None,
            total_calories: totals.calories,
            total_protein: totals.protein,
            total_carbs: totals.carbs,
            total_fat: totals.fat,
            items,
        }
    }

    #[tokio::test]
    async fn test_drain_fail_once_then_succeed() {
        // Scenario: create queued with no network; first attempt fails, the
        // retry lands. Two items all the way through.
        let target = Uuid::new_v4();
        let h = harness(vec![
            Err(TransportError::Network("offline".into())),
            Ok(MutationOutcome::Applied(Some(server_meal(
                target,
                Utc::now(),
            )))),
        ])
        .await;

        let record = MutationRecord::new(OperationType::Create, target, snapshot(None));
        h.queue.enqueue(&record).await.unwrap();

        let now = Utc::now();
        let report = h.processor.drain_at(now).await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.rescheduled, 1);

        let stored = h.queue.get(record.operation_id).await.unwrap().unwrap();
        assert_eq!(stored.status, MutationStatus::Failed);
        assert_eq!(stored.retry_count, 1);

        // Not due yet at `now`; due after the backoff elapses.
        assert_eq!(h.processor.drain_at(now).await.unwrap().attempted, 0);
        let later = now + ChronoDuration::seconds(10);
        let report = h.processor.drain_at(later).await.unwrap();
        assert_eq!(report.completed, 1);

        assert!(h.queue.get(record.operation_id).await.unwrap().is_none());
        let adopted = h.local.get(target).await.unwrap().unwrap();
        assert_eq!(adopted.items.len(), 2);
        assert!(h.local.conflict_token(target).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_conflict_adopts_server_version_and_discards_mutation() {
        // Device B's half of the two-device scenario: its queued update
        // claims T0, the server is at T1, B adopts T1.
        let target = Uuid::new_v4();
        let t0 = Utc::now() - ChronoDuration::minutes(10);
        let t1 = Utc::now();
        let winning = server_meal(target, t1);

        let h = harness(vec![Ok(MutationOutcome::Conflict(Box::new(
            winning.clone(),
        )))])
        .await;

        let record = MutationRecord::new(OperationType::Update, target, snapshot(Some(t0)));
        h.queue.enqueue(&record).await.unwrap();

        let report = h.processor.drain_at(Utc::now()).await.unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.completed, 0);

        // The losing mutation is gone and the local view is the server's.
        assert!(h.queue.get(record.operation_id).await.unwrap().is_none());
        assert_eq!(h.local.conflict_token(target).await.unwrap(), Some(t1));
        assert_eq!(h.local.get(target).await.unwrap().unwrap(), winning);
    }

    #[tokio::test]
    async fn test_validation_failure_is_terminal() {
        let h = harness(vec![Ok(MutationOutcome::Invalid(
            "400: validation_error".into(),
        ))])
        .await;

        let record = MutationRecord::new(OperationType::Create, Uuid::new_v4(), snapshot(None));
        h.queue.enqueue(&record).await.unwrap();

        let report = h.processor.drain_at(Utc::now()).await.unwrap();
        assert_eq!(report.failed_terminal, 1);

        let stored = h.queue.get(record.operation_id).await.unwrap().unwrap();
        assert!(stored.is_terminal());

        // Never auto-retried, even far in the future.
        let far = Utc::now() + ChronoDuration::days(30);
        assert_eq!(h.processor.drain_at(far).await.unwrap().attempted, 0);
        assert_eq!(h.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_is_terminal() {
        let h = harness(vec![Ok(MutationOutcome::Unauthorized)]).await;
        let record = MutationRecord::new(OperationType::Update, Uuid::new_v4(), snapshot(None));
        h.queue.enqueue(&record).await.unwrap();

        let report = h.processor.drain_at(Utc::now()).await.unwrap();
        assert_eq!(report.failed_terminal, 1);
        let stored = h.queue.get(record.operation_id).await.unwrap().unwrap();
        assert_eq!(stored.last_error.as_deref(), Some("unauthorized"));
    }

    #[tokio::test]
    async fn test_delete_of_missing_meal_is_success_equivalent() {
        let target = Uuid::new_v4();
        let h = harness(vec![Ok(MutationOutcome::MissingRemote)]).await;

        h.local.adopt_server(&server_meal(target, Utc::now())).await.unwrap();
        let record = MutationRecord::new(OperationType::Delete, target, snapshot(None));
        h.queue.enqueue(&record).await.unwrap();

        let report = h.processor.drain_at(Utc::now()).await.unwrap();
        assert_eq!(report.completed, 1);
        assert!(h.queue.get(record.operation_id).await.unwrap().is_none());
        assert!(h.local.get(target).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_target_mutations_delivered_in_enqueue_order() {
        // create -> update -> update for one meal: the server must see them
        // in order, none skipped, and the final state is the last update.
        let target = Uuid::new_v4();
        let t1 = Utc::now();
        let t2 = t1 + ChronoDuration::milliseconds(1);
        let t3 = t2 + ChronoDuration::milliseconds(1);
        let h = harness(vec![
            Ok(MutationOutcome::Applied(Some(server_meal(target, t1)))),
            Ok(MutationOutcome::Applied(Some(server_meal(target, t2)))),
            Ok(MutationOutcome::Applied(Some(server_meal(target, t3)))),
        ])
        .await;

        let create = MutationRecord::new(OperationType::Create, target, snapshot(None));
        let update_a = MutationRecord::new(OperationType::Update, target, snapshot(None));
        let update_b = MutationRecord::new(OperationType::Update, target, snapshot(None));
        h.queue.enqueue(&create).await.unwrap();
        h.queue.enqueue(&update_a).await.unwrap();
        h.queue.enqueue(&update_b).await.unwrap();

        // Each drain pass moves exactly one mutation for the target.
        assert_eq!(h.processor.drain_at(Utc::now()).await.unwrap().completed, 1);
        assert_eq!(h.processor.drain_at(Utc::now()).await.unwrap().completed, 1);
        assert_eq!(h.processor.drain_at(Utc::now()).await.unwrap().completed, 1);

        let sent = h.transport.sent();
        assert_eq!(
            sent.iter().map(|(op, _, _)| *op).collect::<Vec<_>>(),
            vec![
                OperationType::Create,
                OperationType::Update,
                OperationType::Update
            ]
        );
        // The updates carried the freshest acknowledged token, picked up
        // from the local view at send time.
        assert_eq!(sent[1].2, Some(t1));
        assert_eq!(sent[2].2, Some(t2));
        assert_eq!(h.local.conflict_token(target).await.unwrap(), Some(t3));
        assert!(h.queue.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_send_while_same_target_in_flight() {
        let target = Uuid::new_v4();
        let h = harness(vec![]).await;

        let first = MutationRecord::new(OperationType::Create, target, snapshot(None));
        let second = MutationRecord::new(OperationType::Update, target, snapshot(None));
        h.queue.enqueue(&first).await.unwrap();
        h.queue.enqueue(&second).await.unwrap();

        // Simulate a concurrent drain holding the first record in flight.
        assert!(h.queue.mark_in_flight(first.operation_id).await.unwrap());

        let report = h.processor.drain_at(Utc::now()).await.unwrap();
        assert_eq!(report.attempted, 0);
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_drains_send_each_record_once() {
        let target = Uuid::new_v4();
        let t1 = Utc::now();
        let h = harness(vec![
            Ok(MutationOutcome::Applied(Some(server_meal(target, t1)))),
            Ok(MutationOutcome::Applied(Some(server_meal(target, t1)))),
        ])
        .await;

        let record = MutationRecord::new(OperationType::Create, target, snapshot(None));
        h.queue.enqueue(&record).await.unwrap();

        let now = Utc::now();
        let (a, b) = tokio::join!(h.processor.drain_at(now), h.processor.drain_at(now));
        let total = a.unwrap().attempted + b.unwrap().attempted;
        assert_eq!(total, 1);
        assert_eq!(h.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_run_waits_for_connectivity_then_drains() {
        use crate::sync::connectivity::ConnectivitySignal;

        let target = Uuid::new_v4();
        let h = harness(vec![Ok(MutationOutcome::Applied(Some(server_meal(
            target,
            Utc::now(),
        ))))])
        .await;

        let record = MutationRecord::new(OperationType::Create, target, snapshot(None));
        h.queue.enqueue(&record).await.unwrap();

        let signal = ConnectivitySignal::new(false);
        let handle = tokio::spawn(Arc::new(h.processor).run(
            Duration::from_millis(10),
            signal.clone() as Arc<dyn ConnectivityObserver>,
        ));

        // While offline the loop ticks but sends nothing.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(h.transport.sent().is_empty());

        signal.set_online(true);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !h.queue.list().await.unwrap().is_empty() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "queue never drained after connectivity returned"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.transport.sent().len(), 1);

        handle.abort();
    }
}
