//! Ledger writer — drives queued submissions to a terminal state.
//!
//! Each worker owns one record at a time, so a slow or stuck transaction
//! never blocks progress on other records; parallelism is the number of
//! workers. The cardinal rule: never resubmit without re-checking ledger
//! state first, because a blind resubmit after an ambiguous failure would
//! double-append.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event;
use crate::ledger::{CongestionLevel, LedgerAuth, LedgerConnector, TransactionRef, TransactionStatus};
use crate::submit::{QueueError, SubmissionQueue, SubmissionRecord, SubmissionState};

/// Tunables for the writer workers.
#[derive(Debug, Clone)]
pub struct WriterSettings {
    /// Maximum ledger submissions per record before it is abandoned.
    pub max_attempts: u32,
    /// Bound on a single submit call.
    pub submit_timeout: Duration,
    /// How long to poll for inclusion after a submit is acknowledged.
    pub confirm_deadline: Duration,
    /// Cadence of status polls within the confirmation window.
    pub status_poll_interval: Duration,
    /// First backoff delay; doubles per retry.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_cap: Duration,
    /// Refuse to submit while congestion is at or above this level.
    pub congestion_ceiling: CongestionLevel,
    /// Sleep when the queue has nothing ready.
    pub idle_sleep: Duration,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            max_attempts: crate::config::defaults::WRITER_MAX_ATTEMPTS,
            submit_timeout: Duration::from_secs(10),
            confirm_deadline: Duration::from_secs(30),
            status_poll_interval: Duration::from_millis(500),
            backoff_base: Duration::from_millis(crate::config::defaults::BACKOFF_BASE_MS),
            backoff_cap: Duration::from_millis(crate::config::defaults::BACKOFF_CAP_MS),
            congestion_ceiling: CongestionLevel::High,
            idle_sleep: Duration::from_millis(200),
        }
    }
}

/// Shared writer counters (one set across all workers).
#[derive(Debug, Default)]
pub struct WriterStats {
    pub submissions: AtomicU64,
    pub confirmed: AtomicU64,
    pub transient_failures: AtomicU64,
    pub permanent_failures: AtomicU64,
    pub abandoned: AtomicU64,
}

/// Serializable snapshot for the stats endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WriterStatsSnapshot {
    pub submissions: u64,
    pub confirmed: u64,
    pub transient_failures: u64,
    pub permanent_failures: u64,
    pub abandoned: u64,
}

impl WriterStats {
    pub fn snapshot(&self) -> WriterStatsSnapshot {
        WriterStatsSnapshot {
            submissions: self.submissions.load(Ordering::Relaxed),
            confirmed: self.confirmed.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of one attempt cycle on a record.
enum DriveStep {
    /// Record reached a terminal state (or shutdown released it). Done.
    Done,
    /// Transient failure; retry after backoff unless attempts are exhausted.
    Transient(String),
}

/// One writer worker. Clone per task; all clones share the queue and stats.
#[derive(Clone)]
pub struct LedgerWriter {
    queue: Arc<SubmissionQueue>,
    connector: Arc<dyn LedgerConnector>,
    auth: LedgerAuth,
    settings: WriterSettings,
    stats: Arc<WriterStats>,
    cancel: CancellationToken,
}

impl LedgerWriter {
    pub fn new(
        queue: Arc<SubmissionQueue>,
        connector: Arc<dyn LedgerConnector>,
        auth: LedgerAuth,
        settings: WriterSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            connector,
            auth,
            settings,
            stats: Arc::new(WriterStats::default()),
            cancel,
        }
    }

    pub fn stats_handle(&self) -> Arc<WriterStats> {
        Arc::clone(&self.stats)
    }

    /// Worker loop. Runs until cancellation; shutdown stops dequeuing and
    /// releases the record currently held, bounded by per-call timeouts.
    pub async fn run(self, worker_id: usize) {
        info!(worker = worker_id, "Ledger writer started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let Some(record) = self.queue.next_ready() else {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.idle_sleep) => continue,
                }
            };

            if let Err(e) = self.drive(record).await {
                warn!(worker = worker_id, error = %e, "Writer transition error");
            }
        }

        info!(worker = worker_id, "Ledger writer stopped");
    }

    /// Drive one Submitted record until terminal, shutdown, or a
    /// confirmation-window expiry hands it back to the queue.
    async fn drive(&self, record: SubmissionRecord) -> Result<(), QueueError> {
        let key = record.idempotency_key.clone();

        // Re-check before anything else: a transaction handle from an earlier
        // attempt (or a previous process life) may already have landed.
        if let Some(ref tx_ref) = record.transaction_ref {
            let tx = TransactionRef(tx_ref.clone());
            match self.connector.get_status(&tx).await {
                Ok(TransactionStatus::IncludedAtPosition(seq)) => {
                    debug!(key = %key, sequence = seq, "Prior submission already included");
                    self.confirm(&key, seq)?;
                    return Ok(());
                }
                Ok(TransactionStatus::Pending) => {
                    // Still on the ledger's books — keep waiting, never resubmit.
                    return self.await_inclusion_or_requeue(&key, &tx).await;
                }
                Ok(TransactionStatus::NotFound) => {
                    // Dropped by the ledger; safe to submit afresh.
                }
                Err(e) => {
                    // Can't tell — hand the record back rather than risk a
                    // double-append.
                    warn!(key = %key, error = %e, "Status re-check failed, requeueing");
                    return self.queue.nack(&key, &e.to_string());
                }
            }
        }

        let payload = event::encode(&record.event);

        loop {
            if self.cancel.is_cancelled() {
                return self.release_quiet(&key);
            }
            // The reconciler may have confirmed this record from the chain side.
            if matches!(self.queue.state_of(&key), Some(s) if s.is_terminal()) {
                return Ok(());
            }

            if !self.congestion_gate().await {
                return self.release_quiet(&key);
            }

            let attempts = self.queue.begin_attempt(&key)?;
            self.stats.submissions.fetch_add(1, Ordering::Relaxed);

            let step = self.attempt_submit(&key, &payload).await?;
            let error = match step {
                DriveStep::Done => return Ok(()),
                DriveStep::Transient(error) => error,
            };

            self.stats.transient_failures.fetch_add(1, Ordering::Relaxed);

            if attempts >= self.settings.max_attempts {
                self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
                return self.queue.ack_abandoned(&key, &error);
            }

            let delay = self.backoff_for(attempts);
            debug!(key = %key, attempts = attempts, delay_ms = delay.as_millis() as u64,
                error = %error, "Transient failure, backing off");
            tokio::select! {
                _ = self.cancel.cancelled() => return self.release_quiet(&key),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One submit + confirmation cycle.
    async fn attempt_submit(&self, key: &str, payload: &[u8]) -> Result<DriveStep, QueueError> {
        let submitted =
            tokio::time::timeout(self.settings.submit_timeout, self.connector.submit(payload, &self.auth))
                .await;

        match submitted {
            Ok(Ok(tx)) => {
                self.queue.note_transaction_ref(key, &tx.0)?;
                match self.poll_inclusion(&tx).await {
                    Some(TransactionStatus::IncludedAtPosition(seq)) => {
                        self.confirm(key, seq)?;
                        Ok(DriveStep::Done)
                    }
                    Some(TransactionStatus::NotFound) => {
                        // Accepted then dropped (e.g. fee eviction).
                        Ok(DriveStep::Transient("transaction dropped by ledger".to_string()))
                    }
                    Some(TransactionStatus::Pending) | None => {
                        // Deadline expired (or shutdown) with the transaction
                        // still pending. Hand it back; the pre-submit status
                        // re-check resumes waiting without resubmitting.
                        self.queue.nack(key, "confirmation window expired")?;
                        Ok(DriveStep::Done)
                    }
                }
            }
            Ok(Err(e)) if e.is_permanent() => {
                self.stats.permanent_failures.fetch_add(1, Ordering::Relaxed);
                self.queue.ack_failed(key, &e.to_string())?;
                Ok(DriveStep::Done)
            }
            Ok(Err(crate::ledger::LedgerError::Network(msg))) => {
                // Ambiguous: the submit may have landed even though the reply
                // was lost. Give the reconciler a grace window to confirm it
                // from the chain side before treating this as retryable.
                if self.reconciler_confirmed(key).await {
                    Ok(DriveStep::Done)
                } else {
                    Ok(DriveStep::Transient(format!("network error: {}", msg)))
                }
            }
            Ok(Err(e)) => Ok(DriveStep::Transient(e.to_string())),
            Err(_elapsed) => {
                // Same ambiguity as a network error.
                if self.reconciler_confirmed(key).await {
                    Ok(DriveStep::Done)
                } else {
                    Ok(DriveStep::Transient("submit timed out".to_string()))
                }
            }
        }
    }

    /// Resume waiting on a transaction known to be pending on the ledger.
    async fn await_inclusion_or_requeue(
        &self,
        key: &str,
        tx: &TransactionRef,
    ) -> Result<(), QueueError> {
        match self.poll_inclusion(tx).await {
            Some(TransactionStatus::IncludedAtPosition(seq)) => self.confirm(key, seq),
            Some(TransactionStatus::NotFound) => {
                // It evaporated after all — clear the stale wait, retry path
                // will submit afresh next dispatch.
                self.queue.nack(key, "pending transaction dropped by ledger")
            }
            Some(TransactionStatus::Pending) | None => {
                self.queue.nack(key, "confirmation window expired")
            }
        }
    }

    /// Poll a transaction until inclusion, the confirmation deadline, or
    /// shutdown. `None` means shutdown interrupted the wait.
    async fn poll_inclusion(&self, tx: &TransactionRef) -> Option<TransactionStatus> {
        let deadline = tokio::time::Instant::now() + self.settings.confirm_deadline;
        let mut last = TransactionStatus::Pending;

        loop {
            match self.connector.get_status(tx).await {
                Ok(TransactionStatus::IncludedAtPosition(seq)) => {
                    return Some(TransactionStatus::IncludedAtPosition(seq));
                }
                Ok(status) => last = status,
                Err(e) => debug!(tx = %tx, error = %e, "Status poll failed"),
            }

            if tokio::time::Instant::now() >= deadline {
                return Some(last);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep_until(
                    std::cmp::min(deadline, tokio::time::Instant::now() + self.settings.status_poll_interval)
                ) => {}
            }
        }
    }

    /// After an ambiguous submit outcome, wait briefly for the reconciler's
    /// chain-side confirmation before deciding the attempt failed.
    async fn reconciler_confirmed(&self, key: &str) -> bool {
        let deadline = tokio::time::Instant::now() + self.settings.confirm_deadline;
        loop {
            if matches!(self.queue.state_of(key), Some(SubmissionState::Confirmed { .. })) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline || self.cancel.is_cancelled() {
                return false;
            }
            tokio::time::sleep(self.settings.status_poll_interval).await;
        }
    }

    /// Gate submissions on ledger congestion: delay (with capped jittered
    /// backoff), don't fail, and don't burn attempts. Returns false only on
    /// shutdown.
    async fn congestion_gate(&self) -> bool {
        let mut waits = 0u32;
        loop {
            match self.connector.estimate_congestion().await {
                Ok(level) if level >= self.settings.congestion_ceiling => {
                    waits += 1;
                    let delay = self.backoff_for(waits);
                    debug!(level = ?level, delay_ms = delay.as_millis() as u64,
                        "Congestion above ceiling, delaying submission");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Ok(_) => return true,
                Err(e) => {
                    warn!(error = %e, "Congestion estimate failed, proceeding");
                    return true;
                }
            }
        }
    }

    fn confirm(&self, key: &str, sequence: u64) -> Result<(), QueueError> {
        self.stats.confirmed.fetch_add(1, Ordering::Relaxed);
        // The ledger timestamp is authoritative only from the reconciler, which
        // stamps it when the entry is observed on-chain.
        self.queue.ack_confirmed(key, sequence, None)
    }

    /// Release a record on shutdown. The reconciler may have confirmed it in
    /// the meantime, which makes the release a no-op rather than an error.
    fn release_quiet(&self, key: &str) -> Result<(), QueueError> {
        match self.queue.release(key) {
            Ok(()) => Ok(()),
            Err(QueueError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Exponential backoff with jitter, capped.
    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .settings
            .backoff_base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.settings.backoff_cap);
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        base + Duration::from_millis(jitter)
    }
}
