//! Chain-side reconciliation.
//!
//! A single background task polls the ledger, maintains the
//! [`MaterializedLog`], detects tail reorganizations, advances the finality
//! watermark, and feeds chain-side confirmations back into the submission
//! queue. On-chain observation is the source of truth for event state; the
//! writer's acknowledgement is only a hint.

pub mod log;

pub use log::{EventFilter, EventPage, LogError, MaterializedLog};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::event;
use crate::ledger::{LedgerConnector, LedgerError};
use crate::storage::{ClientStore, StorageError};
use crate::submit::SubmissionQueue;

/// Shared handle to the materialized log. Held by the reconciler (writer) and
/// the API layer (reader).
pub type SharedLog = Arc<RwLock<MaterializedLog>>;

/// Read the shared log, recovering from a poisoned lock.
pub fn read_log(log: &SharedLog) -> std::sync::RwLockReadGuard<'_, MaterializedLog> {
    log.read().unwrap_or_else(|e| e.into_inner())
}

fn write_log(log: &SharedLog) -> std::sync::RwLockWriteGuard<'_, MaterializedLog> {
    log.write().unwrap_or_else(|e| e.into_inner())
}

/// Tunables for the reconciliation loop.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Interval between reconciliation cycles.
    pub poll_interval: Duration,
    /// How many times a missing position is re-queried before the cycle gives
    /// up and leaves it for the next one.
    pub gap_retry_limit: u32,
    /// Delay between gap re-queries.
    pub gap_retry_delay: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(crate::config::defaults::RECONCILE_INTERVAL_SECS),
            gap_retry_limit: 3,
            gap_retry_delay: Duration::from_millis(250),
        }
    }
}

/// Counters exposed on the stats endpoint.
#[derive(Debug, Default)]
pub struct ReconcilerStats {
    pub cycles: AtomicU64,
    pub observed: AtomicU64,
    pub evictions: AtomicU64,
    pub finalized: AtomicU64,
    pub malformed: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReconcilerStatsSnapshot {
    pub cycles: u64,
    pub observed: u64,
    pub evictions: u64,
    pub finalized: u64,
    pub malformed: u64,
}

impl ReconcilerStats {
    pub fn snapshot(&self) -> ReconcilerStatsSnapshot {
        ReconcilerStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            observed: self.observed.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            finalized: self.finalized.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Outcome of one reconciliation cycle.
enum CycleOutcome {
    Continue,
    /// A finality violation was detected; the log is poisoned and the loop
    /// must halt without taking the process down.
    Halt,
}

pub struct Reconciler {
    connector: Arc<dyn LedgerConnector>,
    log: SharedLog,
    queue: Arc<SubmissionQueue>,
    store: ClientStore,
    settings: ReconcilerSettings,
    stats: Arc<ReconcilerStats>,
    cancel: CancellationToken,
    /// Next ledger position to fetch. Tracks past positions whose payloads
    /// failed to decode, which the log itself never holds.
    cursor: u64,
    /// Raw payload bytes of every pending-tail position, for byte-exact
    /// divergence probing.
    tail_bytes: HashMap<u64, Vec<u8>>,
    /// Recently finalized positions and their bytes, probed to detect the
    /// one thing that must never happen: a rewrite under the watermark.
    finalized_probe: VecDeque<(u64, Vec<u8>)>,
}

/// How many finalized positions stay in the probe window.
const FINALIZED_PROBE_WINDOW: usize = 32;

impl Reconciler {
    pub fn new(
        connector: Arc<dyn LedgerConnector>,
        log: SharedLog,
        queue: Arc<SubmissionQueue>,
        store: ClientStore,
        settings: ReconcilerSettings,
        cancel: CancellationToken,
    ) -> Self {
        let cursor = read_log(&log).first_unobserved();
        Self {
            connector,
            log,
            queue,
            store,
            settings,
            stats: Arc::new(ReconcilerStats::default()),
            cancel,
            cursor,
            tail_bytes: HashMap::new(),
            finalized_probe: VecDeque::new(),
        }
    }

    pub fn stats_handle(&self) -> Arc<ReconcilerStats> {
        Arc::clone(&self.stats)
    }

    /// Reconciliation loop. Transient ledger errors abort the cycle and are
    /// retried next interval; a finality violation halts this task while the
    /// rest of the process keeps serving the last coherent view.
    pub async fn run(mut self) {
        info!(from = self.cursor, "Reconciler started");

        loop {
            match self.cycle().await {
                Ok(CycleOutcome::Continue) => {}
                Ok(CycleOutcome::Halt) => {
                    error!("Reconciler halted: finalized consistency violation");
                    return;
                }
                Err(e) => warn!(error = %e, "Reconciliation cycle failed, will retry"),
            }
            self.stats.cycles.fetch_add(1, Ordering::Relaxed);

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        info!("Reconciler stopped");
    }

    async fn cycle(&mut self) -> Result<CycleOutcome, ReconcileError> {
        if let CycleOutcome::Halt = self.probe_divergence().await? {
            return Ok(CycleOutcome::Halt);
        }
        self.fetch_appended().await?;
        self.advance_finality().await?;
        Ok(CycleOutcome::Continue)
    }

    /// Re-query previously observed positions and compare payload bytes
    /// against what was observed before.
    ///
    /// In the pending tail a mismatch is an ordinary reorganization: evict
    /// from the divergence point and refetch. Under the finality watermark a
    /// mismatch breaks the ledger's core contract; the log is poisoned and
    /// the loop halts.
    async fn probe_divergence(&mut self) -> Result<CycleOutcome, ReconcileError> {
        for (pos, bytes) in self.finalized_probe.clone() {
            let current = self.connector.query_at(pos).await?;
            let unchanged = matches!(&current, Some(entry) if entry.payload == bytes);
            if !unchanged {
                let height = read_log(&self.log).finalized_height().unwrap_or(pos);
                write_log(&self.log).poison(
                    LogError::FinalizedViolation { position: pos, finalized_height: height }
                        .to_string(),
                );
                return Ok(CycleOutcome::Halt);
            }
        }

        let positions = read_log(&self.log).tail_positions();

        let mut diverged_at = None;
        for pos in positions {
            let current = self.connector.query_at(pos).await?;
            let known = self.tail_bytes.get(&pos);
            let unchanged =
                matches!((&current, known), (Some(entry), Some(bytes)) if &entry.payload == bytes);
            if !unchanged {
                diverged_at = Some(pos);
                break;
            }
        }

        let Some(pos) = diverged_at else {
            return Ok(CycleOutcome::Continue);
        };

        let mut log = write_log(&self.log);
        match log.evict_from(pos) {
            Ok(evicted) => {
                drop(log);
                self.tail_bytes.retain(|p, _| *p < pos);
                self.cursor = self.cursor.min(pos);
                self.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
                info!(position = pos, evicted = evicted, "Ledger reorganization detected");
                Ok(CycleOutcome::Continue)
            }
            Err(e @ LogError::FinalizedViolation { .. }) => {
                log.poison(e.to_string());
                Ok(CycleOutcome::Halt)
            }
        }
    }

    /// Fetch newly appended entries from the cursor onward and fold them into
    /// the log and (via logical match) the submission queue.
    async fn fetch_appended(&mut self) -> Result<(), ReconcileError> {
        let entries = self.connector.query_appended(self.cursor).await?;

        for entry in entries {
            if entry.position < self.cursor {
                continue;
            }
            if entry.position > self.cursor {
                // A hole in the response. Positions are appended strictly in
                // order, so the missing ones exist; re-query them bounded
                // times, then leave the rest for the next cycle.
                if !self.fill_gap(self.cursor, entry.position).await? {
                    return Ok(());
                }
            }
            self.ingest(entry.position, entry.timestamp, &entry.payload)?;
        }
        Ok(())
    }

    /// Re-query positions [from, to); returns false if any stayed missing.
    async fn fill_gap(&mut self, from: u64, to: u64) -> Result<bool, ReconcileError> {
        for pos in from..to {
            let mut found = None;
            for _ in 0..self.settings.gap_retry_limit {
                if let Some(entry) = self.connector.query_at(pos).await? {
                    found = Some(entry);
                    break;
                }
                tokio::time::sleep(self.settings.gap_retry_delay).await;
            }
            match found {
                Some(entry) => self.ingest(entry.position, entry.timestamp, &entry.payload)?,
                None => {
                    warn!(position = pos, "Ledger gap persisted across re-queries");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn ingest(&mut self, position: u64, timestamp: i64, payload: &[u8]) -> Result<(), ReconcileError> {
        self.cursor = position + 1;

        let decoded = match event::decode(payload) {
            Ok(ev) => ev,
            Err(e) => {
                // A foreign or corrupt entry on the shared ledger. Skip it but
                // keep the cursor moving so it is not refetched forever.
                warn!(position = position, error = %e, "Undecodable ledger entry skipped");
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };

        write_log(&self.log).observe(position, timestamp, decoded.clone());
        self.tail_bytes.insert(position, payload.to_vec());
        self.stats.observed.fetch_add(1, Ordering::Relaxed);
        debug!(position = position, build_id = %decoded.build_id, "Entry observed");

        if let Some(key) = self.queue.confirm_matching(&decoded, position, Some(timestamp)) {
            debug!(key = %key, position = position, "Chain-side confirmation");
        }
        Ok(())
    }

    /// Advance the finality watermark, clamped to what has actually been
    /// observed, and persist the migrated events.
    async fn advance_finality(&mut self) -> Result<(), ReconcileError> {
        let Some(ledger_height) = self.connector.current_finalized_position().await? else {
            return Ok(());
        };
        if self.cursor == 0 {
            return Ok(());
        }
        // Never let the watermark run ahead of observation, or unobserved
        // entries below it would be skipped forever.
        let effective = ledger_height.min(self.cursor - 1);
        if read_log(&self.log).finalized_height() >= Some(effective) {
            return Ok(());
        }

        let migrated = write_log(&self.log).advance_finalized(effective);

        for event in &migrated {
            self.store.save_finalized_event(event)?;
            if let Some(seq) = event.sequence {
                if let Some(bytes) = self.tail_bytes.remove(&seq) {
                    self.finalized_probe.push_back((seq, bytes));
                }
            }
        }
        while self.finalized_probe.len() > FINALIZED_PROBE_WINDOW {
            self.finalized_probe.pop_front();
        }
        self.store.set_finalized_height(effective)?;
        self.stats.finalized.fetch_add(migrated.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{BuildEvent, BuildStatus};
    use crate::ledger::{CongestionLevel, LedgerAuth, LedgerEntry, TransactionRef, TransactionStatus};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// In-memory ledger whose chain contents tests mutate directly.
    #[derive(Default)]
    struct FakeChain {
        entries: Mutex<Vec<LedgerEntry>>,
        finalized: Mutex<Option<u64>>,
    }

    impl FakeChain {
        fn append(&self, position: u64, event: &BuildEvent) {
            self.entries.lock().unwrap().push(LedgerEntry {
                position,
                timestamp: 1000 + position as i64,
                payload: event::encode(event),
            });
        }

        fn rewrite(&self, position: u64, event: &BuildEvent) {
            let mut entries = self.entries.lock().unwrap();
            entries.retain(|e| e.position < position);
            entries.push(LedgerEntry {
                position,
                timestamp: 2000 + position as i64,
                payload: event::encode(event),
            });
        }

        fn finalize(&self, height: u64) {
            *self.finalized.lock().unwrap() = Some(height);
        }
    }

    #[async_trait]
    impl LedgerConnector for FakeChain {
        async fn submit(
            &self,
            _payload: &[u8],
            _auth: &LedgerAuth,
        ) -> Result<TransactionRef, LedgerError> {
            Err(LedgerError::RejectedPermanent("read-only fake".to_string()))
        }

        async fn get_status(&self, _tx: &TransactionRef) -> Result<TransactionStatus, LedgerError> {
            Ok(TransactionStatus::NotFound)
        }

        async fn query_appended(&self, from: u64) -> Result<Vec<LedgerEntry>, LedgerError> {
            let mut out: Vec<LedgerEntry> = self
                .entries
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.position >= from)
                .cloned()
                .collect();
            out.sort_by_key(|e| e.position);
            Ok(out)
        }

        async fn query_at(&self, position: u64) -> Result<Option<LedgerEntry>, LedgerError> {
            Ok(self
                .entries
                .lock()
                .unwrap()
                .iter()
                .find(|e| e.position == position)
                .cloned())
        }

        async fn current_finalized_position(&self) -> Result<Option<u64>, LedgerError> {
            Ok(*self.finalized.lock().unwrap())
        }

        async fn estimate_congestion(&self) -> Result<CongestionLevel, LedgerError> {
            Ok(CongestionLevel::Low)
        }
    }

    fn harness(chain: Arc<FakeChain>) -> (tempfile::TempDir, SharedLog, Arc<SubmissionQueue>, Reconciler) {
        let tmp = tempfile::tempdir().unwrap();
        let store = ClientStore::open(tmp.path().join("db")).unwrap();
        let queue = Arc::new(SubmissionQueue::open(store.clone(), 4).unwrap());
        let log: SharedLog = Arc::new(RwLock::new(MaterializedLog::new()));
        let reconciler = Reconciler::new(
            chain,
            Arc::clone(&log),
            Arc::clone(&queue),
            store,
            ReconcilerSettings {
                poll_interval: Duration::from_millis(10),
                gap_retry_limit: 2,
                gap_retry_delay: Duration::from_millis(1),
            },
            CancellationToken::new(),
        );
        (tmp, log, queue, reconciler)
    }

    fn ev(build_id: &str, status: BuildStatus) -> BuildEvent {
        BuildEvent::new(build_id, status, "alice")
    }

    #[tokio::test]
    async fn test_observes_appended_entries_in_order() {
        let chain = Arc::new(FakeChain::default());
        chain.append(0, &ev("b1", BuildStatus::Started));
        chain.append(1, &ev("b1", BuildStatus::Success));
        let (_tmp, log, _queue, mut reconciler) = harness(Arc::clone(&chain));

        reconciler.cycle().await.unwrap();

        let view = read_log(&log);
        assert_eq!(view.tail_len(), 2);
        assert_eq!(view.first_unobserved(), 2);
        let latest = view.get_latest("b1").unwrap();
        assert_eq!(latest.sequence, Some(1));
        assert_eq!(latest.ledger_timestamp, Some(1001));
    }

    #[tokio::test]
    async fn test_chain_side_confirmation_reaches_queue() {
        let chain = Arc::new(FakeChain::default());
        let (_tmp, _log, queue, mut reconciler) = harness(Arc::clone(&chain));

        let key = queue.enqueue("b1", BuildStatus::Success, "alice").unwrap();
        // Simulate the writer's submit landing without its acknowledgement:
        // the record's own event appears on-chain.
        let record = queue.record_of(&key).unwrap();
        chain.append(0, &record.event);

        reconciler.cycle().await.unwrap();

        assert_eq!(
            queue.state_of(&key),
            Some(crate::submit::SubmissionState::Confirmed { sequence: 0 })
        );
        let confirmed = queue.record_of(&key).unwrap();
        assert_eq!(confirmed.event.ledger_timestamp, Some(1000));
    }

    #[tokio::test]
    async fn test_tail_reorg_evicts_and_refetches() {
        let chain = Arc::new(FakeChain::default());
        chain.append(0, &ev("b1", BuildStatus::Started));
        chain.append(1, &ev("b1", BuildStatus::Success));
        let (_tmp, log, _queue, mut reconciler) = harness(Arc::clone(&chain));
        reconciler.cycle().await.unwrap();

        // Position 1 is rewritten before finalization.
        chain.rewrite(1, &ev("b9", BuildStatus::Aborted));
        reconciler.cycle().await.unwrap();

        let view = read_log(&log);
        assert!(!view.is_poisoned());
        assert_eq!(view.tail_len(), 2);
        let replaced = view
            .list(&EventFilter::default(), Some(1), 1)
            .events
            .remove(0);
        assert_eq!(replaced.build_id, "b9");
        assert_eq!(replaced.status, BuildStatus::Aborted);
    }

    #[tokio::test]
    async fn test_finalized_rewrite_poisons_and_halts() {
        let chain = Arc::new(FakeChain::default());
        chain.append(0, &ev("b1", BuildStatus::Started));
        chain.append(1, &ev("b1", BuildStatus::Success));
        chain.finalize(1);
        let (_tmp, log, _queue, mut reconciler) = harness(Arc::clone(&chain));
        reconciler.cycle().await.unwrap();
        assert_eq!(read_log(&log).finalized_height(), Some(1));

        // Finality contract broken: position 1 changes under the watermark.
        chain.rewrite(1, &ev("b9", BuildStatus::Aborted));
        chain.finalize(1);

        let outcome = reconciler.cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Halt));
        assert!(read_log(&log).is_poisoned());
        // Reads still serve the last coherent finalized view.
        assert_eq!(
            read_log(&log)
                .list(&EventFilter { finalized_only: true, ..Default::default() }, None, 10)
                .events
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_gap_is_requeried_not_skipped() {
        let chain = Arc::new(FakeChain::default());
        chain.append(0, &ev("b1", BuildStatus::Started));
        chain.append(2, &ev("b2", BuildStatus::Started));
        let (_tmp, log, _queue, mut reconciler) = harness(Arc::clone(&chain));

        reconciler.cycle().await.unwrap();
        // Position 1 never appeared: ingestion stops at the gap.
        assert_eq!(read_log(&log).tail_len(), 1);
        assert_eq!(read_log(&log).first_unobserved(), 1);

        // The missing entry shows up; the next cycle fills the hole and moves on.
        chain.append(1, &ev("b1", BuildStatus::Success));
        reconciler.cycle().await.unwrap();
        assert_eq!(read_log(&log).tail_len(), 3);
        assert_eq!(read_log(&log).first_unobserved(), 3);
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_skipped_once() {
        let chain = Arc::new(FakeChain::default());
        chain.append(0, &ev("b1", BuildStatus::Started));
        chain.entries.lock().unwrap().push(LedgerEntry {
            position: 1,
            timestamp: 1001,
            payload: b"not an event".to_vec(),
        });
        chain.append(2, &ev("b1", BuildStatus::Success));
        let (_tmp, log, _queue, mut reconciler) = harness(Arc::clone(&chain));

        reconciler.cycle().await.unwrap();

        assert_eq!(read_log(&log).tail_len(), 2);
        // Cursor moved past the foreign entry; it is not refetched.
        assert_eq!(reconciler.cursor, 3);
        assert_eq!(reconciler.stats.malformed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_finality_watermark_persists() {
        let chain = Arc::new(FakeChain::default());
        chain.append(0, &ev("b1", BuildStatus::Started));
        chain.append(1, &ev("b1", BuildStatus::Success));
        chain.finalize(0);
        let (_tmp, log, _queue, mut reconciler) = harness(Arc::clone(&chain));

        reconciler.cycle().await.unwrap();

        assert_eq!(read_log(&log).finalized_height(), Some(0));
        assert_eq!(reconciler.store.finalized_height().unwrap(), Some(0));
        assert_eq!(reconciler.store.load_finalized_events().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_watermark_never_outruns_observation() {
        let chain = Arc::new(FakeChain::default());
        chain.append(0, &ev("b1", BuildStatus::Started));
        // The ledger claims finality far beyond anything fetched so far.
        chain.finalize(100);
        let (_tmp, log, _queue, mut reconciler) = harness(Arc::clone(&chain));

        reconciler.cycle().await.unwrap();

        assert_eq!(read_log(&log).finalized_height(), Some(0));
        assert_eq!(read_log(&log).first_unobserved(), 1);
    }
}
