//! Shared test fixtures: a scripted in-memory ledger and a full client
//! harness wired the way `main` wires production.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use opsledger::ledger::{
    CongestionLevel, LedgerAuth, LedgerConnector, LedgerEntry, LedgerError, TransactionRef,
    TransactionStatus,
};
use opsledger::reconcile::{
    MaterializedLog, Reconciler, ReconcilerSettings, SharedLog,
};
use opsledger::reconcile::ReconcilerStats;
use opsledger::storage::ClientStore;
use opsledger::submit::{
    LedgerWriter, SubmissionQueue, SubmissionState, WriterSettings, WriterStats,
};

/// Scripted outcome for one submit call. When the script runs dry, submits
/// are accepted.
#[derive(Debug, Clone, Copy)]
pub enum SubmitScript {
    Accept,
    Transient,
    Permanent,
}

#[derive(Default)]
struct LedgerState {
    chain: Vec<LedgerEntry>,
    finalized: Option<u64>,
    congestion: Option<CongestionLevel>,
    script: VecDeque<SubmitScript>,
    tx_positions: HashMap<String, u64>,
    next_tx: u64,
    submit_calls: u64,
    appended_from: Vec<u64>,
}

/// In-memory ledger double. Accepted submissions are appended to the chain
/// immediately, so the reconciler observes them on its next cycle.
#[derive(Default)]
pub struct ScriptedLedger {
    state: Mutex<LedgerState>,
}

impl ScriptedLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_submits(&self, outcomes: impl IntoIterator<Item = SubmitScript>) {
        self.state.lock().unwrap().script.extend(outcomes);
    }

    /// Drop any remaining scripted outcomes; submits accept again.
    pub fn clear_script(&self) {
        self.state.lock().unwrap().script.clear();
    }

    pub fn set_congestion(&self, level: CongestionLevel) {
        self.state.lock().unwrap().congestion = Some(level);
    }

    /// Append an entry out-of-band (something another client wrote).
    pub fn append_raw(&self, payload: Vec<u8>) -> u64 {
        let mut state = self.state.lock().unwrap();
        let position = state.chain.last().map_or(0, |e| e.position + 1);
        state.chain.push(LedgerEntry {
            position,
            timestamp: 1_700_000_000 + position as i64,
            payload,
        });
        position
    }

    /// Reorganize: discard everything at or beyond `position` and append a
    /// replacement entry there.
    pub fn rewrite(&self, position: u64, payload: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.chain.retain(|e| e.position < position);
        state.tx_positions.retain(|_, p| *p < position);
        state.chain.push(LedgerEntry {
            position,
            timestamp: 1_800_000_000 + position as i64,
            payload,
        });
    }

    pub fn finalize(&self, height: u64) {
        self.state.lock().unwrap().finalized = Some(height);
    }

    pub fn submit_calls(&self) -> u64 {
        self.state.lock().unwrap().submit_calls
    }

    pub fn chain_len(&self) -> usize {
        self.state.lock().unwrap().chain.len()
    }

    /// `from` arguments of every query_appended call, in order.
    pub fn appended_queries(&self) -> Vec<u64> {
        self.state.lock().unwrap().appended_from.clone()
    }
}

#[async_trait]
impl LedgerConnector for ScriptedLedger {
    async fn submit(
        &self,
        payload: &[u8],
        _auth: &LedgerAuth,
    ) -> Result<TransactionRef, LedgerError> {
        let mut state = self.state.lock().unwrap();
        state.submit_calls += 1;
        match state.script.pop_front().unwrap_or(SubmitScript::Accept) {
            SubmitScript::Accept => {
                let position = state.chain.last().map_or(0, |e| e.position + 1);
                state.chain.push(LedgerEntry {
                    position,
                    timestamp: 1_700_000_000 + position as i64,
                    payload: payload.to_vec(),
                });
                let tx = format!("tx-{}", state.next_tx);
                state.next_tx += 1;
                state.tx_positions.insert(tx.clone(), position);
                Ok(TransactionRef(tx))
            }
            SubmitScript::Transient => {
                Err(LedgerError::RejectedTransient("ledger congested".to_string()))
            }
            SubmitScript::Permanent => {
                Err(LedgerError::RejectedPermanent("payload rejected by validator".to_string()))
            }
        }
    }

    async fn get_status(&self, tx: &TransactionRef) -> Result<TransactionStatus, LedgerError> {
        let state = self.state.lock().unwrap();
        match state.tx_positions.get(&tx.0) {
            Some(position) => Ok(TransactionStatus::IncludedAtPosition(*position)),
            None => Ok(TransactionStatus::NotFound),
        }
    }

    async fn query_appended(&self, from: u64) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut state = self.state.lock().unwrap();
        state.appended_from.push(from);
        let mut out: Vec<LedgerEntry> = state
            .chain
            .iter()
            .filter(|e| e.position >= from)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.position);
        Ok(out)
    }

    async fn query_at(&self, position: u64) -> Result<Option<LedgerEntry>, LedgerError> {
        let state = self.state.lock().unwrap();
        Ok(state.chain.iter().find(|e| e.position == position).cloned())
    }

    async fn current_finalized_position(&self) -> Result<Option<u64>, LedgerError> {
        Ok(self.state.lock().unwrap().finalized)
    }

    async fn estimate_congestion(&self) -> Result<CongestionLevel, LedgerError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .congestion
            .unwrap_or(CongestionLevel::Low))
    }
}

/// A fully wired client: queue, writer workers, reconciler, shared log.
pub struct TestClient {
    pub ledger: Arc<ScriptedLedger>,
    pub queue: Arc<SubmissionQueue>,
    pub log: SharedLog,
    pub store: ClientStore,
    pub cancel: CancellationToken,
    pub writer_stats: Arc<WriterStats>,
    pub reconciler_stats: Arc<ReconcilerStats>,
    _db_dir: tempfile::TempDir,
}

/// Settings tightened so tests settle in milliseconds.
pub fn fast_writer_settings(max_attempts: u32) -> WriterSettings {
    WriterSettings {
        max_attempts,
        submit_timeout: Duration::from_millis(500),
        confirm_deadline: Duration::from_millis(500),
        status_poll_interval: Duration::from_millis(10),
        backoff_base: Duration::from_millis(2),
        backoff_cap: Duration::from_millis(10),
        congestion_ceiling: CongestionLevel::High,
        idle_sleep: Duration::from_millis(10),
    }
}

pub fn fast_reconciler_settings() -> ReconcilerSettings {
    ReconcilerSettings {
        poll_interval: Duration::from_millis(20),
        gap_retry_limit: 2,
        gap_retry_delay: Duration::from_millis(5),
    }
}

impl TestClient {
    /// Start a client against a fresh database and ledger, with the writer
    /// and reconciler tasks running.
    pub fn start(max_attempts: u32) -> Self {
        let ledger = ScriptedLedger::new();
        Self::start_with(ledger, tempfile::tempdir().unwrap(), max_attempts)
    }

    /// Start against an existing ledger and database directory; used by
    /// restart tests to simulate a new process life.
    pub fn start_with(
        ledger: Arc<ScriptedLedger>,
        db_dir: tempfile::TempDir,
        max_attempts: u32,
    ) -> Self {
        let store = ClientStore::open(db_dir.path().join("db")).unwrap();
        let queue = Arc::new(SubmissionQueue::open(store.clone(), 8).unwrap());

        let finalized = store.load_finalized_events().unwrap();
        let height = store.finalized_height().unwrap();
        let log: SharedLog = Arc::new(RwLock::new(MaterializedLog::from_snapshot(
            finalized, height,
        )));

        let cancel = CancellationToken::new();
        let connector: Arc<dyn LedgerConnector> = ledger.clone();

        let writer = LedgerWriter::new(
            Arc::clone(&queue),
            Arc::clone(&connector),
            LedgerAuth {
                authority: "ci-bot".to_string(),
                token: "test-token".to_string(),
            },
            fast_writer_settings(max_attempts),
            cancel.clone(),
        );
        let writer_stats = writer.stats_handle();
        tokio::spawn(writer.run(0));

        let reconciler = Reconciler::new(
            connector,
            Arc::clone(&log),
            Arc::clone(&queue),
            store.clone(),
            fast_reconciler_settings(),
            cancel.clone(),
        );
        let reconciler_stats = reconciler.stats_handle();
        tokio::spawn(reconciler.run());

        Self {
            ledger,
            queue,
            log,
            store,
            cancel,
            writer_stats,
            reconciler_stats,
            _db_dir: db_dir,
        }
    }

    /// Build the HTTP app over this client's live components.
    pub fn app(&self) -> axum::Router {
        opsledger::api::create_app(opsledger::api::AppContext {
            queue: Arc::clone(&self.queue),
            log: Arc::clone(&self.log),
            store: self.store.clone(),
            writer_stats: Arc::clone(&self.writer_stats),
            reconciler_stats: Arc::clone(&self.reconciler_stats),
            started_at: std::time::Instant::now(),
        })
    }

    /// Stop the background tasks and hand back the ledger and database
    /// directory for a subsequent "restart".
    pub async fn shutdown(self) -> (Arc<ScriptedLedger>, tempfile::TempDir) {
        self.cancel.cancel();
        // Give the tasks a beat to observe cancellation.
        tokio::time::sleep(Duration::from_millis(50)).await;
        (self.ledger, self._db_dir)
    }

    /// Poll until the submission reaches a terminal state.
    pub async fn wait_terminal(&self, key: &str) -> SubmissionState {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(state) = self.queue.state_of(key) {
                if state.is_terminal() {
                    return state;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "submission {} did not reach a terminal state",
                key
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the materialized log holds `n` events (tail + finalized).
    pub async fn wait_observed(&self, n: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let total = {
                let log = opsledger::read_log(&self.log);
                log.finalized_len() + log.tail_len()
            };
            if total >= n {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "materialized log never reached {} events",
                n
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the finality watermark reaches `height`.
    pub async fn wait_finalized(&self, height: u64) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if opsledger::read_log(&self.log).finalized_height() >= Some(height) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "finality watermark never reached {}",
                height
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
