//! Submission queue — pending events with idempotency keys and
//! at-most-one-in-flight dispatch.
//!
//! The queue owns every [`SubmissionRecord`] state transition. Writers obtain
//! records via [`next_ready`](SubmissionQueue::next_ready) and report outcomes
//! back through `ack_*`/`nack`; nothing else mutates a record. Unconfirmed
//! records are mirrored to disk so a restart resumes without re-submitting
//! anything that already confirmed.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::event::{BuildEvent, BuildStatus};
use crate::storage::{ClientStore, StorageError};

/// Lifecycle of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubmissionState {
    /// Accepted, waiting for a writer.
    Pending,
    /// Held by a writer; a ledger call may be outstanding.
    Submitted,
    /// Observed on the ledger at the given position. Terminal.
    Confirmed { sequence: u64 },
    /// Permanently rejected. Terminal.
    Failed { reason: String },
    /// Retries exhausted. Terminal, surfaced to the caller.
    Abandoned,
}

impl SubmissionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionState::Confirmed { .. }
                | SubmissionState::Failed { .. }
                | SubmissionState::Abandoned
        )
    }

    fn name(&self) -> &'static str {
        match self {
            SubmissionState::Pending => "pending",
            SubmissionState::Submitted => "submitted",
            SubmissionState::Confirmed { .. } => "confirmed",
            SubmissionState::Failed { .. } => "failed",
            SubmissionState::Abandoned => "abandoned",
        }
    }
}

/// One tracked submission. Owned by the queue; writers receive clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub idempotency_key: String,
    pub event: BuildEvent,
    pub state: SubmissionState,
    /// Number of ledger submissions performed (incremented per attempt,
    /// including the one that eventually succeeds).
    pub attempts: u32,
    pub last_error: Option<String>,
    pub transaction_ref: Option<String>,
}

/// Queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("unknown idempotency key: {0}")]
    UnknownKey(String),
    #[error("invalid transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: &'static str,
        to: &'static str,
    },
}

/// Point-in-time queue counters for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub confirmed: u64,
    pub failed: u64,
    pub abandoned: u64,
}

struct QueueInner {
    records: HashMap<String, SubmissionRecord>,
    /// Dispatch order for Pending keys. Keys whose state moved on are
    /// skipped lazily at dequeue time.
    pending_order: VecDeque<String>,
    in_flight: usize,
    confirmed: u64,
    failed: u64,
    abandoned: u64,
}

/// The submission queue. Clone-free; share via `Arc`.
pub struct SubmissionQueue {
    store: ClientStore,
    max_in_flight: usize,
    inner: Mutex<QueueInner>,
}

impl SubmissionQueue {
    /// Open the queue, restoring unconfirmed records from disk.
    ///
    /// Records that were `Submitted` when the process died are demoted to
    /// `Pending`: the writer re-checks ledger state before any resubmission,
    /// so demotion cannot double-append.
    pub fn open(store: ClientStore, max_in_flight: usize) -> Result<Self, QueueError> {
        let mut records = store.load_records()?;
        records.sort_by(|a, b| {
            a.event
                .submitted_at
                .cmp(&b.event.submitted_at)
                .then_with(|| a.idempotency_key.cmp(&b.idempotency_key))
        });

        let mut map = HashMap::with_capacity(records.len());
        let mut order = VecDeque::with_capacity(records.len());
        let mut demoted = 0usize;

        for mut rec in records {
            if rec.state == SubmissionState::Submitted {
                rec.state = SubmissionState::Pending;
                demoted += 1;
                store.save_record(&rec)?;
            }
            if rec.state == SubmissionState::Pending {
                order.push_back(rec.idempotency_key.clone());
            }
            map.insert(rec.idempotency_key.clone(), rec);
        }

        if !map.is_empty() {
            info!(
                restored = map.len(),
                demoted = demoted,
                "Submission queue restored from disk"
            );
        }

        Ok(Self {
            store,
            max_in_flight,
            inner: Mutex::new(QueueInner {
                records: map,
                pending_order: order,
                in_flight: 0,
                confirmed: 0,
                failed: 0,
                abandoned: 0,
            }),
        })
    }

    /// Accept a new event for submission. Returns its idempotency key.
    ///
    /// The key is a deterministic digest of the event's canonical encoding
    /// plus a per-enqueue nonce: the nonce keeps two deliberate retries of
    /// the same logical build distinguishable, while a single enqueue call
    /// can never produce two effective submissions.
    pub fn enqueue(
        &self,
        build_id: &str,
        status: BuildStatus,
        developer: &str,
    ) -> Result<String, QueueError> {
        let event = BuildEvent::new(build_id, status, developer);
        event
            .validate()
            .map_err(|e| QueueError::InvalidEvent(e.to_string()))?;

        let nonce: u64 = rand::random();
        let mut digest_input = crate::event::encode(&event);
        digest_input.extend_from_slice(&nonce.to_be_bytes());
        let key = format!("{:x}", md5::compute(&digest_input));

        let record = SubmissionRecord {
            idempotency_key: key.clone(),
            event,
            state: SubmissionState::Pending,
            attempts: 0,
            last_error: None,
            transaction_ref: None,
        };
        self.store.save_record(&record)?;

        let mut inner = self.lock();
        inner.pending_order.push_back(key.clone());
        inner.records.insert(key.clone(), record);

        debug!(key = %key, build_id = build_id, status = %status, "Submission enqueued");
        Ok(key)
    }

    /// Hand out at most one Pending record, transitioning it to Submitted.
    ///
    /// Returns `None` when nothing is pending or the global in-flight cap is
    /// reached (backpressure). A key already Submitted is never handed out
    /// again — the at-most-one-in-flight invariant lives here.
    pub fn next_ready(&self) -> Option<SubmissionRecord> {
        let mut inner = self.lock();
        if inner.in_flight >= self.max_in_flight {
            return None;
        }

        while let Some(key) = inner.pending_order.pop_front() {
            let Some(rec) = inner.records.get_mut(&key) else {
                continue;
            };
            if rec.state != SubmissionState::Pending {
                // Confirmed by the reconciler (or otherwise moved on) while
                // waiting in the dispatch order.
                continue;
            }
            rec.state = SubmissionState::Submitted;
            let snapshot = rec.clone();
            inner.in_flight += 1;
            self.persist(&snapshot);
            return Some(snapshot);
        }
        None
    }

    /// Record the start of a ledger submission attempt. Returns the new
    /// attempt count.
    pub fn begin_attempt(&self, key: &str) -> Result<u32, QueueError> {
        let mut inner = self.lock();
        let rec = Self::submitted_record(&mut inner, key, "attempt")?;
        rec.attempts += 1;
        let attempts = rec.attempts;
        let snapshot = rec.clone();
        drop(inner);
        self.persist(&snapshot);
        Ok(attempts)
    }

    /// Attach the ledger's transaction handle to an in-flight record.
    pub fn note_transaction_ref(&self, key: &str, tx_ref: &str) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let rec = Self::submitted_record(&mut inner, key, "transaction_ref")?;
        rec.transaction_ref = Some(tx_ref.to_string());
        let snapshot = rec.clone();
        drop(inner);
        self.persist(&snapshot);
        Ok(())
    }

    /// Mark a record Confirmed at the given ledger position.
    ///
    /// Accepted from Pending as well as Submitted: the reconciler may observe
    /// the event on-chain before (or instead of) the writer's own
    /// acknowledgement. Idempotent for a repeat confirmation at the same
    /// position; a *different* position is a consistency bug and rejected.
    pub fn ack_confirmed(
        &self,
        key: &str,
        sequence: u64,
        ledger_timestamp: Option<i64>,
    ) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let rec = inner
            .records
            .get_mut(key)
            .ok_or_else(|| QueueError::UnknownKey(key.to_string()))?;

        match &rec.state {
            SubmissionState::Confirmed { sequence: existing } if *existing == sequence => {
                return Ok(());
            }
            s if s.is_terminal() => {
                return Err(QueueError::InvalidTransition {
                    key: key.to_string(),
                    from: s.name(),
                    to: "confirmed",
                });
            }
            _ => {}
        }

        let was_in_flight = rec.state == SubmissionState::Submitted;
        rec.state = SubmissionState::Confirmed { sequence };
        rec.event.sequence = Some(sequence);
        if ledger_timestamp.is_some() {
            rec.event.ledger_timestamp = ledger_timestamp;
        }
        if was_in_flight {
            inner.in_flight -= 1;
        }
        inner.confirmed += 1;
        drop(inner);

        self.retire(key);
        info!(key = key, sequence = sequence, "Submission confirmed");
        Ok(())
    }

    /// Mark a record permanently Failed. No retry.
    pub fn ack_failed(&self, key: &str, reason: &str) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let rec = Self::submitted_record(&mut inner, key, "failed")?;
        rec.state = SubmissionState::Failed {
            reason: reason.to_string(),
        };
        rec.last_error = Some(reason.to_string());
        inner.in_flight -= 1;
        inner.failed += 1;
        drop(inner);

        self.retire(key);
        warn!(key = key, reason = reason, "Submission permanently failed");
        Ok(())
    }

    /// Mark a record Abandoned after retries were exhausted. Terminal and
    /// surfaced via `state_of` — never silently dropped.
    pub fn ack_abandoned(&self, key: &str, last_error: &str) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let rec = Self::submitted_record(&mut inner, key, "abandoned")?;
        rec.state = SubmissionState::Abandoned;
        rec.last_error = Some(last_error.to_string());
        inner.in_flight -= 1;
        inner.abandoned += 1;
        drop(inner);

        self.retire(key);
        warn!(key = key, last_error = last_error, "Submission abandoned");
        Ok(())
    }

    /// Return a Submitted record to Pending after a transient failure.
    pub fn nack(&self, key: &str, error: &str) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let rec = Self::submitted_record(&mut inner, key, "pending")?;
        rec.state = SubmissionState::Pending;
        rec.last_error = Some(error.to_string());
        let snapshot = rec.clone();
        inner.in_flight -= 1;
        inner.pending_order.push_back(key.to_string());
        drop(inner);

        self.persist(&snapshot);
        debug!(key = key, error = error, "Submission returned to pending");
        Ok(())
    }

    /// Return a Submitted record to Pending without counting anything
    /// against it. Used when shutdown interrupts a writer mid-record.
    pub fn release(&self, key: &str) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let rec = Self::submitted_record(&mut inner, key, "pending")?;
        rec.state = SubmissionState::Pending;
        let snapshot = rec.clone();
        inner.in_flight -= 1;
        inner.pending_order.push_front(key.to_string());
        drop(inner);

        self.persist(&snapshot);
        Ok(())
    }

    /// Producer-facing state probe.
    pub fn state_of(&self, key: &str) -> Option<SubmissionState> {
        self.lock().records.get(key).map(|r| r.state.clone())
    }

    /// Full record snapshot (for the submission status endpoint).
    pub fn record_of(&self, key: &str) -> Option<SubmissionRecord> {
        self.lock().records.get(key).cloned()
    }

    /// Confirm whichever non-terminal record matches the given on-chain
    /// event. Called by the reconciler so submission state converges even
    /// when the writer's own acknowledgement was lost. Returns the key it
    /// confirmed, if any.
    pub fn confirm_matching(
        &self,
        event: &BuildEvent,
        sequence: u64,
        ledger_timestamp: Option<i64>,
    ) -> Option<String> {
        let key = {
            let inner = self.lock();
            inner
                .records
                .values()
                .find(|r| !r.state.is_terminal() && r.event.same_logical(event))
                .map(|r| r.idempotency_key.clone())
        }?;

        match self.ack_confirmed(&key, sequence, ledger_timestamp) {
            Ok(()) => Some(key),
            Err(e) => {
                warn!(key = %key, error = %e, "Reconciler confirmation rejected");
                None
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        QueueStats {
            pending: inner
                .records
                .values()
                .filter(|r| r.state == SubmissionState::Pending)
                .count(),
            in_flight: inner.in_flight,
            confirmed: inner.confirmed,
            failed: inner.failed,
            abandoned: inner.abandoned,
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn submitted_record<'a>(
        inner: &'a mut QueueInner,
        key: &str,
        to: &'static str,
    ) -> Result<&'a mut SubmissionRecord, QueueError> {
        let rec = inner
            .records
            .get_mut(key)
            .ok_or_else(|| QueueError::UnknownKey(key.to_string()))?;
        if rec.state != SubmissionState::Submitted {
            return Err(QueueError::InvalidTransition {
                key: key.to_string(),
                from: rec.state.name(),
                to,
            });
        }
        Ok(rec)
    }

    /// Persist a still-unconfirmed record; storage failure is logged, not
    /// fatal — in-memory state stays authoritative for this process.
    fn persist(&self, record: &SubmissionRecord) {
        if let Err(e) = self.store.save_record(record) {
            warn!(key = %record.idempotency_key, error = %e, "Failed to persist submission record");
        }
    }

    /// Drop a terminal record from the durable unconfirmed set.
    fn retire(&self, key: &str) {
        if let Err(e) = self.store.remove_record(key) {
            warn!(key = key, error = %e, "Failed to retire submission record");
        }
    }
}
