//! Materialized view of the on-chain event log.
//!
//! Two regions: a finalized prefix that is immutable by ledger contract, and
//! a pending tail that later observations may rewrite (reorgs). The boundary
//! is `finalized_height`, a watermark that only moves forward. Reads come
//! from this structure; the ledger is never queried on the read path.

use serde::Serialize;
use tracing::{debug, warn};

use crate::event::{BuildEvent, BuildStatus};

/// Read-path filters. All conjunctive; `None` means "any".
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub build_id: Option<String>,
    pub developer: Option<String>,
    pub status: Option<BuildStatus>,
    /// Exclude the pending tail, serving only irreversible history.
    pub finalized_only: bool,
}

impl EventFilter {
    fn matches(&self, event: &BuildEvent) -> bool {
        if let Some(ref build_id) = self.build_id {
            if &event.build_id != build_id {
                return false;
            }
        }
        if let Some(ref developer) = self.developer {
            if &event.developer != developer {
                return false;
            }
        }
        if let Some(status) = self.status {
            if event.status != status {
                return false;
            }
        }
        true
    }
}

/// One page of query results, ordered by ledger sequence.
#[derive(Debug, Clone, Serialize)]
pub struct EventPage {
    pub events: Vec<BuildEvent>,
    /// Cursor for the next page, absent on the last page. Pass back as-is.
    pub next_cursor: Option<u64>,
}

/// Log-side failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LogError {
    /// A rewrite reached into the finalized region. The ledger (or this
    /// client's view of it) has broken the finality contract.
    #[error(
        "finalized consistency violation: position {position} changed below watermark {finalized_height}"
    )]
    FinalizedViolation { position: u64, finalized_height: u64 },
}

#[derive(Debug, Default)]
pub struct MaterializedLog {
    /// Irreversible prefix, ascending by sequence.
    finalized: Vec<BuildEvent>,
    /// Observed but not yet irreversible, ascending by sequence.
    pending_tail: Vec<BuildEvent>,
    /// Highest finalized position, if anything has finalized.
    finalized_height: Option<u64>,
    /// Set on a finality violation; all writes are refused afterwards.
    poisoned: Option<String>,
}

impl MaterializedLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a persisted snapshot: the finalized events and watermark
    /// as of the last run. The pending tail is always refetched, never
    /// restored, so a reorg during downtime cannot leave stale entries.
    pub fn from_snapshot(mut finalized: Vec<BuildEvent>, finalized_height: Option<u64>) -> Self {
        finalized.sort_by_key(Self::seq_of);
        Self {
            finalized,
            pending_tail: Vec::new(),
            finalized_height,
            poisoned: None,
        }
    }

    fn seq_of(event: &BuildEvent) -> u64 {
        // Every event in the log was stamped at observation.
        event.sequence.unwrap_or(0)
    }

    pub fn finalized_height(&self) -> Option<u64> {
        self.finalized_height
    }

    pub fn finalized_len(&self) -> usize {
        self.finalized.len()
    }

    pub fn tail_len(&self) -> usize {
        self.pending_tail.len()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    pub fn poison_reason(&self) -> Option<&str> {
        self.poisoned.as_deref()
    }

    /// Mark the log unusable after a finality violation. Reads keep serving
    /// the last coherent view; writes are refused.
    pub fn poison(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "Materialized log poisoned");
        self.poisoned = Some(reason);
    }

    /// First ledger position not yet represented here; where the next
    /// `query_appended` should start.
    pub fn first_unobserved(&self) -> u64 {
        let last = self
            .pending_tail
            .last()
            .or_else(|| self.finalized.last())
            .map(Self::seq_of);
        match (last, self.finalized_height) {
            (Some(seq), Some(h)) => seq.max(h) + 1,
            (Some(seq), None) => seq + 1,
            (None, Some(h)) => h + 1,
            (None, None) => 0,
        }
    }

    /// Sequences currently in the pending tail, ascending. The reconciler
    /// probes these for divergence.
    pub fn tail_positions(&self) -> Vec<u64> {
        self.pending_tail.iter().map(Self::seq_of).collect()
    }

    /// Record an entry observed on the ledger at `position`. Stamps the
    /// ledger-assigned fields; an observation at an already held tail
    /// position replaces the old entry.
    pub fn observe(&mut self, position: u64, ledger_timestamp: i64, mut event: BuildEvent) {
        if self.poisoned.is_some() {
            return;
        }
        if let Some(h) = self.finalized_height {
            if position <= h {
                // Finalized positions are re-observed during catch-up; only a
                // *different* payload there is a violation, and the caller
                // compares payloads before calling observe.
                return;
            }
        }

        event.sequence = Some(position);
        event.ledger_timestamp = Some(ledger_timestamp);

        match self
            .pending_tail
            .binary_search_by_key(&position, Self::seq_of)
        {
            Ok(i) => self.pending_tail[i] = event,
            Err(i) => self.pending_tail.insert(i, event),
        }
    }

    /// Drop every pending entry at or beyond `position` after a detected
    /// rewrite. Refused (and the log poisoned by the caller) if the rewrite
    /// reaches the finalized region.
    pub fn evict_from(&mut self, position: u64) -> Result<usize, LogError> {
        if let Some(h) = self.finalized_height {
            if position <= h {
                return Err(LogError::FinalizedViolation {
                    position,
                    finalized_height: h,
                });
            }
        }
        let before = self.pending_tail.len();
        self.pending_tail.retain(|e| Self::seq_of(e) < position);
        let evicted = before - self.pending_tail.len();
        if evicted > 0 {
            debug!(position = position, evicted = evicted, "Evicted reorganized tail entries");
        }
        Ok(evicted)
    }

    /// Advance the finality watermark, migrating tail entries at or below the
    /// new height into the finalized region. Returns the migrated events so
    /// the caller can persist them. The watermark never moves backwards.
    pub fn advance_finalized(&mut self, new_height: u64) -> Vec<BuildEvent> {
        if self.poisoned.is_some() {
            return Vec::new();
        }
        if let Some(h) = self.finalized_height {
            if new_height <= h {
                return Vec::new();
            }
        }

        let split = self
            .pending_tail
            .partition_point(|e| Self::seq_of(e) <= new_height);
        let migrated: Vec<BuildEvent> = self.pending_tail.drain(..split).collect();
        self.finalized.extend(migrated.iter().cloned());
        self.finalized_height = Some(new_height);

        if !migrated.is_empty() {
            debug!(
                height = new_height,
                migrated = migrated.len(),
                "Finality watermark advanced"
            );
        }
        migrated
    }

    /// Sequence-ordered page of matching events. `cursor` is the first
    /// sequence to include; the returned `next_cursor` continues from where
    /// the page stopped.
    pub fn list(&self, filter: &EventFilter, cursor: Option<u64>, limit: usize) -> EventPage {
        let start = cursor.unwrap_or(0);
        let mut events = Vec::new();
        let mut next_cursor = None;

        let tail: &[BuildEvent] = if filter.finalized_only {
            &[]
        } else {
            &self.pending_tail
        };

        for event in self.finalized.iter().chain(tail.iter()) {
            let seq = Self::seq_of(event);
            if seq < start || !filter.matches(event) {
                continue;
            }
            if events.len() == limit {
                next_cursor = Some(seq);
                break;
            }
            events.push(event.clone());
        }

        EventPage { events, next_cursor }
    }

    /// Latest (highest-sequence) event for a build, pending tail included.
    pub fn get_latest(&self, build_id: &str) -> Option<BuildEvent> {
        self.pending_tail
            .iter()
            .rev()
            .chain(self.finalized.iter().rev())
            .find(|e| e.build_id == build_id)
            .cloned()
    }
}
