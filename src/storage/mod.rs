//! Durable client state.
//!
//! Two things must survive a restart: the submission queue's unconfirmed
//! records (so a restart never re-submits a confirmed event) and the
//! materialized log's finalized region plus watermark (so reconciliation
//! resumes where it left off instead of rescanning from genesis).
//!
//! Backed by sled with one tree per concern. Values are JSON; finalized
//! events are keyed by sequence as big-endian bytes so iteration order is
//! ledger order.

use std::path::Path;
use std::sync::Arc;

use crate::event::BuildEvent;
use crate::submit::SubmissionRecord;

const TREE_SUBMISSIONS: &str = "submissions";
const TREE_FINALIZED: &str = "finalized_events";
const TREE_META: &str = "meta";

const META_FINALIZED_HEIGHT: &[u8] = b"finalized_height";

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Handle over the client's durable state. Cheap to clone.
#[derive(Clone)]
pub struct ClientStore {
    db: Arc<sled::Db>,
    submissions: sled::Tree,
    finalized: sled::Tree,
    meta: sled::Tree,
}

impl ClientStore {
    /// Open or create the store at the given directory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path.as_ref())?;
        let submissions = db.open_tree(TREE_SUBMISSIONS)?;
        let finalized = db.open_tree(TREE_FINALIZED)?;
        let meta = db.open_tree(TREE_META)?;

        tracing::info!(path = %path.as_ref().display(), "Client store opened");

        Ok(Self {
            db: Arc::new(db),
            submissions,
            finalized,
            meta,
        })
    }

    // ------------------------------------------------------------------
    // Submission records (unconfirmed set)
    // ------------------------------------------------------------------

    /// Persist an unconfirmed submission record, keyed by idempotency key.
    pub fn save_record(&self, record: &SubmissionRecord) -> Result<(), StorageError> {
        let value = serde_json::to_vec(record)?;
        self.submissions
            .insert(record.idempotency_key.as_bytes(), value)?;
        self.submissions.flush()?;
        Ok(())
    }

    /// Remove a record that reached a terminal state.
    pub fn remove_record(&self, idempotency_key: &str) -> Result<(), StorageError> {
        self.submissions.remove(idempotency_key.as_bytes())?;
        self.submissions.flush()?;
        Ok(())
    }

    /// Load every unconfirmed record. Corrupted entries are dropped with a
    /// warning rather than poisoning startup.
    pub fn load_records(&self) -> Result<Vec<SubmissionRecord>, StorageError> {
        let mut records = Vec::new();
        for item in self.submissions.iter() {
            let (key, value) = item?;
            match serde_json::from_slice::<SubmissionRecord>(&value) {
                Ok(rec) => records.push(rec),
                Err(e) => {
                    tracing::warn!(
                        key = %String::from_utf8_lossy(&key),
                        error = %e,
                        "Dropping corrupted submission record"
                    );
                }
            }
        }
        Ok(records)
    }

    // ------------------------------------------------------------------
    // Finalized log region + watermark
    // ------------------------------------------------------------------

    /// Persist a finalized event at its sequence position.
    pub fn save_finalized_event(&self, event: &BuildEvent) -> Result<(), StorageError> {
        let seq = event.sequence.ok_or_else(|| {
            StorageError::Serialization("finalized event without sequence".to_string())
        })?;
        let value = serde_json::to_vec(event)?;
        self.finalized.insert(seq.to_be_bytes(), value)?;
        Ok(())
    }

    /// Load the finalized region in sequence order.
    pub fn load_finalized_events(&self) -> Result<Vec<BuildEvent>, StorageError> {
        let mut events = Vec::new();
        for item in self.finalized.iter() {
            let (_key, value) = item?;
            events.push(serde_json::from_slice::<BuildEvent>(&value)?);
        }
        Ok(events)
    }

    /// Persist the finalized watermark. Flushes, so a crash after this call
    /// never loses the watermark or the events below it.
    pub fn set_finalized_height(&self, height: u64) -> Result<(), StorageError> {
        self.meta
            .insert(META_FINALIZED_HEIGHT, &height.to_be_bytes())?;
        self.finalized.flush()?;
        self.meta.flush()?;
        Ok(())
    }

    /// Read the persisted finalized watermark, if any.
    pub fn finalized_height(&self) -> Result<Option<u64>, StorageError> {
        let Some(raw) = self.meta.get(META_FINALIZED_HEIGHT)? else {
            return Ok(None);
        };
        let mut bytes = [0u8; 8];
        if raw.len() != 8 {
            return Err(StorageError::Database(
                "corrupted finalized_height value".to_string(),
            ));
        }
        bytes.copy_from_slice(&raw);
        Ok(Some(u64::from_be_bytes(bytes)))
    }

    /// Database size on disk (for the stats endpoint).
    pub fn size_bytes(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }
}
