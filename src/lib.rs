//! OpsLedger: CI/CD audit events on an append-only ledger.
//!
//! A client service that records build/deploy events on an external
//! replicated ledger and maintains a queryable local view of what the ledger
//! actually holds.
//!
//! ## Architecture
//!
//! - **Submission queue**: durable, idempotency-keyed intake for events
//! - **Ledger writers**: workers that drive each queued record to a terminal
//!   state against the ledger, with retry classification and backoff
//! - **Reconciler**: polls the ledger, maintains the materialized log,
//!   handles reorganizations, and advances the finality watermark
//! - **REST API**: write path into the queue, read path over the
//!   materialized log

pub mod api;
pub mod config;
pub mod event;
pub mod ledger;
pub mod reconcile;
pub mod storage;
pub mod submit;

// Re-export client configuration
pub use config::ClientConfig;

// Re-export the event schema and codec
pub use event::{decode, encode, BuildEvent, BuildStatus, CodecError};

// Re-export ledger interface types
pub use ledger::{
    CongestionLevel, LedgerAuth, LedgerConnector, LedgerEntry, LedgerError, TransactionRef,
    TransactionStatus,
};

// Re-export submission components
pub use submit::{
    LedgerWriter, QueueError, QueueStats, SubmissionQueue, SubmissionRecord, SubmissionState,
    WriterSettings, WriterStats,
};

// Re-export reconciliation components
pub use reconcile::{
    read_log, EventFilter, EventPage, MaterializedLog, Reconciler, ReconcilerSettings, SharedLog,
};

// Re-export storage
pub use storage::{ClientStore, StorageError};
