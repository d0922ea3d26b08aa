//! Submission side of the ledger client.
//!
//! Producers hand events to the [`SubmissionQueue`]; one or more
//! [`LedgerWriter`] workers drive each queued record to a terminal state
//! against the external ledger.

pub mod queue;
pub mod writer;

pub use queue::{QueueError, QueueStats, SubmissionQueue, SubmissionRecord, SubmissionState};
pub use writer::{LedgerWriter, WriterSettings, WriterStats, WriterStatsSnapshot};
