//! External ledger interface.
//!
//! The replicated ledger itself is a black box. Everything the client needs
//! from it is expressed by [`LedgerConnector`]; the production implementation
//! talks HTTP to a ledger node gateway ([`rpc::HttpLedgerConnector`]) and
//! tests substitute a scripted in-memory double.

pub mod rpc;

use async_trait::async_trait;

/// Opaque handle for a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionRef(pub String);

impl std::fmt::Display for TransactionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a submitted transaction currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Known to the ledger but not yet included.
    Pending,
    /// Included at the given position.
    IncludedAtPosition(u64),
    /// The ledger has no record of this transaction.
    NotFound,
}

/// Coarse congestion/fee level reported by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionLevel {
    Low,
    Moderate,
    High,
    Critical,
}

/// Submission credentials forwarded to the ledger gateway.
#[derive(Debug, Clone)]
pub struct LedgerAuth {
    /// Submitting identity (account / authority address).
    pub authority: String,
    /// Bearer token for the gateway.
    pub token: String,
}

/// One appended ledger entry.
///
/// `timestamp` is assigned by the ledger at inclusion time and is the
/// authoritative event time; `payload` is the encoded [`crate::event::BuildEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub position: u64,
    pub timestamp: i64,
    pub payload: Vec<u8>,
}

/// Ledger call failures, split along the retry boundary the writer cares about.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    /// Transport-level failure; the transaction may or may not have landed.
    #[error("ledger network error: {0}")]
    Network(String),
    /// Ledger refused the transaction for a transient reason (congestion,
    /// underpriced fee). Safe to retry after backoff.
    #[error("transaction rejected (transient): {0}")]
    RejectedTransient(String),
    /// The on-chain validator rejected the payload outright. Never retried.
    #[error("transaction rejected (permanent): {0}")]
    RejectedPermanent(String),
}

impl LedgerError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, LedgerError::RejectedPermanent(_))
    }
}

/// Client view of the external ledger.
#[async_trait]
pub trait LedgerConnector: Send + Sync {
    /// Submit an encoded event. Returns an opaque transaction handle.
    async fn submit(&self, payload: &[u8], auth: &LedgerAuth)
        -> Result<TransactionRef, LedgerError>;

    /// Look up a previously submitted transaction.
    async fn get_status(&self, tx: &TransactionRef) -> Result<TransactionStatus, LedgerError>;

    /// Fetch appended entries at or beyond `from`, ordered by position.
    async fn query_appended(&self, from: u64) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Fetch the entry at a single position, if any. Used by the reconciler
    /// to probe previously observed positions for divergence.
    async fn query_at(&self, position: u64) -> Result<Option<LedgerEntry>, LedgerError>;

    /// Highest position considered irreversible, if the ledger has finalized
    /// anything yet.
    async fn current_finalized_position(&self) -> Result<Option<u64>, LedgerError>;

    /// Current congestion/fee level.
    async fn estimate_congestion(&self) -> Result<CongestionLevel, LedgerError>;
}
