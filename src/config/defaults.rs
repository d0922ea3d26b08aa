//! System-wide default constants.
//!
//! Centralises the tunables shared between the TOML config defaults and the
//! subsystem settings structs. Grouped by subsystem.

// ============================================================================
// Server
// ============================================================================

/// Default HTTP bind address.
pub const SERVER_ADDR: &str = "0.0.0.0:8080";

// ============================================================================
// Ledger gateway
// ============================================================================

/// HTTP client timeout for ledger gateway requests (seconds).
pub const LEDGER_HTTP_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Writer
// ============================================================================

/// Ledger submission attempts per record before it is abandoned.
pub const WRITER_MAX_ATTEMPTS: u32 = 5;

/// Number of concurrent writer workers.
pub const WRITER_WORKERS: usize = 2;

/// Cap on records dispatched to workers at once (backpressure).
pub const MAX_IN_FLIGHT: usize = 16;

/// Bound on a single submit call (seconds).
pub const SUBMIT_TIMEOUT_SECS: u64 = 10;

/// How long a writer polls for inclusion after submit (seconds).
pub const CONFIRM_DEADLINE_SECS: u64 = 30;

/// Cadence of transaction status polls (milliseconds).
pub const STATUS_POLL_INTERVAL_MS: u64 = 500;

/// First retry backoff delay (milliseconds). Doubles per retry.
pub const BACKOFF_BASE_MS: u64 = 500;

/// Retry backoff ceiling (milliseconds).
pub const BACKOFF_CAP_MS: u64 = 30_000;

// ============================================================================
// Reconciler
// ============================================================================

/// Interval between reconciliation cycles (seconds).
pub const RECONCILE_INTERVAL_SECS: u64 = 5;

/// Re-queries of a missing ledger position before the cycle gives up.
pub const GAP_RETRY_LIMIT: u32 = 3;

/// Delay between gap re-queries (milliseconds).
pub const GAP_RETRY_DELAY_MS: u64 = 250;

// ============================================================================
// Storage
// ============================================================================

/// Default on-disk database path.
pub const DB_PATH: &str = "opsledger_db";
