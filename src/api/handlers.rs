//! API handlers — consistent envelope, typed responses, ISO-8601 timestamps.
//!
//! All handlers return `Response` via [`ApiResponse`] or [`ApiErrorResponse`].
//! Reads are served entirely from the materialized log; no handler ever
//! queries the ledger.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::response::Response;
use serde::{Deserialize, Serialize};

use super::envelope::{ApiErrorResponse, ApiResponse};
use crate::event::{BuildEvent, BuildStatus};
use crate::reconcile::{read_log, EventFilter, ReconcilerStatsSnapshot, ReconcilerStats, SharedLog};
use crate::storage::ClientStore;
use crate::submit::{QueueError, QueueStats, SubmissionQueue, WriterStats, WriterStatsSnapshot};

/// Default page size for event listings.
const DEFAULT_LIMIT: usize = 50;
/// Hard cap on a single page.
const MAX_LIMIT: usize = 500;

/// Shared handler state.
#[derive(Clone)]
pub struct AppContext {
    pub queue: Arc<SubmissionQueue>,
    pub log: SharedLog,
    pub store: ClientStore,
    pub writer_stats: Arc<WriterStats>,
    pub reconciler_stats: Arc<ReconcilerStats>,
    pub started_at: Instant,
}

impl AppContext {
    fn degraded(&self) -> bool {
        read_log(&self.log).is_poisoned()
    }
}

// ============================================================================
// Events (read path)
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub build_id: Option<String>,
    pub developer: Option<String>,
    pub status: Option<String>,
    pub cursor: Option<u64>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub finalized_only: bool,
}

/// `GET /api/v1/events` — filtered, cursor-paginated event listing in ledger
/// order.
pub async fn list_events(
    State(ctx): State<AppContext>,
    Query(query): Query<ListEventsQuery>,
) -> Response {
    let status = match query.status.as_deref() {
        Some(raw) => match raw.parse::<BuildStatus>() {
            Ok(s) => Some(s),
            Err(e) => return ApiErrorResponse::bad_request(e.to_string()),
        },
        None => None,
    };

    let filter = EventFilter {
        build_id: query.build_id,
        developer: query.developer,
        status,
        finalized_only: query.finalized_only,
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);

    let page = read_log(&ctx.log).list(&filter, query.cursor, limit);
    ApiResponse::ok(page, ctx.degraded())
}

/// `GET /api/v1/events/:build_id` — latest recorded event for a build.
pub async fn get_event(State(ctx): State<AppContext>, Path(build_id): Path<String>) -> Response {
    match read_log(&ctx.log).get_latest(&build_id) {
        Some(event) => ApiResponse::ok(event, ctx.degraded()),
        None => ApiErrorResponse::not_found(format!("no recorded event for build '{}'", build_id)),
    }
}

// ============================================================================
// Submissions (write path)
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SubmitEventRequest {
    pub build_id: String,
    pub status: String,
    pub developer: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitEventResponse {
    pub idempotency_key: String,
    pub state: &'static str,
}

/// `POST /api/v1/submissions` — enqueue an event for ledger submission.
///
/// Returns 202: acceptance means durably queued, not recorded. Track progress
/// through `GET /api/v1/submissions/:key`.
pub async fn submit_event(
    State(ctx): State<AppContext>,
    axum::Json(req): axum::Json<SubmitEventRequest>,
) -> Response {
    let status = match req.status.parse::<BuildStatus>() {
        Ok(s) => s,
        Err(e) => return ApiErrorResponse::bad_request(e.to_string()),
    };

    match ctx.queue.enqueue(&req.build_id, status, &req.developer) {
        Ok(key) => ApiResponse::accepted(
            SubmitEventResponse {
                idempotency_key: key,
                state: "pending",
            },
            ctx.degraded(),
        ),
        Err(QueueError::InvalidEvent(msg)) => ApiErrorResponse::bad_request(msg),
        Err(e) => ApiErrorResponse::internal(e.to_string()),
    }
}

#[derive(Debug, Serialize)]
pub struct SubmissionView {
    pub idempotency_key: String,
    pub state: crate::submit::SubmissionState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub transaction_ref: Option<String>,
    pub event: BuildEvent,
}

/// `GET /api/v1/submissions/:key` — lifecycle state of one submission.
pub async fn submission_state(
    State(ctx): State<AppContext>,
    Path(key): Path<String>,
) -> Response {
    match ctx.queue.record_of(&key) {
        Some(record) => ApiResponse::ok(
            SubmissionView {
                idempotency_key: record.idempotency_key,
                state: record.state,
                attempts: record.attempts,
                last_error: record.last_error,
                transaction_ref: record.transaction_ref,
                event: record.event,
            },
            ctx.degraded(),
        ),
        None => ApiErrorResponse::not_found(format!("unknown submission key '{}'", key)),
    }
}

// ============================================================================
// Health and stats
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub finalized_height: Option<u64>,
    pub pending_tail: usize,
    pub degraded_reason: Option<String>,
}

/// `GET /api/v1/health`
pub async fn health(State(ctx): State<AppContext>) -> Response {
    let (finalized_height, pending_tail, reason) = {
        let log = read_log(&ctx.log);
        (
            log.finalized_height(),
            log.tail_len(),
            log.poison_reason().map(str::to_string),
        )
    };
    let degraded = reason.is_some();

    ApiResponse::ok(
        HealthResponse {
            status: if degraded { "degraded" } else { "ok" },
            uptime_secs: ctx.started_at.elapsed().as_secs(),
            finalized_height,
            pending_tail,
            degraded_reason: reason,
        },
        degraded,
    )
}

#[derive(Debug, Serialize)]
pub struct LogStats {
    pub finalized_events: usize,
    pub pending_tail: usize,
    pub finalized_height: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub queue: QueueStats,
    pub writer: WriterStatsSnapshot,
    pub reconciler: ReconcilerStatsSnapshot,
    pub log: LogStats,
    pub storage_bytes: u64,
}

/// `GET /api/v1/stats`
pub async fn stats(State(ctx): State<AppContext>) -> Response {
    let log = {
        let view = read_log(&ctx.log);
        LogStats {
            finalized_events: view.finalized_len(),
            pending_tail: view.tail_len(),
            finalized_height: view.finalized_height(),
        }
    };

    ApiResponse::ok(
        StatsResponse {
            queue: ctx.queue.stats(),
            writer: ctx.writer_stats.snapshot(),
            reconciler: ctx.reconciler_stats.snapshot(),
            log,
            storage_bytes: ctx.store.size_bytes(),
        },
        ctx.degraded(),
    )
}
