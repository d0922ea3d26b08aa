//! HTTP ledger connector — talks to a ledger node gateway.
//!
//! The gateway fronts the replicated ledger with a small JSON API. Status
//! codes carry the retry classification: 4xx payload rejections are permanent,
//! 429/503 are transient, transport errors are ambiguous network failures.

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    CongestionLevel, LedgerAuth, LedgerConnector, LedgerEntry, LedgerError, TransactionRef,
    TransactionStatus,
};

/// HTTP client for the ledger gateway.
#[derive(Clone)]
pub struct HttpLedgerConnector {
    http: reqwest::Client,
    gateway_url: String,
}

#[derive(Deserialize)]
struct SubmitResponse {
    transaction_ref: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    position: Option<u64>,
}

#[derive(Deserialize)]
struct EntryResponse {
    position: u64,
    timestamp: i64,
    /// Raw event payload as a JSON string (the gateway stores entry bytes
    /// verbatim, so the string round-trips byte-for-byte).
    payload: String,
}

#[derive(Deserialize)]
struct FinalizedResponse {
    #[serde(default)]
    finalized_position: Option<u64>,
}

#[derive(Deserialize)]
struct CongestionResponse {
    level: CongestionLevel,
}

impl From<EntryResponse> for LedgerEntry {
    fn from(e: EntryResponse) -> Self {
        LedgerEntry {
            position: e.position,
            timestamp: e.timestamp,
            payload: e.payload.into_bytes(),
        }
    }
}

impl HttpLedgerConnector {
    /// Create a connector for the given gateway URL.
    pub fn new(gateway_url: &str, request_timeout: std::time::Duration) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LedgerError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn gateway_url(&self) -> &str {
        &self.gateway_url
    }

    fn classify_status(status: reqwest::StatusCode, body: String) -> LedgerError {
        match status {
            reqwest::StatusCode::TOO_MANY_REQUESTS | reqwest::StatusCode::SERVICE_UNAVAILABLE => {
                LedgerError::RejectedTransient(format!("HTTP {}: {}", status, body))
            }
            s if s.is_client_error() => {
                LedgerError::RejectedPermanent(format!("HTTP {}: {}", s, body))
            }
            s => LedgerError::Network(format!("HTTP {}: {}", s, body)),
        }
    }

    async fn read_error(resp: reqwest::Response) -> LedgerError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Self::classify_status(status, body)
    }
}

fn transport(e: reqwest::Error) -> LedgerError {
    LedgerError::Network(e.to_string())
}

#[async_trait]
impl LedgerConnector for HttpLedgerConnector {
    async fn submit(
        &self,
        payload: &[u8],
        auth: &LedgerAuth,
    ) -> Result<TransactionRef, LedgerError> {
        let resp = self
            .http
            .post(format!("{}/ledger/transactions", self.gateway_url))
            .header("Authorization", format!("Bearer {}", auth.token))
            .header("Content-Type", "application/json")
            .header("X-Authority", &auth.authority)
            .body(payload.to_vec())
            .send()
            .await
            .map_err(transport)?;

        if !resp.status().is_success() {
            return Err(Self::read_error(resp).await);
        }

        let body: SubmitResponse = resp.json().await.map_err(transport)?;
        Ok(TransactionRef(body.transaction_ref))
    }

    async fn get_status(&self, tx: &TransactionRef) -> Result<TransactionStatus, LedgerError> {
        let resp = self
            .http
            .get(format!("{}/ledger/transactions/{}", self.gateway_url, tx))
            .send()
            .await
            .map_err(transport)?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(TransactionStatus::NotFound);
        }
        if !resp.status().is_success() {
            return Err(Self::read_error(resp).await);
        }

        let body: StatusResponse = resp.json().await.map_err(transport)?;
        match (body.status.as_str(), body.position) {
            ("included", Some(pos)) => Ok(TransactionStatus::IncludedAtPosition(pos)),
            ("pending", _) => Ok(TransactionStatus::Pending),
            ("not_found", _) => Ok(TransactionStatus::NotFound),
            (other, _) => Err(LedgerError::Network(format!(
                "unexpected transaction status '{}'",
                other
            ))),
        }
    }

    async fn query_appended(&self, from: u64) -> Result<Vec<LedgerEntry>, LedgerError> {
        let resp = self
            .http
            .get(format!("{}/ledger/entries", self.gateway_url))
            .query(&[("from", from)])
            .send()
            .await
            .map_err(transport)?;

        if !resp.status().is_success() {
            return Err(Self::read_error(resp).await);
        }

        let body: Vec<EntryResponse> = resp.json().await.map_err(transport)?;
        let mut entries: Vec<LedgerEntry> = body.into_iter().map(Into::into).collect();
        entries.sort_by_key(|e| e.position);
        Ok(entries)
    }

    async fn query_at(&self, position: u64) -> Result<Option<LedgerEntry>, LedgerError> {
        let resp = self
            .http
            .get(format!("{}/ledger/entries/{}", self.gateway_url, position))
            .send()
            .await
            .map_err(transport)?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::read_error(resp).await);
        }

        let body: EntryResponse = resp.json().await.map_err(transport)?;
        Ok(Some(body.into()))
    }

    async fn current_finalized_position(&self) -> Result<Option<u64>, LedgerError> {
        let resp = self
            .http
            .get(format!("{}/ledger/finalized", self.gateway_url))
            .send()
            .await
            .map_err(transport)?;

        if !resp.status().is_success() {
            return Err(Self::read_error(resp).await);
        }

        let body: FinalizedResponse = resp.json().await.map_err(transport)?;
        Ok(body.finalized_position)
    }

    async fn estimate_congestion(&self) -> Result<CongestionLevel, LedgerError> {
        let resp = self
            .http
            .get(format!("{}/ledger/congestion", self.gateway_url))
            .send()
            .await
            .map_err(transport)?;

        if !resp.status().is_success() {
            return Err(Self::read_error(resp).await);
        }

        let body: CongestionResponse = resp.json().await.map_err(transport)?;
        Ok(body.level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_classification() {
        let err = HttpLedgerConnector::classify_status(
            reqwest::StatusCode::BAD_REQUEST,
            "schema violation".to_string(),
        );
        assert!(err.is_permanent());

        let err = HttpLedgerConnector::classify_status(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            "rate limited".to_string(),
        );
        assert!(matches!(err, LedgerError::RejectedTransient(_)));

        let err = HttpLedgerConnector::classify_status(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            "boom".to_string(),
        );
        assert!(matches!(err, LedgerError::Network(_)));
    }

    #[test]
    fn test_gateway_url_normalization() {
        let c = HttpLedgerConnector::new("http://node:9650/", std::time::Duration::from_secs(5))
            .unwrap();
        assert_eq!(c.gateway_url(), "http://node:9650");
    }
}
