//! # Ledger and Identity Service Clients
//!
//! Remote seams used only by the sync coordinator and by online credential
//! checks. Every transport or protocol failure becomes
//! [`IdentityError::SyncFailure`] so callers can treat it as retryable.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared::{
    config::SyncConfig,
    constants::{CREDENTIAL_STATUS_PATH, LEDGER_TRANSACTIONS_PATH},
    error::{IdentityError, IdentityResult},
    types::{CredentialStatusResponse, TransactionLogRequest, TransactionLogResponse},
};

/// Ledger transaction log
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit one transaction; a response with `success: false` is an error
    async fn log_transaction(
        &self,
        request: &TransactionLogRequest,
    ) -> IdentityResult<TransactionLogResponse>;
}

/// Authoritative credential status lookup
#[async_trait]
pub trait CredentialStatusClient: Send + Sync {
    async fn credential_status(
        &self,
        credential_id: Uuid,
    ) -> IdentityResult<CredentialStatusResponse>;
}

/// Reports whether the remote services are currently reachable
pub trait ConnectivityProbe: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Probe backed by a flag that a health check or the operator flips
#[derive(Debug, Default)]
pub struct ConnectivityFlag(AtomicBool);

impl ConnectivityFlag {
    pub fn new(online: bool) -> Self {
        Self(AtomicBool::new(online))
    }

    pub fn set_online(&self, online: bool) {
        let previous = self.0.swap(online, Ordering::SeqCst);
        if previous != online {
            info!(online, "Connectivity changed");
        }
    }
}

impl ConnectivityProbe for ConnectivityFlag {
    fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// HTTP client for the ledger and identity service APIs
pub struct HttpLedgerClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpLedgerClient {
    pub fn new(config: &SyncConfig) -> IdentityResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| IdentityError::ConfigurationError(format!("HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.ledger_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn transactions_url(&self) -> String {
        format!("{}{}", self.base_url, LEDGER_TRANSACTIONS_PATH)
    }

    fn status_url(&self, credential_id: Uuid) -> String {
        format!("{}{}/{}/status", self.base_url, CREDENTIAL_STATUS_PATH, credential_id)
    }

    /// Whether the ledger answers at all
    pub async fn is_reachable(&self) -> bool {
        match self.http_client.get(&self.base_url).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Ledger unreachable");
                false
            }
        }
    }

    async fn check_status(
        response: reqwest::Response,
        what: &str,
    ) -> IdentityResult<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(IdentityError::SyncFailure(format!(
            "{} failed with {}: {}",
            what, status, body
        )))
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn log_transaction(
        &self,
        request: &TransactionLogRequest,
    ) -> IdentityResult<TransactionLogResponse> {
        let response = self
            .http_client
            .post(self.transactions_url())
            .json(request)
            .send()
            .await
            .map_err(|e| IdentityError::SyncFailure(e.to_string()))?;

        let response = Self::check_status(response, "transaction log").await?;
        let logged: TransactionLogResponse = response
            .json()
            .await
            .map_err(|e| {
                IdentityError::SyncFailure(format!("invalid ledger response: {}", e))
            })?;

        if !logged.success {
            warn!(
                transaction_type = %request.transaction_type,
                correlation_id = %request.correlation_id,
                "Ledger rejected transaction"
            );
            return Err(IdentityError::SyncFailure("ledger rejected transaction".into()));
        }

        debug!(
            transaction_type = %request.transaction_type,
            log_id = ?logged.log_id,
            "Transaction logged"
        );
        Ok(logged)
    }
}

#[async_trait]
impl CredentialStatusClient for HttpLedgerClient {
    async fn credential_status(
        &self,
        credential_id: Uuid,
    ) -> IdentityResult<CredentialStatusResponse> {
        let response = self
            .http_client
            .get(self.status_url(credential_id))
            .send()
            .await
            .map_err(|e| IdentityError::SyncFailure(e.to_string()))?;

        let response = Self::check_status(response, "credential status").await?;
        let status: CredentialStatusResponse = response
            .json()
            .await
            .map_err(|e| {
                IdentityError::SyncFailure(format!("invalid status response: {}", e))
            })?;

        if status.credential_id != credential_id {
            return Err(IdentityError::SyncFailure(format!(
                "status answer for {} while asking about {}",
                status.credential_id, credential_id
            )));
        }
        Ok(status)
    }
}
