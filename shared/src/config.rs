//! # Configuration for the Offline Verification Kiosk
//!
//! This module handles configuration loading and validation.
//! Defaults come from [`crate::constants`]; environment variables override them.

use crate::constants::*;
use crate::error::{IdentityError, IdentityResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// KIOSK CONFIGURATION
// =============================================================================

/// Configuration for an offline verification device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineVerifierConfig {
    /// Identifier recorded on results and audit entries
    pub device_id: String,

    /// Local storage configuration
    pub storage: StorageConfig,

    /// Verification thresholds and limits
    pub verification: VerificationConfig,

    /// Cache trust horizons
    pub cache: CacheConfig,

    /// Ledger reconciliation
    pub sync: SyncConfig,

    /// Audit trail
    pub audit: AuditConfig,
}

impl Default for OfflineVerifierConfig {
    fn default() -> Self {
        Self {
            device_id: "kiosk-local".into(),
            storage: StorageConfig::default(),
            verification: VerificationConfig::default(),
            cache: CacheConfig::default(),
            sync: SyncConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl OfflineVerifierConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> IdentityResult<Self> {
        let mut config = Self::default();

        if let Ok(device_id) = env::var(ENV_DEVICE_ID) {
            config.device_id = device_id;
        }

        if let Ok(path) = env::var(ENV_DATA_PATH) {
            config.storage.data_path = PathBuf::from(path);
        }

        if let Ok(url) = env::var(ENV_LEDGER_URL) {
            config.sync.ledger_url = url;
        }

        if let Some(score) = parse_env(ENV_MIN_MATCH_SCORE)? {
            config.verification.min_match_score = score;
        }

        if let Some(score) = parse_env(ENV_MIN_QUALITY_SCORE)? {
            config.verification.min_quality_score = score;
        }

        if let Some(timeout) = parse_env(ENV_MATCHER_TIMEOUT_MS)? {
            config.verification.matcher_timeout_ms = timeout;
        }

        if let Some(require) = parse_env(ENV_REQUIRE_VALID_CREDENTIAL)? {
            config.verification.require_valid_credential = require;
        }

        if let Some(interval) = parse_env(ENV_SYNC_INTERVAL_SECS)? {
            config.sync.interval_secs = interval;
        }

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> IdentityResult<()> {
        if self.device_id.trim().is_empty() {
            return Err(IdentityError::ConfigurationError("device_id must not be empty".into()));
        }

        self.verification.validate()?;
        self.sync.validate()?;

        Ok(())
    }
}

fn parse_env<T: FromStr>(name: &str) -> IdentityResult<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| {
                IdentityError::ConfigurationError(format!("{} has invalid value '{}'", name, raw))
            }),
        Err(_) => Ok(None),
    }
}

// =============================================================================
// STORAGE CONFIGURATION
// =============================================================================

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the caches and the pending queue
    pub data_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from(DEFAULT_DEVICE_STORAGE_PATH),
        }
    }
}

// =============================================================================
// VERIFICATION CONFIGURATION
// =============================================================================

/// Verification thresholds and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Minimum matcher score for a match
    pub min_match_score: f64,

    /// Minimum capture quality for a success
    pub min_quality_score: f64,

    /// Templates compared per attempt
    pub max_templates: usize,

    /// Deadline per matcher invocation, in milliseconds
    pub matcher_timeout_ms: u64,

    /// Refuse 1:1 verification when the identity holds no offline-valid credential
    pub require_valid_credential: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            min_match_score: DEFAULT_MIN_MATCH_SCORE,
            min_quality_score: DEFAULT_MIN_QUALITY_SCORE,
            max_templates: DEFAULT_MAX_TEMPLATES,
            matcher_timeout_ms: DEFAULT_MATCHER_TIMEOUT_MS,
            require_valid_credential: false,
        }
    }
}

impl VerificationConfig {
    pub fn matcher_timeout(&self) -> Duration {
        Duration::from_millis(self.matcher_timeout_ms)
    }

    /// Thresholds must lie in [0, 1]
    pub fn validate(&self) -> IdentityResult<()> {
        for (name, value) in [
            ("min_match_score", self.min_match_score),
            ("min_quality_score", self.min_quality_score),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(IdentityError::ConfigurationError(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.max_templates == 0 {
            return Err(IdentityError::ConfigurationError("max_templates must be positive".into()));
        }
        if self.matcher_timeout_ms == 0 {
            return Err(IdentityError::ConfigurationError(
                "matcher_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// CACHE CONFIGURATION
// =============================================================================

/// Cache trust horizons
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Offline validity of newly enrolled templates, in days
    pub template_validity_days: i64,

    /// Age of the last online check after which a credential is re-checked
    pub max_offline_age_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            template_validity_days: DEFAULT_TEMPLATE_VALIDITY_DAYS,
            max_offline_age_secs: DEFAULT_MAX_OFFLINE_AGE_SECS,
        }
    }
}

impl CacheConfig {
    pub fn max_offline_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_offline_age_secs as i64)
    }

    pub fn template_validity(&self) -> chrono::Duration {
        chrono::Duration::days(self.template_validity_days)
    }
}

// =============================================================================
// SYNC CONFIGURATION
// =============================================================================

/// Ledger reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Ledger and identity service base URL
    pub ledger_url: String,

    /// Items pushed per drain
    pub batch_size: usize,

    /// Interval between background drains, in seconds
    pub interval_secs: u64,

    /// Attempts before an item is parked
    pub max_retries: u32,

    /// First retry delay, in seconds
    pub backoff_base_secs: u64,

    /// Retry delay ceiling, in seconds
    pub backoff_max_secs: u64,

    /// HTTP request timeout, in seconds
    pub request_timeout_secs: u64,

    /// Unreconciled items held before enqueue is refused
    pub max_pending: usize,

    /// Age after which reconciled items are purged, in seconds
    pub reconciled_retention_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ledger_url: DEFAULT_LEDGER_URL.into(),
            batch_size: DEFAULT_SYNC_BATCH_SIZE,
            interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            max_retries: DEFAULT_SYNC_MAX_RETRIES,
            backoff_base_secs: DEFAULT_SYNC_BACKOFF_BASE_SECS,
            backoff_max_secs: DEFAULT_SYNC_BACKOFF_MAX_SECS,
            request_timeout_secs: DEFAULT_SYNC_REQUEST_TIMEOUT_SECS,
            max_pending: DEFAULT_MAX_PENDING,
            reconciled_retention_secs: DEFAULT_RECONCILED_RETENTION_SECS,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reconciled_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reconciled_retention_secs as i64)
    }

    /// Delay before attempt `attempts + 1`: base * 2^(attempts - 1), capped
    pub fn backoff_for(&self, attempts: u32) -> chrono::Duration {
        let exponent = attempts.saturating_sub(1).min(32);
        let delay = self
            .backoff_base_secs
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_secs);
        chrono::Duration::seconds(delay as i64)
    }

    pub fn validate(&self) -> IdentityResult<()> {
        if self.batch_size == 0 {
            return Err(IdentityError::ConfigurationError(
                "sync batch_size must be positive".into(),
            ));
        }
        if self.interval_secs == 0 {
            return Err(IdentityError::ConfigurationError(
                "sync interval_secs must be positive".into(),
            ));
        }
        if self.max_pending == 0 {
            return Err(IdentityError::ConfigurationError(
                "sync max_pending must be positive".into(),
            ));
        }
        if self.backoff_base_secs > self.backoff_max_secs {
            return Err(IdentityError::ConfigurationError(
                "sync backoff_base_secs exceeds backoff_max_secs".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// AUDIT CONFIGURATION
// =============================================================================

/// Audit trail configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Service name recorded in every entry's metadata
    pub source_service: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            source_service: DEFAULT_SOURCE_SERVICE.into(),
        }
    }
}
