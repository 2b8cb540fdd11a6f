//! # Constants for the Offline Verification Kiosk
//!
//! Default thresholds, horizons and environment variable names used across
//! the device client and its tooling.

// =============================================================================
// VERIFICATION THRESHOLDS
// =============================================================================

/// Minimum matcher score accepted as a match
pub const DEFAULT_MIN_MATCH_SCORE: f64 = 0.8;

/// Minimum capture quality accepted for a successful verification
pub const DEFAULT_MIN_QUALITY_SCORE: f64 = 0.6;

/// Upper bound on templates compared per verification attempt
pub const DEFAULT_MAX_TEMPLATES: usize = 100;

/// Deadline for a single matcher invocation (milliseconds)
pub const DEFAULT_MATCHER_TIMEOUT_MS: u64 = 2_000;

// =============================================================================
// CACHE HORIZONS
// =============================================================================

/// Offline validity of a freshly enrolled template (30 days)
pub const DEFAULT_TEMPLATE_VALIDITY_DAYS: i64 = 30;

/// Maximum age of the last online check before a credential is re-checked (24 hours)
pub const DEFAULT_MAX_OFFLINE_AGE_SECS: u64 = 24 * 60 * 60;

/// Default priority for credential refresh requests
pub const DEFAULT_SYNC_PRIORITY: i32 = 0;

/// Priority used for verification results awaiting reconciliation
pub const VERIFICATION_RESULT_PRIORITY: i32 = 10;

/// Priority used for audit entries awaiting submission
pub const AUDIT_ENTRY_PRIORITY: i32 = 20;

// =============================================================================
// SYNC CONFIGURATION
// =============================================================================

/// Default number of pending items pushed per drain
pub const DEFAULT_SYNC_BATCH_SIZE: usize = 50;

/// Interval between background drains (seconds)
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;

/// Attempts before a pending item is parked as exhausted
pub const DEFAULT_SYNC_MAX_RETRIES: u32 = 8;

/// First retry delay (seconds)
pub const DEFAULT_SYNC_BACKOFF_BASE_SECS: u64 = 5;

/// Retry delay ceiling (seconds)
pub const DEFAULT_SYNC_BACKOFF_MAX_SECS: u64 = 60 * 60;

/// Ledger request timeout (seconds)
pub const DEFAULT_SYNC_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of unreconciled items held on the device
pub const DEFAULT_MAX_PENDING: usize = 10_000;

/// Reconciled items older than this are purged during maintenance (7 days)
pub const DEFAULT_RECONCILED_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

// =============================================================================
// LEDGER API
// =============================================================================

/// Default ledger service base URL
pub const DEFAULT_LEDGER_URL: &str = "http://localhost:8080";

/// Path for transaction log submission
pub const LEDGER_TRANSACTIONS_PATH: &str = "/api/v1/ledger/transactions";

/// Path prefix for credential status checks
pub const CREDENTIAL_STATUS_PATH: &str = "/api/v1/credentials";

// =============================================================================
// AUDIT
// =============================================================================

/// Source service recorded on every audit entry
pub const DEFAULT_SOURCE_SERVICE: &str = "offline-kiosk";

/// Entity type for identity lifecycle and verification entries
pub const ENTITY_TYPE_IDENTITY: &str = "Identity";

/// Entity type for biometric template entries
pub const ENTITY_TYPE_TEMPLATE: &str = "BiometricTemplate";

/// Entity type for cached credential entries
pub const ENTITY_TYPE_CREDENTIAL: &str = "Credential";

/// Suffix appended to redacted metadata keys
pub const REDACTED_KEY_SUFFIX: &str = "Hash";

/// Metadata key fragments treated as personally identifying.
/// Matched against the lowercased key with `-`, `_` and spaces removed.
pub const SENSITIVE_KEY_FRAGMENTS: &[&str] = &[
    "name",
    "email",
    "phone",
    "address",
    "nationalid",
    "passport",
    "ssn",
    "socialsecurity",
    "taxid",
    "dateofbirth",
    "birthdate",
    "dob",
    "biometric",
];

// =============================================================================
// STORAGE PATHS
// =============================================================================

/// Default path for device storage
pub const DEFAULT_DEVICE_STORAGE_PATH: &str = "./kiosk_storage";

// =============================================================================
// ENVIRONMENT VARIABLES
// =============================================================================

/// Device identifier recorded on results and audit entries
pub const ENV_DEVICE_ID: &str = "KIOSK_DEVICE_ID";

/// Storage directory
pub const ENV_DATA_PATH: &str = "KIOSK_DATA_PATH";

/// Ledger base URL
pub const ENV_LEDGER_URL: &str = "KIOSK_LEDGER_URL";

/// Match threshold override
pub const ENV_MIN_MATCH_SCORE: &str = "KIOSK_MIN_MATCH_SCORE";

/// Quality threshold override
pub const ENV_MIN_QUALITY_SCORE: &str = "KIOSK_MIN_QUALITY_SCORE";

/// Matcher deadline override (milliseconds)
pub const ENV_MATCHER_TIMEOUT_MS: &str = "KIOSK_MATCHER_TIMEOUT_MS";

/// Sync interval override (seconds)
pub const ENV_SYNC_INTERVAL_SECS: &str = "KIOSK_SYNC_INTERVAL_SECS";

/// Template keys, formatted as `id:hex,id:hex`
pub const ENV_TEMPLATE_KEYS: &str = "KIOSK_TEMPLATE_KEYS";

/// Key id used for new template rows
pub const ENV_TEMPLATE_KEY_CURRENT: &str = "KIOSK_TEMPLATE_KEY_CURRENT";

/// Trusted issuer keys, formatted as `issuer=hex,issuer=hex`
pub const ENV_TRUSTED_ISSUERS: &str = "KIOSK_TRUSTED_ISSUERS";

/// Require an offline-valid credential for 1:1 verification
pub const ENV_REQUIRE_VALID_CREDENTIAL: &str = "KIOSK_REQUIRE_VALID_CREDENTIAL";
