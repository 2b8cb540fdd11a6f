//! # Offline Verification Kiosk CLI
//!
//! Operator tool for a kiosk's local state:
//! - Show cache and sync status
//! - Drain the pending queue against the ledger
//! - Run maintenance (eviction, key rotation, refresh scheduling)
//! - Run the background sync loop
//! - Inspect what the device holds for one identity
//!
//! ## Usage
//!
//! ```bash
//! export KIOSK_TEMPLATE_KEYS="k1:<64 hex chars>"
//! export KIOSK_TRUSTED_ISSUERS="did:example:issuer=<64 hex chars>"
//!
//! kiosk status
//! kiosk sync --batch 100
//! kiosk maintain
//! kiosk run --interval 30
//! kiosk inspect --identity 7b1c...
//! ```

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use device_client::{
    engine::FeatureVectorMatcher, ConnectivityFlag, ConnectivityProbe, Ed25519JwsVerifier,
    FileStore, HttpLedgerClient, KeyRing, KioskRuntime, RuntimeServices,
};
use shared::{
    config::OfflineVerifierConfig,
    constants::{ENV_TEMPLATE_KEYS, ENV_TEMPLATE_KEY_CURRENT, ENV_TRUSTED_ISSUERS},
    error::IdentityError,
};

#[derive(Parser)]
#[command(name = "kiosk")]
#[command(about = "Offline identity verification kiosk")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory (overrides KIOSK_DATA_PATH)
    #[arg(long, global = true)]
    data_path: Option<PathBuf>,

    /// Ledger base URL (overrides KIOSK_LEDGER_URL)
    #[arg(long, global = true)]
    ledger_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show cache, queue and connectivity status
    Status,

    /// Drain the pending queue once
    Sync {
        /// Maximum items to process
        #[arg(long)]
        batch: Option<usize>,

        /// Re-arm items that ran out of retries first
        #[arg(long)]
        reset_exhausted: bool,
    },

    /// Evict expired credentials, re-encrypt stale templates, schedule refreshes
    Maintain,

    /// Run maintenance and sync on an interval until Ctrl-C
    Run {
        /// Seconds between passes (overrides KIOSK_SYNC_INTERVAL_SECS)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Show what the device holds for one identity
    Inspect {
        #[arg(long)]
        identity: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = OfflineVerifierConfig::from_env()?;
    if let Some(path) = cli.data_path {
        config.storage.data_path = path;
    }
    if let Some(url) = cli.ledger_url {
        config.sync.ledger_url = url;
    }
    if let Commands::Run { interval: Some(secs) } = &cli.command {
        config.sync.interval_secs = *secs;
    }

    let ledger = Arc::new(HttpLedgerClient::new(&config.sync)?);
    let probe = Arc::new(ConnectivityFlag::new(ledger.is_reachable().await));
    let runtime = build_runtime(config, ledger.clone(), probe.clone()).await?;

    match cli.command {
        Commands::Status => show_status(&runtime)?,
        Commands::Sync { batch, reset_exhausted } => {
            sync_once(&runtime, probe.as_ref(), batch, reset_exhausted).await?
        }
        Commands::Maintain => {
            let report = runtime.sync.run_maintenance(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Run { .. } => run_loop(&runtime, ledger, probe).await?,
        Commands::Inspect { identity } => inspect_identity(&runtime, identity)?,
    }

    Ok(())
}

async fn build_runtime(
    config: OfflineVerifierConfig,
    ledger: Arc<HttpLedgerClient>,
    probe: Arc<ConnectivityFlag>,
) -> Result<KioskRuntime> {
    let key_spec = std::env::var(ENV_TEMPLATE_KEYS)
        .map_err(|_| IdentityError::MissingEnvVar(ENV_TEMPLATE_KEYS.into()))?;
    let current_key = std::env::var(ENV_TEMPLATE_KEY_CURRENT).ok();
    let keyring = KeyRing::from_spec(&key_spec, current_key.as_deref())
        .with_context(|| format!("loading {}", ENV_TEMPLATE_KEYS))?;

    let issuers = std::env::var(ENV_TRUSTED_ISSUERS).unwrap_or_default();
    let verifier = Ed25519JwsVerifier::from_spec(&issuers)
        .with_context(|| format!("loading {}", ENV_TRUSTED_ISSUERS))?;
    if verifier.issuer_count() == 0 {
        warn!("No trusted issuers configured; every credential signature check will fail");
    }

    let store = Arc::new(FileStore::open(&config.storage).await?);

    let runtime = KioskRuntime::assemble(
        config,
        RuntimeServices {
            store,
            cipher: Arc::new(keyring),
            matcher: Arc::new(FeatureVectorMatcher),
            signatures: Arc::new(verifier),
            ledger: ledger.clone(),
            status_client: ledger,
            probe,
        },
    )
    .await?;
    Ok(runtime)
}

fn show_status(runtime: &KioskRuntime) -> Result<()> {
    let snapshot = runtime.snapshot(Utc::now());
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn sync_once(
    runtime: &KioskRuntime,
    probe: &ConnectivityFlag,
    batch: Option<usize>,
    reset_exhausted: bool,
) -> Result<()> {
    if !probe.is_online() {
        println!("Ledger at {} is unreachable; nothing synced.", runtime.config.sync.ledger_url);
        return Ok(());
    }

    if reset_exhausted {
        let reset = runtime.sync.reset_exhausted().await?;
        println!("Re-armed {} exhausted items", reset);
    }

    let batch = batch.unwrap_or(runtime.config.sync.batch_size);
    let report = runtime.sync.drain_pending(batch, Utc::now()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_loop(
    runtime: &KioskRuntime,
    ledger: Arc<HttpLedgerClient>,
    probe: Arc<ConnectivityFlag>,
) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health = {
        let mut shutdown = shutdown_rx.clone();
        let interval = runtime.config.sync.interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => probe.set_online(ledger.is_reachable().await),
                    _ = shutdown.changed() => break,
                }
            }
        })
    };

    let sync = runtime.sync.clone().spawn(shutdown_rx);
    info!(device_id = %runtime.config.device_id, "Kiosk running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown_tx.send(true)?;

    sync.await?;
    health.await?;
    Ok(())
}

fn inspect_identity(runtime: &KioskRuntime, identity_id: Uuid) -> Result<()> {
    let now = Utc::now();

    let credentials: Vec<_> = runtime
        .credentials
        .for_identity(identity_id)
        .iter()
        .map(|c| {
            serde_json::json!({
                "id": c.id,
                "type": c.credential_type,
                "issuer": c.issuer,
                "validOffline": c.is_valid_offline(now),
                "offlineValidUntil": c.offline_valid_until,
                "expiresAt": c.expires_at,
                "revoked": c.is_revoked,
                "lastOnlineCheck": c.last_online_check,
            })
        })
        .collect();

    let templates: Vec<_> = runtime
        .templates
        .history(identity_id)
        .iter()
        .map(|t| {
            serde_json::json!({
                "id": t.id,
                "modality": t.modality,
                "active": t.is_active,
                "eligible": t.is_valid_for_matching(now),
                "enrolledAt": t.enrolled_at,
                "expiresAt": t.expires_at,
                "keyId": t.encryption_key_id,
                "deactivationReason": t.deactivation_reason,
            })
        })
        .collect();

    let view = serde_json::json!({
        "identityId": identity_id,
        "credentials": credentials,
        "templates": templates,
    });
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}
