//! # Offline Verification - Benchmark Suite
//!
//! Measures kiosk operations against an in-memory store so the numbers
//! reflect local work only: no disk, no ledger round-trips.
//!
//! ## Benchmarks Included
//!
//! 1. Template Sealing - Encrypt and cache one enrollment
//! 2. Biometric Verify - 1:1 match against a claimed identity
//! 3. Biometric Identify - 1:N match across every enrolled identity
//! 4. Credential Verify - Offline policy plus Ed25519 signature check
//! 5. Audit Entry - Build one redacted audit entry
//! 6. Sync Drain - Reconcile a batch of pending items against a local ledger stub
//!
//! ## Usage
//!
//! ```bash
//! # Run all benchmarks
//! cargo run --release --package benchmarks -- --all
//!
//! # 1:N identification over 1000 enrolled identities
//! cargo run --release --package benchmarks -- --benchmark biometric-identify --identities 1000
//!
//! # Export results to CSV
//! cargo run --release --package benchmarks -- --all --output results.csv
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, ValueEnum};
use ed25519_dalek::SigningKey;
use hdrhistogram::Histogram;
use rand::rngs::OsRng;
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

use device_client::{
    engine::FeatureVectorMatcher, signature::sign_compact_jws, AuditEventType, BiometricCapture,
    BiometricClaim, ConnectivityFlag, CredentialStatusClient, Ed25519JwsVerifier, KeyRing,
    KioskRuntime, LedgerClient, MemoryStore, RuntimeServices, TemplateEnrollment,
};
use shared::{
    config::OfflineVerifierConfig,
    error::IdentityResult,
    types::{
        BiometricModality, CachedCredential, CredentialStatusResponse, TemplateFormat,
        TransactionLogRequest, TransactionLogResponse,
    },
};

// Number of iterations for each benchmark
const DEFAULT_ITERATIONS: usize = 1_000;

// Enrolled identities for the matching benchmarks
const DEFAULT_IDENTITIES: usize = 100;

// Feature vector dimensions
const DEFAULT_DIMENSIONS: usize = 128;

// Warm-up iterations (not counted in results)
const WARMUP_ITERATIONS: usize = 10;

const BENCH_ISSUER: &str = "did:example:bench-issuer";
const CREDENTIAL_TYPE: &str = "ResidentCard";

#[derive(Parser, Debug)]
#[command(name = "benchmark")]
#[command(about = "Offline Verification Benchmark Suite")]
struct Args {
    /// Run all benchmarks
    #[arg(long)]
    all: bool,

    /// Specific benchmark to run
    #[arg(long, value_enum)]
    benchmark: Option<BenchmarkType>,

    /// Number of iterations per benchmark
    #[arg(long, default_value_t = DEFAULT_ITERATIONS)]
    iterations: usize,

    /// Identities enrolled before matching
    #[arg(long, default_value_t = DEFAULT_IDENTITIES)]
    identities: usize,

    /// Feature vector dimensions
    #[arg(long, default_value_t = DEFAULT_DIMENSIONS)]
    dimensions: usize,

    /// Output file for CSV results
    #[arg(long)]
    output: Option<String>,

    /// Skip warm-up iterations
    #[arg(long)]
    no_warmup: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BenchmarkType {
    TemplateSealing,
    BiometricVerify,
    BiometricIdentify,
    CredentialVerify,
    AuditEntry,
    SyncDrain,
}

#[derive(Debug, Clone, Serialize)]
struct BenchmarkResult {
    name: String,
    iterations: usize,
    min_ms: f64,
    max_ms: f64,
    mean_ms: f64,
    median_ms: f64,
    p95_ms: f64,
    p99_ms: f64,
    std_dev_ms: f64,
    timestamp: DateTime<Utc>,
}

impl BenchmarkResult {
    fn from_histogram(name: &str, histogram: &Histogram<u64>, iterations: usize) -> Self {
        let to_ms = |v: u64| v as f64 / 1000.0; // microseconds to milliseconds

        Self {
            name: name.to_string(),
            iterations,
            min_ms: to_ms(histogram.min()),
            max_ms: to_ms(histogram.max()),
            mean_ms: histogram.mean() / 1000.0,
            median_ms: to_ms(histogram.value_at_quantile(0.5)),
            p95_ms: to_ms(histogram.value_at_quantile(0.95)),
            p99_ms: to_ms(histogram.value_at_quantile(0.99)),
            std_dev_ms: histogram.stdev() / 1000.0,
            timestamp: Utc::now(),
        }
    }

    fn print_report(&self) {
        println!("\n{}", "=".repeat(60));
        println!("Benchmark: {}", self.name);
        println!("{}", "=".repeat(60));
        println!("Iterations: {}", self.iterations);
        println!();
        println!("  Min:      {:>10.3} ms", self.min_ms);
        println!("  Max:      {:>10.3} ms", self.max_ms);
        println!("  Mean:     {:>10.3} ms", self.mean_ms);
        println!("  Median:   {:>10.3} ms", self.median_ms);
        println!("  P95:      {:>10.3} ms", self.p95_ms);
        println!("  P99:      {:>10.3} ms", self.p99_ms);
        println!("  Std Dev:  {:>10.3} ms", self.std_dev_ms);
        println!("{}", "=".repeat(60));
    }
}

// =============================================================================
// Local ledger stub
// =============================================================================

/// Accepts everything immediately
struct LocalLedger;

#[async_trait]
impl LedgerClient for LocalLedger {
    async fn log_transaction(
        &self,
        _request: &TransactionLogRequest,
    ) -> IdentityResult<TransactionLogResponse> {
        Ok(TransactionLogResponse {
            success: true,
            log_id: Some(Uuid::new_v4().to_string()),
        })
    }
}

#[async_trait]
impl CredentialStatusClient for LocalLedger {
    async fn credential_status(
        &self,
        credential_id: Uuid,
    ) -> IdentityResult<CredentialStatusResponse> {
        Ok(CredentialStatusResponse {
            credential_id,
            revoked: false,
            checked_at: Utc::now(),
        })
    }
}

// =============================================================================
// Runner
// =============================================================================

/// An in-memory kiosk with enrolled identities
struct Fixture {
    runtime: KioskRuntime,
    issuer_key: SigningKey,
    /// (identity, enrolled feature vector)
    enrolled: Vec<(Uuid, Vec<f32>)>,
}

struct BenchmarkRunner {
    iterations: usize,
    identities: usize,
    dimensions: usize,
    warmup: bool,
    verbose: bool,
}

impl BenchmarkRunner {
    fn new(args: &Args) -> Self {
        Self {
            iterations: args.iterations,
            identities: args.identities,
            dimensions: args.dimensions,
            warmup: !args.no_warmup,
            verbose: args.verbose,
        }
    }

    fn create_histogram() -> Result<Histogram<u64>> {
        // Histogram with microsecond precision, max 60 seconds
        Histogram::new_with_bounds(1, 60_000_000, 3).context("creating histogram")
    }

    fn random_features(&self) -> Vec<f32> {
        let mut rng = rand::thread_rng();
        (0..self.dimensions).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    async fn fixture(&self) -> Result<Fixture> {
        let mut config = OfflineVerifierConfig {
            device_id: "kiosk-bench".into(),
            ..Default::default()
        };
        config.verification.max_templates = self.identities.max(1);
        config.sync.max_pending = usize::MAX;

        let issuer_key = SigningKey::generate(&mut OsRng);
        let verifier = Ed25519JwsVerifier::new();
        verifier.trust(BENCH_ISSUER, issuer_key.verifying_key());
        let ledger = Arc::new(LocalLedger);

        let runtime = KioskRuntime::assemble(
            config,
            RuntimeServices {
                store: Arc::new(MemoryStore::new()),
                cipher: Arc::new(KeyRing::generate("bench-key")),
                matcher: Arc::new(FeatureVectorMatcher),
                signatures: Arc::new(verifier),
                ledger: ledger.clone(),
                status_client: ledger,
                probe: Arc::new(ConnectivityFlag::new(false)),
            },
        )
        .await?;

        let mut enrolled = Vec::with_capacity(self.identities);
        for _ in 0..self.identities {
            let identity_id = Uuid::new_v4();
            let features = self.random_features();
            runtime
                .templates
                .store(TemplateEnrollment::new(
                    identity_id,
                    BiometricModality::Face,
                    TemplateFormat::FeatureVector,
                    0.9,
                    FeatureVectorMatcher::encode(&features),
                ))
                .await?;
            enrolled.push((identity_id, features));
        }

        info!(identities = enrolled.len(), dimensions = self.dimensions, "Fixture ready");
        Ok(Fixture {
            runtime,
            issuer_key,
            enrolled,
        })
    }

    async fn run_benchmark<F, Fut>(&self, name: &str, mut f: F) -> Result<BenchmarkResult>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut histogram = Self::create_histogram()?;

        // Warm-up phase
        if self.warmup {
            if self.verbose {
                println!("  Warming up ({} iterations)...", WARMUP_ITERATIONS);
            }
            for _ in 0..WARMUP_ITERATIONS {
                f().await?;
            }
        }

        // Measurement phase
        if self.verbose {
            println!("  Running {} iterations...", self.iterations);
        }

        for i in 0..self.iterations {
            let start = Instant::now();
            f().await?;
            let elapsed = start.elapsed();

            let micros = elapsed.as_micros() as u64;
            histogram.record(micros.max(1)).ok();

            if self.verbose {
                println!("    Iteration {}: {:.3} ms", i + 1, elapsed.as_secs_f64() * 1000.0);
            }
        }

        Ok(BenchmarkResult::from_histogram(name, &histogram, self.iterations))
    }

    // =========================================================================
    // BENCHMARK: Template Sealing
    // =========================================================================

    async fn benchmark_template_sealing(&self) -> Result<BenchmarkResult> {
        println!("\nBenchmark: Template Sealing");
        println!("  AES-256-GCM encryption, hashing and caching of one enrollment.");

        let fixture = self.fixture().await?;
        let template = FeatureVectorMatcher::encode(&self.random_features());

        self.run_benchmark("Template Sealing", || {
            let templates = fixture.runtime.templates.clone();
            let template = template.clone();
            async move {
                templates
                    .store(TemplateEnrollment::new(
                        Uuid::new_v4(),
                        BiometricModality::Face,
                        TemplateFormat::FeatureVector,
                        0.9,
                        template,
                    ))
                    .await?;
                Ok(())
            }
        })
        .await
    }

    // =========================================================================
    // BENCHMARK: Biometric Verify (1:1)
    // =========================================================================

    async fn benchmark_biometric_verify(&self) -> Result<BenchmarkResult> {
        println!("\nBenchmark: Biometric Verify (1:1)");
        println!("  Decrypt and compare against the claimed identity's templates.");

        let fixture = self.fixture().await?;
        let (identity_id, features) = fixture
            .enrolled
            .first()
            .cloned()
            .context("benchmark needs at least one identity")?;
        let sample = FeatureVectorMatcher::encode(&features);

        self.run_benchmark("Biometric Verify (1:1)", || {
            let engine = fixture.runtime.engine.clone();
            let capture = BiometricCapture::new(BiometricModality::Face, sample.clone(), 0.9);
            async move {
                let result = engine
                    .verify_biometric(&capture, BiometricClaim::Verify { identity_id })
                    .await;
                anyhow::ensure!(
                    result.is_success(),
                    "expected a match, got {:?}",
                    result.error_code()
                );
                Ok(())
            }
        })
        .await
    }

    // =========================================================================
    // BENCHMARK: Biometric Identify (1:N)
    // =========================================================================

    async fn benchmark_biometric_identify(&self) -> Result<BenchmarkResult> {
        println!("\nBenchmark: Biometric Identify (1:N)");
        println!("  Decrypt and compare against all {} enrolled identities.", self.identities);

        let fixture = self.fixture().await?;
        let (identity_id, features) = fixture
            .enrolled
            .last()
            .cloned()
            .context("benchmark needs at least one identity")?;
        let sample = FeatureVectorMatcher::encode(&features);

        self.run_benchmark("Biometric Identify (1:N)", || {
            let engine = fixture.runtime.engine.clone();
            let capture = BiometricCapture::new(BiometricModality::Face, sample.clone(), 0.9);
            async move {
                let result = engine.verify_biometric(&capture, BiometricClaim::Identify).await;
                anyhow::ensure!(
                    result.identity_id() == Some(identity_id),
                    "identified {:?} instead of {}",
                    result.identity_id(),
                    identity_id
                );
                Ok(())
            }
        })
        .await
    }

    // =========================================================================
    // BENCHMARK: Credential Verify
    // =========================================================================

    async fn benchmark_credential_verify(&self) -> Result<BenchmarkResult> {
        println!("\nBenchmark: Credential Verify (offline)");
        println!("  Offline trust policy plus EdDSA signature verification.");

        let fixture = self.fixture().await?;
        let identity_id = Uuid::new_v4();
        let token = sign_compact_jws(
            &fixture.issuer_key,
            None,
            &serde_json::json!({ "iss": BENCH_ISSUER, "sub": identity_id.to_string() }),
        )?;
        let now = Utc::now();
        fixture
            .runtime
            .credentials
            .upsert(CachedCredential::new(
                identity_id,
                CREDENTIAL_TYPE,
                BENCH_ISSUER,
                token,
                now,
                Some(now + Duration::days(365)),
                now + Duration::days(1),
            ))
            .await?;

        self.run_benchmark("Credential Verify", || {
            let engine = fixture.runtime.engine.clone();
            async move {
                let result = engine.verify_credential(identity_id, CREDENTIAL_TYPE).await;
                anyhow::ensure!(
                    result.is_success(),
                    "credential check failed: {:?}",
                    result.error_code()
                );
                Ok(())
            }
        })
        .await
    }

    // =========================================================================
    // BENCHMARK: Audit Entry
    // =========================================================================

    async fn benchmark_audit_entry(&self) -> Result<BenchmarkResult> {
        println!("\nBenchmark: Audit Entry");
        println!("  Redact and stamp one entry with personal attributes.");

        let fixture = self.fixture().await?;
        let mut metadata = BTreeMap::new();
        metadata.insert("fullName".to_string(), "Ada Lovelace".to_string());
        metadata.insert("email".to_string(), "ada@example.org".to_string());
        metadata.insert("dateOfBirth".to_string(), "1815-12-10".to_string());
        metadata.insert("modality".to_string(), "face".to_string());

        self.run_benchmark("Audit Entry", || {
            let audit = fixture.runtime.audit.clone();
            let metadata = metadata.clone();
            async move {
                let entry = audit.build_entry(
                    AuditEventType::BiometricEnrolled,
                    "Identity",
                    Uuid::new_v4(),
                    None,
                    metadata,
                    None,
                );
                anyhow::ensure!(!entry.metadata().contains_key("email"), "email not redacted");
                Ok(())
            }
        })
        .await
    }

    // =========================================================================
    // BENCHMARK: Sync Drain
    // =========================================================================

    async fn benchmark_sync_drain(&self) -> Result<BenchmarkResult> {
        const BATCH: usize = 50;

        println!("\nBenchmark: Sync Drain");
        println!("  Reconcile {} queued audit entries against a local ledger stub.", BATCH);

        let fixture = self.fixture().await?;

        self.run_benchmark("Sync Drain", || {
            let sync = fixture.runtime.sync.clone();
            let audit = fixture.runtime.audit.clone();
            async move {
                for _ in 0..BATCH {
                    sync.enqueue_audit_entry(audit.identity_removed_entry(Uuid::new_v4(), 0, 0))
                        .await?;
                }
                let report = sync.drain_pending(BATCH, Utc::now()).await?;
                anyhow::ensure!(
                    report.reconciled == BATCH,
                    "reconciled {} of {}",
                    report.reconciled,
                    BATCH
                );
                Ok(())
            }
        })
        .await
    }
}

// =============================================================================
// CSV Export
// =============================================================================

fn export_to_csv(results: &[BenchmarkResult], filename: &str) -> Result<()> {
    use std::fs::File;
    use std::io::Write;

    let mut file = File::create(filename)?;

    // Header
    writeln!(
        file,
        "benchmark,iterations,min_ms,max_ms,mean_ms,median_ms,p95_ms,p99_ms,std_dev_ms,timestamp"
    )?;

    // Data rows
    for r in results {
        writeln!(
            file,
            "{},{},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{}",
            r.name,
            r.iterations,
            r.min_ms,
            r.max_ms,
            r.mean_ms,
            r.median_ms,
            r.p95_ms,
            r.p99_ms,
            r.std_dev_ms,
            r.timestamp.to_rfc3339()
        )?;
    }

    println!("\nResults exported to: {}", filename);
    Ok(())
}

async fn run(runner: &BenchmarkRunner, benchmark: BenchmarkType) -> Result<BenchmarkResult> {
    match benchmark {
        BenchmarkType::TemplateSealing => runner.benchmark_template_sealing().await,
        BenchmarkType::BiometricVerify => runner.benchmark_biometric_verify().await,
        BenchmarkType::BiometricIdentify => runner.benchmark_biometric_identify().await,
        BenchmarkType::CredentialVerify => runner.benchmark_credential_verify().await,
        BenchmarkType::AuditEntry => runner.benchmark_audit_entry().await,
        BenchmarkType::SyncDrain => runner.benchmark_sync_drain().await,
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging; per-verification info logs would dominate the timings
    let log_level = if args.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .init();

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║       Offline Verification - Benchmark Suite               ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    println!("Configuration:");
    println!("  Iterations: {}", args.iterations);
    println!("  Identities: {}", args.identities);
    println!("  Dimensions: {}", args.dimensions);
    println!("  Warm-up: {}", if args.no_warmup { "disabled" } else { "enabled" });
    println!();

    let runner = BenchmarkRunner::new(&args);
    let mut results: Vec<BenchmarkResult> = Vec::new();

    let selected: Vec<BenchmarkType> = if args.all {
        BenchmarkType::value_variants().to_vec()
    } else if let Some(benchmark) = args.benchmark {
        vec![benchmark]
    } else {
        println!("No benchmark specified. Use --all or --benchmark <type>");
        println!();
        println!("Available benchmarks:");
        println!("  template-sealing    - Encrypt and cache one enrollment");
        println!("  biometric-verify    - 1:1 match against a claimed identity");
        println!("  biometric-identify  - 1:N match across enrolled identities");
        println!("  credential-verify   - Offline credential policy and signature");
        println!("  audit-entry         - Build one redacted audit entry");
        println!("  sync-drain          - Reconcile a batch against a local ledger");
        println!();
        println!("Example: cargo run --release -p benchmarks -- --all");
        return Ok(());
    };

    for benchmark in selected {
        let result = run(&runner, benchmark).await?;
        result.print_report();
        results.push(result);
    }

    // Print summary
    if !results.is_empty() {
        println!("\n");
        println!("╔════════════════════════════════════════════════════════════╗");
        println!("║                      SUMMARY                               ║");
        println!("╚════════════════════════════════════════════════════════════╝");
        println!();
        println!("{:<30} {:>10} {:>10} {:>10}", "Benchmark", "Mean", "P95", "P99");
        println!("{}", "-".repeat(62));

        for r in &results {
            println!(
                "{:<30} {:>8.3}ms {:>8.3}ms {:>8.3}ms",
                r.name, r.mean_ms, r.p95_ms, r.p99_ms
            );
        }

        println!();

        // Export to CSV if requested
        if let Some(output_file) = args.output {
            export_to_csv(&results, &output_file)?;
        }
    }

    Ok(())
}
