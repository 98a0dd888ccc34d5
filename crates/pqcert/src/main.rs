//! PQCert - Main entry point
//!
//! Locally trusted development certificates and certificate renewal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use pqcert::ca::LocalAuthority;
use pqcert::trust::detect_trust_store;
use pqcert::{
    Algorithm, CertificateFetcher, CertificateService, ChallengeManager, DomainIssuer,
    DomainValidator, FsStore, RecordStore, RenewalScheduler,
};
use pqcert_config::validate::{lint_config, validate_root_ca};
use pqcert_config::{Config, CONFIG_ENV};

/// PQCert - post-quantum ready certificates for domains and localhost
#[derive(Parser, Debug)]
#[command(name = "pqcert")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = CONFIG_ENV, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Obtain a domain-validated certificate from the issuance server
    Get {
        /// Domain to certify; this machine must serve it over HTTP
        domain: String,

        /// Key algorithm: rsa, ml-dsa or hybrid (server default when omitted)
        #[arg(short = 'a', long = "algorithm")]
        algorithm: Option<Algorithm>,

        /// Contact address sent with the request
        #[arg(short = 'e', long = "email")]
        email: Option<String>,

        /// Document root of the domain's web server
        #[arg(long = "webroot", value_name = "DIR")]
        webroot: Option<PathBuf>,

        /// Issuance server URL
        #[arg(long = "server", value_name = "URL")]
        server: Option<String>,
    },
    /// Issue a locally trusted certificate for localhost
    Localhost {
        /// Skip adding the root CA to the system trust store
        #[arg(long = "no-install")]
        no_install: bool,

        /// Additional hostname or IP to include (repeatable)
        #[arg(long = "host", value_name = "HOST")]
        hosts: Vec<String>,
    },
    /// Create the root CA if needed and add it to the system trust store
    Install,
    /// Remove the root CA from the system trust store and delete it
    Uninstall,
    /// Show the root CA, trust state and issued certificates
    Status,
    /// Re-issue certificates that are close to expiry
    Renew {
        /// Renew certificates expiring within this many days
        #[arg(long = "threshold-days")]
        threshold_days: Option<u32>,

        /// Keep checking periodically until interrupted
        #[arg(long = "watch", conflicts_with = "downloaded")]
        watch: bool,

        /// Re-run `get` for certificates downloaded from a server instead
        #[arg(long = "downloaded")]
        downloaded: bool,
    },
    /// Validate configuration and exit
    ConfigTest,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let mut config =
        Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Get {
            domain,
            algorithm,
            email,
            webroot,
            server,
        } => {
            if let Some(webroot) = webroot {
                config.client.webroot = webroot;
            }
            if let Some(server) = server {
                config.client.server_url = server;
            }
            get(&config, &domain, algorithm, email)
        }
        Commands::Localhost { no_install, hosts } => localhost(&config, no_install, hosts),
        Commands::Install => install(&config),
        Commands::Uninstall => uninstall(&config),
        Commands::Status => status(&config),
        Commands::Renew {
            threshold_days,
            downloaded: true,
            ..
        } => renew_downloaded(&config, threshold_days),
        Commands::Renew {
            threshold_days,
            watch,
            downloaded: false,
        } => renew(&config, threshold_days, watch),
        Commands::ConfigTest => config_test(&config, cli.config.as_deref()),
    }
}

/// Assemble the issuance service from configuration
fn build_service(config: &Config) -> Result<CertificateService> {
    config.validate().context("Configuration validation failed")?;

    let store = Arc::new(FsStore::new(&config.storage.data_dir).with_context(|| {
        format!(
            "Failed to open data directory {}",
            config.storage.data_dir.display()
        )
    })?);
    let validator = DomainValidator::with_prefix(&config.validator, &config.challenge.path_prefix)
        .context("Failed to build HTTP client for challenge validation")?;
    let local = Arc::new(LocalAuthority::new(config.local_ca.clone()));

    Ok(CertificateService::new(
        ChallengeManager::with_config(store.clone(), &config.challenge),
        validator,
        DomainIssuer::new(&config.issuance),
        RecordStore::new(store),
    )
    .with_local_authority(local)
    .with_default_algorithm(config.issuance.default_algorithm))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("Failed to start async runtime")
}

fn fetcher(config: &Config) -> Result<CertificateFetcher> {
    config.validate().context("Configuration validation failed")?;
    CertificateFetcher::new(&config.client).context("Failed to set up issuance client")
}

fn get(
    config: &Config,
    domain: &str,
    algorithm: Option<Algorithm>,
    email: Option<String>,
) -> Result<()> {
    let fetcher = fetcher(config)?;
    info!(
        domain = %domain,
        server = %config.client.server_url,
        webroot = %config.client.webroot.display(),
        "Requesting certificate"
    );

    let metadata = runtime()?
        .block_on(fetcher.fetch(domain, algorithm, email))
        .with_context(|| format!("Failed to obtain a certificate for {}", domain))?;

    let dir = metadata.cert_dir.display();
    println!("Certificate for {} ({})", metadata.domain, metadata.certificate_id);
    if let Some(expires_at) = metadata.expires_at {
        println!("  expires:    {}", expires_at.format("%Y-%m-%d"));
    }
    println!("  cert:       {}/cert.pem", dir);
    println!("  key:        {}/key.pem", dir);
    println!("  chain:      {}/chain.pem", dir);
    println!("  fullchain:  {}/fullchain.pem", dir);
    Ok(())
}

fn renew_downloaded(config: &Config, threshold_days: Option<u32>) -> Result<()> {
    let threshold = threshold_days.unwrap_or(config.renewal.threshold_days);
    let fetcher = fetcher(config)?;
    let due = fetcher
        .due_for_renewal(threshold)
        .with_context(|| format!("Failed to scan {}", fetcher.certs_dir().display()))?;
    if due.is_empty() {
        println!("No downloaded certificates expire within {} days", threshold);
        return Ok(());
    }

    let runtime = runtime()?;
    let mut failed = 0;
    for metadata in due {
        match runtime.block_on(fetcher.fetch(
            &metadata.domain,
            metadata.algorithm,
            metadata.email.clone(),
        )) {
            Ok(renewed) => println!(
                "renewed {} -> {}",
                metadata.domain, renewed.certificate_id
            ),
            Err(e) => {
                warn!(domain = %metadata.domain, error = %e, "Renewal failed");
                println!("failed  {}: {}", metadata.domain, e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} certificate(s) failed to renew", failed);
    }
    Ok(())
}

fn localhost(config: &Config, no_install: bool, hosts: Vec<String>) -> Result<()> {
    let service = build_service(config)?;
    let (leaf, record) = runtime()?
        .block_on(service.issue_local("localhost", hosts))
        .context("Failed to issue localhost certificate")?;

    println!("Certificate for {} (serial {})", leaf.name, leaf.bundle.serial);
    println!("  valid for:  {}", leaf.subject_alt_names.join(", "));
    println!("  expires:    {}", record.expires_at.format("%Y-%m-%d"));
    println!("  cert:       {}", leaf.paths.cert_pem.display());
    println!("  key:        {}", leaf.paths.key_pem.display());
    println!("  fullchain:  {}", leaf.paths.fullchain_pem.display());
    println!("  pkcs#12:    {}", leaf.paths.pfx.display());

    if no_install {
        info!("Skipping trust store installation");
        return Ok(());
    }
    install(config)
}

fn install(config: &Config) -> Result<()> {
    let local = LocalAuthority::new(config.local_ca.clone());
    let root = local.ensure_root_ca().context("Failed to create root CA")?;
    let store = detect_trust_store(&config.trust)?;

    if store
        .is_installed(&root.common_name)
        .context("Failed to query trust store")?
    {
        println!("Root CA '{}' is already trusted", root.common_name);
        return Ok(());
    }

    let result = store
        .install(&root)
        .with_context(|| format!("Failed to install root CA via {}", store.mechanism()))?;
    println!(
        "Root CA '{}' trusted on {}: {}",
        root.common_name, result.platform, result.detail
    );
    Ok(())
}

fn uninstall(config: &Config) -> Result<()> {
    let local = LocalAuthority::new(config.local_ca.clone());
    let store = detect_trust_store(&config.trust)?;

    let result = store
        .uninstall(&config.local_ca.common_name)
        .with_context(|| format!("Failed to remove root CA via {}", store.mechanism()))?;
    println!("Trust store: {}", result.detail);

    if local.remove_root_ca().context("Failed to delete root CA")? {
        println!(
            "Deleted root CA files from {}",
            config.local_ca.ca_dir().display()
        );
    }
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let local = LocalAuthority::new(config.local_ca.clone());
    match local.root_certificate().context("Failed to read root CA")? {
        Some(root) => {
            println!("Root CA:     {}", root.common_name);
            println!("  file:      {}", root.pem_path.display());
            println!("  expires:   {}", root.not_after.format("%Y-%m-%d"));
            println!("  sha256:    {}", root.fingerprint);
            match detect_trust_store(&config.trust)
                .and_then(|store| store.is_installed(&root.common_name))
            {
                Ok(true) => println!("  trusted:   yes"),
                Ok(false) => println!("  trusted:   no (run `pqcert install`)"),
                Err(e) => {
                    warn!(error = %e, "Could not query trust store");
                    println!("  trusted:   unknown");
                }
            }
        }
        None => println!("Root CA:     not created (run `pqcert localhost`)"),
    }

    let service = build_service(config)?;
    let records = service.records().list()?;
    if records.is_empty() {
        println!("\nNo certificates issued");
        return Ok(());
    }

    println!("\n{:<36}  {:<24}  {:<7}  {:>5}  STATUS", "ID", "DOMAIN", "ALG", "DAYS");
    for record in records {
        println!(
            "{:<36}  {:<24}  {:<7}  {:>5}  {}",
            record.id.as_str(),
            record.domain,
            record.algorithm.as_str(),
            record.days_remaining(),
            record.status()
        );
    }
    Ok(())
}

fn renew(config: &Config, threshold_days: Option<u32>, watch: bool) -> Result<()> {
    let threshold = threshold_days.unwrap_or(config.renewal.threshold_days);
    let service = Arc::new(build_service(config)?);
    let runtime = runtime()?;

    if watch {
        let scheduler = RenewalScheduler::new(service, threshold)
            .with_interval(Duration::from_secs(config.renewal.check_interval_secs));
        return runtime.block_on(async {
            tokio::select! {
                _ = scheduler.run() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    signal.context("Failed to listen for Ctrl-C")?;
                    info!("Renewal scheduler stopped");
                    Ok(())
                }
            }
        });
    }

    let report = runtime
        .block_on(service.renew_expiring(threshold))
        .context("Renewal check failed")?;
    for (old, new) in &report.renewed {
        println!("renewed {} -> {}", old, new);
    }
    for (id, reason) in &report.failed {
        println!("failed  {}: {}", id, reason);
    }
    if report.is_empty() {
        println!("No certificates expire within {} days", threshold);
    }

    if !report.failed.is_empty() {
        anyhow::bail!("{} certificate(s) failed to renew", report.failed.len());
    }
    Ok(())
}

/// Validate configuration and the on-disk root CA
fn config_test(config: &Config, path: Option<&std::path::Path>) -> Result<()> {
    config.validate().context("Configuration validation failed")?;

    for warning in lint_config(config).warnings {
        warn!("{}", warning.message);
    }

    let root = validate_root_ca(config);
    for warning in &root.warnings {
        warn!("{}", warning.message);
    }
    root.into_result().context("Root CA check failed")?;

    println!(
        "pqcert: configuration {} test is successful",
        path.map(|p| p.display().to_string())
            .unwrap_or_else(|| "(defaults)".to_string())
    );
    Ok(())
}
