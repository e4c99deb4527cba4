//! Sentinel CA - Main entry point
//!
//! Runs the ACME validation engine and periodic tidy against the configured
//! storage, or performs one-shot config tests and tidy passes.
//!
//! The binary has no HTTP front end. `run` wires an [`AcmeService`] exactly
//! as an embedding server would and only reports its directory URL; request
//! routing and JWS verification live in the server that embeds the library.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};

use sentinel_ca::acme::{
    tidy, AcmeMetrics, AcmeService, AllowAllIdentifiers, Clock, ConfiguredChallengeSelector,
    LocalIssuer, NetworkValidator, NonceRegistry, Policies, ResourceStore, StoredEabPolicy,
    SystemClock, ValidationEngine,
};
use sentinel_ca::storage;
use sentinel_ca_config::Config;

/// Sentinel CA - ACME certificate authority engine
#[derive(Parser, Debug)]
#[command(name = "sentinel-ca")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "SENTINEL_CA_CONFIG", global = true)]
    config: Option<String>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file and exit
    Test,
    /// Run the validation engine and tidy (default)
    Run,
    /// Run one tidy pass and print the report
    Tidy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Test => test_config(cli.config.as_deref()),
        Commands::Run => runtime.block_on(run_server(cli.config.as_deref())),
        Commands::Tidy => runtime.block_on(run_tidy(cli.config.as_deref())),
    }
}

fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn load_config(config_path: Option<&str>) -> Result<Config> {
    let config = match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            Config::from_file(path).context("Failed to load configuration file")?
        }
        None => {
            info!("No configuration specified, using embedded default configuration");
            Config::default_embedded().context("Failed to load embedded configuration")?
        }
    };
    config.validated()
}

/// Test configuration file and exit
fn test_config(config_path: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;

    info!("Configuration test successful:");
    info!("  - base URL {}", config.server.base_url_trimmed());
    info!("  - {:?} storage at {}", config.storage.backend, config.storage.path.display());
    info!(
        "  - {} validation worker(s), {} max retries",
        config.validation.workers, config.validation.max_retries
    );
    info!(
        "  - challenge types: {}",
        config
            .validation
            .challenge_types
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    println!(
        "sentinel-ca: configuration file {} test is successful",
        config_path.unwrap_or("(embedded)")
    );
    Ok(())
}

/// Components shared by `run` and `tidy`
struct Components {
    config: Config,
    store: Arc<ResourceStore>,
    nonces: Arc<NonceRegistry>,
    metrics: Arc<AcmeMetrics>,
    clock: Arc<dyn Clock>,
}

impl Components {
    async fn open(config: Config) -> Result<Self> {
        let backend = storage::open(&config.storage)
            .await
            .context("Failed to open storage backend")?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        Ok(Self {
            store: Arc::new(ResourceStore::new(backend)),
            nonces: Arc::new(NonceRegistry::new(config.nonce.ttl(), Arc::clone(&clock))),
            metrics: Arc::new(AcmeMetrics::new()?),
            clock,
            config,
        })
    }
}

async fn run_tidy(config_path: Option<&str>) -> Result<()> {
    let rt = Components::open(load_config(config_path)?).await?;
    let report = tidy::run(
        &rt.store,
        &rt.nonces,
        &rt.config.tidy,
        &rt.clock,
        Some(rt.metrics.as_ref()),
    )
    .await
    .context("Tidy pass failed")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_server(config_path: Option<&str>) -> Result<()> {
    let rt = Components::open(load_config(config_path)?).await?;
    let config = &rt.config;

    let validator = Arc::new(NetworkValidator::new(&config.http01, &config.dns01));
    let engine = ValidationEngine::new(
        Arc::clone(&rt.store),
        validator,
        (&config.validation).into(),
        Arc::clone(&rt.clock),
    )
    .with_metrics(Arc::clone(&rt.metrics));
    let handle = engine.handle();

    let issuer = LocalIssuer::generate(
        "Sentinel CA Local Root",
        config.orders.certificate_lifetime(),
        Arc::clone(&rt.clock),
    )?;
    let policies = Policies {
        identifiers: Arc::new(AllowAllIdentifiers),
        challenges: Arc::new(ConfiguredChallengeSelector::new(
            config.validation.challenge_types.clone(),
        )),
        eab: Arc::new(StoredEabPolicy::new(
            config.accounts.eab_policy,
            Arc::clone(&rt.store),
        )),
        issuer: Arc::new(issuer),
    };
    // Same wiring an embedding router holds; here it only backs the startup log
    let service = Arc::new(AcmeService::new(
        config,
        Arc::clone(&rt.store),
        handle.clone(),
        Arc::clone(&rt.nonces),
        policies,
        Arc::clone(&rt.clock),
        Arc::clone(&rt.metrics),
    ));

    let queued = handle
        .reload_from_storage()
        .await
        .context("Failed to reload validation queue")?;
    let engine_task = tokio::spawn(engine.run());

    let tidy_task = config.tidy.enabled.then(|| {
        let store = Arc::clone(&rt.store);
        let nonces = Arc::clone(&rt.nonces);
        let metrics = Arc::clone(&rt.metrics);
        let clock = Arc::clone(&rt.clock);
        let tidy_config = config.tidy.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tidy_config.interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let result =
                    tidy::run(&store, &nonces, &tidy_config, &clock, Some(metrics.as_ref())).await;
                if let Err(e) = result {
                    warn!(error = %e, "Tidy pass failed");
                }
            }
        })
    });

    info!(
        directory = %service.urls().directory(),
        queued = queued,
        workers = config.validation.workers,
        tidy = config.tidy.enabled,
        "Sentinel CA started"
    );

    wait_for_shutdown().await;
    info!("Received shutdown signal, stopping validation engine");

    if let Some(task) = tidy_task {
        task.abort();
    }
    handle.shutdown();

    let grace = Duration::from_secs(config.server.graceful_shutdown_timeout_secs);
    match tokio::time::timeout(grace, engine_task).await {
        Ok(Ok(())) => info!("Validation engine stopped"),
        Ok(Err(e)) => error!(error = %e, "Validation engine task failed"),
        Err(_) => warn!(
            timeout_secs = grace.as_secs(),
            "Validation engine did not stop within the shutdown timeout"
        ),
    }

    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to register SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to wait for Ctrl-C");
    }
}
