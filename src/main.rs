use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rategate::config::{LogFormat, LoggingConfig, RateGateConfig};
use rategate::ratelimit::{
    Algorithm, DecisionDispatcher, Policy, RateLimitResult, SlidingWindowLogLimiter,
    TokenBucketLimiter,
};
use rategate::store::{MemoryDirectory, MemoryUsageLog};
use rategate::time::{ManualTimeSource, SystemTimeSource, TimeSource};

const DEMO_KEY: &str = "demo-key";
const DEMO_ENDPOINT: &str = "/api/demo";

#[derive(Parser, Debug)]
#[command(author, version, about = "RateGate admission control")]
struct Cli {
    /// Path to configuration YAML file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one or more decisions for an API key and endpoint
    Check {
        #[arg(long)]
        key: String,

        #[arg(long)]
        endpoint: String,

        /// Request cost, defaults to 1
        #[arg(long, allow_negative_numbers = true)]
        cost: Option<i64>,

        #[arg(long, default_value_t = 1)]
        repeat: u32,

        /// Pause between repeated decisions
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },

    /// Walk a 10 requests / 10 s token bucket through a burst and a recovery
    Demo {
        /// Sleep on the wall clock instead of advancing a simulated one
        #[arg(long)]
        realtime: bool,
    },
}

/// Dispatcher plus the background tasks that keep its state bounded.
struct Engine {
    dispatcher: DecisionDispatcher,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    fn start(
        config: &RateGateConfig,
        clock: Arc<dyn TimeSource>,
        directory: Arc<MemoryDirectory>,
    ) -> Self {
        let limits = &config.rate_limiting;
        let shutdown = CancellationToken::new();
        let usage_log = Arc::new(MemoryUsageLog::new());

        let token_bucket = Arc::new(TokenBucketLimiter::new(clock.clone()));
        let sliding_window = Arc::new(SlidingWindowLogLimiter::new(
            directory.clone(),
            usage_log.clone(),
            clock.clone(),
            limits.sliding_window_consistency,
        ));
        info!(
            consistency = ?sliding_window.consistency(),
            "Rate limiters initialized"
        );

        let retention = seconds(limits.usage_log_retention_secs);
        if let Some(window) = directory.longest_sliding_window() {
            if window > retention {
                info!(
                    window_secs = window.num_seconds(),
                    retention_secs = retention.num_seconds(),
                    "Usage log retention is shorter than a sliding window; entries are kept for the window instead"
                );
            }
        }

        let tasks = vec![
            token_bucket.clone().spawn_sweeper(
                Duration::from_secs(limits.bucket_sweep_interval_secs),
                seconds(limits.bucket_idle_ttl_secs),
                shutdown.clone(),
            ),
            usage_log.spawn_pruner(
                clock,
                directory.clone(),
                Duration::from_secs(limits.usage_log_prune_interval_secs),
                retention,
                shutdown.clone(),
            ),
        ];

        let dispatcher =
            DecisionDispatcher::new(directory.clone(), directory, token_bucket, sliding_window);

        Self {
            dispatcher,
            shutdown,
            tasks,
        }
    }

    async fn decide(&self, key: &str, endpoint: &str, cost: Option<i64>) -> RateLimitResult {
        self.dispatcher
            .decide(key, endpoint, cost, &self.shutdown)
            .await
    }

    async fn stop(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                error!(%err, "Background task failed");
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = RateGateConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    info!("Starting RateGate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Check {
            key,
            endpoint,
            cost,
            repeat,
            interval_ms,
        } => run_check(&config, &key, &endpoint, cost, repeat, interval_ms).await?,
        Command::Demo { realtime } => run_demo(&config, realtime).await?,
    }

    info!("RateGate stopped");
    Ok(())
}

async fn run_check(
    config: &RateGateConfig,
    key: &str,
    endpoint: &str,
    cost: Option<i64>,
    repeat: u32,
    interval_ms: u64,
) -> anyhow::Result<()> {
    let directory = match &config.directory_path {
        Some(path) => MemoryDirectory::from_file(path)?,
        None => {
            warn!("No directory_path configured; every key will be rejected");
            MemoryDirectory::new()
        }
    };

    let engine = Engine::start(config, Arc::new(SystemTimeSource), Arc::new(directory));
    let watcher = watch_for_shutdown(engine.shutdown.clone());

    for i in 0..repeat {
        if i > 0 && interval_ms > 0 {
            tokio::select! {
                _ = engine.shutdown.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {}
            }
        }
        if engine.shutdown.is_cancelled() {
            break;
        }

        let result = engine.decide(key, endpoint, cost).await;
        println!("{}", serde_json::to_string(&result)?);
    }

    watcher.abort();
    engine.stop().await;
    Ok(())
}

async fn run_demo(config: &RateGateConfig, realtime: bool) -> anyhow::Result<()> {
    let directory = MemoryDirectory::new();
    directory.add_key(1, 1, DEMO_KEY, true);
    directory.add_policy(
        1,
        Policy {
            id: 1,
            owner_id: 1,
            name: "demo".to_string(),
            endpoint_pattern: DEMO_ENDPOINT.to_string(),
            algorithm: Algorithm::TokenBucket,
            limit: 10,
            window_in_seconds: 10,
            burst_limit: None,
        },
    );

    let simulated = (!realtime).then(|| Arc::new(ManualTimeSource::default()));
    let clock: Arc<dyn TimeSource> = match &simulated {
        Some(manual) => manual.clone(),
        None => Arc::new(SystemTimeSource),
    };

    let engine = Engine::start(config, clock, Arc::new(directory));
    let watcher = watch_for_shutdown(engine.shutdown.clone());

    let pause = |ms: u64| {
        let simulated = simulated.clone();
        async move {
            match simulated {
                Some(manual) => manual.advance_ms(ms as i64),
                None => tokio::time::sleep(Duration::from_millis(ms)).await,
            }
        }
    };

    info!(realtime, "Sending 15 requests 200ms apart");
    for i in 1..=15 {
        if i > 1 {
            pause(200).await;
        }
        let result = engine.decide(DEMO_KEY, DEMO_ENDPOINT, None).await;
        println!("{:>2} {}", i, serde_json::to_string(&result)?);
    }

    info!("Waiting 11s for the bucket to refill");
    pause(11_000).await;

    for i in 16..=20 {
        let result = engine.decide(DEMO_KEY, DEMO_ENDPOINT, None).await;
        println!("{:>2} {}", i, serde_json::to_string(&result)?);
        pause(200).await;
    }

    watcher.abort();
    engine.stop().await;
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match logging.format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// Cancel `token` once a shutdown signal arrives.
fn watch_for_shutdown(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    })
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(%err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(%err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
