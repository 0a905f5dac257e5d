use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use rand::seq::SliceRandom;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fairgate::clock::{Clock, ManualClock};
use fairgate::config::{FairgateConfig, LoggingConfig};
use fairgate::limits::{BucketKey, LimitConfiguration, LimitRegistry};
use fairgate::protocol::{AcquireRequest, AdmissionController};
use fairgate::ratelimit::FairnessScheduler;
use fairgate::store::InMemoryStore;

/// Operator tooling for Fairgate admission control.
#[derive(Parser)]
#[command(name = "fairgate")]
#[command(version)]
#[command(about = "Inspect and exercise Fairgate limit configurations")]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Service configuration file (YAML or TOML)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a limits file and print its buckets.
    Check {
        /// Limits YAML file
        file: PathBuf,
    },
    /// Project the decision for one request against fresh bucket state.
    DryRun {
        /// Limits YAML file; defaults to `limits.path` from the service configuration
        #[arg(long)]
        limits: Option<PathBuf>,
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        class: String,
        #[arg(long, default_value_t = 1)]
        tokens: u32,
    },
    /// Drive synthetic per-class demand at a bucket and report admitted rates.
    Simulate {
        /// Limits YAML file; defaults to `limits.path` from the service configuration
        #[arg(long)]
        limits: Option<PathBuf>,
        #[arg(long)]
        bucket: String,
        /// Offered load per class as `class=requests_per_second`; repeatable
        #[arg(long = "demand", value_parser = parse_demand, required = true)]
        demand: Vec<(String, f64)>,
        /// Simulated duration in seconds
        #[arg(long, default_value_t = 60)]
        seconds: u64,
        /// Simulation step in milliseconds
        #[arg(long, default_value_t = 100)]
        tick_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = FairgateConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Fairgate");

    match cli.command {
        Command::Check { file } => check(&file),
        Command::DryRun {
            limits,
            bucket,
            class,
            tokens,
        } => dry_run(&config, limits.as_deref(), &bucket, &class, tokens).await,
        Command::Simulate {
            limits,
            bucket,
            demand,
            seconds,
            tick_ms,
        } => simulate(&config, limits.as_deref(), &bucket, &demand, seconds, tick_ms).await,
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn parse_demand(raw: &str) -> Result<(String, f64), String> {
    let (class, rate) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected class=rate, got {:?}", raw))?;
    let rate: f64 = rate
        .parse()
        .map_err(|e| format!("invalid rate for class {}: {}", class, e))?;
    if class.is_empty() || !rate.is_finite() || rate < 0.0 {
        return Err(format!("invalid demand {:?}", raw));
    }
    Ok((class.to_string(), rate))
}

fn load_limits(config: &FairgateConfig, path: Option<&Path>) -> anyhow::Result<LimitConfiguration> {
    let path = match (path, config.limits.path.as_deref()) {
        (Some(path), _) => path.to_path_buf(),
        (None, Some(path)) => PathBuf::from(path),
        (None, None) => bail!("no limits file given and limits.path is not configured"),
    };
    LimitConfiguration::from_file(&path).with_context(|| format!("Invalid limits file {}", path.display()))
}

fn check(file: &Path) -> anyhow::Result<()> {
    let limits =
        LimitConfiguration::from_file(file).with_context(|| format!("Invalid limits file {}", file.display()))?;

    println!("{} is valid", file.display());
    if let Some(global) = &limits.global {
        println!(
            "  global: capacity {} refill {}/s",
            global.capacity, global.refill_rate_per_second
        );
    }
    for (key, definition) in &limits.buckets {
        let classes: Vec<&str> = definition.classes.iter().map(|c| c.name.as_str()).collect();
        println!(
            "  {}: capacity {} refill {}/s classes [{}]",
            key,
            definition.capacity,
            definition.refill_rate_per_second,
            classes.join(", ")
        );
    }
    Ok(())
}

async fn dry_run(
    config: &FairgateConfig,
    limits: Option<&Path>,
    bucket: &str,
    class: &str,
    tokens: u32,
) -> anyhow::Result<()> {
    let limits = load_limits(config, limits)?;
    let registry = LimitRegistry::new(Arc::new(InMemoryStore::new()), config.store.scope.clone(), limits)
        .with_scheduler(FairnessScheduler::new(config.fairness.window_ms))
        .with_operation_timeout(config.store.operation_timeout());

    let outcome = registry.dry_run(&BucketKey::new(bucket), class, tokens).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn simulate(
    config: &FairgateConfig,
    limits: Option<&Path>,
    bucket: &str,
    demand: &[(String, f64)],
    seconds: u64,
    tick_ms: u64,
) -> anyhow::Result<()> {
    if tick_ms == 0 {
        bail!("tick_ms must be positive");
    }
    let limits = load_limits(config, limits)?;
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(0));
    let registry = LimitRegistry::new(store.clone(), config.store.scope.clone(), limits)
        .with_scheduler(FairnessScheduler::new(config.fairness.window_ms))
        .with_operation_timeout(config.store.operation_timeout())
        .with_clock(clock.clone());
    let controller = AdmissionController::new(Arc::new(registry))
        .with_throttle_half_life(config.fairness.throttle_half_life());

    let bucket_key = BucketKey::new(bucket);
    let mut credit: BTreeMap<&str, f64> = BTreeMap::new();
    let mut admitted: BTreeMap<&str, u64> = BTreeMap::new();
    let mut offered: BTreeMap<&str, u64> = BTreeMap::new();
    let mut rng = rand::thread_rng();
    let ticks = seconds * 1000 / tick_ms;

    info!(bucket = %bucket_key, seconds = seconds, tick_ms = tick_ms, "Starting simulation");

    for _ in 0..ticks {
        let mut batch = Vec::new();
        for (class, rate) in demand {
            let entry = credit.entry(class.as_str()).or_insert(0.0);
            *entry += rate * tick_ms as f64 / 1000.0;
            while *entry >= 1.0 {
                *entry -= 1.0;
                batch.push(class.as_str());
            }
        }
        batch.shuffle(&mut rng);

        for class in batch {
            *offered.entry(class).or_default() += 1;
            let outcome = controller.acquire(&AcquireRequest::new(bucket_key.clone(), class)).await;
            if outcome.is_granted() {
                *admitted.entry(class).or_default() += 1;
            }
        }

        clock.advance(Duration::from_millis(tick_ms));
        store.evict_idle(clock.now_millis(), config.store.idle_eviction());
    }

    let status = controller.status_snapshot(&bucket_key).await?;
    let elapsed = (ticks * tick_ms) as f64 / 1000.0;
    println!("bucket {} (capacity {}, refill {}/s)", bucket_key, status.capacity, status.refill_rate_per_second);
    for (class, _) in demand {
        let class = class.as_str();
        let offered = offered.get(class).copied().unwrap_or(0);
        let admitted = admitted.get(class).copied().unwrap_or(0);
        println!(
            "  {:<16} offered {:>8.2}/s  admitted {:>8.2}/s",
            class,
            offered as f64 / elapsed.max(f64::EPSILON),
            admitted as f64 / elapsed.max(f64::EPSILON)
        );
    }
    Ok(())
}
