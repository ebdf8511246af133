use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::{
    AdmissionController, AdmissionPass, ClientId, Clock, QuotaResult, RateLimitResult, SystemClock, Timestamp,
};

/// Drive a simulated concurrent workload through the admission controller.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Path to a YAML configuration file (defaults are used if omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of distinct simulated clients
    #[arg(long, default_value_t = 8)]
    clients: usize,

    /// Total number of simulated requests
    #[arg(long, default_value_t = 200)]
    requests: usize,

    /// Rate limit tokens spent per request
    #[arg(long, default_value_t = 1.0)]
    cost: f64,

    /// Quota units spent per request
    #[arg(long, default_value_t = 1)]
    units: u64,

    /// Spread request start times evenly over this many milliseconds
    #[arg(long, default_value_t = 0)]
    duration_ms: u64,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Print the final summary as JSON
    #[arg(long)]
    report_json: bool,
}

/// What happened to one simulated request.
#[derive(Debug, Clone, Copy)]
enum Outcome {
    Served,
    RateLimited,
    QuotaExceeded,
    Expired,
}

#[derive(Debug, Default, Serialize)]
struct Report {
    requests: usize,
    served: usize,
    rate_limited: usize,
    quota_exceeded: usize,
    expired: usize,
    interrupted: bool,
    tracked_clients: usize,
    evicted_at_exit: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!("Starting Tollgate admission simulation");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    anyhow::ensure!(args.clients > 0, "--clients must be at least 1");

    let config = match &args.config {
        Some(path) => TollgateConfig::from_file(path)?,
        None => TollgateConfig::default(),
    };
    info!(tiers = config.tiers.len(), "Configuration loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let controller = Arc::new(AdmissionController::from_config(&config, clock.clone())?);

    let evictor = spawn_evictor(controller.clone(), config.store.eviction_interval());

    let mut rng = rand::thread_rng();
    let tasks: Vec<_> = (0..args.requests)
        .map(|i| {
            let controller = controller.clone();
            let clock = clock.clone();
            let client = ClientId::new(format!("client-{}", rng.gen_range(0..args.clients)));
            let delay = start_offset(i, args.requests, args.duration_ms);
            let (cost, units) = (args.cost, args.units);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                handle_request(&controller, clock.as_ref(), &client, cost, units).await
            })
        })
        .collect();

    let mut report = Report {
        requests: args.requests,
        ..Default::default()
    };

    tokio::select! {
        results = join_all(tasks) => {
            for result in results {
                match result?? {
                    Outcome::Served => report.served += 1,
                    Outcome::RateLimited => report.rate_limited += 1,
                    Outcome::QuotaExceeded => report.quota_exceeded += 1,
                    Outcome::Expired => report.expired += 1,
                }
            }
        }
        _ = shutdown_signal() => {
            warn!("Simulation interrupted before all requests completed");
            report.interrupted = true;
        }
    }

    if let Some(evictor) = evictor {
        evictor.abort();
    }
    report.tracked_clients = controller.tracked_clients();
    report.evicted_at_exit = controller.evict_idle();

    if args.report_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        info!(
            requests = report.requests,
            served = report.served,
            rate_limited = report.rate_limited,
            quota_exceeded = report.quota_exceeded,
            expired = report.expired,
            tracked_clients = report.tracked_clients,
            "Simulation finished"
        );
    }

    info!("Tollgate admission simulation stopped");
    Ok(())
}

/// Initialize tracing, honouring `RUST_LOG` and defaulting to `info`.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Offset of request `index` when `count` requests are spread over `window_ms`.
fn start_offset(index: usize, count: usize, window_ms: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(window_ms * index as u64 / count as u64)
}

/// Run both admission checks for one request and serve it if admitted.
async fn handle_request(
    controller: &AdmissionController,
    clock: &dyn Clock,
    client: &ClientId,
    cost: f64,
    units: u64,
) -> tollgate::Result<Outcome> {
    let rate_limit = match controller.try_acquire(client, cost)? {
        RateLimitResult::Allowed { token } => token,
        RateLimitResult::Denied { retry_after, reason, .. } => {
            debug!(client = %client, retry_after = %retry_after, reason = %reason, "Request rate limited");
            return Ok(Outcome::RateLimited);
        }
    };

    let quota = match controller.try_consume_quota(client, units).await? {
        QuotaResult::Available { token } => token,
        QuotaResult::Exceeded { used, limit, reset_at } => {
            debug!(client = %client, used = used, limit = limit, reset_at = %reset_at, "Request over quota");
            return Ok(Outcome::QuotaExceeded);
        }
    };

    Ok(serve(AdmissionPass::new(rate_limit, quota)?, clock.now()))
}

/// The protected operation: it cannot be called without an admission pass,
/// and refuses a pass that has expired by the time it runs.
fn serve(pass: AdmissionPass, now: Timestamp) -> Outcome {
    if let Err(e) = pass.ensure_valid_at(now) {
        warn!(error = %e, "Refusing expired admission");
        return Outcome::Expired;
    }

    debug!(
        client = %pass.client_id(),
        rate_limit_token = %pass.rate_limit().id(),
        quota_token = %pass.quota().id(),
        quota_remaining = pass.quota().units_remaining(),
        "Serving request"
    );
    Outcome::Served
}

/// Periodically drop rate limit buckets that have refilled completely.
fn spawn_evictor(
    controller: Arc<AdmissionController>,
    every: Duration,
) -> Option<tokio::task::JoinHandle<()>> {
    if every.is_zero() {
        info!("Idle bucket eviction disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let evicted = controller.evict_idle();
            debug!(evicted = evicted, tracked = controller.tracked_clients(), "Evicted idle buckets");
        }
    }))
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
