use std::{net::SocketAddr, path::Path, sync::Arc};

use clap::Parser;
use jemallocator::Jemalloc;
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusBuilder;
use rand::{SeedableRng, rngs::StdRng};
use sluice::{
    config::{self, Config, Telemetry, parse_duration_ns},
    control::Control,
    control_plane::ControlPlane,
    dispatcher::Dispatcher,
    forward::HttpSink,
    freshness::FreshnessMeter,
    ingest::Ingest,
    queue::QueueManager,
};
use tokio::{
    runtime::Builder,
    signal,
    time::{self, Duration},
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error("Failed to load sluice config: {0}")]
    Config(#[from] config::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Control state error: {0}")]
    Control(#[from] sluice::control::Error),
    #[error("Sluice control plane returned an error: {0}")]
    ControlPlane(#[from] sluice::control_plane::Error),
    #[error("Sluice ingest returned an error: {0}")]
    Ingest(#[from] sluice::ingest::Error),
    #[error("Downstream sink error: {0}")]
    Forward(#[from] sluice::forward::Error),
}

fn default_config_path() -> String {
    "/etc/sluice/sluice.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    /// Path to the sluice config file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// Override the control plane port from the config
    #[clap(long)]
    port: Option<u16>,
    /// Expose prometheus metrics on this address, overriding the config
    #[clap(long)]
    prometheus_addr: Option<SocketAddr>,
}

async fn run(config: Config) -> Result<(), Error> {
    // Set up the telemetry sub-system, a passive prometheus export.
    if let Some(Telemetry::Prometheus { addr }) = config.telemetry {
        let builder = PrometheusBuilder::new().with_http_listener(addr);
        tokio::spawn(async move {
            builder
                .install()
                .expect("failed to install prometheus recorder");
        });
    }

    let (shutdown_watcher, shutdown_broadcaster) = sluice_signal::signal();

    // Shared control state, seeded from configuration before any component
    // can observe it.
    let control = Arc::new(Control::default());
    for (tenant, duration) in &config.initial_slos {
        let threshold_ns = parse_duration_ns(duration)?;
        control.set_slo(tenant, threshold_ns, "ns")?;
        info!(%tenant, duration = %duration, "applied initial slo");
    }
    if !config.initial_weights.is_empty() {
        control.replace_weights(config.initial_weights.clone())?;
        info!(
            num_sources = control.num_sources(),
            "applied initial weights"
        );
    }

    let queues = Arc::new(QueueManager::new(
        config.source_attribute.clone(),
        config.max_total_capacity,
        Arc::clone(&control),
    ));
    let meter = Arc::new(FreshnessMeter::new(
        Arc::clone(&control),
        config.source_attribute.clone(),
    ));

    // Set up the application servers and periodic tasks:
    //
    // * the "ingest" listener which producers push batches into
    // * the "control plane" which operators adjust weights and SLOs through
    // * the "dispatcher" which paces batches to the downstream
    // * the reconcile pass which realigns queues with the weight table

    let sink = HttpSink::new(&config.downstream_uri)?;
    let dispatcher = Dispatcher::new(
        Arc::clone(&queues),
        Arc::clone(&control),
        sink,
        Duration::from_millis(config.poll_interval_ms),
        StdRng::from_os_rng(),
        shutdown_watcher.clone(),
    );

    let control_plane = ControlPlane::new(
        SocketAddr::from(([0, 0, 0, 0], config.port)),
        config.concurrent_requests_max,
        Arc::clone(&control),
        shutdown_watcher.clone(),
    );
    let ingest = Ingest::new(
        config.ingest_addr,
        config.concurrent_requests_max,
        Arc::clone(&queues),
        Arc::clone(&meter),
        shutdown_watcher.clone(),
    );

    let mut srv_joinset = tokio::task::JoinSet::new();
    srv_joinset.spawn(async move { control_plane.run().await.map_err(Error::from) });
    srv_joinset.spawn(async move { ingest.run().await.map_err(Error::from) });

    let mut task_joinset = tokio::task::JoinSet::new();
    task_joinset.spawn(Arc::clone(&queues).spin(shutdown_watcher.clone()));
    task_joinset.spawn(dispatcher.spin());

    // Drop the original watcher: only the clones held by running components
    // may keep signal_and_wait below from returning.
    drop(shutdown_watcher);

    let mut interval = time::interval(Duration::from_millis(400));
    let res = loop {
        tokio::select! {
            _ = interval.tick() => {
                gauge!("sluice.running").set(1.0);
            },

            _ = signal::ctrl_c() => {
                info!("received ctrl-c");
                break Ok(());
            },
            Some(res) = srv_joinset.join_next() => {
                match res {
                    Ok(Ok(())) => { /* Server shut down successfully */ }
                    Ok(Err(err)) => {
                        error!("Server shut down unexpectedly: {err}");
                        break Err(err);
                    }
                    Err(err) => error!("Could not join the spawned server task: {err}"),
                }
            },
        }
    };

    shutdown_broadcaster.signal_and_wait().await;
    while task_joinset.join_next().await.is_some() {}
    res
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting sluice {version} run.");

    let cli = Cli::parse();
    let mut config = Config::load(Path::new(&cli.config_path))?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(addr) = cli.prometheus_addr {
        config.telemetry = Some(Telemetry::Prometheus { addr });
    }

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    runtime.block_on(run(config))
}
