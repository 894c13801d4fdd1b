use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flowacct::config::{CliArgs, Config};
use flowacct::ledger::{FlowSample, Ledger};
use flowacct::loader::{self, KernelMaps};
use flowacct::report::{render_report, FlowSource};
use flowacct::{api, storage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // One-shot report from maps pinned by a running agent.
    if let Some(ref dir) = cli.report_pinned {
        let maps = KernelMaps::from_pins(Path::new(dir))?;
        print!("{}", render_report(&maps.snapshot()?));
        return Ok(());
    }

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(Path::new(config_path))?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);
    config.validate()?;

    // Logging.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // ── eBPF setup ────────────────────────────────────────────────────
    let mut bpf = loader::load(&config)?;
    loader::init_ebpf_logger(&mut bpf);
    loader::attach(&mut bpf, Path::new(&config.cgroup_path))?;
    let maps = KernelMaps::take(&mut bpf, config.pin_dir.as_deref().map(Path::new))?;

    // ── Channels ──────────────────────────────────────────────────────
    let (tx, rx) = mpsc::channel::<Vec<FlowSample>>(64);

    // ── Ledger & Storage ──────────────────────────────────────────────
    let endpoints = config.endpoint_directory()?;
    if !endpoints.is_empty() {
        tracing::info!("{} named endpoints configured", endpoints.len());
    }
    let ledger = Arc::new(Ledger::new(config.idle_polls).with_endpoints(endpoints));
    let storage = Arc::new(storage::Storage::new(&config.db_path)?);

    // ── Storage Writer Task ───────────────────────────────────────────
    let storage_clone = storage.clone();
    tokio::spawn(async move {
        storage_clone.run_writer(rx).await;
    });

    // ── Flow Table Poller ─────────────────────────────────────────────
    let ledger_poll = ledger.clone();
    let poll_every = Duration::from_secs(config.poll_interval_seconds);
    let print_report = config.print_report;
    tokio::spawn(async move {
        poll_flow_tables(maps, ledger_poll, tx, poll_every, print_report).await;
    });

    // ── Data Retention Task ───────────────────────────────────────────
    if let Some(retention_seconds) = config.data_retention_seconds {
        let storage_retention = storage.clone();
        tokio::spawn(async move {
            let mut retention_interval = interval(Duration::from_secs(60));
            loop {
                retention_interval.tick().await;
                match storage_retention.delete_old_data(retention_seconds) {
                    Ok(deleted) if deleted > 0 => {
                        tracing::info!("Data retention: deleted {} old samples", deleted);
                    }
                    Err(e) => {
                        tracing::error!("Data retention cleanup failed: {}", e);
                    }
                    _ => {}
                }
            }
        });
    }

    // ── HTTP API ──────────────────────────────────────────────────────
    let app_state = Arc::new(api::AppState {
        ledger: ledger.clone(),
        storage: storage.clone(),
        start_time: std::time::Instant::now(),
    });

    let app = api::router(app_state, &config.allowed_ips);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!("Server running on http://0.0.0.0:{}", config.port);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Dropping `bpf` detaches the programs; pinned maps outlive us.
    drop(bpf);
    tracing::info!("Exiting...");
    Ok(())
}

/// Walk both flow tables every `every`, fold the snapshot into the ledger
/// and hand the per-flow deltas to the storage writer.
async fn poll_flow_tables(
    source: impl FlowSource,
    ledger: Arc<Ledger>,
    tx: mpsc::Sender<Vec<FlowSample>>,
    every: Duration,
    print_report: bool,
) {
    let mut ticker = interval(every);
    loop {
        ticker.tick().await;

        let snapshot = match source.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("failed to read flow tables: {:#}", e);
                continue;
            }
        };
        if print_report {
            print!("{}", render_report(&snapshot));
        }

        let samples = ledger.apply(&snapshot);
        tracing::debug!(
            "poll: {} flows in tables, {} changed",
            snapshot.len(),
            samples.len()
        );
        if !samples.is_empty() && tx.send(samples).await.is_err() {
            tracing::error!("storage writer stopped, ending poll loop");
            break;
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Ctrl-C received, shutting down");
}
