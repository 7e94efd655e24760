//! gpulet daemon
//!
//! Main daemon process that schedules GPU scripts on the local host.

use clap::Parser;
use gpulet_api::create_router;
use gpulet_core::{DaemonConfig, GpuProbe, NvmlProbe, ProbeKind, StaticProbe, TaskEvent};
use gpulet_exec::ProcessSupervisor;
use gpulet_scheduler::Scheduler;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// gpulet daemon - single-node GPU scheduler for shell and Python scripts
#[derive(Parser, Debug)]
#[command(name = "gpuletd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Use a virtual inventory of this many GPUs instead of NVML
    #[arg(long)]
    static_gpus: Option<u32>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_file(path).expect("Failed to load config"),
        None => DaemonConfig::default(),
    };
    if let Some(address) = args.address {
        config.api.rest_address = address;
    }
    if let Some(port) = args.port {
        config.api.rest_port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(count) = args.static_gpus {
        config.gpu.probe = ProbeKind::Static;
        config.gpu.static_count = count;
    }

    // Initialize logging
    let log_level = match config.logging.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false);
    if config.logging.format == "json" {
        tracing::subscriber::set_global_default(builder.json().finish())
            .expect("Failed to set subscriber");
    } else {
        tracing::subscriber::set_global_default(builder.finish())
            .expect("Failed to set subscriber");
    }

    info!("Starting gpulet daemon v{}", env!("CARGO_PKG_VERSION"));

    // Pick the GPU probe
    let probe: Arc<dyn GpuProbe> = match config.gpu.probe {
        ProbeKind::Static => Arc::new(StaticProbe::new(config.gpu.static_count)),
        ProbeKind::Nvml => match NvmlProbe::new(&config.gpu) {
            Ok(probe) => Arc::new(probe),
            Err(e) => {
                warn!(error = %e, "NVML unavailable, falling back to an empty inventory");
                Arc::new(StaticProbe::new(0))
            }
        },
    };

    // Wire the event channel, supervisor and scheduler
    let (events, _) = broadcast::channel::<TaskEvent>(256);
    let supervisor = Arc::new(ProcessSupervisor::new(config.exec.clone(), events.clone()));
    let scheduler = Arc::new(Scheduler::new(
        config.scheduler.clone(),
        probe,
        supervisor,
        events.clone(),
    ));
    scheduler.start();

    // Mirror lifecycle events into the log as JSON lines
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => info!(target: "gpulet::events", "{line}"),
                    Err(e) => warn!(error = %e, "Failed to encode event"),
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Event log fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Create API router
    let router = create_router(scheduler.clone());

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", config.api.rest_address, config.api.rest_port)
        .parse()
        .expect("Invalid address");

    info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    scheduler.shutdown().await;
    info!("Daemon stopped");
}

/// Resolves when the process receives SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for ctrl-c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
}
