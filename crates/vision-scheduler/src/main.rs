use axum::{routing::get, Router};
use clap::Parser;
use std::fs::File;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::{self, writer::BoxMakeWriter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vision_scheduler::config::{LogFormat, MonitoringConfig};
use vision_scheduler::{api, Scheduler, SchedulerConfig};

#[derive(Parser, Debug)]
#[command(name = "vs-scheduler")]
#[command(about = "Task scheduler for vision worker pods", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "scheduler.yaml")]
    config: String,

    /// API host
    #[arg(long)]
    host: Option<String>,

    /// API port
    #[arg(long)]
    port: Option<u16>,

    /// Prometheus metrics port
    #[arg(long)]
    metrics_port: Option<u16>,
}

/// Install the global subscriber; the returned guard flushes the log file on drop
fn init_tracing(monitoring: &MonitoringConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&monitoring.log_level));

    let (writer, guard) = match &monitoring.log_file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(File::create(path)?);
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stdout), None),
    };
    let ansi = guard.is_none();

    let (json, text) = match monitoring.log_format {
        LogFormat::Json => (Some(fmt::layer().json().with_writer(writer)), None),
        LogFormat::Text => (
            None,
            Some(
                fmt::layer()
                    .with_ansi(ansi)
                    .with_target(false)
                    .with_writer(writer),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json)
        .with(text)
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let config_found = std::path::Path::new(&args.config).exists();
    let mut config = if config_found {
        SchedulerConfig::from_file(&args.config)?
    } else {
        SchedulerConfig::default()
    };

    // Override with CLI args
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(metrics_port) = args.metrics_port {
        config.monitoring.prometheus_port = metrics_port;
    }

    let _log_guard = init_tracing(&config.monitoring)?;
    if !config_found {
        tracing::warn!("Config file {} not found, using defaults", args.config);
    }
    tracing::info!(
        "Starting scheduler on {}:{} with {:?} orchestrator",
        config.server.host,
        config.server.port,
        config.orchestrator.backend
    );

    let api_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let metrics_port = config.monitoring.prometheus_port;

    let scheduler = Arc::new(Scheduler::from_config(config)?);
    let workers = scheduler.bootstrap().await?;
    tracing::info!("{} startup workers ready", workers);

    // Start metrics server
    let metrics_scheduler = scheduler.clone();
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_scheduler, metrics_port).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    let app = api::create_router(scheduler.clone());
    let listener = tokio::net::TcpListener::bind(api_addr).await?;
    tracing::info!("REST API listening on {}", api_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C"),
            _ = scheduler.shutdown_requested() => tracing::info!("Restart requested"),
        }
    })
    .await?;

    tracing::info!("Scheduler stopped");
    Ok(())
}

async fn start_metrics_server(scheduler: Arc<Scheduler>, port: u16) -> anyhow::Result<()> {
    let app = Router::new().route(
        "/metrics",
        get(move || async move {
            match scheduler.render_metrics() {
                Ok(text) => text,
                Err(e) => format!("Error: {}", e),
            }
        }),
    );

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Metrics server listening on {}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
