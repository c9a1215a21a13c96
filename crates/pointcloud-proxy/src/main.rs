use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pointcloud_proxy::{app::Application, config::Config, web::WebServer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "pointcloud-proxy")]
#[command(version)]
#[command(about = "On-demand point-cloud tile fetching, conversion and caching")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path (default: $CONFIG_FILE or config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// State store URL (overrides config file)
    #[arg(short = 'd', long, value_name = "URL")]
    database_url: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = if cli.log_level == "trace" {
        format!("pointcloud_proxy={},tower_http=trace", cli.log_level)
    } else {
        format!("pointcloud_proxy={}", cli.log_level)
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| log_filter.into());
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    info!("Starting point-cloud proxy v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => {
            let config = Config::load_from_file(path)?;
            info!("Configuration loaded from: {}", path);
            config
        }
        None => Config::load()?,
    };

    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    if let Some(database_url) = cli.database_url {
        config.database.url = database_url;
    }
    info!("Using state store: {}", config.database.url);

    let application = Application::build(config).await?;
    let cancellation_token = CancellationToken::new();

    let web_server = WebServer::new(application.app_state())?;
    info!("Starting web server on {}", web_server.addr());

    let (server_ready_tx, server_ready_rx) = tokio::sync::oneshot::channel();
    let server_token = cancellation_token.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = web_server
            .serve_with_cancellation(server_ready_tx, server_token)
            .await
        {
            tracing::error!("Web server failed: {}", e);
        }
    });

    match server_ready_rx.await {
        Ok(Ok(())) => {
            info!("Web server is now listening, starting background services...");
        }
        Ok(Err(bind_error)) => {
            tracing::error!("Failed to bind web server: {}", bind_error);
            return Err(bind_error);
        }
        Err(_) => {
            tracing::error!("Web server task completed without signaling");
            return Err(anyhow::anyhow!("Web server failed to start"));
        }
    }

    let background = application.spawn_background(&cancellation_token);
    info!("All services started successfully");

    wait_for_shutdown_signal().await?;
    cancellation_token.cancel();

    server_handle.await?;
    for handle in background {
        handle.await?;
    }
    info!("Point-cloud proxy stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
            _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), shutting down gracefully"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down gracefully");
    }

    Ok(())
}
