use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};

use mediarelay::api::{self, ApiState};
use mediarelay::core::config::AppConfig;
use mediarelay::core::shutdown::{ShutdownCoordinator, DRAIN_TIMEOUT};
use mediarelay::observability::metrics as obs_metrics;
use mediarelay::path::PathManager;
use mediarelay::rtmp::RtmpServer;

#[tokio::main]
async fn main() -> ExitCode {
    // Load configuration (layered: default.toml → {env}.toml → env vars)
    let config = match AppConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    // Install the Prometheus recorder before any metrics are recorded.
    let metrics_handle = if config.observability.metrics_enabled {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %e, "failed to install metrics recorder");
                None
            }
        }
    } else {
        None
    };
    obs_metrics::describe_all_metrics();

    // Log panics before unwinding tears the task down.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        eprintln!("PANIC: {panic_info}\nBacktrace:\n{backtrace}");
        default_hook(panic_info);
    }));

    info!(version = env!("CARGO_PKG_VERSION"), "mediarelay starting");

    let shutdown = ShutdownCoordinator::new();
    let path_manager = Arc::new(PathManager::new(config.paths.clone()));

    // RTMP server
    let server = RtmpServer::new(&config, path_manager.clone(), shutdown.token());
    {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "RTMP server failed");
            }
        });
    }

    // Introspection API
    let api_addr: SocketAddr =
        match format!("{}:{}", config.server.host, config.server.api_port).parse() {
            Ok(addr) => addr,
            Err(e) => {
                error!(error = %e, "invalid API bind address");
                return ExitCode::FAILURE;
            }
        };
    let app = api::build_router(ApiState {
        server: server.clone(),
        path_manager: path_manager.clone(),
        metrics_handle,
    });
    let api_listener = match tokio::net::TcpListener::bind(api_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%api_addr, error = %e, "failed to bind API listener");
            return ExitCode::FAILURE;
        }
    };
    info!(%api_addr, rtmp_port = config.server.rtmp_port, "servers listening");
    {
        let token = shutdown.token();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(api_listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
            {
                error!(error = %e, "API server failed");
            }
        });
    }

    // Wait for SIGINT/SIGTERM, then drain connections
    shutdown.wait_for_signal().await;

    if shutdown
        .drain_until(|| server.conn_snapshots().is_empty())
        .await
    {
        info!("graceful shutdown completed");
        ExitCode::SUCCESS
    } else {
        error!("connections failed to drain within {DRAIN_TIMEOUT:?}, forcing exit");
        ExitCode::FAILURE
    }
}

fn init_tracing(log_level: &str, log_format: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    match log_format {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
