use clap::Parser;
use grpc_transparent_proxy::config::Args;
use grpc_transparent_proxy::{GrpcProxy, ProxyConfig};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command-line arguments first
    let args = Args::parse();

    // Load configuration from file and apply CLI overrides
    let config = match ProxyConfig::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            eprintln!("Use --help for usage information");
            process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config.logging.level) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    display_startup_info(&config);

    let proxy = match GrpcProxy::new(config) {
        Ok(proxy) => Arc::new(proxy),
        Err(e) => {
            error!("Failed to create proxy: {}", e);
            process::exit(1);
        }
    };

    {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received, initiating graceful shutdown");
            proxy.stop().await;
        });
    }

    if let Err(e) = proxy.start().await {
        error!("Server error: {}", e);
        process::exit(1);
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let mut filter_str = format!("grpc_transparent_proxy={}", level);
    filter_str.push_str(",hyper=warn,h2=warn,rustls=warn,tokio=warn");

    // Allow environment override
    if let Ok(env_filter) = std::env::var("RUST_LOG") {
        filter_str = env_filter;
    }

    let filter = EnvFilter::try_new(&filter_str)
        .map_err(|e| format!("Invalid log filter '{}': {}", filter_str, e))?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    info!("Logging initialized with filter: {}", filter_str);

    Ok(())
}

/// Wait for shutdown signals (SIGINT, SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}

/// Display startup information for the proxy server
fn display_startup_info(config: &ProxyConfig) {
    info!("=== gRPC Transparent Proxy Startup Information ===");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Listen Address: {}", config.listen_addr);
    info!("Target Address: {}", config.target_addr);

    if config.enable_tls {
        info!("TLS Certificate: {}", config.cert_file.display());
        info!("TLS Key: {}", config.key_file.display());
        info!("Mode: Encrypted (TLS, certificate also trusted for the target)");
    } else {
        info!("Mode: Unencrypted (h2c)");
    }

    info!("Call logging: {}", if config.enable_logging { "enabled" } else { "disabled" });
    info!("Health service: {}", if config.enable_health_service { "local" } else { "proxied" });
    info!("Max concurrent streams: {}", config.max_concurrent_streams);
    info!("Connection timeout: {:?}", config.connection_timeout);
    info!("Log Level: {}", config.logging.level);
    info!("=== End Startup Information ===");
}
