mod wire;

use clap::Parser;
use lmtp_server::server::backend_fake::DemoBackend;
use lmtp_server::server::config::{CliArgs, ServerConfig};
use lmtp_server::server::scheduler::{ExecutionMode, SchedulerConfig, SchedulerRegistry};
use lmtp_server::server::session::TokenSession;
use lmtp_server::server::telemetry::{TelemetryProviders, init_telemetry};
use lmtp_server::server::transport_stdio::StdioTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    log_startup_info(&config);

    let registry = Arc::new(SchedulerRegistry::<DemoBackend>::new());
    let transport = Arc::new(StdioTransport::stdout());
    let session = Arc::new(TokenSession::new(
        transport,
        registry,
        lmtp_core::kwargs::Kwargs::new(),
        config.static_session,
        config.longrunning_session,
        ExecutionMode::Threaded,
        SchedulerConfig::from(&config),
        config.retention_min_loaded,
        Duration::from_millis(config.output_poll_ms),
    ));

    run_until_shutdown(session.clone(), providers).await;

    session.close();
    Ok(())
}

/// Reads newline-delimited JSON commands from stdin and dispatches each to
/// the session, until EOF or a shutdown signal arrives first.
async fn run_until_shutdown<B: lmtp_core::backend::ModelBackend>(
    session: Arc<TokenSession<B>>,
    providers: TelemetryProviders,
) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    tokio::select! {
        () = read_commands(&mut lines, &session) => {
            #[cfg(feature = "tracing")]
            tracing::info!("stdin closed, shutting down");
        }
        () = shutdown_signal() => {
            #[cfg(feature = "tracing")]
            tracing::info!("shutdown signal received, terminating gracefully...");
        }
    }

    #[cfg(feature = "tracing")]
    {
        if let Err(err) = providers.tracer_provider.force_flush() {
            eprintln!("Error flushing traces: {err:#?}");
        }
        if let Err(err) = providers.tracer_provider.shutdown() {
            eprintln!("Error shutting down tracer: {err:#?}");
        }
    }

    #[cfg(feature = "metrics")]
    {
        if let Err(err) = providers.meter_provider.force_flush() {
            eprintln!("Error flushing metrics: {err:#?}");
        }
        if let Err(err) = providers.meter_provider.shutdown() {
            eprintln!("Error shutting down meter: {err:#?}");
        }
    }

    #[cfg(not(any(feature = "tracing", feature = "metrics")))]
    let _ = providers;
}

async fn read_commands<B: lmtp_core::backend::ModelBackend>(
    lines: &mut tokio::io::Lines<BufReader<tokio::io::Stdin>>,
    session: &TokenSession<B>,
) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                session.handle(wire::parse_command(&line));
            }
            Ok(None) => break,
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_err, "error reading stdin, shutting down");
                break;
            }
        }
    }
}

fn log_startup_info(_config: &ServerConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!("Starting lmtp-server with full config: {:#?}", _config);
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting lmtp-server with max_batch_size={}",
            _config.max_batch_size
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }
}
