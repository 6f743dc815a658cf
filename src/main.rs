//! Datalyst daemon
//!
//! Loads configuration from the environment, assembles the analytics
//! runtime, starts the maintenance workers, and serves the HTTP façade
//! until interrupted.
//!
//! Exit codes: 0 clean shutdown, 1 fatal config error, 2 provider
//! initialization failure, 3 backing-store connection failure.

use clap::Parser;
use std::process::ExitCode;

use datalyst_runtime::types::RuntimeError;
use datalyst_runtime::{api, AnalyticsRuntime, Config};

#[derive(Parser, Debug)]
#[command(name = "datalyst", version, about = "Conversational data-analytics runtime")]
struct Args {
    /// Override the listen address (host:port).
    #[arg(long)]
    listen: Option<String>,

    /// Validate configuration and exit.
    #[arg(long)]
    check_config: bool,
}

const EXIT_CONFIG: u8 = 1;
const EXIT_PROVIDER: u8 = 2;
const EXIT_STORE: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "fatal configuration error");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if args.check_config {
        tracing::info!("configuration is valid");
        return ExitCode::SUCCESS;
    }

    let runtime = match AnalyticsRuntime::new(config).await {
        Ok(runtime) => runtime,
        Err(RuntimeError::Llm(e)) => {
            tracing::error!(error = %e, "LLM provider initialization failed");
            return ExitCode::from(EXIT_PROVIDER);
        }
        Err(RuntimeError::Storage(e)) => {
            tracing::error!(error = %e, "backing-store connection failed");
            return ExitCode::from(EXIT_STORE);
        }
        Err(e) => {
            tracing::error!(error = %e, "runtime initialization failed");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    runtime.start_maintenance();

    let listen = args.listen.unwrap_or_else(|| {
        format!(
            "{}:{}",
            runtime.config().api.host,
            runtime.config().api.port
        )
    });
    let listener = match tokio::net::TcpListener::bind(&listen).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, listen, "failed to bind listen address");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    tracing::info!(%listen, "datalyst listening");

    let app = api::router(runtime.clone());
    let shutdown_runtime = runtime.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("interrupt received, shutting down");
            shutdown_runtime.shutdown();
        })
        .await;

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server error");
            ExitCode::FAILURE
        }
    }
}
