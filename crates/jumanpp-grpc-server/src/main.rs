#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use jumanpp_grpc_core::proto::jumanpp_jumandic_server::JumanppJumandicServer;
use server::backend::{AnalysisEnv, charclass::CharClassEnv};
use server::config::{CliArgs, ModelConfig, ServerConfig};
use server::service::handler::AnalysisService;
use server::telemetry::{TelemetryProviders, init_telemetry};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{codec::CompressionEncoding, transport::Server};
use tonic_health::server::HealthReporter;
use tonic_web::GrpcWebLayer;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

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

    let tcp = TcpListener::bind(&config.server_addr).await?;
    let local_addr = tcp.local_addr()?;
    // Clients and test harnesses read the port from the first line of stdout.
    println!("{}", local_addr.port());
    log_startup_info(&local_addr.to_string(), &config);

    run_server(providers, TcpListenerStream::new(tcp), config).await
}

/// The reference backend, with the model file's scorers and fields where it
/// names any.
fn build_backend(model: &ModelConfig) -> Arc<dyn AnalysisEnv> {
    let builtin = CharClassEnv::default();
    let scorers = if model.scorers.is_empty() {
        builtin.scorer_def().clone()
    } else {
        model.scorers.clone()
    };
    let fields = if model.fields.is_empty() {
        builtin.field_names().to_vec()
    } else {
        model.fields.clone()
    };
    Arc::new(CharClassEnv::new(scorers, fields))
}

async fn run_server(
    providers: TelemetryProviders,
    incoming: TcpListenerStream,
    config: ServerConfig,
) -> anyhow::Result<()> {
    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<JumanppJumandicServer<AnalysisService>>()
        .await;

    let service = AnalysisService::new(&config, build_backend(&config.model))?;

    Server::builder()
        .accept_http1(true)
        .http2_adaptive_window(Some(true))
        .layer(
            ServiceBuilder::new()
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                )
                .layer(GrpcWebLayer::new()),
        )
        .add_service(health_service.clone())
        .add_service(build_analysis_service(service.clone()))
        .serve_with_incoming_shutdown(
            incoming,
            shutdown_signal(service, health_reporter, providers),
        )
        .await?;

    #[cfg(feature = "tracing")]
    tracing::info!("Service shut down successfully");
    Ok(())
}

fn log_startup_info(_addr: &str, _config: &ServerConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting analysis service on {} with full config: {:#?}",
            _addr,
            _config
        );
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting analysis service on {} with {} compute workers and {} analyzers",
            _addr,
            _config.num_workers,
            _config.cache_capacity
        );
    }
}

fn build_analysis_service(service: AnalysisService) -> JumanppJumandicServer<AnalysisService> {
    JumanppJumandicServer::new(service)
        .send_compressed(CompressionEncoding::Zstd)
        .send_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Deflate)
        .accept_compressed(CompressionEncoding::Zstd)
        .accept_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Deflate)
}

async fn shutdown_signal(
    service: AnalysisService,
    health_reporter: HealthReporter,
    providers: TelemetryProviders,
) {
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

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, terminating gracefully...");

    // 1. Publish the status
    health_reporter
        .set_not_serving::<JumanppJumandicServer<AnalysisService>>()
        .await;

    // 2. Drain calls and stop the workers
    if let Err(_e) = service.shutdown().await {
        #[cfg(feature = "tracing")]
        tracing::error!("Error during service shutdown: {:?}", _e);
    }

    #[cfg(feature = "tracing")]
    {
        if let Err(err) = providers.tracer_provider.force_flush() {
            eprintln!("Error flushing traces: {:#?}", err);
        }
        if let Err(err) = providers.tracer_provider.shutdown() {
            eprintln!("Error shutting down tracer: {:#?}", err);
        }
    }

    #[cfg(feature = "metrics")]
    {
        if let Err(err) = providers.meter_provider.force_flush() {
            eprintln!("Error flushing metrics: {:#?}", err);
        }
        if let Err(err) = providers.meter_provider.shutdown() {
            eprintln!("Error shutting down meter: {:#?}", err);
        }
    }
    #[cfg(not(any(feature = "tracing", feature = "metrics")))]
    let _ = providers;
}
