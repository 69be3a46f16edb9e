use clap::Parser;
use futures::Stream;
use partstream_tonic_core::proto::{FILE_DESCRIPTOR_SET, partition_stream_server::PartitionStreamServer};
use partstream_tonic_server::{
    CliArgs, PartitionService, ServerConfig, build_partition_service,
    server::telemetry::{TelemetryProviders, init_telemetry},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Server, server::Connected};
use tonic_health::server::HealthReporter;
use tonic_web::GrpcWebLayer;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

// mimalloc holds up better than the system allocator under many concurrent
// exchanges, musl builds in particular.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

type HostedService = PartitionStreamServer<PartitionService>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = ServerConfig::try_from(CliArgs::parse())?;
    let providers = init_telemetry()?;
    log_startup_info(&config);

    if !config.uds {
        let listener = TcpListener::bind(&config.server_addr).await?;
        return serve(TcpListenerStream::new(listener), config, providers).await;
    }

    #[cfg(unix)]
    {
        let path = config.server_addr.clone();
        let listener = tokio::net::UnixListener::bind(&path)?;
        let incoming = tokio_stream::wrappers::UnixListenerStream::new(listener);
        let result = serve(incoming, config, providers).await;
        // Not reached on panic, so a stale socket file may survive a crash.
        let _ = std::fs::remove_file(&path);
        result
    }
    #[cfg(not(unix))]
    {
        anyhow::bail!("--uds is only supported on unix platforms")
    }
}

/// Serves the partition host, health and reflection on `incoming` until a
/// shutdown signal arrives and the host has drained.
async fn serve<I, IO, IE>(
    incoming: I,
    config: ServerConfig,
    providers: TelemetryProviders,
) -> anyhow::Result<()>
where
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<tower::BoxError>,
{
    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter.set_serving::<HostedService>().await;

    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let service = PartitionService::new(config);
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let shutdown = {
        let service = service.clone();
        async move {
            wait_for_signal().await;
            drain(&service, &health_reporter).await;
            providers.shutdown();
        }
    };

    Server::builder()
        .accept_http1(true)
        .http2_adaptive_window(Some(true))
        .layer(ServiceBuilder::new().layer(cors).layer(GrpcWebLayer::new()))
        .add_service(health_service)
        .add_service(reflection)
        .add_service(build_partition_service(service))
        .serve_with_incoming_shutdown(incoming, shutdown)
        .await?;

    #[cfg(feature = "tracing")]
    tracing::info!("Partition host stopped");
    Ok(())
}

fn log_startup_info(_config: &ServerConfig) {
    #[cfg(feature = "tracing")]
    {
        let transport = if _config.uds { "unix socket" } else { "tcp" };
        if cfg!(debug_assertions) {
            tracing::info!("Partition host on {transport} {}: {:#?}", _config.server_addr, _config);
        } else {
            tracing::info!(
                "Partition host on {transport} {} with {} workers",
                _config.server_addr,
                _config.num_workers
            );
        }
    }
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn wait_for_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM");
        },
    }
}

/// Stops advertising the service, then lets in-flight exchanges finish.
async fn drain(service: &PartitionService, health_reporter: &HealthReporter) {
    #[cfg(feature = "tracing")]
    tracing::info!("Draining {} exchanges", service.inflight());

    health_reporter.set_not_serving::<HostedService>().await;
    if let Err(_e) = service.shutdown().await {
        #[cfg(feature = "tracing")]
        tracing::error!("Partition host did not drain cleanly: {_e}");
    }
}
