//! AuthGate proxy binary.
//!
//! Loads the bootstrap file, builds the configured filter and route table,
//! and serves downstream HTTP/1 and HTTP/2 connections until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use authgate::admin;
use authgate::config::file::BootstrapFile;
use authgate::error::ProxyError;
use authgate::filter::StreamInfo;
use authgate::logging_layer::{LogFormat, init_tracing};
use authgate::proxy_service::{HttpUpstream, ProxyService, error_response};
use authgate::registry::{FactoryContext, FilterRegistry};
use authgate::route::RouteTable;
use clap::Parser;
use hyper::Request;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "authgate", version, about = "HTTP proxy with external authorization")]
struct Cli {
    /// Bootstrap file (YAML)
    #[arg(long, env = "AUTHGATE_CONFIG")]
    config: PathBuf,

    /// Log output format
    #[arg(long, env = "AUTHGATE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    // Both rustls users (hyper-rustls, reqwest) share the ring provider.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }

    let bootstrap = BootstrapFile::load(&cli.config).inspect_err(|e| {
        error!(error = %e, path = %cli.config.display(), "failed to load bootstrap");
    })?;

    let metrics = prometheus::Registry::new();
    let filters = FilterRegistry::with_builtin();
    let factory = filters.create(
        &bootstrap.filter.name,
        &bootstrap.filter.typed_config,
        &FactoryContext { registry: &metrics },
    )?;
    let routes = Arc::new(RouteTable::from_file(&bootstrap.virtual_hosts, &filters)?);
    let upstream = Arc::new(HttpUpstream::new(
        bootstrap.upstream.base_url()?,
        bootstrap.upstream.timeout()?,
    )?);
    let service = Arc::new(
        ProxyService::new(routes, factory, upstream)
            .with_max_body_bytes(bootstrap.upstream.max_request_body_bytes()?),
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown requested");
            shutdown.cancel();
        });
    }

    if let Some(admin_listener) = &bootstrap.admin {
        let addr = admin_listener.address;
        let shutdown = shutdown.clone();
        let registry = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = admin::serve(addr, registry, shutdown).await {
                error!(error = %e, %addr, "admin listener failed");
            }
        });
    }

    let listener = TcpListener::bind(bootstrap.listener.address)
        .await
        .inspect_err(|e| error!(error = %e, addr = %bootstrap.listener.address, "failed to bind"))?;
    info!(
        addr = %bootstrap.listener.address,
        filter = %bootstrap.filter.name,
        upstream = %bootstrap.upstream.url,
        "authgate listening"
    );

    loop {
        let (stream, peer) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            },
        };

        let service = service.clone();
        tokio::spawn(async move {
            let handler = service_fn(move |request: Request<Incoming>| {
                let service = service.clone();
                async move {
                    let mut info = StreamInfo::default();
                    info.downstream_address = Some(peer);
                    match service.handle(request, info).await {
                        Ok(response) => Ok(response),
                        // Surfacing the error makes hyper abort the stream.
                        Err(ProxyError::Reset) => Err(ProxyError::Reset),
                        Err(e) => Ok::<_, ProxyError>(error_response(&e)),
                    }
                }
            });
            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), handler)
                .await
            {
                debug!(error = %e, %peer, "connection closed with error");
            }
        });
    }

    info!("authgate stopped");
    Ok(())
}
