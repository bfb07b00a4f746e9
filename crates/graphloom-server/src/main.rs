//! graphloomd - Graphloom API server
//!
//! Startup order: configuration (load, validate), tracing, resources
//! (Neo4j schema constraints + crash recovery run inside `Resources::init`
//! before the listener binds), then serve until ctrl-c.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use http_body_util::BodyExt;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Request};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use graphloom_core::config::Config;
use graphloom_server::api;
use graphloom_server::resources::Resources;

fn parse_config_path() -> PathBuf {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return PathBuf::from(path);
            }
        }
    }
    PathBuf::from("config.yaml")
}

fn setup_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = parse_config_path();
    let cfg = Config::load(&config_path)?;

    let validation_errors = cfg.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            eprintln!("config error: {err}");
        }
        anyhow::bail!("invalid configuration ({} errors)", validation_errors.len());
    }

    setup_tracing(&cfg.logging.level);

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
        .parse()
        .context("invalid server.host / server.port")?;

    let resources = Resources::init(cfg).await?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    serve(addr, resources, shutdown).await
}

/// Accept loop; each connection gets its own task.
async fn serve(
    addr: SocketAddr,
    resources: Arc<Resources>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "graphloomd listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, _) = result?;
                let io = TokioIo::new(stream);
                let resources = Arc::clone(&resources);

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let resources = Arc::clone(&resources);
                        async move { handle(req, resources).await }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        error!(error = %e, "connection error");
                    }
                });
            }
            _ = shutdown.cancelled() => {
                info!("server shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Collects the request body and headers, then hands off to the router.
async fn handle(
    req: Request<hyper::body::Incoming>,
    resources: Arc<Resources>,
) -> Result<hyper::Response<http_body_util::Full<hyper::body::Bytes>>, std::convert::Infallible> {
    let (parts, body) = req.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!(error = %e, "failed to read request body");
            hyper::body::Bytes::new()
        }
    };

    let bearer = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let origin = parts
        .headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().unwrap_or("").to_string();

    Ok(api::route(
        &resources,
        &parts.method,
        &path,
        &query,
        bearer.as_deref(),
        origin.as_deref(),
        &bytes,
    )
    .await)
}
