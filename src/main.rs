//! backy-agent: host-side daemon for Linux software-RAID (md) storage pools.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use backy_agent::agent::Agent;
use backy_agent::api::{ApiServer, ApiServerConfig};
use backy_agent::config::AgentConfig;
use backy_agent::drives::run_refresh_loop;
use backy_agent::operations::run_sweep_loop;
use backy_agent::{Error, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::parse();
    init_logging(&config);

    info!(version = backy_agent::VERSION, "starting backy-agent");

    let agent = Arc::new(Agent::build(config).await?);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let health_addr = format!("{}:{}", agent.config.bind_addr, agent.config.health_port);
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!(error = %e, "health server error");
        }
    });

    let metrics_addr = format!("{}:{}", agent.config.bind_addr, agent.config.metrics_port);
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!(error = %e, "metrics server error");
        }
    });

    // First DriveCache refresh runs inline so startup reconciliation sees a
    // populated snapshot rather than racing the periodic ticker.
    agent.drives.refresh().await;

    tokio::spawn(run_refresh_loop(
        agent.drives.clone(),
        agent.config.drive_cache_refresh_interval(),
        shutdown_tx.subscribe(),
    ));

    tokio::spawn(run_sweep_loop(
        agent.operations.clone(),
        agent.config.operation_cleanup_interval(),
        shutdown_tx.subscribe(),
    ));

    let startup_reconciler = agent.reconciler.clone();
    let auto_mount = agent.config.auto_mount_on_recover;
    tokio::spawn(async move {
        let fixed = startup_reconciler.reconcile(auto_mount).await;
        info!(fixed_entries = fixed, "startup reconciliation complete");
    });

    let rest_addr: SocketAddr = format!("{}:{}", agent.config.bind_addr, agent.config.listen_port)
        .parse()
        .map_err(|e| Error::Internal(format!("invalid REST bind address: {e}")))?;
    let api_server = ApiServer::new(ApiServerConfig { rest_addr }, agent.clone());

    let shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
        let _ = shutdown_tx.send(());
    });

    api_server.run(shutdown_rx).await?;

    info!("backy-agent shutdown complete");
    Ok(())
}

fn init_logging(config: &AgentConfig) {
    let level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap())
        .add_directive("axum=info".parse().unwrap());

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("ok"))
                    .unwrap(),
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .unwrap(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("invalid health server address: {e}")))?;

    info!(%addr, "health server listening");
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("health server error: {e}")))?;

    Ok(())
}

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    // Handles are registered once in `Agent::build` and threaded into every
    // component that updates them; this endpoint only gathers and encodes
    // the process-wide default registry.
    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    encoder.encode(&metric_families, &mut buffer).unwrap();

                    Response::builder()
                        .status(StatusCode::OK)
                        .header("Content-Type", encoder.format_type())
                        .body(Body::from(buffer))
                        .unwrap()
                }
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .unwrap(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("invalid metrics server address: {e}")))?;

    info!(%addr, "metrics server listening");
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("metrics server error: {e}")))?;

    Ok(())
}
