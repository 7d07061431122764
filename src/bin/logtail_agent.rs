//! logtail-agent: tails log files into SQLite tables.
//!
//! Reads its configuration from the file named by `LOGTAIL_AGENT_CONFIG`
//! (default `config.toml`) and runs until ctrl-c.

use anyhow::Result;
use logtail_agent::config::Config;
use logtail_agent::runner;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env()?;

    let shutdown = CancellationToken::new();
    let metrics_server = config
        .metrics
        .as_ref()
        .map(|metrics| tokio::spawn(start_metrics_server(metrics.listen, shutdown.clone())));

    let result = runner::run(&config).await;

    shutdown.cancel();
    if let Some(server) = metrics_server {
        let _ = server.await;
    }
    result
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Serves the default Prometheus registry at GET /metrics until `shutdown` fires.
async fn start_metrics_server(addr: SocketAddr, shutdown: CancellationToken) {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::{Encoder, TextEncoder};
    use tokio::net::TcpListener;

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, %addr, "failed to bind metrics server");
            return;
        }
    };

    info!(%addr, "metrics server listening on /metrics");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("metrics server shutting down");
                break;
            }
            accept_result = listener.accept() => {
                let (stream, _) = match accept_result {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to accept metrics connection");
                        continue;
                    }
                };

                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        if req.uri().path() != "/metrics" {
                            let mut response = Response::new(Full::new(Bytes::from("Not Found")));
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            return Ok::<_, hyper::Error>(response);
                        }

                        let mut buffer = Vec::new();
                        if let Err(err) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
                            tracing::warn!(error = %err, "failed to encode metrics");
                            let mut response = Response::new(Full::new(Bytes::new()));
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            return Ok(response);
                        }

                        let mut response = Response::new(Full::new(Bytes::from(buffer)));
                        response
                            .headers_mut()
                            .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
                        Ok(response)
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        tracing::debug!(error = %err, "error serving metrics connection");
                    }
                });
            }
        }
    }
}
