//! Metrics and health endpoints

use anyhow::Result;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::tokio::TokioIo;
use netplane_core::context::CancelableContext;
use netplane_core::metrics::ReconcilerMetrics;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Serve `/metrics` and `/healthz` on `addr` until the context is cancelled
pub async fn serve(addr: SocketAddr, metrics: ReconcilerMetrics, ctx: CancelableContext) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics listening on http://{}", addr);

    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = ctx.done() => break,
            accepted = listener.accept() => accepted?,
        };
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let metrics = metrics.clone();
                async move { Ok::<_, hyper::Error>(handle_request(req, &metrics)) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
            }
        });
    }

    Ok(())
}

fn handle_request<B>(req: Request<B>, metrics: &ReconcilerMetrics) -> Response<Full<Bytes>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => match metrics.gather() {
            Ok(text) => response(StatusCode::OK, Some("text/plain; version=0.0.4"), text),
            Err(e) => {
                warn!("Failed to gather metrics: {}", e);
                response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    None,
                    "Failed to gather metrics\n".to_string(),
                )
            }
        },
        (_, "/healthz") => response(StatusCode::OK, None, "OK\n".to_string()),
        _ => response(StatusCode::NOT_FOUND, None, "Not Found\n".to_string()),
    }
}

fn response(status: StatusCode, content_type: Option<&str>, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        if let Ok(value) = content_type.parse() {
            response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
        }
    }
    response
}
