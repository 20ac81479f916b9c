//! Proxy dispatcher: the outward-facing HTTP server.
//!
//! Splits incoming traffic three ways. CONNECT requests are answered
//! with 200, hijacked off the connection and handed to the tunnel
//! handler. Absolute-URI requests go to the forwarder. Everything else
//! (including the reserved local vhost `proxy`) is for the proxy itself,
//! such as the root certificate download.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use http::header::PROXY_AUTHORIZATION;
use http::{Method, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::ProxyResult;
use crate::handler::{empty_body, status_response, HttpHandler, ProxyBody};
use crate::net::{TunnelHandler, TunnelStream};

/// Dispatcher over a real listening socket. All parts are optional:
/// without a tunnel handler CONNECT is refused, without a forwarder
/// absolute-URI requests are refused, without a local handler everything
/// else is 404.
#[derive(Default)]
pub struct ProxyServer {
    tunnel_handler: Option<Arc<dyn TunnelHandler>>,
    forwarder: Option<Arc<dyn HttpHandler>>,
    local_handler: Option<Arc<dyn HttpHandler>>,
}

impl ProxyServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tunnel_handler(mut self, handler: Arc<dyn TunnelHandler>) -> Self {
        self.tunnel_handler = Some(handler);
        self
    }

    pub fn with_forwarder(mut self, forwarder: Arc<dyn HttpHandler>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn with_local_handler(mut self, handler: Arc<dyn HttpHandler>) -> Self {
        self.local_handler = Some(handler);
        self
    }

    /// Accept loop. Runs until the listener fails; per-connection errors
    /// are logged and absorbed.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> ProxyResult<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("failed to accept connection: {e}");
                    continue;
                }
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let this = Arc::clone(&this);
                    async move { this.dispatch(peer, req).await }
                });
                let conn = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades();
                if let Err(e) = conn.await {
                    debug!(%peer, "connection ended: {e}");
                }
            });
        }
    }

    async fn dispatch(
        self: Arc<Self>,
        peer: SocketAddr,
        mut req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, hyper::Error> {
        // Never leak proxy credentials upstream or into handlers.
        req.headers_mut().remove(PROXY_AUTHORIZATION);

        if req.method() == Method::CONNECT {
            return Ok(self.handle_connect(peer, req));
        }

        let host = req
            .uri()
            .host()
            .map(|h| h.to_ascii_lowercase())
            .unwrap_or_default();
        if host.is_empty() || host == "proxy" {
            match &self.local_handler {
                Some(handler) => Ok(handler
                    .handle(req)
                    .await
                    .unwrap_or_else(|e| {
                        status_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
                    })),
                None => Ok(status_response(StatusCode::NOT_FOUND, "not found")),
            }
        } else {
            Ok(self.forward(req).await)
        }
    }

    /// Replies 200 and, once hyper releases the raw stream to us, hands
    /// it to the tunnel handler under the CONNECT authority.
    fn handle_connect(&self, peer: SocketAddr, req: Request<Incoming>) -> Response<ProxyBody> {
        let Some(tunnel_handler) = self.tunnel_handler.clone() else {
            return status_response(StatusCode::METHOD_NOT_ALLOWED, "CONNECT method not allowed");
        };
        let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
            return status_response(StatusCode::BAD_REQUEST, "CONNECT requires authority form");
        };

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let stream = TunnelStream::new(TokioIo::new(upgraded), peer);
                    match tunnel_handler.handle_tunnel(stream, &authority).await {
                        Ok(()) => info!("CONNECT {authority} ok"),
                        Err(e) => warn!("CONNECT {authority} rejected: {e}"),
                    }
                }
                Err(e) => warn!("CONNECT {authority} upgrade failed: {e}"),
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .body(empty_body())
            .unwrap()
    }

    /// Forwards an absolute-URI request, with an access log line per
    /// request: method, URL, status, error and duration.
    async fn forward(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        let started = Instant::now();

        let (response, status, errmsg) = match &self.forwarder {
            Some(forwarder) => match forwarder.handle(req).await {
                Ok(response) => {
                    let status = response.status();
                    let text = format!(
                        "{} {}",
                        status.as_u16(),
                        status.canonical_reason().unwrap_or("-")
                    );
                    (response, text, "-".to_string())
                }
                Err(e) => (
                    status_response(StatusCode::BAD_GATEWAY, &e.to_string()),
                    "900 Network Error".to_string(),
                    e.to_string(),
                ),
            },
            None => (
                status_response(StatusCode::BAD_GATEWAY, "no forwarder configured"),
                "502 Bad Gateway".to_string(),
                "no forwarder configured".to_string(),
            ),
        };

        let elapsed_ms = started.elapsed().as_millis();
        let errmsg = errmsg.replace('"', "'");
        info!("{method} {uri} \"{status}\" \"{errmsg}\" {elapsed_ms}ms");
        response
    }
}
