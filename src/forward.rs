//! Upstream forwarder for proxied requests.
//!
//! One pooled hyper client backed by the platform trust store carries
//! both the plain-HTTP proxy path and intercepted HTTPS requests, which
//! arrive with their reconstructed absolute URL and need a real TLS
//! connection to the origin.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HOST};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::ClientConfig;
use rustls::RootCertStore;
use tracing::{debug, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::handler::{HttpHandler, ProxyBody};

// Connection-scoped headers that must not travel end to end.
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.iter().any(|h| name.as_str().eq_ignore_ascii_case(h))
}

/// Pooled HTTP/HTTPS client used as the proxy's round-tripper.
pub struct UpstreamClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl UpstreamClient {
    pub fn new() -> ProxyResult<Self> {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for error in &native.errors {
            warn!("skipping unreadable system certificate: {error}");
        }
        for cert in native.certs {
            roots.add(cert).ok();
        }

        let tls = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .build();

        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        })
    }
}

#[async_trait]
impl HttpHandler for UpstreamClient {
    async fn handle(&self, req: Request<Incoming>) -> ProxyResult<Response<ProxyBody>> {
        let (parts, body) = req.into_parts();
        let authority = parts
            .uri
            .authority()
            .cloned()
            .ok_or_else(|| ProxyError::Http("forwarding requires an absolute URL".into()))?;

        // Buffered so hyper can frame the request for either protocol.
        let body = body
            .collect()
            .await
            .map_err(|e| ProxyError::Http(format!("failed to read request body: {e}")))?
            .to_bytes();
        debug!("forwarding {} {} ({} byte body)", parts.method, parts.uri, body.len());

        let mut upstream = Request::builder()
            .method(parts.method.clone())
            .uri(parts.uri.clone());
        for (name, value) in parts.headers.iter() {
            if !is_hop_by_hop(name) && name != &HOST {
                upstream = upstream.header(name, value);
            }
        }
        upstream = upstream.header(HOST, authority.as_str());
        let upstream = upstream
            .body(Full::new(body))
            .map_err(|e| ProxyError::Http(e.to_string()))?;

        let response = self
            .client
            .request(upstream)
            .await
            .map_err(|e| ProxyError::UpstreamConnection {
                target: authority.to_string(),
                reason: e.to_string(),
            })?;

        let (parts, body) = response.into_parts();
        let mut downstream = Response::builder().status(parts.status);
        for (name, value) in parts.headers.iter() {
            if !is_hop_by_hop(name) {
                downstream = downstream.header(name, value);
            }
        }
        downstream
            .body(body.boxed())
            .map_err(|e| ProxyError::Http(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_recognized() {
        assert!(is_hop_by_hop(&HeaderName::from_static("connection")));
        assert!(is_hop_by_hop(&HeaderName::from_static("transfer-encoding")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("content-type")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("host")));
    }
}
