//! Ready-made wiring for running the proxy as a whole.
//!
//! The dispatcher and the hijacker reference each other only through
//! their capability traits: the hijacker is the dispatcher's tunnel
//! handler, and both share one upstream forwarder as their request
//! handler. Construct the pieces, wire the references, serve.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::info;

use crate::cert;
use crate::error::{ProxyError, ProxyResult};
use crate::forward::UpstreamClient;
use crate::handler::{FileHandler, HttpHandler, LocalRouter};
use crate::hijack::{HijackerConfig, HttpsHijacker};
use crate::server::ProxyServer;

/// Path on the proxy's local vhost serving the root certificate.
pub const ROOT_CA_PATH: &str = "/rootca";

/// Serves an intercepting proxy on `addr` with a freshly generated
/// root certificate, downloadable at [`ROOT_CA_PATH`]. Clients must
/// trust that root or disable verification.
pub async fn simple_listen_and_serve(addr: &str) -> ProxyResult<()> {
    let valid_until = OffsetDateTime::now_utc() + time::Duration::days(365);
    let (root_cert_pem, root_key_pem) =
        tokio::task::spawn_blocking(move || cert::sign_root(valid_until))
            .await
            .map_err(|e| ProxyError::Certificate(format!("root generation failed: {e}")))??;
    listen_and_serve(addr, root_cert_pem, root_key_pem).await
}

/// Serves an intercepting proxy on `addr` using existing root material,
/// with default hijacker tunables and the root certificate download.
pub async fn listen_and_serve(
    addr: &str,
    root_cert_pem: String,
    root_key_pem: String,
) -> ProxyResult<()> {
    let local = LocalRouter::new().route(
        ROOT_CA_PATH,
        Arc::new(FileHandler::new("text/plain", root_cert_pem.clone())),
    );
    serve_proxy(
        addr,
        root_cert_pem,
        root_key_pem,
        Some(Arc::new(local)),
        HijackerConfig::default(),
    )
    .await
}

/// Fully parameterized variant: runs the dispatcher until ctrl-c, then
/// shuts the hijacker down with a one second grace period.
pub async fn serve_proxy(
    addr: &str,
    root_cert_pem: String,
    root_key_pem: String,
    local_handler: Option<Arc<dyn HttpHandler>>,
    hijacker_config: HijackerConfig,
) -> ProxyResult<()> {
    let forwarder: Arc<dyn HttpHandler> = Arc::new(UpstreamClient::new()?);
    let hijacker = Arc::new(HttpsHijacker::with_config(
        root_cert_pem,
        root_key_pem,
        Arc::clone(&forwarder),
        hijacker_config,
    ));

    let mut server = ProxyServer::new()
        .with_tunnel_handler(Arc::clone(&hijacker) as Arc<dyn crate::net::TunnelHandler>)
        .with_forwarder(forwarder);
    if let Some(local) = local_handler {
        server = server.with_local_handler(local);
    }
    let server = Arc::new(server);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::BindFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
    info!("proxy listening on {addr}");

    let hijacker_task = tokio::spawn(Arc::clone(&hijacker).serve());

    let run_result = tokio::select! {
        result = server.run(listener) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    hijacker.shutdown(Duration::from_secs(1)).await;
    let _ = hijacker_task.await;

    run_result
}
