//! HTTPS hijacker: turns CONNECT tunnels into decrypted request streams.
//!
//! Flow per tunnel: the dispatcher hands over the raw client stream and
//! the requested host. The hijacker records the host under the stream's
//! client address, wraps the stream so the registry entry is released on
//! close, and pushes it onto the virtual listener. The embedded server
//! accepts it, reads the TLS ClientHello, mints (or reuses) a leaf
//! certificate for the SNI's host pattern, finishes the handshake and
//! serves the decrypted HTTP/1.1 requests, rewriting each request URL to
//! `https://<requested host><path>` before delegating to the proxy
//! handler.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use http::uri::Uri;
use http::StatusCode;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use rustls::server::Acceptor;
use rustls::sign::CertifiedKey;
use time::OffsetDateTime;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, warn};

use crate::cache::LruCache;
use crate::cert;
use crate::error::{ProxyError, ProxyResult};
use crate::handler::{status_response, HttpHandler, ProxyBody};
use crate::listener::{virtual_listener, TunnelSender, VirtualListener};
use crate::net::{CloseNotifyStream, TunnelHandler, TunnelStream};
use crate::vhost::{self, VirtualHost};

/// Cache of per-host-pattern TLS state.
pub type VirtualHostCache = LruCache<String, Arc<VirtualHost>>;

/// Tunables for the hijacker. The defaults match production use: leaves
/// are cached for a week and minted with a week of slack beyond that, so
/// a certificate served from the cache is never already expired.
#[derive(Debug, Clone)]
pub struct HijackerConfig {
    /// Capacity of the default virtual-host cache.
    pub cache_capacity: usize,
    /// How long a minted leaf stays cached before reissue.
    pub vhost_ttl: Duration,
    /// Extra leaf validity beyond the cache deadline.
    pub leaf_margin: Duration,
    /// Header read timeout for decrypted connections.
    pub header_read_timeout: Option<Duration>,
}

impl Default for HijackerConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1000,
            vhost_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            leaf_margin: Duration::from_secs(7 * 24 * 60 * 60),
            header_read_timeout: None,
        }
    }
}

/// Decrypts CONNECT tunnels by serving them a dynamically minted
/// certificate issued from the configured root.
pub struct HttpsHijacker {
    root_cert_pem: String,
    root_key_pem: String,
    handler: Arc<dyn HttpHandler>,
    config: HijackerConfig,
    cache: Arc<VirtualHostCache>,
    // Client address of each live tunnel mapped to the CONNECT
    // authority; the close hook on the wrapped stream removes entries.
    dst: Arc<DashMap<SocketAddr, String>>,
    listener: VirtualListener,
    sender: TunnelSender,
    graceful: Mutex<Option<GracefulShutdown>>,
}

impl HttpsHijacker {
    pub fn new(
        root_cert_pem: impl Into<String>,
        root_key_pem: impl Into<String>,
        handler: Arc<dyn HttpHandler>,
    ) -> Self {
        Self::with_config(root_cert_pem, root_key_pem, handler, HijackerConfig::default())
    }

    pub fn with_config(
        root_cert_pem: impl Into<String>,
        root_key_pem: impl Into<String>,
        handler: Arc<dyn HttpHandler>,
        config: HijackerConfig,
    ) -> Self {
        let (listener, sender) = virtual_listener();
        Self {
            root_cert_pem: root_cert_pem.into(),
            root_key_pem: root_key_pem.into(),
            handler,
            cache: Arc::new(LruCache::new(config.cache_capacity)),
            config,
            dst: Arc::new(DashMap::new()),
            listener,
            sender,
            graceful: Mutex::new(Some(GracefulShutdown::new())),
        }
    }

    /// Replaces the default virtual-host cache, e.g. to share one cache
    /// across hijackers or shrink it for tests.
    pub fn with_cache(mut self, cache: Arc<VirtualHostCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Runs the embedded server against the virtual listener. Returns
    /// once [`shutdown`](Self::shutdown) closes the listener.
    pub async fn serve(self: Arc<Self>) -> ProxyResult<()> {
        loop {
            let tunnel = match self.listener.accept().await {
                Ok(tunnel) => tunnel,
                Err(_) => break,
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                let peer = tunnel.peer_addr;
                if let Err(e) = this.serve_tunnel(tunnel).await {
                    if e.is_recoverable() {
                        debug!(%peer, "tunnel ended: {e}");
                    } else {
                        warn!(%peer, "tunnel failed: {e}");
                    }
                }
            });
        }
        Ok(())
    }

    /// Stops accepting tunnels, then drains in-flight connections,
    /// giving up after `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        self.listener.close();
        self.listener.drain().await;
        let graceful = self
            .graceful
            .lock()
            .expect("graceful lock poisoned")
            .take();
        if let Some(graceful) = graceful {
            tokio::select! {
                _ = graceful.shutdown() => debug!("hijacker connections drained"),
                _ = tokio::time::sleep(grace) => warn!("hijacker shutdown grace expired"),
            }
        }
    }

    async fn serve_tunnel(self: Arc<Self>, tunnel: TunnelStream) -> ProxyResult<()> {
        let peer = tunnel.peer_addr;

        let start = LazyConfigAcceptor::new(Acceptor::default(), tunnel.io)
            .await
            .map_err(|e| ProxyError::ClientTls(e.to_string()))?;
        let sni = match start.client_hello().server_name() {
            Some(name) => name.to_string(),
            None => return Err(ProxyError::MissingSni),
        };

        let key = self.resolve_certificate(&sni).await?;
        let tls = start
            .into_stream(vhost::server_config_with(key))
            .await
            .map_err(|e| ProxyError::ClientTls(e.to_string()))?;
        debug!(%peer, sni, "tunnel handshake complete");

        let this = Arc::clone(&self);
        let service = service_fn(move |req| {
            let this = Arc::clone(&this);
            async move { this.intercept(peer, req).await }
        });

        let mut builder = http1::Builder::new();
        builder.timer(TokioTimer::new());
        if let Some(timeout) = self.config.header_read_timeout {
            builder.header_read_timeout(timeout);
        }
        let conn = builder.serve_connection(TokioIo::new(tls), service);

        let watched = {
            let guard = self.graceful.lock().expect("graceful lock poisoned");
            guard.as_ref().map(|graceful| graceful.watch(conn))
        };
        match watched {
            Some(conn) => conn.await.map_err(|e| ProxyError::Http(e.to_string())),
            // Shutdown won the race; drop the connection unserved.
            None => Err(ProxyError::ListenerClosed),
        }
    }

    /// Certificate selection for one handshake: canonicalize the SNI,
    /// share or start the issuance for that pattern, then wait for it.
    async fn resolve_certificate(&self, sni: &str) -> ProxyResult<Arc<CertifiedKey>> {
        let pattern = cert::host_pattern_of(sni);
        let vh = self.virtual_host(pattern);
        vh.wait().await
    }

    /// Returns the cached record for `pattern`, or inserts an unready
    /// one and starts its issuance in the background. The factory only
    /// constructs and spawns, so the cache lock is never held across
    /// slow work; concurrent handshakes for one pattern share a single
    /// issuance.
    fn virtual_host(&self, pattern: String) -> Arc<VirtualHost> {
        let key = pattern.clone();
        self.cache.get_or_insert_with(key, || {
            let deadline = OffsetDateTime::now_utc() + self.config.vhost_ttl;
            let (vh, ready_tx) = VirtualHost::new_unready(deadline);
            self.spawn_issuance(pattern.clone(), Arc::clone(&vh), ready_tx);
            vh
        })
    }

    fn spawn_issuance(
        &self,
        pattern: String,
        vh: Arc<VirtualHost>,
        ready_tx: tokio::sync::watch::Sender<bool>,
    ) {
        let root_cert = self.root_cert_pem.clone();
        let root_key = self.root_key_pem.clone();
        // The leaf outlives the cache deadline so a freshly served
        // handshake never presents an already-expired certificate.
        let valid_until = vh.deadline() + self.config.leaf_margin;
        tokio::spawn(async move {
            let minted = {
                let pattern = pattern.clone();
                tokio::task::spawn_blocking(move || {
                    let (cert_pem, key_pem) =
                        cert::sign_host(&pattern, &root_cert, &root_key, valid_until)?;
                    vhost::parse_certified_key(&cert_pem, &key_pem)
                })
                .await
            };
            let outcome = match minted {
                Ok(Ok(key)) => {
                    info!(pattern, "minted certificate");
                    Ok(Arc::new(key))
                }
                Ok(Err(e)) => {
                    warn!(pattern, "certificate issuance failed: {e}");
                    Err(e.to_string())
                }
                Err(e) => {
                    warn!(pattern, "certificate issuance task failed: {e}");
                    Err(format!("issuance task failed: {e}"))
                }
            };
            vh.fulfill(outcome, ready_tx);
        });
    }

    /// One decrypted request: reattach the destination recorded at
    /// tunnel setup, rebuild an absolute HTTPS URL, and delegate.
    async fn intercept(
        &self,
        peer: SocketAddr,
        mut req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, hyper::Error> {
        let Some(dst) = self.dst.get(&peer).map(|entry| entry.value().clone()) else {
            let err = ProxyError::NoDestination(peer);
            warn!("{err}");
            return Ok(status_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &err.to_string(),
            ));
        };

        let authority = dst.strip_suffix(":443").unwrap_or(dst.as_str());
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = match Uri::builder()
            .scheme("https")
            .authority(authority)
            .path_and_query(path_and_query)
            .build()
        {
            Ok(uri) => uri,
            Err(e) => {
                warn!(%peer, dst, "unusable destination: {e}");
                return Ok(status_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "unusable destination for client address",
                ));
            }
        };
        *req.uri_mut() = uri;

        match self.handler.handle(req).await {
            Ok(response) => Ok(response),
            Err(e) => Ok(status_response(
                StatusCode::BAD_GATEWAY,
                &format!("upstream error: {e}"),
            )),
        }
    }

    fn put_dst(&self, peer: SocketAddr, host: &str) -> ProxyResult<()> {
        match self.dst.entry(peer) {
            Entry::Occupied(_) => Err(ProxyError::AddressConflict(peer)),
            Entry::Vacant(slot) => {
                slot.insert(host.to_string());
                Ok(())
            }
        }
    }

    #[cfg(test)]
    fn get_dst(&self, peer: &SocketAddr) -> Option<String> {
        self.dst.get(peer).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl TunnelHandler for HttpsHijacker {
    /// Takes ownership of a hijacked stream. On any failure the stream
    /// is dropped, which closes it; the close hook keeps the registry
    /// consistent either way.
    async fn handle_tunnel(&self, stream: TunnelStream, hostname: &str) -> ProxyResult<()> {
        let peer = stream.peer_addr;
        self.put_dst(peer, hostname)?;

        let registry = Arc::clone(&self.dst);
        let hooked = CloseNotifyStream::with_hook(stream.io, move || {
            registry.remove(&peer);
        });
        self.sender.send(TunnelStream::new(hooked, peer)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::full_body;
    use bytes::Bytes;
    use http::header::HOST;
    use http_body_util::{BodyExt, Empty};
    use rustls::pki_types::ServerName;
    use rustls::RootCertStore;
    use std::sync::OnceLock;
    use tokio::io::DuplexStream;
    use tokio_rustls::client::TlsStream;
    use tokio_rustls::TlsConnector;

    struct EchoUrlHandler;

    #[async_trait]
    impl HttpHandler for EchoUrlHandler {
        async fn handle(&self, req: Request<Incoming>) -> ProxyResult<Response<ProxyBody>> {
            let host_header = req
                .headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let body = format!("{} {}", req.uri(), host_header);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .body(full_body(body))
                .unwrap())
        }
    }

    fn init_crypto() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    fn test_root() -> &'static (String, String) {
        static ROOT: OnceLock<(String, String)> = OnceLock::new();
        ROOT.get_or_init(|| {
            cert::sign_root(OffsetDateTime::now_utc() + time::Duration::days(30)).unwrap()
        })
    }

    fn test_hijacker() -> Arc<HttpsHijacker> {
        let (root_cert, root_key) = test_root().clone();
        Arc::new(HttpsHijacker::new(root_cert, root_key, Arc::new(EchoUrlHandler)))
    }

    async fn tls_connect(
        io: DuplexStream,
        sni: &str,
    ) -> Result<TlsStream<DuplexStream>, std::io::Error> {
        let (root_cert, _) = test_root();
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut root_cert.as_bytes()) {
            roots.add(cert.unwrap()).unwrap();
        }
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let name = ServerName::try_from(sni.to_string()).unwrap();
        connector.connect(name, io).await
    }

    async fn get_over_tunnel(
        hijacker: &Arc<HttpsHijacker>,
        peer: &str,
        connect_host: &str,
        sni: &str,
        paths: &[&str],
    ) -> Vec<String> {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let peer: SocketAddr = peer.parse().unwrap();
        hijacker
            .handle_tunnel(TunnelStream::new(server_io, peer), connect_host)
            .await
            .unwrap();

        let tls = tls_connect(client_io, sni).await.unwrap();
        let (mut send, conn) =
            hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(TokioIo::new(tls))
                .await
                .unwrap();
        tokio::spawn(conn);

        let mut bodies = Vec::new();
        for path in paths {
            let req = Request::builder()
                .uri(*path)
                .header(HOST, sni)
                .body(Empty::<Bytes>::new())
                .unwrap();
            let resp = send.send_request(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            let body = resp.collect().await.unwrap().to_bytes();
            bodies.push(String::from_utf8(body.to_vec()).unwrap());
        }
        bodies
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cold_intercept_reconstructs_https_url() {
        init_crypto();
        let hijacker = test_hijacker();
        let serve = tokio::spawn(Arc::clone(&hijacker).serve());

        let bodies = get_over_tunnel(
            &hijacker,
            "10.1.1.1:50001",
            "example.com:443",
            "example.com",
            &["/", "/second"],
        )
        .await;
        // The handler saw absolute HTTPS URLs and the client's Host
        // header untouched; the default :443 is dropped.
        assert_eq!(bodies[0], "https://example.com/ example.com");
        assert_eq!(bodies[1], "https://example.com/second example.com");

        hijacker.shutdown(Duration::from_secs(1)).await;
        serve.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn warm_intercept_shares_wildcard_record() {
        init_crypto();
        let (root_cert, root_key) = test_root().clone();
        let cache: Arc<VirtualHostCache> = Arc::new(LruCache::new(16));
        let hijacker = Arc::new(
            HttpsHijacker::new(root_cert, root_key, Arc::new(EchoUrlHandler))
                .with_cache(Arc::clone(&cache)),
        );
        let serve = tokio::spawn(Arc::clone(&hijacker).serve());

        let first = get_over_tunnel(
            &hijacker,
            "10.1.1.2:50002",
            "www.example.com:443",
            "www.example.com",
            &["/"],
        )
        .await;
        assert_eq!(first[0], "https://www.example.com/ www.example.com");

        let second = get_over_tunnel(
            &hijacker,
            "10.1.1.3:50003",
            "foo.example.com:443",
            "foo.example.com",
            &["/"],
        )
        .await;
        assert_eq!(second[0], "https://foo.example.com/ foo.example.com");

        // Both hostnames canonicalize to *.example.com and share one
        // cached record, so only one issuance ran.
        assert_eq!(cache.len(), 1);

        hijacker.shutdown(Duration::from_secs(1)).await;
        serve.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn conflicting_client_address_rejects_second_tunnel() {
        init_crypto();
        let hijacker = test_hijacker();
        let serve = tokio::spawn(Arc::clone(&hijacker).serve());

        let peer: SocketAddr = "10.1.1.4:50004".parse().unwrap();
        let (_client_a, server_a) = tokio::io::duplex(1024);
        hijacker
            .handle_tunnel(TunnelStream::new(server_a, peer), "a.example.com:443")
            .await
            .unwrap();

        let (_client_b, server_b) = tokio::io::duplex(1024);
        let err = hijacker
            .handle_tunnel(TunnelStream::new(server_b, peer), "b.example.com:443")
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::AddressConflict(addr) if addr == peer));

        // The first tunnel's registration is untouched.
        assert_eq!(hijacker.get_dst(&peer).as_deref(), Some("a.example.com:443"));

        hijacker.shutdown(Duration::from_secs(1)).await;
        serve.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closing_tunnel_releases_registry_entry() {
        init_crypto();
        let hijacker = test_hijacker();
        let serve = tokio::spawn(Arc::clone(&hijacker).serve());

        let peer: SocketAddr = "10.1.1.5:50005".parse().unwrap();
        let (client_io, server_io) = tokio::io::duplex(1024);
        hijacker
            .handle_tunnel(TunnelStream::new(server_io, peer), "example.com:443")
            .await
            .unwrap();
        assert!(hijacker.get_dst(&peer).is_some());

        // Client vanishes before the handshake; the wrapper's close hook
        // must clear the registry so the address can be reused.
        drop(client_io);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(hijacker.get_dst(&peer).is_none());

        let (_client2, server2) = tokio::io::duplex(1024);
        hijacker
            .handle_tunnel(TunnelStream::new(server2, peer), "example.com:443")
            .await
            .unwrap();

        hijacker.shutdown(Duration::from_secs(1)).await;
        serve.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_sni_fails_handshake() {
        init_crypto();
        let hijacker = test_hijacker();
        let serve = tokio::spawn(Arc::clone(&hijacker).serve());

        let peer: SocketAddr = "10.1.1.6:50006".parse().unwrap();
        let (client_io, server_io) = tokio::io::duplex(4096);
        hijacker
            .handle_tunnel(TunnelStream::new(server_io, peer), "example.com:443")
            .await
            .unwrap();

        let (root_cert, _) = test_root();
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut root_cert.as_bytes()) {
            roots.add(cert.unwrap()).unwrap();
        }
        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.enable_sni = false;
        let connector = TlsConnector::from(Arc::new(config));
        let name = ServerName::try_from("example.com").unwrap();
        assert!(connector.connect(name, client_io).await.is_err());

        hijacker.shutdown(Duration::from_secs(1)).await;
        serve.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_rejects_new_tunnels() {
        init_crypto();
        let hijacker = test_hijacker();
        let serve = tokio::spawn(Arc::clone(&hijacker).serve());

        hijacker.shutdown(Duration::from_secs(1)).await;
        serve.await.unwrap().unwrap();

        let (_client, server_io) = tokio::io::duplex(1024);
        let peer: SocketAddr = "10.1.1.7:50007".parse().unwrap();
        let err = hijacker
            .handle_tunnel(TunnelStream::new(server_io, peer), "example.com:443")
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ListenerClosed));
    }

    #[tokio::test]
    async fn registry_roundtrip() {
        let hijacker = test_hijacker();
        let peer: SocketAddr = "10.1.1.8:50008".parse().unwrap();

        hijacker.put_dst(peer, "example.com:443").unwrap();
        assert_eq!(hijacker.get_dst(&peer).as_deref(), Some("example.com:443"));
        assert!(matches!(
            hijacker.put_dst(peer, "other.com:443"),
            Err(ProxyError::AddressConflict(_))
        ));
        hijacker.dst.remove(&peer);
        assert!(hijacker.get_dst(&peer).is_none());
    }
}
