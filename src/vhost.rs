//! Per-host-pattern TLS state.
//!
//! A [`VirtualHost`] is created unready and inserted into the hijacker's
//! cache immediately, so concurrent handshakes for the same pattern
//! share one record and one issuance. A background task fills in the
//! minted keypair (or the error) and fires the readiness signal; the
//! outcome is written exactly once before the signal, so readers never
//! need a lock.

use std::sync::{Arc, OnceLock};

use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::cache::CacheEntry;
use crate::error::{ProxyError, ProxyResult};

/// Issuance outcome: a usable TLS keypair or the error that prevented
/// one. Stored once, then immutable.
type Outcome = Result<Arc<CertifiedKey>, String>;

pub struct VirtualHost {
    ready: watch::Receiver<bool>,
    slot: OnceLock<Outcome>,
    deadline: OffsetDateTime,
}

impl VirtualHost {
    /// Creates an unready record expiring at `deadline`, plus the sender
    /// the issuance task uses to fire the readiness signal.
    pub(crate) fn new_unready(deadline: OffsetDateTime) -> (Arc<Self>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            Arc::new(Self {
                ready: rx,
                slot: OnceLock::new(),
                deadline,
            }),
            tx,
        )
    }

    /// Stores the outcome and fires the readiness signal. Must be called
    /// at most once; later calls are ignored.
    pub(crate) fn fulfill(&self, outcome: Outcome, ready_tx: watch::Sender<bool>) {
        let _ = self.slot.set(outcome);
        let _ = ready_tx.send(true);
    }

    /// Awaits readiness and returns the issuance outcome. All concurrent
    /// waiters observe the same value.
    pub async fn wait(&self) -> ProxyResult<Arc<CertifiedKey>> {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|signalled| *signalled)
            .await
            .map_err(|_| ProxyError::Certificate("issuance task abandoned".into()))?;
        match self.slot.get() {
            Some(Ok(key)) => Ok(key.clone()),
            Some(Err(msg)) => Err(ProxyError::Certificate(msg.clone())),
            None => Err(ProxyError::Certificate(
                "issuance signalled ready without an outcome".into(),
            )),
        }
    }

    pub fn deadline(&self) -> OffsetDateTime {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        OffsetDateTime::now_utc() > self.deadline
    }
}

impl CacheEntry for Arc<VirtualHost> {
    fn is_expired(&self) -> bool {
        VirtualHost::is_expired(self)
    }
}

/// Parses a minted PEM pair into the keypair rustls serves with.
pub(crate) fn parse_certified_key(cert_pem: &str, key_pem: &str) -> ProxyResult<CertifiedKey> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<_, _>>()
        .map_err(|e| ProxyError::Certificate(format!("bad leaf cert PEM: {e}")))?;
    if certs.is_empty() {
        return Err(ProxyError::Certificate("leaf PEM held no certificate".into()));
    }
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| ProxyError::Certificate(format!("bad leaf key PEM: {e}")))?
        .ok_or_else(|| ProxyError::Certificate("leaf PEM held no private key".into()))?;
    let signing_key = any_supported_type(&key)
        .map_err(|e| ProxyError::Certificate(format!("unsupported leaf key: {e}")))?;
    Ok(CertifiedKey::new(certs, signing_key))
}

/// Builds the per-tunnel server config around an already-resolved
/// keypair. The handshake that triggered issuance has the certificate in
/// hand by the time this runs, so the resolver is a constant.
pub(crate) fn server_config_with(key: Arc<CertifiedKey>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SingleCertResolver(key)));
    // HTTP/1.1 only on the intercept path.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

struct SingleCertResolver(Arc<CertifiedKey>);

impl std::fmt::Debug for SingleCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SingleCertResolver")
    }
}

impl ResolvesServerCert for SingleCertResolver {
    fn resolve(&self, _hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}
