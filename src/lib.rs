//! tlstap: an intercepting HTTP/HTTPS forward proxy.
//!
//! Clients use it as an ordinary HTTP proxy. Plain requests are
//! forwarded upstream; CONNECT tunnels are terminated with a
//! dynamically minted certificate issued from a locally trusted root,
//! and the decrypted requests are surfaced to a handler with their
//! absolute `https://` URL reconstructed.
//!
//! Architecture:
//! 1. [`server::ProxyServer`] dispatches CONNECT, absolute-URI and
//!    local requests from a real listening socket.
//! 2. [`hijack::HttpsHijacker`] takes over CONNECT streams, feeding
//!    them through an in-memory [`listener`] into an embedded HTTP
//!    server behind a per-host TLS handshake.
//! 3. [`cert`] mints the root and per-host-pattern leaves; [`vhost`]
//!    and [`cache`] make issuance single-flight and bounded.
//! 4. [`forward::UpstreamClient`] carries both proxied plain requests
//!    and decrypted HTTPS requests to the origin.
//!
//! ```rust,ignore
//! // Serve a proxy on :8080 with a throwaway root, downloadable at
//! // http://proxy/rootca through the proxy itself.
//! tlstap::bootstrap::simple_listen_and_serve("127.0.0.1:8080").await?;
//! ```

pub mod bootstrap;
pub mod cache;
pub mod cert;
pub mod config;
pub mod error;
pub mod forward;
pub mod handler;
pub mod hijack;
pub mod listener;
pub mod net;
pub mod server;
pub mod vhost;

// Re-exports for convenience
pub use error::{ProxyError, ProxyResult};
pub use handler::{HttpHandler, ProxyBody};
pub use hijack::{HijackerConfig, HttpsHijacker};
pub use net::{TunnelHandler, TunnelStream};
pub use server::ProxyServer;
