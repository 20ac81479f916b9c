//! Stream plumbing for hijacked tunnels.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::error::ProxyResult;

/// Byte-stream bound required of a hijacked connection.
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelIo for T {}

/// An already-established byte stream taken over from a CONNECT request,
/// together with the client address it arrived from. The address is what
/// ties decrypted requests back to the originally requested host, since
/// the stream itself never went through a real socket accept.
pub struct TunnelStream {
    pub io: Box<dyn TunnelIo>,
    pub peer_addr: SocketAddr,
}

impl TunnelStream {
    pub fn new(io: impl TunnelIo + 'static, peer_addr: SocketAddr) -> Self {
        Self {
            io: Box::new(io),
            peer_addr,
        }
    }
}

/// The capability invoked by the proxy dispatcher when it has hijacked a
/// CONNECT stream: take ownership of the stream and serve everything the
/// client sends over it for `hostname`.
#[async_trait]
pub trait TunnelHandler: Send + Sync {
    async fn handle_tunnel(&self, stream: TunnelStream, hostname: &str) -> ProxyResult<()>;
}

/// Passthrough wrapper that fires a one-shot closed signal the first time
/// the stream shuts down, or on drop if it never did. An optional hook
/// runs at the same moment; cleanup that must follow the connection's
/// lifetime (like releasing a registry entry) goes there instead of in a
/// watcher task.
pub struct CloseNotifyStream<S> {
    inner: S,
    closed: CancellationToken,
    hook: Option<Box<dyn FnOnce() + Send>>,
}

impl<S> CloseNotifyStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            closed: CancellationToken::new(),
            hook: None,
        }
    }

    pub fn with_hook(inner: S, hook: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner,
            closed: CancellationToken::new(),
            hook: Some(Box::new(hook)),
        }
    }

    /// Token cancelled exactly once when the stream closes.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn fire(&mut self) {
        self.closed.cancel();
        if let Some(hook) = self.hook.take() {
            hook();
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CloseNotifyStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CloseNotifyStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = Pin::new(&mut self.inner).poll_shutdown(cx);
        if result.is_ready() {
            // The signal fires whether or not the underlying close
            // succeeded; later shutdown calls are passthrough only.
            self.fire();
        }
        result
    }
}

impl<S> Drop for CloseNotifyStream<S> {
    fn drop(&mut self) {
        self.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn passthrough_read_write() {
        let (client, server) = tokio::io::duplex(64);
        let mut wrapped = CloseNotifyStream::new(client);
        let mut server = server;

        wrapped.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn shutdown_fires_signal_and_hook_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let hook_fired = fired.clone();

        let (client, _server) = tokio::io::duplex(64);
        let mut wrapped = CloseNotifyStream::with_hook(client, move || {
            hook_fired.fetch_add(1, Ordering::SeqCst);
        });
        let closed = wrapped.closed();
        assert!(!closed.is_cancelled());

        wrapped.shutdown().await.unwrap();
        assert!(closed.is_cancelled());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // A second shutdown must not re-run the hook.
        let _ = wrapped.shutdown().await;
        drop(wrapped);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drop_fires_signal_and_hook() {
        let fired = Arc::new(AtomicUsize::new(0));
        let hook_fired = fired.clone();

        let (client, _server) = tokio::io::duplex(64);
        let wrapped = CloseNotifyStream::with_hook(client, move || {
            hook_fired.fetch_add(1, Ordering::SeqCst);
        });
        let closed = wrapped.closed();

        drop(wrapped);
        assert!(closed.is_cancelled());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
