//! Transport adapter abstracting over plaintext and TLS-terminated sockets.
//!
//! Every concurrency mode in [`daemon`](super::daemon) and the connection
//! state machine in [`connection`](super::connection) read and write through
//! [`Transport`] instead of a bare `TcpStream`, so enabling TLS doesn't
//! change a single line of HTTP parsing or response writing.

use crate::errors::ErrorKind;
use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::{server::TlsStream, TlsAcceptor};

/// A connected socket, optionally terminated with TLS.
pub(crate) enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    #[inline]
    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Transport::Plain(stream) => stream.local_addr(),
            Transport::Tls(stream) => stream.get_ref().0.local_addr(),
        }
    }

    /// Non-blocking read used by `SharedInternalLoop`/`ExternalReadiness` so
    /// one idle connection never blocks another sharing the same task. Only
    /// meaningful for [`Transport::Plain`]: a TLS session can need to write
    /// during what looks like a read (renegotiation, close-notify), which a
    /// bare `try_read` can't drive, so TLS connections under those two modes
    /// fall back to failing the read with `WouldBlock` forever, effectively
    /// opting them out of non-blocking scheduling.
    #[inline]
    pub(crate) fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.try_read(buf),
            Transport::Tls(_) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "non-blocking reads aren't supported on TLS transports",
            )),
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Runs the TLS handshake on a freshly accepted socket. Translates failures
/// into the variant a fatal TLS alert from the peer produces versus every
/// other handshake failure (bad ClientHello, no shared cipher suite, timed
/// out mid-handshake); the connection never reaches a point where either
/// gets written back as an HTTP response, but both are logged and counted
/// the same way a completed connection's errors are.
pub(crate) async fn accept_tls(acceptor: &TlsAcceptor, stream: TcpStream) -> Result<Transport, ErrorKind> {
    match acceptor.accept(stream).await {
        Ok(stream) => Ok(Transport::Tls(Box::new(stream))),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            tracing::debug!(error = %e, "TLS handshake rejected by peer alert");
            Err(ErrorKind::TlsFatalAlert)
        }
        Err(e) => {
            tracing::debug!(error = %e, "TLS handshake failed");
            Err(ErrorKind::TlsHandshakeFailed)
        }
    }
}
