//! Concurrency modes for running a built [`Server`](super::server_impl::Server).
//!
//! All four modes share the same per-connection state machine
//! ([`HttpConnection`]/[`ConnState`]); they differ only in who owns the
//! socket and how often it gets a turn:
//!
//! - [`ConcurrencyMode::WorkerPool`] — a fixed number of tasks pull
//!   connections from a shared queue and run each to completion before
//!   pulling the next one. The default, and the cheapest on task-scheduling
//!   overhead for short-lived connections.
//! - [`ConcurrencyMode::ThreadPerConnection`] — a dispatcher task spawns one
//!   fresh tokio task per accepted connection, bounded by `max_connections`
//!   via a semaphore. Higher per-connection overhead, but one slow
//!   connection can never delay another from being picked up.
//! - [`ConcurrencyMode::SharedInternalLoop`] — a single task owns every live
//!   connection and steps each of them with [`HttpConnection::try_step`],
//!   which never blocks on a socket read. No per-connection task at all.
//! - `ExternalReadiness` isn't a variant of this enum: it doesn't fit
//!   [`Server::launch`](super::server_impl::Server::launch)'s run-forever
//!   contract, since the whole point is that the embedding application
//!   drives it from an event loop of its own. It's reached through
//!   [`ServerBuilder::build_external`](super::server_impl::ServerBuilder::build_external)
//!   instead, which returns an [`ExternalServer`] exposing
//!   [`accept_one`](ExternalServer::accept_one) and
//!   [`poll_once`](ExternalServer::poll_once).

use crate::{
    errors::ErrorKind,
    http::types::Version,
    server::{
        connection::{ConnState, ConnectionData, HttpConnection},
        server_impl::{AllLimits, Handler, TcpQueue},
        transport::{accept_tls, Transport},
    },
    ConnectionFilter, Response,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::Semaphore, task::yield_now, time::sleep as tokio_sleep};
use tokio_rustls::TlsAcceptor;

/// Builds a connection for a freshly accepted socket, reporting
/// [`ErrorKind::OutOfMemory`] to the peer instead of panicking if the
/// per-connection buffers can't be allocated.
async fn try_build_connection<H, S>(
    stream: &mut Transport,
    handler: Arc<H>,
    limits: AllLimits,
) -> Option<HttpConnection<H, S>>
where
    H: Handler<S>,
    S: ConnectionData,
{
    match HttpConnection::<H, S>::try_new(handler, limits.clone()) {
        Ok(mut conn) => {
            conn.begin();
            Some(conn)
        }
        Err(error) => {
            tracing::warn!(?error, "failed to allocate connection buffers");
            let _ = limits
                .1
                .send_error(stream, error, Version::Http11, limits.0.json_errors)
                .await;
            None
        }
    }
}

/// Selects how a [`Server`](super::server_impl::Server) schedules its
/// connections. See the [module docs](self) for the tradeoffs of each mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyMode {
    /// Fixed pool of tasks, each running one connection to completion at a
    /// time (default).
    #[default]
    WorkerPool,
    /// One fresh task per accepted connection.
    ThreadPerConnection,
    /// A single task round-robins every live connection.
    SharedInternalLoop,
}

/// Runs [`ConnectionFilter::filter`]/[`ConnectionFilter::filter_async`] and
/// reports whether the connection was admitted.
async fn admitted<F: ConnectionFilter>(
    filter: &F,
    stream: &Transport,
    addr: SocketAddr,
    response: &mut Response,
) -> bool {
    let Ok(local_addr) = stream.local_addr() else {
        return false;
    };

    filter.filter(addr, local_addr, response).is_ok()
        && filter.filter_async(addr, local_addr, response).await.is_ok()
}

pub(crate) fn spawn_thread_per_connection<H, S, F>(
    queue: &TcpQueue,
    limits: &AllLimits,
    filter: &Arc<F>,
    handler: &Arc<H>,
) where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    let queue = queue.clone();
    let filter = filter.clone();
    let handler = handler.clone();
    let limits = limits.clone();
    let permits = Arc::new(Semaphore::new(limits.0.max_connections));

    tokio::spawn(async move {
        loop {
            let (mut stream, addr) =
                super::server_impl::Server::get_stream(&queue, &limits.0.wait_strategy).await;

            // A bounded pool of task slots, distinct from the fixed worker
            // pool `WorkerPool` pre-allocates: here every accepted connection
            // wants its own task, so saturation has to reject instead of
            // queuing behind whichever connection finishes first.
            let Ok(permit) = permits.clone().try_acquire_owned() else {
                tracing::warn!(addr = %addr, "thread-per-connection pool saturated, rejecting connection");
                let _ = limits
                    .1
                    .send_error(&mut stream, ErrorKind::OutOfPool, Version::Http11, limits.0.json_errors)
                    .await;
                continue;
            };

            let filter = filter.clone();
            let handler = handler.clone();
            let limits = limits.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let mut response = Response::new(&limits.3);

                if !admitted(filter.as_ref(), &stream, addr, &mut response).await {
                    let _ = limits.1.write_bytes(&mut stream, response.buffer()).await;
                    return;
                }

                let Some(mut conn) = try_build_connection::<H, S>(&mut stream, handler, limits).await else {
                    return;
                };
                let _ = conn.run(&mut stream).await;
            });
        }
    });
}

pub(crate) fn spawn_shared_internal_loop<H, S, F>(
    queue: &TcpQueue,
    limits: &AllLimits,
    filter: &Arc<F>,
    handler: &Arc<H>,
) where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    let queue = queue.clone();
    let filter = filter.clone();
    let handler = handler.clone();
    let limits = limits.clone();

    tokio::spawn(async move {
        let mut live: Vec<(HttpConnection<H, S>, Transport)> = Vec::new();

        loop {
            if live.len() < limits.0.max_connections {
                if let Some((mut stream, addr)) = queue.pop() {
                    let mut response = Response::new(&limits.3);

                    if admitted(filter.as_ref(), &stream, addr, &mut response).await {
                        if let Some(conn) =
                            try_build_connection::<H, S>(&mut stream, handler.clone(), limits.clone()).await
                        {
                            live.push((conn, stream));
                        }
                    } else {
                        let _ = limits.1.write_bytes(&mut stream, response.buffer()).await;
                    }
                }
            }

            let mut progressed = false;
            let mut i = 0;
            while i < live.len() {
                match live[i].0.try_step(&mut live[i].1).await {
                    Ok(ConnState::Done) => {
                        live.swap_remove(i);
                        progressed = true;
                    }
                    Ok(_) => {
                        progressed = true;
                        i += 1;
                    }
                    Err(_) => {
                        live.swap_remove(i);
                        progressed = true;
                    }
                }
            }

            if !progressed {
                match &limits.0.wait_strategy {
                    crate::limits::WaitStrategy::Yield => yield_now().await,
                    crate::limits::WaitStrategy::Sleep(time) => tokio_sleep(*time).await,
                }
            }
        }
    });
}

/// Entry point for the `ExternalReadiness` concurrency mode, returned by
/// [`ServerBuilder::build_external`](super::server_impl::ServerBuilder::build_external).
///
/// Unlike [`Server`](super::server_impl::Server), this type has no internal
/// accept or scheduling loop: the embedding application calls
/// [`accept_one`](Self::accept_one) and [`poll_once`](Self::poll_once) from
/// its own event loop, at whatever cadence it likes.
pub struct ExternalServer<H, S, F>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    listener: TcpListener,
    tls_acceptor: Option<Arc<TlsAcceptor>>,
    handler: Arc<H>,
    filter: Arc<F>,
    limits: AllLimits,
    live: Vec<(HttpConnection<H, S>, Transport)>,
}

impl<H, S, F> ExternalServer<H, S, F>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    pub(crate) fn new(
        listener: TcpListener,
        tls_acceptor: Option<Arc<TlsAcceptor>>,
        handler: Arc<H>,
        filter: Arc<F>,
        limits: AllLimits,
    ) -> Self {
        Self { listener, tls_acceptor, handler, filter, limits, live: Vec::new() }
    }

    /// Accepts at most one pending connection and, if it passes the
    /// installed [`ConnectionFilter`], adds it to the live set.
    ///
    /// Returns `Ok(true)` if a connection was accepted (filtered out or
    /// TLS-handshake-failed connections still count, since the listener
    /// backlog was drained), `Ok(false)` if nothing was pending, `Err` on a
    /// listener-level I/O error.
    pub async fn accept_one(&mut self) -> std::io::Result<bool> {
        if self.live.len() >= self.limits.0.max_connections {
            return Ok(false);
        }

        let (stream, addr) = match self.listener.accept().await {
            Ok(value) => value,
            Err(e) => return Err(e),
        };

        let mut stream = match &self.tls_acceptor {
            None => Transport::Plain(stream),
            Some(acceptor) => match accept_tls(acceptor, stream).await {
                Ok(transport) => transport,
                Err(_) => return Ok(true),
            },
        };

        let mut response = Response::new(&self.limits.3);

        if admitted(self.filter.as_ref(), &stream, addr, &mut response).await {
            if let Some(conn) =
                try_build_connection::<H, S>(&mut stream, self.handler.clone(), self.limits.clone()).await
            {
                self.live.push((conn, stream));
            }
        } else {
            let _ = self.limits.1.write_bytes(&mut stream, response.buffer()).await;
        }

        Ok(true)
    }

    /// Advances every live connection by exactly one non-blocking
    /// [`ConnState`] transition. Returns the number of connections that
    /// finished (closed) during this call.
    pub async fn poll_once(&mut self) -> usize {
        let mut finished = 0;
        let mut i = 0;

        while i < self.live.len() {
            let (conn, stream) = &mut self.live[i];
            match conn.try_step(stream).await {
                Ok(ConnState::Done) | Err(_) => {
                    self.live.swap_remove(i);
                    finished += 1;
                }
                Ok(_) => i += 1,
            }
        }

        finished
    }

    /// Number of connections currently tracked (accepted, not yet closed).
    pub fn live_connections(&self) -> usize {
        self.live.len()
    }
}
