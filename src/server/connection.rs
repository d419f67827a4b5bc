use crate::{
    errors::ErrorKind,
    http::{
        request::{classify_read_error, classify_write_error, Parser, Request},
        response::{PayloadSource, Response},
        types::Version,
    },
    limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits},
    server::{
        server_impl::{AllLimits, Handler},
        transport::Transport,
    },
    Handled,
};
use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Instant,
};
use tokio::{io::AsyncWriteExt, time::sleep};

/// Where a connection sits in its request/response lifecycle. [`HttpConnection::step`]
/// advances one state per call, so a driver can interleave many connections
/// in a single task (see `SharedInternalLoop` in `daemon.rs`) instead of only
/// ever running one connection to completion before touching another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// Waiting between requests; checked against the connection's lifetime
    /// limits before the next read is issued.
    Idle,
    /// Blocked on (or about to issue) a socket read for the next request.
    Reading,
    /// Request parsed; handed to the application [`Handler`].
    Dispatching,
    /// Writing the queued response back to the peer.
    Writing,
    /// Connection is finished and should be torn down by the caller.
    Done,
}

pub(crate) struct HttpConnection<H: Handler<S>, S: ConnectionData> {
    handler: Arc<H>,
    connection_data: S,

    connection: Connection,
    pub(crate) parser: Parser,
    pub(crate) request: Request,
    pub(crate) response: Response,
    pub(crate) state: ConnState,

    pub(crate) server_limits: ServerLimits,
    pub(crate) conn_limits: ConnLimits,
    pub(crate) req_limits: ReqLimits,
    pub(crate) resp_limits: RespLimits,
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    pub(crate) fn new(handler: Arc<H>, limits: AllLimits) -> Self {
        Self {
            handler,
            connection_data: S::new(),

            connection: Connection::new(),
            parser: Parser::new(&limits.2),
            request: Request::new(&limits.2),
            response: Response::new(&limits.3),
            state: ConnState::Idle,

            server_limits: limits.0,
            conn_limits: limits.1,
            req_limits: limits.2,
            resp_limits: limits.3,
        }
    }

    /// Fallible counterpart to [`new`](Self::new), for modes that allocate a
    /// connection per accepted socket instead of pre-allocating a fixed pool
    /// at startup ([`ConcurrencyMode`](crate::ConcurrencyMode::ThreadPerConnection)
    /// and [`SharedInternalLoop`](crate::ConcurrencyMode::SharedInternalLoop),
    /// and [`ExternalServer`](crate::ExternalServer)). Lets the caller write
    /// an [`ErrorKind::OutOfMemory`] response to the peer and drop the
    /// connection instead of aborting the process.
    #[inline]
    pub(crate) fn try_new(handler: Arc<H>, limits: AllLimits) -> Result<Self, ErrorKind> {
        Ok(Self {
            handler,
            connection_data: S::new(),

            connection: Connection::new(),
            parser: Parser::try_new(&limits.2)?,
            request: Request::new(&limits.2),
            response: Response::new(&limits.3),
            state: ConnState::Idle,

            server_limits: limits.0,
            conn_limits: limits.1,
            req_limits: limits.2,
            resp_limits: limits.3,
        })
    }

    #[inline]
    fn reset_request_response(&mut self) {
        self.parser.reset();
        self.request.reset();
        self.response.reset(&self.resp_limits);
    }

    /// Resets this (pooled and reused) connection object for a freshly
    /// accepted socket and moves it back to `Idle`.
    #[inline]
    pub(crate) fn begin(&mut self) {
        self.connection.reset();
        self.connection_data.reset();
        self.state = ConnState::Idle;
    }
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    /// Runs a connection to completion by repeatedly calling [`step`](Self::step).
    /// This is what the `WorkerPool` and `ThreadPerConnection` daemon modes use:
    /// each owns one connection exclusively until it closes.
    #[inline]
    pub(crate) async fn run(&mut self, stream: &mut Transport) -> Result<(), io::Error> {
        self.begin();

        loop {
            match self.step(stream).await {
                Ok(ConnState::Done) => return Ok(()),
                Ok(_) => {}
                Err(ErrorKind::Io(e)) => return Err(e.0),
                Err(error) => {
                    tracing::debug!(?error, "rejecting request");
                    return self
                        .conn_limits
                        .send_error(
                            stream,
                            error,
                            self.request.version(),
                            self.server_limits.json_errors,
                        )
                        .await
                }
            }
        }
    }

    /// Advances this connection by exactly one [`ConnState`] transition,
    /// performing at most one fallible I/O operation. Returns the new state;
    /// the caller decides whether (and when) to call `step` again, which is
    /// what lets `SharedInternalLoop`/`ExternalReadiness` interleave many
    /// connections under one task without each blocking the others.
    #[inline]
    pub(crate) async fn step(&mut self, stream: &mut Transport) -> Result<ConnState, ErrorKind> {
        self.state = match self.state {
            ConnState::Idle => self.idle()?,
            ConnState::Reading => self.read(stream).await?,
            ConnState::Dispatching => self.dispatch().await,
            ConnState::Writing => self.write(stream).await?,
            ConnState::Done => ConnState::Done,
        };

        Ok(self.state)
    }

    /// Non-blocking counterpart to [`step`](Self::step): never awaits a
    /// socket read. While idle on `Reading` it returns immediately with the
    /// state unchanged if no bytes are available yet, so a caller driving
    /// many connections out of one task (`SharedInternalLoop`,
    /// `ExternalReadiness`) can round-robin between them instead of
    /// blocking on whichever one is read next.
    ///
    /// Bodies that don't arrive with their headers (100-continue,
    /// multi-read chunked bodies) aren't pulled in here the way
    /// [`read`](Self::read) does it for the blocking verbs; such requests
    /// fail with [`ErrorKind::BodyMismatch`] or [`ErrorKind::BadChunk`] in
    /// this mode. A queued [`Response::body_stream`] body fails with
    /// [`ErrorKind::WrongMode`] for the same reason: draining it takes
    /// further fallible I/O this mode can't run without blocking every
    /// other connection sharing the task.
    #[inline]
    pub(crate) async fn try_step(&mut self, stream: &mut Transport) -> Result<ConnState, ErrorKind> {
        // A `body_stream` response needs further fallible I/O to produce its
        // body after the headers go out; running that here would block this
        // task's turn for every other connection it's interleaving, so this
        // mode rejects it outright instead of stalling the whole roster.
        if self.state == ConnState::Writing && self.response.has_stream() {
            return Err(ErrorKind::WrongMode);
        }

        if self.state != ConnState::Reading {
            return self.step(stream).await;
        }

        match self.parser.try_fill_buffer(stream).map_err(classify_read_error)? {
            None => Ok(ConnState::Reading),
            Some(0) => {
                self.state = ConnState::Done;
                Ok(ConnState::Done)
            }
            Some(_) => {
                self.response.version = self.parse()?;
                self.state = ConnState::Dispatching;
                Ok(ConnState::Dispatching)
            }
        }
    }

    #[inline]
    fn idle(&mut self) -> Result<ConnState, ErrorKind> {
        if self.is_expired()? {
            return Ok(ConnState::Done);
        }

        self.reset_request_response();
        Ok(ConnState::Reading)
    }

    #[inline]
    async fn read(&mut self, stream: &mut Transport) -> Result<ConnState, ErrorKind> {
        let n = self
            .parser
            .fill_buffer(stream, self.conn_limits.socket_read_timeout)
            .await
            .map_err(classify_read_error)?;

        if n == 0 {
            return Ok(ConnState::Done);
        }

        self.response.version = self.parse_streaming(stream).await?;
        Ok(ConnState::Dispatching)
    }

    #[inline]
    async fn dispatch(&mut self) -> ConnState {
        self.handler
            .handle(&mut self.connection_data, &self.request, &mut self.response)
            .await;

        ConnState::Writing
    }

    #[inline]
    async fn write(&mut self, stream: &mut Transport) -> Result<ConnState, ErrorKind> {
        self.conn_limits
            .write_bytes(stream, self.response.buffer())
            .await
            .map_err(classify_write_error)?;

        if let Some(source) = self.response.take_stream() {
            self.write_streamed(stream, &source).await?;
        }

        if !self.response.keep_alive {
            return Ok(ConnState::Done);
        }

        self.connection.request_count += 1;
        Ok(ConnState::Idle)
    }

    /// Drains a [`PayloadSource::PullCallback`] onto the wire as
    /// `transfer-encoding: chunked` chunks, ending with the terminator. A
    /// [`PayloadSource::Buffer`] body is already part of
    /// [`Response::buffer`] and needs nothing further here.
    async fn write_streamed(
        &self,
        stream: &mut Transport,
        source: &Arc<Mutex<PayloadSource>>,
    ) -> Result<(), ErrorKind> {
        // Contention here would mean something else still holds this
        // response's payload source; nothing in the current handler/daemon
        // call graph can produce that, but the lock is real, so a caller
        // that did share the `Arc` out gets a clean `500` instead of a hang.
        let mut guard = source.try_lock().map_err(|_| ErrorKind::Frozen)?;

        let PayloadSource::PullCallback(pull) = &mut *guard else {
            return Ok(());
        };

        let mut chunk = Vec::new();
        let mut framed = Vec::new();

        loop {
            chunk.clear();
            let more = pull(&mut chunk);

            if !chunk.is_empty() {
                framed.clear();
                Response::encode_chunk(&chunk, &mut framed);
                self.conn_limits
                    .write_bytes(stream, &framed)
                    .await
                    .map_err(classify_write_error)?;
            }

            if !more {
                return self
                    .conn_limits
                    .write_bytes(stream, Response::CHUNK_TERMINATOR)
                    .await
                    .map_err(classify_write_error);
            }
        }
    }
}

impl ConnLimits {
    #[inline]
    pub(crate) async fn send_error(
        &self,
        stream: &mut Transport,
        error: ErrorKind,
        version: Version,
        json_errors: bool,
    ) -> Result<(), io::Error> {
        self.write_bytes(stream, error.as_http(version, json_errors))
            .await
    }

    #[inline]
    pub(crate) async fn write_bytes(
        &self,
        stream: &mut Transport,
        response: &[u8],
    ) -> Result<(), io::Error> {
        tokio::select! {
            biased;

            result = stream.write_all(response) => result,
            _ = sleep(self.socket_write_timeout) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout"))
            },
        }
    }
}

macro_rules! is_expired {
    ($self:expr, $limits:expr) => {
        Ok(!$self.response.keep_alive
            || $self.connection.request_count >= $limits.max_requests_per_connection
            || $self.connection.created.elapsed() > $limits.connection_lifetime)
    };
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    fn is_expired(&self) -> Result<bool, ErrorKind> {
        is_expired!(self, self.conn_limits)
    }
}

#[derive(Debug)]
pub(crate) struct Connection {
    created: Instant,
    request_count: usize,
}

impl Connection {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            created: Instant::now(),
            request_count: 0,
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.created = Instant::now();
        self.request_count = 0;
    }
}

//

/// Managing user session data stored between requests within a single HTTP connection.
///
/// This trait allows you to store arbitrary state (e.g., authentication data,
/// multistep form status, cache, etc.). The state is available across all requests
/// within a single HTTP keep-alive connection.
///
/// # Examples
/// ```no_run
/// use microhive::ConnectionData;
/// use std::collections::HashMap;
///
/// struct MyConnectionData {
///     user_id: Option<i32>,
///     request_count: usize,
///     cache: HashMap<usize, [u8; 4]>,
/// }
///
/// impl ConnectionData for MyConnectionData {
///     fn new() -> Self {
///         Self {
///             user_id: None,
///             request_count: 0,
///             cache: HashMap::new(),
///         }
///     }
///
///     fn reset(&mut self) {
///         self.user_id = None;
///         self.request_count = 0;
///         self.cache.clear(); // Saving the allocated memory
///     }
/// }
/// ```
///
/// Check out a [real-world example
/// ](https://github.com/microhive-rs/microhive/blob/main/demos/request_counter.rs)
/// (well, almost)
pub trait ConnectionData: Sync + Send + 'static {
    /// Creates a new instance of user data.
    ///
    /// It is called once at server startup, which avoids runtime allocations.
    fn new() -> Self;

    /// Resets the internal state of the instance to its initial values.
    ///
    /// It is called after the connection is closed. Allows repeated
    /// use of the instance for the following connections. If implemented
    /// correctly, avoids any allocations.
    fn reset(&mut self);
}

impl ConnectionData for () {
    #[inline(always)]
    fn new() -> Self {}

    #[inline(always)]
    fn reset(&mut self) {}
}

/// A trait for filtering TCP connections before HTTP processing.
///
/// # Examples
///
/// Simple IP Blacklist:
/// ```
/// use std::{collections::HashSet, net::{SocketAddr, IpAddr}};
/// use microhive::{Server, ConnectionFilter, Response, Handled, StatusCode};
///
/// struct MyConnFilter {
///     blacklist: HashSet<IpAddr>
/// }
///
/// impl ConnectionFilter for MyConnFilter {
///     fn filter(
///         &self, client_addr: SocketAddr, _: SocketAddr, err_resp: &mut Response
///     ) -> Result<(), Handled> {
///         if self.blacklist.contains(&client_addr.ip()) {
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("Your IP is permanently banned"))
///         } else {
///             Ok(())
///         }
///     }
/// }
/// ```
/// File-based IP blacklist:
/// ```
/// use std::net::SocketAddr;
/// use microhive::{Server, ConnectionFilter, Response, Handled, StatusCode};
///
/// # struct DatabaseClient;
/// #
/// # impl DatabaseClient {
/// #     async fn execute(&self, _: &str) -> Option<Vec<&str>> {
/// #         Some(vec!["true"])
/// #     }
/// # }
/// #
/// #
/// struct MyConnFilter {
///     db: DatabaseClient
/// }
///
/// impl ConnectionFilter for MyConnFilter {
///     fn filter(&self, _: SocketAddr, _: SocketAddr, _: &mut Response) -> Result<(), Handled> {
///         Ok(())
///     }
///
///     async fn filter_async(
///         &self,
///         client_addr: SocketAddr,
///         _: SocketAddr,
///         err_resp: &mut Response,
///     ) -> Result<(), Handled> {
///         let request = format!(
///             "SELECT EXISTS (SELECT 1 FROM ip_blacklist WHERE ip_address = '{}')",
///             client_addr.ip()
///         );
///
///         if self.db.execute(&request).await == Some(vec!["false"]) {
///             Ok(()) // IP not found in blacklist
///         } else {
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("IP found in blacklist file"))
///         }
///     }
/// }
/// ```
/// Two-stage filtering with cache:
/// ```
/// use std::{collections::HashSet, sync::RwLock, net::{SocketAddr, IpAddr}};
/// use microhive::{Server, ConnectionFilter, Response, Handled, StatusCode};
///
/// # struct DatabaseClient;
/// #
/// # impl DatabaseClient {
/// #     async fn execute(&self, _: &str) -> Option<Vec<&str>> {
/// #         Some(vec!["true"])
/// #     }
/// # }
/// #
/// #
/// struct MyConnFilter {
///     cache: RwLock<HashSet<IpAddr>>,
///     db: DatabaseClient,
/// }
///
/// impl ConnectionFilter for MyConnFilter {
///     fn filter(
///         &self, client_addr: SocketAddr, _: SocketAddr, err_resp: &mut Response
///     ) -> Result<(), Handled> {
///         let Ok(guard) = self.cache.read() else {
///             return Err(err_resp.status(StatusCode::InternalServerError)
///                 .body("Internal server error"));
///         };
///
///         if guard.contains(&client_addr.ip()) {
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("Your IP is permanently banned"))
///         } else {
///             Ok(())
///         }
///     }
///
///     async fn filter_async(
///         &self,
///         client_addr: SocketAddr,
///         _: SocketAddr,
///         err_resp: &mut Response,
///     ) -> Result<(), Handled> {
///         let request = format!(
///             "SELECT EXISTS (SELECT 1 FROM ip_blacklist WHERE ip_address = '{}')",
///             client_addr.ip()
///         );
///
///         if self.db.execute(&request).await == Some(vec!["false"]) {
///             Ok(()) // IP not found in blacklist
///         } else {
///             let Ok(mut guard) = self.cache.write() else {
///                 return Err(err_resp.status(StatusCode::InternalServerError)
///                     .body("Internal server error"));
///             };
///             guard.insert(client_addr.ip());
///
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("IP found in blacklist file"))
///         }
///     }
/// }
/// ```
/// # Connection Filter Architecture
/// ```text
///                     [ QUEUE TCP_STREAM ]
///                              ||
/// /----------------------------||----------------------------------\
/// |                            || TCP_STREAM            Tokio Task |
/// |       /=====================/                                  |
/// |       \/                                                       |
/// |   [--------]   Err(Handled)   [----------------------]         |
/// |   [ filter ] ===============> [ Send `error_response`]         |
/// |   [--------]                  [----------------------]         |
/// |       ||                                 /\                    |
/// |       || Ok(())                          ||                    |
/// |       \/                Err(Handled)     ||                    |
/// |   [--------------] ========================/                   |
/// |   [ filter_async ]                             [-----------]   |
/// |   [--------------] ==========================> [  Handler  ]   |
/// |                             Ok(())             [-----------]   |
/// |                                                                |
/// \----------------------------------------------------------------/
/// ```
pub trait ConnectionFilter: Sync + Send + 'static {
    /// Synchronous connection validation.
    ///
    /// Perform fast, in-memory checks here. Expensive operations should be deferred
    /// to [`filter_async`](Self::filter_async).
    ///
    /// Use for:
    /// - IP blacklist/whitelist (in-memory cache)
    /// - Geographic IP restrictions
    /// - Rate limiting counters
    fn filter(
        &self,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
        error_response: &mut Response,
    ) -> Result<(), Handled>;

    /// Asynchronous connection inspection.
    ///
    /// Called after [`filter`](Self::filter) succeeds.Executes asynchronously within
    /// the Tokio runtime.
    ///
    /// Use for:
    /// - Database lookups
    /// - External API calls
    /// - File system operations
    /// - Complex business logic
    /// - Machine learning inference
    fn filter_async(
        &self,
        #[allow(unused_variables)] client_addr: SocketAddr,
        #[allow(unused_variables)] server_addr: SocketAddr,
        #[allow(unused_variables)] error_response: &mut Response,
    ) -> impl Future<Output = Result<(), Handled>> + Send {
        async { Ok(()) }
    }
}

impl ConnectionFilter for () {
    fn filter(&self, _: SocketAddr, _: SocketAddr, _: &mut Response) -> Result<(), Handled> {
        Ok(())
    }
}

//

#[cfg(test)]
mod def_handler {
    use super::*;
    use crate::{Handled, StatusCode};

    pub(crate) struct DefHandler;

    impl Handler<()> for DefHandler {
        async fn handle(&self, _: &mut (), _: &Request, r: &mut Response) -> Handled {
            r.status(StatusCode::Ok).body("test")
        }
    }

    impl HttpConnection<DefHandler, ()> {
        #[inline]
        pub(crate) fn from_req<V: AsRef<[u8]>>(value: V) -> Self {
            let req_limits = ReqLimits::default().precalculate();
            let resp_limits = RespLimits::default();

            Self {
                handler: Arc::new(DefHandler),
                connection_data: (),

                connection: Connection::new(),
                parser: Parser::from(&req_limits, value),
                request: Request::new(&req_limits),
                response: Response::new(&resp_limits),
                state: ConnState::Idle,

                server_limits: ServerLimits::default(),
                conn_limits: ConnLimits::default(),
                req_limits,
                resp_limits,
            }
        }
    }
}
