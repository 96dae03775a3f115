//! Async TCP server lifecycle using Tokio.
//!
//! A [`Server`] owns one background accept task. [`Server::start`] only
//! records the intent to listen and spawns that task; binding happens in the
//! background, and a bind failure surfaces through [`Server::health`].
//! [`Server::stop`] stops accepting, lets in-flight requests finish up to the
//! configured deadline and then closes whatever is left.
//!
//! ```text
//! Stopped ──start──▶ Starting ──bind ok──▶ Running ──stop──▶ Stopped
//!                        │
//!                        └──bind failed──▶ Failed ──start──▶ Starting
//! ```
//!
//! Each connection gets its own task. HTTP/1.1 connections are persistent by
//! default and are served until the peer closes, asks for `Connection: close`,
//! a response cannot be fully delivered, or the server shuts down.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::context::Context;
use crate::handler::Endpoint;
use crate::http::{
    Response, ResponseError, ResponseWriter, StatusCode,
    request::{Request, RequestError},
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("server is already {0}")]
    AlreadyStarted(State),

    #[error("no Tokio runtime available to run the accept loop")]
    NoRuntime,

    #[error("in-flight requests did not finish within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Where a [`Server`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Starting,
    Running,
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
        })
    }
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

// Written by the accept task, read by anyone holding the server.
#[derive(Debug)]
struct Status {
    state: State,
    fatal: Option<Arc<ServerError>>,
    local_addr: Option<SocketAddr>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The courier HTTP server.
///
/// Dropping a running server signals its accept task to stop; in-flight
/// requests still complete in the background.
///
/// # Examples
///
/// ```rust,no_run
/// use courier::config::ServerConfig;
/// use courier::context::Context;
/// use courier::handler::{HandlerAdapter, HandlerResult};
/// use courier::http::Response;
/// use courier::server::Server;
///
/// async fn hello(_ctx: Context) -> HandlerResult {
///     Ok(Response::text("Hello!"))
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ServerConfig::new().port(8080);
///     let server = Server::new(config.clone(), HandlerAdapter::new(hello).with_config(&config));
///     server.start()?;
///     // ...
///     server.health()?;
///     server.stop().await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    config: ServerConfig,
    endpoint: Arc<dyn Endpoint>,
    status: Arc<Mutex<Status>>,
    running: Mutex<Option<Running>>,
}

impl Server {
    /// Creates a stopped server. Nothing is bound until [`start`](Self::start).
    pub fn new<E: Endpoint>(config: ServerConfig, endpoint: E) -> Self {
        Self {
            config,
            endpoint: Arc::new(endpoint),
            status: Arc::new(Mutex::new(Status {
                state: State::Stopped,
                fatal: None,
                local_addr: None,
            })),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> State {
        lock(&self.status).state
    }

    /// The address actually bound, once running. Differs from the configured
    /// one when port `0` was requested.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.status).local_addr
    }

    /// Launches the accept loop in the background and returns immediately.
    ///
    /// A bind or listen failure does not show up here; it is reported by the
    /// next [`health`](Self::health) call. Starting again after a failure or a
    /// stop clears the previous error.
    ///
    /// # Errors
    ///
    /// - [`ServerError::NoRuntime`]: called outside a Tokio runtime.
    /// - [`ServerError::AlreadyStarted`]: the server is starting or running.
    pub fn start(&self) -> Result<(), ServerError> {
        let runtime = Handle::try_current().map_err(|_| ServerError::NoRuntime)?;

        let mut running = lock(&self.running);
        {
            let mut status = lock(&self.status);
            if matches!(status.state, State::Starting | State::Running) {
                return Err(ServerError::AlreadyStarted(status.state));
            }
            status.state = State::Starting;
            status.fatal = None;
            status.local_addr = None;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = runtime.spawn(accept_loop(
            self.config.bind_addr(),
            Arc::clone(&self.endpoint),
            Arc::clone(&self.status),
            shutdown_rx,
        ));
        *running = Some(Running { shutdown, task });

        info!(address = %self.config.bind_addr(), "server listening");
        Ok(())
    }

    /// Returns the last fatal listen error, or `Ok(())` while healthy.
    ///
    /// A server that was never started is healthy.
    pub fn health(&self) -> Result<(), Arc<ServerError>> {
        match &lock(&self.status).fatal {
            Some(err) => Err(Arc::clone(err)),
            None => Ok(()),
        }
    }

    /// Gracefully shuts the server down.
    ///
    /// Stops accepting, waits for in-flight requests for at most
    /// [`ServerConfig::shutdown_timeout`], then closes every remaining
    /// connection. A server that is not running stops trivially.
    ///
    /// # Errors
    ///
    /// [`ServerError::ShutdownTimeout`] if connections had to be cut off.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let Some(Running { shutdown, mut task }) = lock(&self.running).take() else {
            return Ok(());
        };

        let _ = shutdown.send(true);
        let timeout = self.config.shutdown_timeout;
        let result = match tokio::time::timeout(timeout, &mut task).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(?timeout, "graceful shutdown timed out, closing connections");
                task.abort();
                Err(ServerError::ShutdownTimeout(timeout))
            }
        };

        {
            let mut status = lock(&self.status);
            if status.state != State::Failed {
                status.state = State::Stopped;
            }
            status.local_addr = None;
        }

        info!(address = %self.config.bind_addr(), "server stopped");
        result
    }
}

/// Binds, records the outcome, then accepts until shutdown is signalled and
/// drains the connection tasks.
async fn accept_loop(
    addr: String,
    endpoint: Arc<dyn Endpoint>,
    status: Arc<Mutex<Status>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(source) => {
            error!(address = %addr, error = %source, "can't start server");
            let mut status = lock(&status);
            status.state = State::Failed;
            status.local_addr = None;
            status.fatal = Some(Arc::new(ServerError::Bind { addr, source }));
            return;
        }
    };

    let local_addr = listener.local_addr().ok();
    {
        let mut status = lock(&status);
        status.state = State::Running;
        status.local_addr = local_addr;
    }
    debug!(address = ?local_addr, "accept loop running");

    let connection_shutdown = shutdown.clone();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        // Usually fd exhaustion; let other connections close first.
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };

                debug!(peer = %peer_addr, "connection accepted");
                let endpoint = Arc::clone(&endpoint);
                let shutdown = connection_shutdown.clone();

                connections.spawn(async move {
                    if let Err(e) = handle_connection(stream, peer_addr, endpoint, shutdown).await {
                        warn!(peer = %peer_addr, error = %e, "connection closed with error");
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    debug!(in_flight = connections.len(), "draining connections");
    while connections.join_next().await.is_some() {}
}

/// Handles a single TCP connection over its lifetime.
///
/// Serves every complete request already buffered before reading again, so
/// pipelined requests arriving in one segment are all answered. Each response
/// is written straight onto the socket by the endpoint. An idle connection is
/// closed as soon as shutdown is signalled.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    endpoint: Arc<dyn Endpoint>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), io::Error> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                if read_more(&mut stream, &mut buf, peer_addr, &mut shutdown).await? {
                    continue;
                }
                break;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let mut w = ResponseWriter::new(&mut stream).keep_alive(false);
                if let Err(e) = ResponseError::bad_request(&e).write(&mut w).await {
                    debug!(peer = %peer_addr, error = %e, "could not send 400");
                }
                break;
            }
        };

        // Wait for the full body to arrive if Content-Length is set.
        let total_needed = body_offset + request.content_length().unwrap_or(0);
        if buf.len() < total_needed {
            if read_more(&mut stream, &mut buf, peer_addr, &mut shutdown).await? {
                continue;
            }
            break;
        }

        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let outcome = endpoint.serve(Context::new(request), &mut stream).await;

        // Drop the consumed request bytes from the buffer.
        let _ = buf.split_to(total_needed);

        if !keep_alive || !outcome.is_delivered() {
            debug!(peer = %peer_addr, "closing connection after response");
            break;
        }
    }

    Ok(())
}

/// Reads more bytes into `buf`. Returns `false` when the connection should
/// close: the peer hung up, shutdown was signalled, or the request grew past
/// [`MAX_REQUEST_SIZE`] (answered with a 413).
async fn read_more(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    peer_addr: SocketAddr,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<bool, io::Error> {
    let bytes_read = tokio::select! {
        read = stream.read_buf(buf) => read?,
        _ = shutdown.changed() => {
            debug!(peer = %peer_addr, "server shutting down, closing connection");
            return Ok(false);
        }
    };

    if bytes_read == 0 {
        debug!(peer = %peer_addr, "connection closed by peer");
        return Ok(false);
    }

    // Guard against excessively large requests.
    if buf.len() > MAX_REQUEST_SIZE {
        warn!(peer = %peer_addr, "request too large, sending 413");
        let mut w = ResponseWriter::new(stream).keep_alive(false);
        let response = Response::text("Request entity too large")
            .with_status(StatusCode::PAYLOAD_TOO_LARGE);
        if let Err(e) = response.write(&mut w).await {
            debug!(peer = %peer_addr, error = %e, "could not send 413");
        }
        return Ok(false);
    }

    Ok(true)
}
