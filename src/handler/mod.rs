//! Handler adaptation: from a typed business result to bytes on the wire and
//! exactly one log line.
//!
//! ## Core types
//!
//! - [`Handler`]: business logic, `Context -> Result<Response, ResponseError>`.
//!   Any matching async closure implements it.
//! - [`Endpoint`]: the wire-level contract the server dispatches to. Routers
//!   implement it to pick an endpoint per request.
//! - [`HandlerAdapter`]: turns a [`Handler`] into an [`Endpoint`]. It invokes
//!   the handler once, writes whichever result came back, falls back to the
//!   carried error when the response cannot be serialized, and logs the final
//!   outcome after the write.
//! - [`Outcome`]: what actually happened, and the severity it is logged at.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tracing::Level;

use crate::config::ServerConfig;
use crate::context::{Context, ContextLogger, RequestLogger};
use crate::http::{Method, Response, ResponseError, ResponseWriter, StatusCode, WriteError};

/// What a business handler returns: a success payload or a structured error.
pub type HandlerResult = Result<Response, ResponseError>;

/// Business logic for one route.
///
/// Any `Fn(Context) -> impl Future<Output = HandlerResult> + Send` that is
/// also `Send + Sync + 'static` implements this trait automatically.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
}

impl<T, F> Handler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> {
        Box::pin((self)(ctx))
    }
}

/// A wire-level request handler: consumes the request context, writes the
/// response to `sink` and reports what happened.
pub trait Endpoint: Send + Sync + 'static {
    fn serve<'a>(
        &'a self,
        ctx: Context,
        sink: &'a mut (dyn AsyncWrite + Send + Unpin),
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>>;
}

impl<E: Endpoint + ?Sized> Endpoint for Arc<E> {
    fn serve<'a>(
        &'a self,
        ctx: Context,
        sink: &'a mut (dyn AsyncWrite + Send + Unpin),
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        (**self).serve(ctx, sink)
    }
}

/// The final result of one request, as written and logged.
#[derive(Debug)]
pub enum Outcome {
    /// The handler's response went out completely.
    Success {
        status: StatusCode,
        message: Option<String>,
    },
    /// An error response was written, either the handler's own or the one
    /// produced while serializing its response. `delivered` is `false` when
    /// the sink failed while sending it.
    Failure {
        error: ResponseError,
        delivered: bool,
    },
    /// The response was committed but could not be finished: the sink closed,
    /// the body source failed, or the write deadline passed.
    Aborted { error: WriteError },
}

impl Outcome {
    /// The status code the client was sent (or was being sent).
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Success { status, .. } => *status,
            Self::Failure { error, .. } => error.status(),
            Self::Aborted { error } => match error {
                WriteError::Aborted { status, .. } | WriteError::AlreadyCommitted(status) => {
                    *status
                }
                WriteError::Rejected(err) => err.status(),
            },
        }
    }

    /// `true` when the connection is still in a known-good state.
    pub fn is_delivered(&self) -> bool {
        match self {
            Self::Success { .. } => true,
            Self::Failure { delivered, .. } => *delivered,
            Self::Aborted { .. } => false,
        }
    }

    /// Log severity: successes are info, errors are error at 5xx and warn
    /// below, and aborted writes are warn.
    pub fn level(&self) -> Level {
        match self {
            Self::Success { .. } => Level::INFO,
            Self::Failure { error, .. } => error_level(error.status()),
            Self::Aborted { .. } => Level::WARN,
        }
    }

    /// The text after the status in the log line.
    pub fn detail(&self) -> String {
        match self {
            Self::Success { message, .. } => message.clone().unwrap_or_else(|| "OK".to_owned()),
            Self::Failure {
                error,
                delivered: true,
            } => error.detailed_cause().to_owned(),
            Self::Failure {
                error,
                delivered: false,
            } => format!("{} (error response not delivered)", error.detailed_cause()),
            Self::Aborted { error } => error.to_string(),
        }
    }
}

/// Severity for an error response with the given status.
pub fn error_level(status: StatusCode) -> Level {
    if status.is_server_error() {
        Level::ERROR
    } else {
        Level::WARN
    }
}

/// Adapts a [`Handler`] into an [`Endpoint`].
///
/// # Examples
///
/// ```rust,no_run
/// use courier::handler::{HandlerAdapter, HandlerResult};
/// use courier::context::Context;
/// use courier::http::{Response, ResponseError};
///
/// async fn get_user(ctx: Context) -> HandlerResult {
///     let id = ctx.path_i64("id")?;
///     ctx.set_extra("user_id", id);
///     if id != 1 {
///         return Err(ResponseError::not_found(format!("no user {id}")));
///     }
///     Ok(Response::json(serde_json::json!({ "id": id })))
/// }
///
/// let endpoint = HandlerAdapter::new(get_user);
/// ```
pub struct HandlerAdapter<H> {
    handler: H,
    loggers: ContextLogger,
    write_timeout: Option<Duration>,
}

impl<H: Handler> HandlerAdapter<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            loggers: ContextLogger::default(),
            write_timeout: None,
        }
    }

    /// Uses `loggers` (and its header limits) to derive request loggers.
    #[must_use]
    pub fn with_logger(mut self, loggers: ContextLogger) -> Self {
        self.loggers = loggers;
        self
    }

    /// Aborts a response write that takes longer than `timeout`.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Takes the header limits and write deadline from `config`.
    #[must_use]
    pub fn with_config(mut self, config: &ServerConfig) -> Self {
        self.loggers = ContextLogger::new(config.header_limits);
        self.write_timeout = config.write_timeout;
        self
    }

    /// Runs the handler for `ctx`, writes the result to `w` and logs it once.
    ///
    /// The log line is emitted after the write settles, so its status is the
    /// one the client actually received. If this future is dropped first (the
    /// server cut the connection off at its shutdown deadline), the line is
    /// still written, as a cancelled request.
    pub async fn dispatch(&self, ctx: Context, w: &mut ResponseWriter<'_>) -> Outcome {
        let mut line = PendingLine::new(self.loggers.logger_for(&ctx));

        let outcome = match self.handler.call(ctx).await {
            Err(error) => {
                line.status = Some(error.status());
                self.deliver_error(error, w).await
            }
            Ok(response) => {
                let status = response.status();
                line.status = Some(status);
                let message = response.detailed_message().map(str::to_owned);
                let written = self.bounded(response.write(w)).await;
                match written.unwrap_or_else(|| Err(self.deadline_error(status, w))) {
                    Ok(()) => Outcome::Success { status, message },
                    Err(WriteError::Rejected(error)) => {
                        line.status = Some(error.status());
                        self.deliver_error(error, w).await
                    }
                    Err(error) => Outcome::Aborted { error },
                }
            }
        };

        line.emit(&outcome);
        outcome
    }

    async fn deliver_error(&self, error: ResponseError, w: &mut ResponseWriter<'_>) -> Outcome {
        let delivered = matches!(self.bounded(error.write(w)).await, Some(Ok(())));
        Outcome::Failure { error, delivered }
    }

    // `None` when the write deadline elapsed first.
    async fn bounded<F>(&self, write: F) -> Option<Result<(), WriteError>>
    where
        F: Future<Output = Result<(), WriteError>>,
    {
        match self.write_timeout {
            None => Some(write.await),
            Some(limit) => tokio::time::timeout(limit, write).await.ok(),
        }
    }

    fn deadline_error(&self, status: StatusCode, w: &ResponseWriter<'_>) -> WriteError {
        let limit = self.write_timeout.unwrap_or_default();
        WriteError::Aborted {
            status: w.committed().unwrap_or(status),
            bytes_written: w.bytes_written(),
            source: io::Error::new(
                io::ErrorKind::TimedOut,
                format!("write deadline of {limit:?} elapsed"),
            ),
        }
    }
}

// Guarantees the request's line even when `dispatch` never finishes.
struct PendingLine {
    logger: RequestLogger,
    status: Option<StatusCode>,
    emitted: bool,
}

impl PendingLine {
    fn new(logger: RequestLogger) -> Self {
        Self {
            logger,
            status: None,
            emitted: false,
        }
    }

    fn emit(&mut self, outcome: &Outcome) {
        self.emitted = true;
        self.logger
            .log(outcome.level(), outcome.status(), &outcome.detail());
    }
}

impl Drop for PendingLine {
    fn drop(&mut self) {
        if self.emitted {
            return;
        }
        match self.status {
            Some(status) => self.logger.log(
                Level::WARN,
                status,
                "request cancelled while the response was being written",
            ),
            None => self.logger.log(
                error_level(StatusCode::SERVICE_UNAVAILABLE),
                StatusCode::SERVICE_UNAVAILABLE,
                "request cancelled before the handler returned",
            ),
        }
    }
}

impl<H: Handler> Endpoint for HandlerAdapter<H> {
    fn serve<'a>(
        &'a self,
        ctx: Context,
        sink: &'a mut (dyn AsyncWrite + Send + Unpin),
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            let keep_alive = ctx.request().is_keep_alive();
            let head_only = *ctx.request().method() == Method::Head;
            let mut w = ResponseWriter::new(sink)
                .keep_alive(keep_alive)
                .head_only(head_only);
            self.dispatch(ctx, &mut w).await
        })
    }
}
