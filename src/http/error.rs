//! The client-facing error taxonomy.
//!
//! Every failure a handler reports maps to one of a fixed set of
//! `(status, public message)` pairs. The free-form detailed cause travels
//! alongside for logging and is never written to the wire.

use std::fmt;

use thiserror::Error;

use super::response::{Response, ResponseWriter, WriteError};
use super::StatusCode;

/// A structured, non-leaking HTTP failure.
///
/// # Examples
///
/// ```
/// use courier::http::{ResponseError, StatusCode};
///
/// let err = ResponseError::not_found("no user with id 42");
/// assert_eq!(err.status(), StatusCode::NOT_FOUND);
/// assert_eq!(err.public_message(), "Not found");
/// assert_eq!(err.detailed_cause(), "no user with id 42");
/// ```
#[derive(Debug, Error)]
#[error("{status}: {cause}")]
pub struct ResponseError {
    status: StatusCode,
    public_message: &'static str,
    cause: String,
}

impl ResponseError {
    fn new(status: StatusCode, public_message: &'static str, cause: impl fmt::Display) -> Self {
        Self {
            status,
            public_message,
            cause: cause.to_string(),
        }
    }

    /// 400: the request was malformed or failed validation.
    pub fn bad_request(cause: impl fmt::Display) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "Bad request", cause)
    }

    /// 401: the caller is not authenticated.
    pub fn unauthorized(cause: impl fmt::Display) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized", cause)
    }

    /// 403: the caller is authenticated but not allowed.
    pub fn forbidden(cause: impl fmt::Display) -> Self {
        Self::new(StatusCode::FORBIDDEN, "Forbidden", cause)
    }

    /// 404: the addressed resource does not exist.
    pub fn not_found(cause: impl fmt::Display) -> Self {
        Self::new(StatusCode::NOT_FOUND, "Not found", cause)
    }

    /// 500: anything that is the server's fault, including responses that
    /// could not be serialized.
    pub fn internal_server_error(cause: impl fmt::Display) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", cause)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The only text a client ever sees for this error.
    pub fn public_message(&self) -> &'static str {
        self.public_message
    }

    /// Internal diagnostic text. Logged, never sent.
    pub fn detailed_cause(&self) -> &str {
        &self.cause
    }

    /// Writes the status and the public message as `text/plain`.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::Aborted`] if the sink fails mid-write.
    pub async fn write(&self, w: &mut ResponseWriter<'_>) -> Result<(), WriteError> {
        Response::text(self.public_message)
            .with_status(self.status)
            .write(w)
            .await
    }
}
