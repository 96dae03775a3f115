//! Request-scoped structured logging.
//!
//! [`ContextLogger::logger_for`] derives a [`RequestLogger`] for one request:
//! the client-identifying headers are sanitized and attached as fields, and the
//! request's [`Extras`] are rendered into the line when it is emitted. Nothing
//! process-wide is touched; every field travels on the event itself.
//!
//! Header values are attacker-controlled. Quotes, tabs and line breaks are
//! stripped and the length is bounded before they reach a log line, so a
//! crafted header cannot forge neighbouring fields.

use std::fmt::Write as _;

use serde_json::Value;
use tracing::Level;

use super::{Context, Extras};
use crate::config::HeaderLimits;
use crate::http::{Method, StatusCode};

/// Removes `\n`, `\r`, `\t`, `"` and `'`, then keeps at most `max_len` characters.
///
/// Idempotent: a value that is already clean and short enough comes back unchanged.
///
/// # Examples
///
/// ```
/// use courier::context::logger::sanitize;
///
/// assert_eq!(sanitize("1.2.3.4\n evil-field: x", 32), "1.2.3.4 evil-field: x");
/// assert_eq!(sanitize("\"quoted\"", 32), "quoted");
/// assert_eq!(sanitize("abcdef", 4), "abcd");
/// ```
pub fn sanitize(value: &str, max_len: usize) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '\n' | '\r' | '\t' | '"' | '\''))
        .take(max_len)
        .collect()
}

/// Derives request-scoped loggers.
#[derive(Debug, Clone, Default)]
pub struct ContextLogger {
    limits: HeaderLimits,
}

impl ContextLogger {
    pub fn new(limits: HeaderLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> HeaderLimits {
        self.limits
    }

    /// Builds the logger for the request held by `ctx`.
    ///
    /// `X-Real-IP`, `X-Forwarded-For` and `X-User-Agent-ID` become the fields
    /// `x_real_ip`, `x_forwarded_for` and `x_user_agent_id` when present and
    /// non-empty. The context's extras stay attached by handle, so values added
    /// after this call still show up.
    pub fn logger_for(&self, ctx: &Context) -> RequestLogger {
        let request = ctx.request();
        let headers = request.headers();
        let field = |name: &str, max_len: usize| {
            headers
                .get_non_empty(name)
                .map(|value| sanitize(value, max_len))
        };

        RequestLogger {
            method: request.method().clone(),
            uri: request.uri(),
            x_real_ip: field("x-real-ip", self.limits.x_real_ip),
            x_forwarded_for: field("x-forwarded-for", self.limits.x_forwarded_for),
            x_user_agent_id: field("x-user-agent-id", self.limits.x_user_agent_id),
            extras: ctx.extras().clone(),
        }
    }
}

/// A logger bound to one request.
#[derive(Debug, Clone)]
pub struct RequestLogger {
    method: Method,
    uri: String,
    x_real_ip: Option<String>,
    x_forwarded_for: Option<String>,
    x_user_agent_id: Option<String>,
    extras: Extras,
}

// `tracing` needs the level at compile time.
macro_rules! request_event {
    ($level:expr, $($rest:tt)+) => {
        if $level == Level::ERROR {
            tracing::error!($($rest)+)
        } else if $level == Level::WARN {
            tracing::warn!($($rest)+)
        } else if $level == Level::INFO {
            tracing::info!($($rest)+)
        } else if $level == Level::DEBUG {
            tracing::debug!($($rest)+)
        } else {
            tracing::trace!($($rest)+)
        }
    };
}

impl RequestLogger {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Every field this logger would attach right now, extras rendered as JSON.
    pub fn fields(&self) -> Vec<(String, String)> {
        let headers = [
            ("x_real_ip", &self.x_real_ip),
            ("x_forwarded_for", &self.x_forwarded_for),
            ("x_user_agent_id", &self.x_user_agent_id),
        ];
        headers
            .into_iter()
            .filter_map(|(name, value)| value.as_ref().map(|v| (name.to_owned(), v.clone())))
            .chain(
                self.extras
                    .snapshot()
                    .into_iter()
                    .map(|(key, value)| (key, value.to_string())),
            )
            .collect()
    }

    /// Emits one line: `"{METHOD} {uri} - {status} {detail}"` at `level`.
    ///
    /// `tracing` fixes field names at the callsite, so extras travel together
    /// in the single `extras` field as `key=<json>` pairs. Use
    /// [`fields`](Self::fields) to get one `(key, value)` pair per entry.
    pub fn log(&self, level: Level, status: StatusCode, detail: &str) {
        let extras = render_extras(&self.extras.snapshot());
        let status = status.as_u16();

        request_event!(
            level,
            method = %self.method,
            uri = %self.uri,
            status,
            x_real_ip = self.x_real_ip.as_deref(),
            x_forwarded_for = self.x_forwarded_for.as_deref(),
            x_user_agent_id = self.x_user_agent_id.as_deref(),
            extras = extras.as_deref(),
            "{} {} - {} {}",
            self.method,
            self.uri,
            status,
            detail
        );
    }
}

// `key=<json>` pairs separated by spaces; JSON escaping keeps values on one line.
fn render_extras(extras: &[(String, Value)]) -> Option<String> {
    if extras.is_empty() {
        return None;
    }
    let mut out = String::new();
    for (key, value) in extras {
        if !out.is_empty() {
            out.push(' ');
        }
        let _ = write!(out, "{key}={value}");
    }
    Some(out)
}
