//! Typed access to query and path parameters.
//!
//! Each accessor turns a malformed value into a `400 Bad request` whose
//! detailed cause names the parameter and the offending value, so handlers can
//! simply `?` it.

use std::fmt;
use std::str::FromStr;

use super::Context;
use crate::http::ResponseError;

/// Parses a boolean the way configuration flags usually arrive:
/// `1 t T TRUE true True` and `0 f F FALSE false False`.
///
/// # Examples
///
/// ```
/// use courier::context::params::parse_bool;
///
/// assert_eq!(parse_bool("T"), Ok(true));
/// assert_eq!(parse_bool("0"), Ok(false));
/// assert!(parse_bool("yes").is_err());
/// ```
pub fn parse_bool(value: &str) -> Result<bool, InvalidBool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        _ => Err(InvalidBool),
    }
}

/// Error returned by [`parse_bool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidBool;

impl fmt::Display for InvalidBool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid syntax")
    }
}

impl std::error::Error for InvalidBool {}

#[derive(Clone, Copy)]
enum Source {
    Query,
    Url,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query => f.write_str("query"),
            Self::Url => f.write_str("url"),
        }
    }
}

fn coerce<T, E>(
    source: Source,
    name: &str,
    raw: &str,
    parse: impl FnOnce(&str) -> Result<T, E>,
) -> Result<T, ResponseError>
where
    E: fmt::Display,
{
    parse(raw).map_err(|e| {
        ResponseError::bad_request(format!(
            "Invalid {source} param {name} (value: '{raw}'): {e}"
        ))
    })
}

impl Context {
    fn query_raw(&self, name: &str) -> &str {
        self.request().query_param(name).unwrap_or("")
    }

    fn path_raw(&self, name: &str) -> &str {
        self.params().get(name).unwrap_or("")
    }

    /// Required integer query parameter.
    pub fn query_i64(&self, name: &str) -> Result<i64, ResponseError> {
        coerce(Source::Query, name, self.query_raw(name), i64::from_str)
    }

    /// Integer query parameter; absent or empty yields `None`.
    pub fn optional_query_i64(&self, name: &str) -> Result<Option<i64>, ResponseError> {
        match self.query_raw(name) {
            "" => Ok(None),
            raw => coerce(Source::Query, name, raw, i64::from_str).map(Some),
        }
    }

    /// Required boolean query parameter, see [`parse_bool`].
    pub fn query_bool(&self, name: &str) -> Result<bool, ResponseError> {
        coerce(Source::Query, name, self.query_raw(name), parse_bool)
    }

    /// Boolean query parameter; absent or empty yields `None`.
    pub fn optional_query_bool(&self, name: &str) -> Result<Option<bool>, ResponseError> {
        match self.query_raw(name) {
            "" => Ok(None),
            raw => coerce(Source::Query, name, raw, parse_bool).map(Some),
        }
    }

    /// Required integer path parameter captured by the router.
    pub fn path_i64(&self, name: &str) -> Result<i64, ResponseError> {
        coerce(Source::Url, name, self.path_raw(name), i64::from_str)
    }

    /// Required boolean path parameter captured by the router.
    pub fn path_bool(&self, name: &str) -> Result<bool, ResponseError> {
        coerce(Source::Url, name, self.path_raw(name), parse_bool)
    }
}
