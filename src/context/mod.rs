//! Per-request context: the parsed request, the path parameters a router
//! captured, and the request-scoped log extras.
//!
//! A [`Context`] is built fresh for every request and handed by value to the
//! handler. Its [`Extras`] handle is shared with the
//! [`HandlerAdapter`](crate::handler::HandlerAdapter), which reads it back when
//! the request's single log line is written.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::http::{Request, ResponseError};

pub mod logger;
pub mod params;

pub use logger::{ContextLogger, RequestLogger};

/// Request-scoped key/value pairs that enrich the request's log line.
///
/// Cloning yields another handle onto the same map. Later inserts under the
/// same key overwrite earlier ones. The map lives only as long as the request.
///
/// # Examples
///
/// ```
/// use courier::context::Extras;
///
/// let extras = Extras::new();
/// extras.insert("user_id", 42);
/// extras.insert("user_id", 43);
/// extras.insert("tenant", "acme");
///
/// assert_eq!(extras.len(), 2);
/// assert_eq!(extras.get("user_id"), Some(serde_json::json!(43)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Extras {
    inner: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl Extras {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `value` under `key`, replacing any previous value.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.lock().insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copies the current entries out, in key order.
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        self.lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    // A panic mid-insert cannot leave the map half-written.
    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Path parameters extracted from the matched route.
#[derive(Default, Debug, Clone)]
pub struct PathParams {
    map: HashMap<String, String>,
}

impl PathParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.map.remove(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for PathParams
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            map: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Everything a handler gets to see about one request.
#[derive(Debug)]
pub struct Context {
    request: Request,
    params: PathParams,
    extras: Extras,
}

impl Context {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            params: PathParams::new(),
            extras: Extras::new(),
        }
    }

    /// Attaches the path parameters captured by the router.
    #[must_use]
    pub fn with_params(mut self, params: PathParams) -> Self {
        self.params = params;
        self
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    pub fn extras(&self) -> &Extras {
        &self.extras
    }

    /// Adds a field to this request's log line.
    pub fn set_extra(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.extras.insert(key, value);
    }

    /// Decodes the request body as JSON.
    ///
    /// # Errors
    ///
    /// A `400 Bad request` carrying the decoder's message.
    pub fn json<T>(&self) -> Result<T, ResponseError>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
            .map_err(|e| ResponseError::bad_request(format!("invalid JSON body: {e}")))
    }
}
