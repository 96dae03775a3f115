//! # courier
//!
//! An async HTTP/1.1 response and request-lifecycle layer.
//!
//! A handler returns one typed result, either a [`Response`] or a
//! [`ResponseError`]. The [`HandlerAdapter`] serializes it according to its
//! content type, writes it exactly once and emits exactly one log line
//! enriched with sanitized client headers and request extras. The [`Server`]
//! owns the listening socket: non-blocking start, health check, graceful stop.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use courier::{Context, HandlerAdapter, HandlerResult, Response, ResponseError, Server, ServerConfig};
//!
//! async fn get_item(ctx: Context) -> HandlerResult {
//!     let id = ctx.query_i64("id")?;
//!     if id != 1 {
//!         return Err(ResponseError::not_found(format!("item {id} does not exist")));
//!     }
//!     Ok(Response::json(serde_json::json!({ "id": id })))
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::new().port(8080);
//!     let server = Server::new(config.clone(), HandlerAdapter::new(get_item).with_config(&config));
//!     server.start()?;
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod handler;
pub mod http;
pub mod server;

pub use config::{HeaderLimits, ServerConfig};
pub use context::{Context, ContextLogger, Extras};
pub use handler::{Endpoint, Handler, HandlerAdapter, HandlerResult, Outcome};
pub use http::{ContentType, Headers, Method, Request, Response, ResponseError, StatusCode};
pub use server::{Server, ServerError};
