//! Minimal server with a couple of adapted handlers.
//!
//! ```text
//! cargo run --example hello
//! curl -i 'http://127.0.0.1:8080/?id=1'
//! curl -i 'http://127.0.0.1:8080/?id=abc'
//! ```

use courier::{Context, HandlerAdapter, HandlerResult, Response, ResponseError, Server, ServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn lookup(ctx: Context) -> HandlerResult {
    let id = ctx.query_i64("id")?;
    ctx.set_extra("item_id", id);

    match ctx.request().path() {
        "/" if id == 1 => Ok(Response::json(serde_json::json!({ "id": id, "name": "lamp" }))),
        "/" => Err(ResponseError::not_found(format!("no item with id {id}"))),
        "/report.csv" => Ok(Response::csv("id,name\n1,lamp\n")),
        other => Err(ResponseError::not_found(format!("no route for {other}"))),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::new().port(8080);
    let server = Server::new(config.clone(), HandlerAdapter::new(lookup).with_config(&config));
    server.start()?;

    tokio::signal::ctrl_c().await?;
    server.health()?;
    server.stop().await?;
    Ok(())
}
