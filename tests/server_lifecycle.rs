mod common;

use std::net::SocketAddr;
use std::time::Duration;

use common::{Capture, split_response};
use courier::server::State;
use courier::{Context, HandlerAdapter, HandlerResult, Response, Server, ServerConfig, ServerError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

async fn hello(_ctx: Context) -> HandlerResult {
    Ok(Response::text("hello"))
}

async fn slow(_ctx: Context) -> HandlerResult {
    sleep(Duration::from_millis(200)).await;
    Ok(Response::text("slow"))
}

async fn stuck(_ctx: Context) -> HandlerResult {
    sleep(Duration::from_secs(30)).await;
    Ok(Response::text("never"))
}

fn config() -> ServerConfig {
    ServerConfig::new().port(0)
}

async fn wait_running(server: &Server) -> SocketAddr {
    for _ in 0..200 {
        if let (State::Running, Some(addr)) = (server.state(), server.local_addr()) {
            return addr;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("server did not reach the running state: {:?}", server.state());
}

async fn request(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut wire = Vec::new();
    stream.read_to_end(&mut wire).await.unwrap();
    String::from_utf8_lossy(&wire).into_owned()
}

// Reads until `needle` shows up, leaving the connection open.
async fn read_until(stream: &mut TcpStream, needle: &str) -> String {
    let mut wire = Vec::new();
    let mut chunk = [0u8; 1024];
    while !String::from_utf8_lossy(&wire).contains(needle) {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before {needle:?} arrived");
        wire.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8_lossy(&wire).into_owned()
}

#[tokio::test]
async fn serves_requests_until_stopped() {
    let (capture, _guard) = Capture::install();
    let server = Server::new(config(), HandlerAdapter::new(hello));
    server.start().unwrap();
    let addr = wait_running(&server).await;
    assert!(server.health().is_ok());

    let wire = request(addr, "GET /greeting HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n").await;
    let (head, body) = split_response(wire.as_bytes());
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert!(head.contains("Connection: close"));
    assert_eq!(body, "hello");

    server.stop().await.unwrap();
    assert_eq!(server.state(), State::Stopped);
    assert_eq!(server.local_addr(), None);
    assert!(TcpStream::connect(addr).await.is_err());

    let lines = capture.request_lines();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].message, "GET /greeting - 200 OK");
}

#[tokio::test]
async fn keep_alive_serves_several_requests_per_connection() {
    let server = Server::new(config(), HandlerAdapter::new(hello));
    server.start().unwrap();
    let addr = wait_running(&server).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET /one HTTP/1.1\r\nHost: test\r\n\r\n").await.unwrap();
    let first = read_until(&mut stream, "\r\n\r\nhello").await;
    assert!(first.contains("Connection: keep-alive"));

    stream
        .write_all(b"GET /two HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(String::from_utf8_lossy(&rest).ends_with("\r\n\r\nhello"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_request_gets_400() {
    let server = Server::new(config(), HandlerAdapter::new(hello));
    server.start().unwrap();
    let addr = wait_running(&server).await;

    let wire = request(addr, "GET / HTTP/9.9\r\n\r\n").await;
    let (head, body) = split_response(wire.as_bytes());
    assert!(head.starts_with("HTTP/1.1 400 Bad Request"));
    assert_eq!(body, "Bad request");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn bind_failure_is_reported_by_health() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let server = Server::new(config().port(port), HandlerAdapter::new(hello));
    assert!(server.start().is_ok());

    let mut health = server.health();
    for _ in 0..200 {
        if health.is_err() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
        health = server.health();
    }
    let err = health.unwrap_err();
    assert!(matches!(*err, ServerError::Bind { .. }), "{err}");
    assert_eq!(server.state(), State::Failed);

    server.stop().await.unwrap();
    assert!(server.health().is_err());

    // A fresh start clears the previous failure.
    drop(occupied);
    server.start().unwrap();
    wait_running(&server).await;
    assert!(server.health().is_ok());
    server.stop().await.unwrap();
}

#[tokio::test]
async fn stop_lets_in_flight_requests_finish() {
    let server = Server::new(config(), HandlerAdapter::new(slow));
    server.start().unwrap();
    let addr = wait_running(&server).await;

    let client = tokio::spawn(request(
        addr,
        "GET /report HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n",
    ));
    sleep(Duration::from_millis(50)).await;

    server.stop().await.unwrap();
    let wire = client.await.unwrap();
    assert!(wire.ends_with("\r\n\r\nslow"));
}

#[tokio::test]
async fn stop_gives_up_after_the_deadline() {
    let (capture, _guard) = Capture::install();
    let config = config().shutdown_timeout(Duration::from_millis(100));
    let server = Server::new(config, HandlerAdapter::new(stuck));
    server.start().unwrap();
    let addr = wait_running(&server).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /stuck HTTP/1.1\r\nHost: test\r\n\r\n")
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    let err = server.stop().await.unwrap_err();
    assert!(matches!(err, ServerError::ShutdownTimeout(d) if d == Duration::from_millis(100)));
    assert_eq!(server.state(), State::Stopped);

    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest).await;
    assert!(rest.is_empty());

    let lines = capture.request_lines();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].level, tracing::Level::ERROR);
    assert_eq!(lines[0].field("status"), Some("503"));
    assert!(lines[0].message.starts_with("GET /stuck - 503 request cancelled"));
}

#[tokio::test]
async fn pipelined_requests_in_one_segment_are_all_served() {
    let (capture, _guard) = Capture::install();
    let server = Server::new(config(), HandlerAdapter::new(hello));
    server.start().unwrap();
    let addr = wait_running(&server).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /a HTTP/1.1\r\nHost: test\r\n\r\nGET /b HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut wire = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut wire))
        .await
        .expect("both responses within the deadline")
        .unwrap();
    let wire = String::from_utf8_lossy(&wire);
    assert_eq!(wire.matches("HTTP/1.1 200 OK").count(), 2);

    let messages: Vec<_> = capture.request_lines().into_iter().map(|l| l.message).collect();
    assert_eq!(messages, vec!["GET /a - 200 OK", "GET /b - 200 OK"]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn head_request_gets_headers_only() {
    let server = Server::new(config(), HandlerAdapter::new(hello));
    server.start().unwrap();
    let addr = wait_running(&server).await;

    let wire = request(addr, "HEAD / HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n").await;
    let (head, body) = split_response(wire.as_bytes());
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert!(head.contains("Content-Length: 5"));
    assert!(body.is_empty());

    server.stop().await.unwrap();
}
