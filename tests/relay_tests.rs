//! End-to-end tests for plain relaying and CONNECT tunnels.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use forward_proxy::config::FilterRuleConfig;
use forward_proxy::plugin::TUNNEL_ESTABLISHED;

mod common;

fn proxied_client(proxy: std::net::SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy}")).unwrap())
        .build()
        .unwrap()
}

#[tokio::test]
async fn relays_absolute_uri_requests() {
    let upstream = common::start_echo_upstream().await;
    let (proxy, shutdown) = common::spawn_proxy(common::local_config(), None).await;

    let res = proxied_client(proxy)
        .get(format!("http://{upstream}/hello?x=1"))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 200);
    assert_eq!(res.headers()["x-upstream"], "echo");
    let body = res.text().await.unwrap();
    assert_eq!(body, format!("GET /hello?x=1 host={upstream} body="));

    shutdown.trigger();
}

#[tokio::test]
async fn relays_request_bodies() {
    let upstream = common::start_echo_upstream().await;
    let (proxy, shutdown) = common::spawn_proxy(common::local_config(), None).await;

    let res = proxied_client(proxy)
        .post(format!("http://{upstream}/submit"))
        .body("name=value")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 200);
    assert!(res.text().await.unwrap().ends_with("body=name=value"));

    shutdown.trigger();
}

#[tokio::test]
async fn upstream_failure_returns_bad_gateway() {
    let dead = common::closed_port().await;
    let (proxy, shutdown) = common::spawn_proxy(common::local_config(), None).await;

    let res = proxied_client(proxy)
        .get(format!("http://{dead}/"))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 502);
    assert!(res.text().await.unwrap().starts_with("Error: "));

    shutdown.trigger();
}

#[tokio::test]
async fn aliases_redirect_dials() {
    let upstream = common::start_echo_upstream().await;
    let mut config = common::local_config();
    config
        .network
        .aliases
        .insert("origin.test:80".into(), upstream.to_string());
    let (proxy, shutdown) = common::spawn_proxy(config, None).await;

    let res = proxied_client(proxy)
        .get("http://origin.test/aliased")
        .send()
        .await
        .unwrap();

    assert_eq!(res.text().await.unwrap(), "GET /aliased host=origin.test body=");

    shutdown.trigger();
}

#[tokio::test]
async fn connect_acknowledges_and_tunnels_bytes() {
    let upstream = common::start_echo_upstream().await;
    let (proxy, shutdown) = common::spawn_proxy(common::local_config(), None).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("CONNECT {upstream} HTTP/1.1\r\nHost: {upstream}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let mut ack = vec![0u8; TUNNEL_ESTABLISHED.len()];
    stream.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack, TUNNEL_ESTABLISHED);

    stream
        .write_all(b"GET /through HTTP/1.1\r\nHost: tunneled\r\n\r\n")
        .await
        .unwrap();
    let reply = common::read_until(&mut stream, "body=").await;
    assert!(reply.starts_with("HTTP/1.1 200 OK"));
    assert!(reply.contains("GET /through host=tunneled"));

    shutdown.trigger();
}

#[tokio::test]
async fn connect_dial_failure_returns_bad_gateway() {
    let dead = common::closed_port().await;
    let (proxy, shutdown) = common::spawn_proxy(common::local_config(), None).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("CONNECT {dead} HTTP/1.1\r\nHost: {dead}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let reply = common::read_until(&mut stream, "Error: ").await;
    assert!(reply.starts_with("HTTP/1.1 502 Bad Gateway"));

    shutdown.trigger();
}

#[tokio::test]
async fn unmatched_request_closes_without_response() {
    let upstream = common::start_echo_upstream().await;
    let mut config = common::local_config();
    let mut only = FilterRuleConfig::catch_all("only", "direct");
    only.hosts = vec!["only.test".into()];
    config.request_filters = vec![only];
    let (proxy, shutdown) = common::spawn_proxy(config, None).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("GET http://{upstream}/ HTTP/1.1\r\nHost: {upstream}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert!(out.is_empty());

    shutdown.trigger();
}

#[tokio::test]
async fn malformed_request_gets_bad_request() {
    let (proxy, shutdown) = common::spawn_proxy(common::local_config(), None).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(b"NOT A REQUEST\r\n\r\n").await.unwrap();

    let reply = common::read_until(&mut stream, "\r\n\r\n").await;
    assert!(reply.starts_with("HTTP/1.1 400 Bad Request"));

    shutdown.trigger();
}

#[tokio::test]
async fn slow_upload_outlasting_read_timeout_is_relayed() {
    let upstream = common::start_echo_upstream().await;
    let mut config = common::local_config();
    config.limits.header_read_timeout_secs = 1;
    let (proxy, shutdown) = common::spawn_proxy(config, None).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(
            format!("POST http://{upstream}/upload HTTP/1.1\r\nHost: {upstream}\r\nContent-Length: 6\r\n\r\n").as_bytes(),
        )
        .await
        .unwrap();
    for piece in [b"ab", b"cd", b"ef"] {
        tokio::time::sleep(std::time::Duration::from_millis(600)).await;
        stream.write_all(piece).await.unwrap();
    }

    let reply = common::read_until(&mut stream, "body=abcdef").await;
    assert!(reply.starts_with("HTTP/1.1 200 OK"), "{reply}");
    assert!(reply.contains("POST /upload"));

    shutdown.trigger();
}
