//! End-to-end relaying of plain HTTP requests through the proxy.

use std::sync::Arc;

use hyper::header::HeaderValue;
use hyper::http::request::Parts;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use forward_proxy::auth::basic::encode_basic;
use forward_proxy::auth::FnValidator;
use forward_proxy::config::UserCredentials;
use forward_proxy::{FnRequestFilter, ProxyServer};

mod common;
use common::{
    closed_port, proxied_client, raw_exchange, read_response, start_proxy, test_config, MockChain,
    MockOrigin,
};

fn alice_config() -> forward_proxy::ProxyConfig {
    let mut config = test_config();
    config.auth.users.push(UserCredentials {
        username: "alice".into(),
        password: "wonderland".into(),
    });
    config
}

#[tokio::test]
async fn relays_response_bytes_unchanged() {
    let body: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
    let origin = MockOrigin::start(200, body.clone()).await;
    let (server, proxy) = start_proxy(ProxyServer::new(test_config()).unwrap()).await;

    let res = proxied_client(proxy).get(origin.url("/data?x=1")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.headers()["content-length"], "4096");
    assert_eq!(res.bytes().await.unwrap().as_ref(), body.as_slice());

    let requests = origin.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].starts_with("GET /data?x=1 HTTP/1.1\r\n"), "{}", requests[0]);

    server.stop().await;
}

#[tokio::test]
async fn origin_status_is_forwarded() {
    let origin = MockOrigin::start(404, "missing").await;
    let (server, proxy) = start_proxy(ProxyServer::new(test_config()).unwrap()).await;

    let res = proxied_client(proxy).get(origin.url("/nope")).send().await.unwrap();
    assert_eq!(res.status(), 404);
    assert_eq!(res.text().await.unwrap(), "missing");

    server.stop().await;
}

#[tokio::test]
async fn origin_form_request_uses_host_header() {
    let origin = MockOrigin::start(200, "by-host").await;
    let (server, proxy) = start_proxy(ProxyServer::new(test_config()).unwrap()).await;

    let response = raw_exchange(
        proxy,
        &format!("GET /plain HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", origin.addr),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with("by-host"));

    server.stop().await;
}

#[tokio::test]
async fn unreachable_origin_is_bad_gateway() {
    let port = closed_port().await;
    let (server, proxy) = start_proxy(ProxyServer::new(test_config()).unwrap()).await;

    let res = proxied_client(proxy)
        .get(format!("http://127.0.0.1:{}/", port))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 502);
    assert_eq!(res.headers()["x-proxy-error"], "connect-failed");

    server.stop().await;
}

#[tokio::test]
async fn unresolvable_origin_is_reported_as_dns_failure() {
    let (server, proxy) = start_proxy(ProxyServer::new(test_config()).unwrap()).await;

    let res = proxied_client(proxy)
        .get("http://no-such-host.invalid/")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 502);
    assert_eq!(res.headers()["x-proxy-error"], "dns-resolution");

    server.stop().await;
}

#[tokio::test]
async fn origin_hanging_up_is_reported_as_upstream_closed() {
    let origin = MockOrigin::start_hangup().await;
    let (server, proxy) = start_proxy(ProxyServer::new(test_config()).unwrap()).await;

    let res = proxied_client(proxy).get(origin.url("/")).send().await.unwrap();
    assert_eq!(res.status(), 502);
    assert_eq!(res.headers()["x-proxy-error"], "upstream-closed");
    assert_eq!(origin.requests().len(), 1);

    server.stop().await;
}

#[tokio::test]
async fn request_filter_rewrites_head_before_forwarding() {
    let origin = MockOrigin::start(200, "ok").await;
    let server = ProxyServer::new(test_config()).unwrap();
    server
        .set_request_filter(Arc::new(FnRequestFilter::new(|parts: &mut Parts| {
            parts.headers.insert("x-rewritten", HeaderValue::from_static("yes"));
            parts.headers.remove("x-secret");
        })))
        .unwrap();
    let (server, proxy) = start_proxy(server).await;

    let res = proxied_client(proxy)
        .get(origin.url("/"))
        .header("x-secret", "hunter2")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    let head = origin.requests()[0].to_ascii_lowercase();
    assert!(head.contains("x-rewritten: yes"), "{}", head);
    assert!(!head.contains("x-secret"), "{}", head);

    let late = server.set_request_filter(Arc::new(FnRequestFilter::new(|_: &mut Parts| {})));
    assert_eq!(late.unwrap_err().kind(), "configuration");

    server.stop().await;
}

#[tokio::test]
async fn missing_credentials_get_a_challenge() {
    let origin = MockOrigin::start(200, "secret").await;
    let mut config = test_config();
    config.auth.realm = "tests".into();
    config.auth.users.push(UserCredentials {
        username: "alice".into(),
        password: "wonderland".into(),
    });
    let (server, proxy) = start_proxy(ProxyServer::new(config).unwrap()).await;

    let res = proxied_client(proxy).get(origin.url("/")).send().await.unwrap();
    assert_eq!(res.status(), 407);
    assert_eq!(res.headers()["proxy-authenticate"], "Basic realm=\"tests\"");
    assert!(origin.requests().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn valid_credentials_are_relayed_and_not_forwarded() {
    let origin = MockOrigin::start(200, "secret").await;
    let mut config = test_config();
    config.auth.users.push(UserCredentials {
        username: "alice".into(),
        password: "wonderland".into(),
    });
    let (server, proxy) = start_proxy(ProxyServer::new(config).unwrap()).await;

    let client = reqwest::Client::builder()
        .proxy(
            reqwest::Proxy::all(format!("http://{}", proxy))
                .unwrap()
                .basic_auth("alice", "wonderland"),
        )
        .build()
        .unwrap();
    let res = client.get(origin.url("/")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "secret");

    let head = origin.requests()[0].to_ascii_lowercase();
    assert!(!head.contains("proxy-authorization"), "{}", head);

    server.stop().await;
}

#[tokio::test]
async fn denial_closes_the_connection_when_configured() {
    let origin = MockOrigin::start(200, "secret").await;
    let mut config = alice_config();
    config.auth.close_on_denial = true;
    let (server, proxy) = start_proxy(ProxyServer::new(config).unwrap()).await;

    // no Connection: close from the client, the proxy has to end it
    let response = raw_exchange(
        proxy,
        &format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", origin.url("/"), origin.addr),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 407"), "{}", response);
    assert!(response.to_ascii_lowercase().contains("connection: close"), "{}", response);
    assert!(origin.requests().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn client_can_retry_with_credentials_on_the_same_connection() {
    let origin = MockOrigin::start(200, "secret").await;
    let (server, proxy) = start_proxy(ProxyServer::new(alice_config()).unwrap()).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let first = format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", origin.url("/"), origin.addr);
    stream.write_all(first.as_bytes()).await.unwrap();
    let denied = read_response(&mut stream).await;
    assert!(denied.starts_with("HTTP/1.1 407"), "{}", denied);

    let retry = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nProxy-Authorization: {}\r\n\r\n",
        origin.url("/"),
        origin.addr,
        encode_basic("alice", "wonderland")
    );
    stream.write_all(retry.as_bytes()).await.unwrap();
    let allowed = read_response(&mut stream).await;
    assert!(allowed.starts_with("HTTP/1.1 200"), "{}", allowed);
    assert!(allowed.ends_with("secret"), "{}", allowed);
    assert_eq!(origin.requests().len(), 1);

    server.stop().await;
}

#[tokio::test]
async fn any_accepting_validator_authorizes() {
    let origin = MockOrigin::start(200, "ok").await;
    let server = ProxyServer::new(test_config()).unwrap();
    server.add_auth_validator(Arc::new(FnValidator::new(|_: Option<&str>| false)));
    server.add_auth_validator(Arc::new(FnValidator::new(|creds: Option<&str>| {
        creds == Some(encode_basic("bob", "builder").as_str())
    })));
    let (server, proxy) = start_proxy(server).await;

    let denied = raw_exchange(
        proxy,
        &format!("GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", origin.url("/"), origin.addr),
    )
    .await;
    assert!(denied.starts_with("HTTP/1.1 407"), "{}", denied);

    let allowed = raw_exchange(
        proxy,
        &format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nProxy-Authorization: {}\r\nConnection: close\r\n\r\n",
            origin.url("/"),
            origin.addr,
            encode_basic("bob", "builder")
        ),
    )
    .await;
    assert!(allowed.starts_with("HTTP/1.1 200"), "{}", allowed);

    server.stop().await;
}

#[tokio::test]
async fn validators_added_while_running_take_effect() {
    let origin = MockOrigin::start(200, "ok").await;
    let (server, proxy) = start_proxy(ProxyServer::new(test_config()).unwrap()).await;
    let client = proxied_client(proxy);

    assert_eq!(client.get(origin.url("/")).send().await.unwrap().status(), 200);

    server.add_auth_validator(Arc::new(FnValidator::new(|_: Option<&str>| false)));
    assert_eq!(client.get(origin.url("/")).send().await.unwrap().status(), 407);

    server.stop().await;
}

#[tokio::test]
async fn chained_requests_go_to_the_chain_in_absolute_form() {
    let chain = MockChain::start("via-chain", false).await;
    let mut config = test_config();
    config.chain.proxy = Some(chain.addr.to_string());
    let (server, proxy) = start_proxy(ProxyServer::new(config).unwrap()).await;

    let res = proxied_client(proxy)
        .get("http://origin.example:8081/resource")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "via-chain");

    let requests = chain.requests();
    assert_eq!(requests.len(), 1);
    assert!(
        requests[0].starts_with("GET http://origin.example:8081/resource HTTP/1.1\r\n"),
        "{}",
        requests[0]
    );

    server.stop().await;
}
