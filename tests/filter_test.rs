//! Response filters applied to live traffic.

use bytes::Bytes;
use hyper::header::HeaderValue;
use hyper::Response;
use std::collections::HashMap;
use std::sync::Arc;

use forward_proxy::config::OverflowPolicy;
use forward_proxy::{FnFilter, HttpFilter, ProxyServer};

mod common;
use common::{proxied_client, raw_exchange, start_proxy, test_config, MockOrigin};

fn uppercase(limit: usize) -> Arc<dyn HttpFilter> {
    Arc::new(FnFilter::new(limit, |response: Response<Bytes>, _uri: &str| {
        response.map(|body| Bytes::from(body.to_ascii_uppercase()))
    }))
}

fn tagging(tag: &'static str) -> Arc<dyn HttpFilter> {
    Arc::new(FnFilter::new(1024, move |mut response: Response<Bytes>, _uri: &str| {
        response
            .headers_mut()
            .append("x-filtered-by", HeaderValue::from_static(tag));
        response
    }))
}

#[tokio::test]
async fn filter_rewrites_body_and_length() {
    let origin = MockOrigin::start(200, "hello filters").await;
    let server = ProxyServer::new(test_config()).unwrap();
    server.add_filter(&origin.key(), uppercase(1024)).unwrap();
    let (server, proxy) = start_proxy(server).await;

    let res = proxied_client(proxy).get(origin.url("/")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.headers()["content-length"], "13");
    assert_eq!(res.text().await.unwrap(), "HELLO FILTERS");

    server.stop().await;
}

#[tokio::test]
async fn filters_run_in_registration_order() {
    let origin = MockOrigin::start(200, "x").await;
    let mut filters: HashMap<String, Vec<Arc<dyn HttpFilter>>> = HashMap::new();
    filters.insert(origin.key(), vec![tagging("first"), tagging("second")]);
    let server = ProxyServer::with_filters(test_config(), &filters).unwrap();
    let (server, proxy) = start_proxy(server).await;

    let res = proxied_client(proxy).get(origin.url("/")).send().await.unwrap();
    let tags: Vec<_> = res
        .headers()
        .get_all("x-filtered-by")
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();
    assert_eq!(tags, ["first", "second"]);

    server.stop().await;
}

#[tokio::test]
async fn other_destinations_are_untouched() {
    let filtered = MockOrigin::start(200, "filtered").await;
    let plain = MockOrigin::start(200, "plain").await;
    let server = ProxyServer::new(test_config()).unwrap();
    server.add_filter(&filtered.key(), uppercase(1024)).unwrap();
    let (server, proxy) = start_proxy(server).await;
    let client = proxied_client(proxy);

    let res = client.get(plain.url("/")).send().await.unwrap();
    assert_eq!(res.text().await.unwrap(), "plain");
    let res = client.get(filtered.url("/")).send().await.unwrap();
    assert_eq!(res.text().await.unwrap(), "FILTERED");

    server.stop().await;
}

#[tokio::test]
async fn path_filter_only_applies_under_its_prefix() {
    let origin = MockOrigin::start(200, "body").await;
    let server = ProxyServer::new(test_config()).unwrap();
    server
        .add_filter_for_path(&origin.key(), "/api", uppercase(1024))
        .unwrap();
    let (server, proxy) = start_proxy(server).await;
    let client = proxied_client(proxy);

    let res = client.get(origin.url("/api/v1/items")).send().await.unwrap();
    assert_eq!(res.text().await.unwrap(), "BODY");
    let res = client.get(origin.url("/static/app.js")).send().await.unwrap();
    assert_eq!(res.text().await.unwrap(), "body");

    server.stop().await;
}

#[tokio::test]
async fn malformed_path_pattern_is_rejected() {
    let server = ProxyServer::new(test_config()).unwrap();
    let err = server
        .add_filter_for_path("example.com:80", "/api/(", uppercase(16))
        .unwrap_err();
    assert_eq!(err.kind(), "configuration");
}

#[tokio::test]
async fn filters_cannot_be_added_after_start() {
    let origin = MockOrigin::start(200, "still lowercase").await;
    let (server, proxy) = start_proxy(ProxyServer::new(test_config()).unwrap()).await;

    let err = server.add_filter(&origin.key(), uppercase(1024)).unwrap_err();
    assert_eq!(err.kind(), "configuration");

    let res = proxied_client(proxy).get(origin.url("/")).send().await.unwrap();
    assert_eq!(res.text().await.unwrap(), "still lowercase");

    server.stop().await;
}

#[tokio::test]
async fn head_response_keeps_origin_length_when_filtered() {
    let origin = MockOrigin::start(200, "hello filters").await;
    let server = ProxyServer::new(test_config()).unwrap();
    server.add_filter(&origin.key(), tagging("head")).unwrap();
    let (server, proxy) = start_proxy(server).await;

    let response = raw_exchange(
        proxy,
        &format!(
            "HEAD {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            origin.url("/"),
            origin.addr
        ),
    )
    .await
    .to_ascii_lowercase();
    assert!(response.starts_with("http/1.1 200"), "{}", response);
    assert!(response.contains("x-filtered-by: head"), "{}", response);
    assert!(response.contains("content-length: 13\r\n"), "{}", response);

    server.stop().await;
}

#[tokio::test]
async fn oversized_response_is_rejected_by_default() {
    let origin = MockOrigin::start(200, vec![b'a'; 64]).await;
    let server = ProxyServer::new(test_config()).unwrap();
    server.add_filter(&origin.key(), uppercase(16)).unwrap();
    let (server, proxy) = start_proxy(server).await;

    let res = proxied_client(proxy).get(origin.url("/")).send().await.unwrap();
    assert_eq!(res.status(), 502);
    assert_eq!(res.headers()["x-proxy-error"], "filter-overflow");

    server.stop().await;
}

#[tokio::test]
async fn oversized_response_passes_through_unfiltered() {
    let origin = MockOrigin::start(200, vec![b'a'; 64]).await;
    let mut config = test_config();
    config.filters.overflow_policy = OverflowPolicy::PassThrough;
    let server = ProxyServer::new(config).unwrap();
    server.add_filter(&origin.key(), uppercase(16)).unwrap();
    let (server, proxy) = start_proxy(server).await;

    let res = proxied_client(proxy).get(origin.url("/")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.bytes().await.unwrap().as_ref(), vec![b'a'; 64].as_slice());

    server.stop().await;
}
