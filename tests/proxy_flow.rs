//! End-to-end request flows through a running proxy.

mod common;

use std::time::Duration;

use common::{
    closed_within, connect, dead_address, eventually, proxy_config, read_response, send, send_bytes, spawn_backend,
    Reply, RunningProxy,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keep_alive_reuses_upstream_connection() {
    let backend = spawn_backend(Reply::Fixed("hello")).await;
    let proxy = RunningProxy::start(&proxy_config(&[backend.addr]));

    let mut client = connect(proxy.addr).await;
    let mut leftover = Vec::new();
    for _ in 0..3 {
        send(&mut client, "GET /greet HTTP/1.1\r\nHost: example.test\r\n\r\n").await;
        let response = read_response(&mut client, &mut leftover).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body_str(), "hello");
        assert_eq!(response.header("connection"), Some("keep-alive"));
    }

    assert_eq!(backend.requests().len(), 3);
    assert_eq!(backend.connections(), 1, "one upstream connection serves the whole session");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pipelined_requests_are_answered_in_order() {
    let backend = spawn_backend(Reply::Echo).await;
    let proxy = RunningProxy::start(&proxy_config(&[backend.addr]));

    let mut client = connect(proxy.addr).await;
    send(
        &mut client,
        "POST /a HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nonePOST /b HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\ntwo",
    )
    .await;

    let mut leftover = Vec::new();
    assert_eq!(read_response(&mut client, &mut leftover).await.body_str(), "one");
    assert_eq!(read_response(&mut client, &mut leftover).await.body_str(), "two");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_targets_answer_bad_gateway() {
    let mut config = proxy_config(&[dead_address(), dead_address()]);
    config.health_check.unhealthy_threshold = 1;
    let proxy = RunningProxy::start(&config);

    let mut client = connect(proxy.addr).await;
    let mut leftover = Vec::new();
    send(&mut client, "GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
    let response = read_response(&mut client, &mut leftover).await;
    assert_eq!(response.status, 502);
    assert!(response.header("date").is_some());
    assert_eq!(response.header("connection"), Some("keep-alive"));

    assert!(proxy.balancer.all_backends().iter().all(|b| !b.is_healthy()));

    // nothing eligible now; the same connection still gets an answer
    send(&mut client, "GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await;
    let response = read_response(&mut client, &mut leftover).await;
    assert_eq!(response.status, 502);
    assert_eq!(response.header("connection"), Some("close"));
    assert!(closed_within(&mut client, Duration::from_secs(2)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_target_is_retried_on_another() {
    let backend = spawn_backend(Reply::Fixed("alive")).await;
    let mut config = proxy_config(&[dead_address(), backend.addr]);
    config.load_balancing.policy = event_proxy::load_balancer::Policy::RoundRobin;
    let proxy = RunningProxy::start(&config);

    for _ in 0..2 {
        let mut client = connect(proxy.addr).await;
        send(&mut client, "GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await;
        let response = read_response(&mut client, &mut Vec::new()).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body_str(), "alive");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chunked_response_is_reframed_per_client_version() {
    let backend = spawn_backend(Reply::Chunked(vec!["hello ", "world"])).await;
    let proxy = RunningProxy::start(&proxy_config(&[backend.addr]));

    let mut modern = connect(proxy.addr).await;
    send(&mut modern, "GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
    let response = read_response(&mut modern, &mut Vec::new()).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header("transfer-encoding"), Some("chunked"));
    assert_eq!(response.body_str(), "hello world");

    let mut legacy = connect(proxy.addr).await;
    send(&mut legacy, "GET / HTTP/1.0\r\nHost: x\r\n\r\n").await;
    let response = read_response(&mut legacy, &mut Vec::new()).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header("transfer-encoding"), None);
    assert_eq!(response.header("connection"), Some("close"));
    assert_eq!(response.body_str(), "hello world");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn content_length_body_is_forwarded_once() {
    let backend = spawn_backend(Reply::Echo).await;
    let proxy = RunningProxy::start(&proxy_config(&[backend.addr]));

    let mut client = connect(proxy.addr).await;
    send(
        &mut client,
        "POST /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\nX-Forwarded-For: 10.1.1.1\r\n\r\nhello world",
    )
    .await;
    let response = read_response(&mut client, &mut Vec::new()).await;
    assert_eq!(response.body_str(), "hello world");

    let requests = backend.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body, b"hello world");
    assert_eq!(requests[0].header("x-forwarded-for").as_deref(), Some("10.1.1.1, 127.0.0.1"));
    assert_eq!(requests[0].header("host").as_deref(), Some("x"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_request_gets_bad_request_and_close() {
    let backend = spawn_backend(Reply::Fixed("unused")).await;
    let proxy = RunningProxy::start(&proxy_config(&[backend.addr]));

    let mut client = connect(proxy.addr).await;
    send(&mut client, "GET / HTTP/1.1\r\nBad Header\r\n\r\n").await;
    let response = read_response(&mut client, &mut Vec::new()).await;
    assert_eq!(response.status, 400);
    assert_eq!(response.header("connection"), Some("close"));
    assert!(closed_within(&mut client, Duration::from_secs(2)).await);
    assert!(backend.requests().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_connection_is_closed_after_timeout() {
    let backend = spawn_backend(Reply::Fixed("unused")).await;
    let mut config = proxy_config(&[backend.addr]);
    config.timeouts.idle_ms = 200;
    config.timeouts.keep_alive_ms = 200;
    config.timeouts.sweep_interval_ms = 50;
    let proxy = RunningProxy::start(&config);

    let mut client = connect(proxy.addr).await;
    assert!(closed_within(&mut client, Duration::from_secs(2)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upstream_connection_returns_to_pool_when_client_leaves() {
    let backend = spawn_backend(Reply::Fixed("pooled")).await;
    let proxy = RunningProxy::start(&proxy_config(&[backend.addr]));

    {
        let mut client = connect(proxy.addr).await;
        send(&mut client, "GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert_eq!(read_response(&mut client, &mut Vec::new()).await.body_str(), "pooled");
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while proxy.pool.idle_count(&backend.addr) == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(proxy.pool.idle_count(&backend.addr), 1);

    let mut client = connect(proxy.addr).await;
    send(&mut client, "GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await;
    assert_eq!(read_response(&mut client, &mut Vec::new()).await.body_str(), "pooled");
    assert_eq!(backend.connections(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_body_is_forwarded_exactly_once() {
    let backend = spawn_backend(Reply::Echo).await;
    let mut config = proxy_config(&[backend.addr]);
    config.http.read_buffer_size = 4 * 1024;
    config.http.max_buffered_bytes = 32 * 1024;
    let proxy = RunningProxy::start(&config);

    let body: Vec<u8> = (0..2_000_000u32).map(|i| (i % 251) as u8).collect();
    let mut request = format!("POST /bulk HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
    request.extend_from_slice(&body);

    let mut client = connect(proxy.addr).await;
    send_bytes(&mut client, &request).await;
    let response = read_response(&mut client, &mut Vec::new()).await;
    assert_eq!(response.status, 200);
    assert!(response.body == body, "echoed body differs");

    let requests = backend.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].body == body, "backend saw a different body");
    assert_eq!(backend.connections(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chunked_upload_is_forwarded_intact() {
    let backend = spawn_backend(Reply::Echo).await;
    let proxy = RunningProxy::start(&proxy_config(&[backend.addr]));

    let mut client = connect(proxy.addr).await;
    send(
        &mut client,
        "POST /upload HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    send(&mut client, "6\r\n world\r\n0\r\n\r\n").await;

    let response = read_response(&mut client, &mut Vec::new()).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body_str(), "hello world");

    let requests = backend.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body, b"hello world");
    assert_eq!(requests[0].header("transfer-encoding").as_deref(), Some("chunked"));
    assert_eq!(requests[0].header("content-length"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expect_continue_reaches_the_client_before_the_body() {
    let backend = spawn_backend(Reply::Echo).await;
    let proxy = RunningProxy::start(&proxy_config(&[backend.addr]));

    let mut client = connect(proxy.addr).await;
    let mut leftover = Vec::new();
    send(
        &mut client,
        "POST /upload HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n",
    )
    .await;
    let interim = read_response(&mut client, &mut leftover).await;
    assert_eq!(interim.status, 100);

    send(&mut client, "hello").await;
    let response = read_response(&mut client, &mut leftover).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body_str(), "hello");
    assert_eq!(response.header("connection"), Some("keep-alive"));
    assert_eq!(backend.requests()[0].body, b"hello");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn saturated_backend_answers_service_unavailable() {
    let backend = spawn_backend(Reply::Stall).await;
    let mut config = proxy_config(&[backend.addr]);
    config.backends[0].max_connections = 1;
    let proxy = RunningProxy::start(&config);

    let mut first = connect(proxy.addr).await;
    send(&mut first, "GET /slow HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(eventually(Duration::from_secs(2), || backend.requests().len() == 1).await);

    let mut second = connect(proxy.addr).await;
    send(&mut second, "GET /fast HTTP/1.1\r\nHost: x\r\n\r\n").await;
    let response = read_response(&mut second, &mut Vec::new()).await;
    assert_eq!(response.status, 503);
    assert_eq!(response.header("connection"), Some("keep-alive"));
    assert!(!closed_within(&mut second, Duration::from_millis(200)).await);
    assert!(proxy.balancer.all_backends()[0].is_healthy());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_upstream_gets_gateway_timeout_and_lease_is_released() {
    let backend = spawn_backend(Reply::Stall).await;
    let mut config = proxy_config(&[backend.addr]);
    config.timeouts.idle_ms = 300;
    config.timeouts.sweep_interval_ms = 50;
    let proxy = RunningProxy::start(&config);

    let mut client = connect(proxy.addr).await;
    send(&mut client, "GET /slow HTTP/1.1\r\nHost: x\r\n\r\n").await;
    let response = read_response(&mut client, &mut Vec::new()).await;
    assert_eq!(response.status, 504);
    assert_eq!(response.header("connection"), Some("close"));
    assert!(closed_within(&mut client, Duration::from_secs(2)).await);

    assert!(eventually(Duration::from_secs(2), || proxy.pool.leased_count() == 0).await);
    assert_eq!(proxy.pool.total_idle(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kept_alive_connection_closed_by_backend_is_not_a_failure() {
    let backend = spawn_backend(Reply::Once("fresh")).await;
    let mut config = proxy_config(&[backend.addr]);
    config.health_check.unhealthy_threshold = 1;
    let proxy = RunningProxy::start(&config);

    let mut client = connect(proxy.addr).await;
    let mut leftover = Vec::new();
    for _ in 0..2 {
        send(&mut client, "GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
        let response = read_response(&mut client, &mut leftover).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body_str(), "fresh");
    }
    assert_eq!(backend.connections(), 2, "second request replayed on a new connection");
    assert!(proxy.balancer.all_backends()[0].is_healthy());

    // the body is gone once forwarded, so this one cannot be replayed
    send(&mut client, "POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\ndata").await;
    let response = read_response(&mut client, &mut leftover).await;
    assert_eq!(response.status, 502);
    assert!(proxy.balancer.all_backends()[0].is_healthy());
}
