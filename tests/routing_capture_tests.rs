//! Matching, routing and capture behaviour through the public proxy API

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use wiretap::capture::{CetpFrame, JsonFacet};
use wiretap::{
    CapturedMessage, Config, Expectation, ForwardDecision, HttpFacet, HttpResponse, RequestMatcher, WiretapProxy,
};

fn plain_config() -> Config {
    Config {
        port: 0,
        tls_interception: false,
        ..Config::default()
    }
}

async fn send(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    String::from_utf8_lossy(&reply).to_string()
}

fn responding(priority: i32, body: &'static str) -> Expectation {
    Expectation::respond(
        RequestMatcher::any().path("^/priority").unwrap(),
        HttpResponse::new(200).with_body(body),
    )
    .with_priority(priority)
}

#[tokio::test]
async fn test_higher_priority_wins_in_either_insertion_order() {
    for high_first in [true, false] {
        let proxy = WiretapProxy::builder(plain_config()).build().unwrap();
        if high_first {
            proxy.add_expectation(responding(10, "ten"));
            proxy.add_expectation(responding(5, "five"));
        } else {
            proxy.add_expectation(responding(5, "five"));
            proxy.add_expectation(responding(10, "ten"));
        }
        let handle = proxy.start().await.unwrap();

        let reply = send(
            handle.addr(),
            "GET /priority HTTP/1.1\r\nHost: sut\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(reply.ends_with("ten"), "high_first={}: {}", high_first, reply);

        handle.stop().await;
        proxy.shutdown().await;
    }
}

#[tokio::test]
async fn test_removed_expectation_no_longer_matches() {
    let proxy = WiretapProxy::builder(plain_config()).build().unwrap();
    let id = proxy.add_expectation(responding(1, "mock"));
    let handle = proxy.start().await.unwrap();

    let request = "GET /priority HTTP/1.1\r\nHost: sut\r\nConnection: close\r\n\r\n";
    assert!(send(handle.addr(), request).await.ends_with("mock"));
    assert!(proxy.remove_expectation(&id));
    assert!(send(handle.addr(), request).await.starts_with("HTTP/1.1 404"));

    handle.stop().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_cors_preflight_never_reaches_expectations() {
    let proxy = WiretapProxy::builder(plain_config()).build().unwrap();
    proxy.add_expectation(Expectation::respond(RequestMatcher::any(), HttpResponse::new(418)));
    let handle = proxy.start().await.unwrap();

    let reply = send(
        handle.addr(),
        "OPTIONS /api HTTP/1.1\r\nHost: sut\r\nOrigin: http://x\r\nAccess-Control-Request-Method: GET\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(!reply.starts_with("HTTP/1.1 418"), "{}", reply);
    assert!(reply.contains("Access-Control-Allow-Origin: http://x"));
    assert!(reply.contains("Access-Control-Allow-Methods"));
    assert!(reply.contains("Access-Control-Allow-Credentials: true"));

    handle.stop().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_forward_callback_redirects_to_backend() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = backend.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = socket.read(&mut buf).await.unwrap();
        let head = String::from_utf8_lossy(&buf[..n]).to_string();
        let body = if head.contains(&format!("Host: 127.0.0.1:{}", backend_port)) {
            "host rewritten"
        } else {
            "host kept"
        };
        let reply = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body);
        socket.write_all(reply.as_bytes()).await.unwrap();
    });

    let proxy = WiretapProxy::builder(plain_config()).build().unwrap();
    proxy.add_expectation(Expectation::forward(RequestMatcher::any(), move |request| {
        let url = format!("http://127.0.0.1:{}{}", backend_port, request.path());
        ForwardDecision::Forward(wiretap::message::parse_absolute(&url).unwrap())
    }));
    let handle = proxy.start().await.unwrap();

    let reply = send(handle.addr(), "GET /svc HTTP/1.1\r\nHost: sut\r\nConnection: close\r\n\r\n").await;
    assert!(reply.ends_with("host rewritten"), "{}", reply);

    handle.stop().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_wait_for_next_message_sees_live_traffic() {
    let proxy = Arc::new(WiretapProxy::builder(plain_config()).build().unwrap());
    proxy.add_expectation(Expectation::respond(RequestMatcher::any(), HttpResponse::new(204)));
    let handle = proxy.start().await.unwrap();
    let addr = handle.addr();

    let waiter = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move { proxy.wait_for_next_message(Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    send(addr, "GET /ping HTTP/1.1\r\nHost: sut\r\nConnection: close\r\n\r\n").await;

    let message = waiter.await.unwrap().expect("a message should arrive");
    assert!(matches!(message.element.find::<HttpFacet>(), Some(HttpFacet::Request(_))));

    handle.stop().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_capture_file_round_trip_between_proxies() {
    let source = WiretapProxy::builder(plain_config()).build().unwrap();
    source.add_expectation(Expectation::respond(
        RequestMatcher::any(),
        HttpResponse::new(200)
            .with_header("Content-Type", "application/json")
            .with_body(r#"{"status":"ok"}"#),
    ));
    let handle = source.start().await.unwrap();
    send(
        handle.addr(),
        "POST /submit HTTP/1.1\r\nHost: sut\r\nContent-Length: 2\r\nConnection: close\r\n\r\n[]",
    )
    .await;
    handle.stop().await;
    source.shutdown().await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.jsonl");
    assert_eq!(source.save_capture(&path).await.unwrap(), 2);

    let replay = WiretapProxy::builder(plain_config()).build().unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    replay.add_message_listener(Arc::new(move |message: &CapturedMessage| {
        let _ = tx.send(message.uuid);
    }));
    assert_eq!(replay.load_capture(&path).await.unwrap(), 2);

    let original = source.captured_messages();
    let loaded = replay.captured_messages();
    assert_eq!(loaded.len(), 2);
    for (a, b) in original.iter().zip(loaded.iter()) {
        assert_eq!(a.uuid, b.uuid);
        assert_eq!(a.endpoints, b.endpoints);
        assert_eq!(a.element, b.element);
    }
    assert!(loaded[1].element.find::<JsonFacet>().is_some());
    let delivered = [rx.recv().await.unwrap(), rx.recv().await.unwrap()];
    assert!(delivered.contains(&original[0].uuid));
    assert!(delivered.contains(&original[1].uuid));

    replay.shutdown().await;
}

#[tokio::test]
async fn test_opaque_tunnel_decodes_cetp_frames() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_port = server.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = server.accept().await.unwrap();
        let mut sink = Vec::new();
        let _ = socket.read_to_end(&mut sink).await;
    });

    let proxy = WiretapProxy::builder(plain_config()).build().unwrap();
    let handle = proxy.start().await.unwrap();
    let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
    stream
        .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", server_port).as_bytes())
        .await
        .unwrap();
    let mut reply = [0u8; 39];
    stream.read_exact(&mut reply).await.unwrap();

    // One frame split across two writes
    let mut frame = b"CETP".to_vec();
    frame.extend_from_slice(&13u32.to_be_bytes());
    frame.extend_from_slice(br#"{"event":"x"}"#);
    stream.write_all(&frame[..6]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    stream.write_all(&frame[6..]).await.unwrap();
    stream.shutdown().await.unwrap();

    let cetp = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(message) = proxy
                .captured_messages()
                .into_iter()
                .find(|m| m.element.has_facet::<CetpFrame>())
            {
                return message;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(cetp.size(), frame.len());
    assert!(cetp.element.find::<JsonFacet>().is_some());

    handle.stop().await;
    proxy.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_slow_listener_does_not_stall_relay() {
    let proxy = WiretapProxy::builder(plain_config()).build().unwrap();
    proxy.add_expectation(Expectation::respond(RequestMatcher::any(), HttpResponse::new(204)));
    proxy.add_message_listener(Arc::new(|_: &CapturedMessage| {
        std::thread::sleep(Duration::from_secs(2));
    }));
    let handle = proxy.start().await.unwrap();
    let request = "GET /busy HTTP/1.1\r\nHost: sut\r\nConnection: close\r\n\r\n";

    send(handle.addr(), request).await;
    let started = std::time::Instant::now();
    let reply = send(handle.addr(), request).await;
    assert!(reply.starts_with("HTTP/1.1 204"), "{}", reply);
    assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());

    handle.stop().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_preflight_omits_credentials_when_disabled() {
    let proxy = WiretapProxy::builder(Config {
        cors_allow_credentials: false,
        ..plain_config()
    })
    .build()
    .unwrap();
    let handle = proxy.start().await.unwrap();

    let reply = send(
        handle.addr(),
        "OPTIONS /api HTTP/1.1\r\nHost: sut\r\nOrigin: http://x\r\nAccess-Control-Request-Method: GET\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(reply.contains("Access-Control-Allow-Origin: http://x"), "{}", reply);
    assert!(!reply.contains("Access-Control-Allow-Credentials"), "{}", reply);

    handle.stop().await;
    proxy.shutdown().await;
}
