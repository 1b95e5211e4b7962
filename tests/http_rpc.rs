use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use remcc::from_here;
use remcc::http::{
    HttpClient, HttpClientOptions, StatusRef, HEALTH_OK, HEALTH_REJECTED,
};
use remcc::socket_factory::{SocketFactory, TcpSocketFactory};
use remcc::task::Task;
use remcc::worker::WorkerPool;
use remcc::ErrorCode;

mod util;

use util::{init, ok_response, status_response, MockHttpServer, MockReply};

/// Delegating factory so tests can watch the keep-alive pool from outside
/// the client.
struct SharedFactory(Arc<TcpSocketFactory>);

impl SocketFactory for SharedFactory {
    fn new_socket(&self) -> std::io::Result<(remcc::io::ScopedSocket, bool)> {
        self.0.new_socket()
    }
    fn release_socket(&self, sock: remcc::io::ScopedSocket) {
        self.0.release_socket(sock)
    }
    fn close_socket(&self, sock: remcc::io::ScopedSocket, err: bool) {
        self.0.close_socket(sock, err)
    }
    fn host_name(&self) -> String {
        self.0.host_name()
    }
    fn port(&self) -> u16 {
        self.0.port()
    }
}

fn client_for_port(
    port: u16,
    wm: &Arc<WorkerPool>,
) -> (Arc<HttpClient>, Arc<TcpSocketFactory>) {
    let factory = Arc::new(TcpSocketFactory::new("127.0.0.1".to_string(), port));
    let options = HttpClientOptions {
        dest_host_name: "127.0.0.1".to_string(),
        dest_port: port,
        num_retry_max: 1,
        min_retry_backoff: Duration::from_millis(10),
        max_retry_backoff: Duration::from_millis(50),
        ..Default::default()
    };
    let client = HttpClient::new(
        options,
        Box::new(SharedFactory(Arc::clone(&factory))),
        None,
        Arc::clone(wm),
    );
    (client, factory)
}

#[test]
fn ping_ok_releases_socket() {
    init();
    let server = MockHttpServer::start(|_req| MockReply::Respond(ok_response(b"ok")));
    let wm = WorkerPool::new(2).unwrap();
    let (client, factory) = client_for_port(server.port, &wm);

    assert_eq!(client.ping("/healthz"), 200);
    assert_eq!(client.health_status(), HEALTH_OK);
    // Clean replies return the connection to the keep-alive pool.
    assert_eq!(factory.num_pooled(), 1);

    let seen = server.next_request();
    assert_eq!(seen.path(), "/healthz");
    assert!(seen.head.starts_with("POST /healthz HTTP/1.1"));
    assert_eq!(seen.header("Content-Length").as_deref(), Some("0"));
    assert_eq!(
        seen.header("Content-Type").as_deref(),
        Some("binary/x-protocol-buffer")
    );
    wm.join();
}

#[test]
fn ping_unauthorized_closes_socket() {
    init();
    let server = MockHttpServer::start(|_req| {
        MockReply::RespondAndClose(status_response(401, "Unauthorized", b""))
    });
    let wm = WorkerPool::new(2).unwrap();
    let (client, factory) = client_for_port(server.port, &wm);

    assert_eq!(client.ping("/healthz"), 401);
    assert_eq!(client.health_status(), HEALTH_REJECTED);
    assert_eq!(factory.num_pooled(), 0);
    wm.join();
}

#[test]
fn async_call_finishes_once_on_reply() {
    init();
    // The server holds the response until the test releases it.
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let server = MockHttpServer::start(move |_req| {
        release_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("never released");
        MockReply::Respond(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/x-protocol-buffer\r\nContent-Length: 5\r\n\r\nhello"
                .to_vec(),
        )
    });
    let wm = WorkerPool::new(2).unwrap();
    let (client, _factory) = client_for_port(server.port, &wm);

    let status = StatusRef::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = Arc::clone(&calls);
    let (done_tx, done_rx) = mpsc::channel();
    {
        let client = Arc::clone(&client);
        let status2 = status.clone();
        // Submit from a worker thread so the callback has a home.
        wm.run(
            from_here!(),
            Task::oneshot(move || {
                client.call_with_callback(
                    "/e",
                    b"payload".to_vec(),
                    status2,
                    Some(Task::oneshot(move || {
                        calls2.fetch_add(1, Ordering::SeqCst);
                        done_tx.send(()).unwrap();
                    })),
                );
            }),
            remcc::Priority::Med,
        );
    }

    // Connected but unanswered: the call must be visibly in flight.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !status.with(|s| s.connect_success) {
        assert!(std::time::Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(!status.is_finished());

    release_tx.send(()).unwrap();
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let snap = status.snapshot();
    assert!(snap.finished);
    assert_eq!(snap.err, ErrorCode::Ok);
    assert_eq!(snap.http_return_code, 200);
    assert_eq!(snap.response_body, b"hello");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // Exactly once: give a straggler a chance to double-fire.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    wm.join();
}

#[test]
fn chunked_response_is_reassembled() {
    init();
    let server = MockHttpServer::start(|_req| {
        MockReply::Respond(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n"
                .to_vec(),
        )
    });
    let wm = WorkerPool::new(2).unwrap();
    let (client, _factory) = client_for_port(server.port, &wm);

    let status = StatusRef::new();
    client.call_bytes("/e", b"req".to_vec(), &status);
    let snap = status.snapshot();
    assert_eq!(snap.err, ErrorCode::Ok);
    assert_eq!(snap.response_body, b"hello world");
    wm.join();
}

#[test]
fn short_content_length_read_fails() {
    init();
    let server = MockHttpServer::start(|_req| {
        // Promise 10 bytes, deliver 2, then close.
        MockReply::RespondAndClose(
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nok".to_vec(),
        )
    });
    let wm = WorkerPool::new(2).unwrap();
    let (client, _factory) = client_for_port(server.port, &wm);

    let status = StatusRef::new();
    client.call_bytes("/e", b"req".to_vec(), &status);
    let snap = status.snapshot();
    assert_eq!(snap.err, ErrorCode::Fail);
    wm.join();
}

#[test]
fn chunked_truncation_fails() {
    init();
    let server = MockHttpServer::start(|_req| {
        // One whole chunk, then close before the zero chunk.
        MockReply::RespondAndClose(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n".to_vec(),
        )
    });
    let wm = WorkerPool::new(2).unwrap();
    let (client, _factory) = client_for_port(server.port, &wm);

    let status = StatusRef::new();
    client.call_bytes("/e", b"req".to_vec(), &status);
    assert_eq!(status.snapshot().err, ErrorCode::Fail);
    wm.join();
}

#[test]
fn close_delimited_body_succeeds() {
    init();
    let server = MockHttpServer::start(|_req| {
        MockReply::RespondAndClose(b"HTTP/1.1 200 OK\r\n\r\nstream-until-close".to_vec())
    });
    let wm = WorkerPool::new(2).unwrap();
    let (client, _factory) = client_for_port(server.port, &wm);

    let status = StatusRef::new();
    client.call_bytes("/e", b"req".to_vec(), &status);
    let snap = status.snapshot();
    assert_eq!(snap.err, ErrorCode::Ok);
    assert_eq!(snap.response_body, b"stream-until-close");
    wm.join();
}

#[test]
fn empty_close_delimited_body_is_tolerated() {
    init();
    let server = MockHttpServer::start(|_req| {
        MockReply::RespondAndClose(b"HTTP/1.1 200 OK\r\n\r\n".to_vec())
    });
    let wm = WorkerPool::new(2).unwrap();
    let (client, _factory) = client_for_port(server.port, &wm);

    let status = StatusRef::new();
    client.call_bytes("/e", b"req".to_vec(), &status);
    let snap = status.snapshot();
    assert_eq!(snap.err, ErrorCode::Ok);
    assert!(snap.response_body.is_empty());
    wm.join();
}

#[test]
fn gzip_request_and_response_round_trip() {
    init();
    let body: Vec<u8> = b"object file bytes ".repeat(200);
    let expect = body.clone();
    let server = MockHttpServer::start(move |req| {
        assert_eq!(req.header("Content-Encoding").as_deref(), Some("gzip"));
        let mut encoder = flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        );
        use std::io::Write;
        encoder.write_all(&expect).unwrap();
        let packed = encoder.finish().unwrap();
        let mut out = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            packed.len()
        )
        .into_bytes();
        out.extend_from_slice(&packed);
        MockReply::Respond(out)
    });
    let wm = WorkerPool::new(2).unwrap();
    let factory = Arc::new(TcpSocketFactory::new("127.0.0.1".to_string(), server.port));
    let options = HttpClientOptions {
        dest_host_name: "127.0.0.1".to_string(),
        dest_port: server.port,
        start_compression: true,
        num_retry_max: 1,
        ..Default::default()
    };
    let client = HttpClient::new(
        options,
        Box::new(SharedFactory(factory)),
        None,
        Arc::clone(&wm),
    );

    let status = StatusRef::new();
    client.call_bytes("/e", b"a compressible request body".to_vec(), &status);
    let snap = status.snapshot();
    assert_eq!(snap.err, ErrorCode::Ok);
    assert_eq!(snap.response_body, body);

    let seen = server.next_request();
    // The wire body is gzip; it must not equal the raw request.
    assert_ne!(seen.body, b"a compressible request body".to_vec());
    wm.join();
}

#[test]
fn connection_drop_before_header_retries() {
    init();
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts2 = Arc::clone(&attempts);
    let server = MockHttpServer::start(move |_req| {
        if attempts2.fetch_add(1, Ordering::SeqCst) == 0 {
            MockReply::Close
        } else {
            MockReply::Respond(ok_response(b"ok"))
        }
    });
    let wm = WorkerPool::new(2).unwrap();
    let (client, _factory) = client_for_port(server.port, &wm);

    let status = StatusRef::new();
    client.call_bytes("/e", b"req".to_vec(), &status);
    let snap = status.snapshot();
    assert_eq!(snap.err, ErrorCode::Ok);
    assert_eq!(snap.http_return_code, 200);
    assert_eq!(snap.num_retry, 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    wm.join();
}
