//! Transport-level round trips between `Connection` and `serve_connection`.

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::time::{Duration, Instant};
use weft_core::wire::RequestHead;
use weft_core::{Code, Metadata, Status};
use weft_transport::{serve_connection, Connection, InboundCall};

/// Echo server: one message back per message in, then OK trailers carrying
/// an `x-served-by` trailing entry.
async fn spawn_echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, peer) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut incoming = serve_connection(stream, peer);
                while let Some(call) = incoming.recv().await {
                    tokio::spawn(echo_call(call));
                }
            });
        }
    });
    addr
}

async fn echo_call(mut call: InboundCall) {
    let mut initial = Metadata::new();
    initial.set("x-path", call.head.path.as_str()).unwrap();
    call.responder.send_initial_metadata(&initial).await.unwrap();

    while let Some(payload) = call.messages.recv().await {
        call.responder.send_message(payload).await.unwrap();
    }

    let mut trailing = Metadata::new();
    trailing.set("x-served-by", "echo").unwrap();
    call.responder
        .finish(&Status::ok().with_metadata(trailing))
        .await
        .unwrap();
}

fn head(path: &str) -> RequestHead {
    RequestHead {
        path: path.to_string(),
        authority: "localhost".to_string(),
        timeout_ms: 0,
        metadata: Metadata::new(),
    }
}

#[tokio::test]
async fn test_call_roundtrip() {
    let _ = tracing_subscriber::fmt::try_init();
    let addr = spawn_echo_server().await;
    let conn = Connection::connect(&addr.to_string()).await.unwrap();

    let (control, mut recv) = conn.new_call(None).unwrap();
    control.send_headers(&head("echo.Echo/Echo")).await.unwrap();
    control.send_message(Bytes::from("hello")).await.unwrap();
    control.send_message(Bytes::from("world")).await.unwrap();
    control.send_close().await.unwrap();

    let headers = recv.headers.take().unwrap().await.unwrap();
    assert_eq!(
        headers.first("x-path").unwrap().as_text(),
        Some("echo.Echo/Echo")
    );

    assert_eq!(recv.messages.recv().await.unwrap(), Bytes::from("hello"));
    assert_eq!(recv.messages.recv().await.unwrap(), Bytes::from("world"));
    assert!(recv.messages.recv().await.is_none());

    let status = recv.status.take().unwrap().await.unwrap();
    assert_eq!(status.code(), Code::Ok);
    assert_eq!(
        status.metadata().first("x-served-by").unwrap().as_text(),
        Some("echo")
    );
    assert!(control.is_terminal());
}

#[tokio::test]
async fn test_concurrent_calls_demultiplex() {
    let addr = spawn_echo_server().await;
    let conn = Connection::connect(&addr.to_string()).await.unwrap();

    let (a_control, mut a_recv) = conn.new_call(None).unwrap();
    let (b_control, mut b_recv) = conn.new_call(None).unwrap();

    a_control.send_headers(&head("svc/A")).await.unwrap();
    b_control.send_headers(&head("svc/B")).await.unwrap();
    a_control.send_message(Bytes::from("from-a")).await.unwrap();
    b_control.send_message(Bytes::from("from-b")).await.unwrap();
    a_control.send_close().await.unwrap();
    b_control.send_close().await.unwrap();

    assert_eq!(a_recv.messages.recv().await.unwrap(), Bytes::from("from-a"));
    assert_eq!(b_recv.messages.recv().await.unwrap(), Bytes::from("from-b"));
    assert_eq!(a_recv.status.take().unwrap().await.unwrap().code(), Code::Ok);
    assert_eq!(b_recv.status.take().unwrap().await.unwrap().code(), Code::Ok);
}

#[tokio::test]
async fn test_cancel_reaches_server_and_resolves_locally() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_cancel_tx, seen_cancel_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        let mut incoming = serve_connection(stream, peer);
        let mut call = incoming.recv().await.unwrap();
        let mut cancelled = call.cancelled.clone();
        // Never respond; just report the cancellation.
        loop {
            if *cancelled.borrow() {
                let _ = seen_cancel_tx.send(());
                break;
            }
            if cancelled.changed().await.is_err() {
                break;
            }
        }
        let _ = call.messages.recv().await;
    });

    let conn = Connection::connect(&addr.to_string()).await.unwrap();
    let (control, mut recv) = conn.new_call(None).unwrap();
    control.send_headers(&head("svc/Slow")).await.unwrap();

    control.cancel(Status::cancelled("Cancelled"));
    let status = recv.status.take().unwrap().await.unwrap();
    assert_eq!(status.code(), Code::Cancelled);
    assert!(control.is_terminal());

    // Second cancel is suppressed; the first resolution won.
    control.cancel(Status::internal("late"));
    assert!(recv.messages.recv().await.is_none());

    tokio::time::timeout(Duration::from_secs(1), seen_cancel_rx)
        .await
        .expect("server never observed the cancel")
        .unwrap();
}

#[tokio::test]
async fn test_deadline_is_transport_driven() {
    // A listener that accepts and stays silent.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (_stream, _peer) = listener.accept().await.unwrap();
        std::future::pending::<()>().await;
    });

    let conn = Connection::connect(&addr.to_string()).await.unwrap();
    let deadline = Instant::now() + Duration::from_millis(30);
    let (control, mut recv) = conn.new_call(Some(deadline)).unwrap();
    control.send_headers(&head("svc/Sleep")).await.unwrap();

    let status = tokio::time::timeout(Duration::from_secs(2), recv.status.take().unwrap())
        .await
        .expect("deadline never fired")
        .unwrap();
    assert_eq!(status.code(), Code::DeadlineExceeded);
    assert!(control.is_terminal());
}

#[tokio::test]
async fn test_close_fails_outstanding_calls() {
    let addr = spawn_echo_server().await;
    let conn = Connection::connect(&addr.to_string()).await.unwrap();

    let (_control, mut recv) = conn.new_call(None).unwrap();
    conn.close();

    let status = recv.status.take().unwrap().await.unwrap();
    assert_eq!(status.code(), Code::Unavailable);
    assert!(conn.new_call(None).is_err());
}
