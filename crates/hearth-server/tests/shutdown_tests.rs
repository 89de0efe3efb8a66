//! Graceful shutdown: draining, bounded grace, forced termination

mod common;

use core::time::Duration;

use tokio::net::TcpStream;
use tokio::task::LocalSet;
use tokio::time::Instant;

use hearth_server::ServerConfig;

use common::{read_response, reads_eof, send, start, status_of, EchoApp, SlowApp};

#[tokio::test]
async fn test_drain_closes_idle_connections() {
    LocalSet::new()
        .run_until(async {
            let (app, _) = EchoApp::new();
            let (addr, handle, join) = start(ServerConfig::testing(), app).await;

            let mut client = TcpStream::connect(addr).await.unwrap();
            send(&mut client, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
            let (head, _) = read_response(&mut client).await;
            assert_eq!(status_of(&head), 200);

            // idle in keep-alive; drain should close it well before the
            // grace period runs out
            let started = Instant::now();
            handle.shutdown();
            join.await.unwrap().unwrap();
            assert!(started.elapsed() < Duration::from_millis(400));
            assert!(reads_eof(&mut client).await);
        })
        .await;
}

#[tokio::test]
async fn test_active_request_finishes_during_drain() {
    LocalSet::new()
        .run_until(async {
            let (app, calls) = SlowApp::new(Duration::from_millis(200));
            let (addr, handle, join) = start(ServerConfig::testing(), app).await;

            let mut client = TcpStream::connect(addr).await.unwrap();
            send(&mut client, b"GET /slow HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
            tokio::time::sleep(Duration::from_millis(50)).await;

            handle.shutdown();
            let (head, body) = read_response(&mut client).await;
            assert_eq!(status_of(&head), 200);
            assert_eq!(body, b"slow");
            // persistence is off during drain
            assert!(head.to_ascii_lowercase().contains("connection: close"));
            assert!(reads_eof(&mut client).await);
            assert_eq!(calls.get(), 1);

            join.await.unwrap().unwrap();
        })
        .await;
}

#[tokio::test]
async fn test_stragglers_forced_closed_at_grace() {
    LocalSet::new()
        .run_until(async {
            // handler outlives the 500ms testing grace period
            let (app, _) = SlowApp::new(Duration::from_millis(1500));
            let (addr, handle, join) = start(ServerConfig::testing(), app).await;

            let mut client = TcpStream::connect(addr).await.unwrap();
            send(&mut client, b"GET /stuck HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
            tokio::time::sleep(Duration::from_millis(50)).await;

            let started = Instant::now();
            handle.shutdown();
            join.await.unwrap().unwrap();
            let elapsed = started.elapsed();
            assert!(elapsed >= Duration::from_millis(450));
            assert!(elapsed < Duration::from_millis(1200));

            // the connection was killed without a complete response
            assert!(reads_eof(&mut client).await);
        })
        .await;
}

#[tokio::test]
async fn test_no_new_connections_after_shutdown() {
    LocalSet::new()
        .run_until(async {
            let (app, _) = EchoApp::new();
            let (addr, handle, join) = start(ServerConfig::testing(), app).await;

            handle.shutdown();
            join.await.unwrap().unwrap();

            // the listener is gone; connect must fail or yield immediate EOF
            match TcpStream::connect(addr).await {
                Err(_) => {}
                Ok(mut stream) => assert!(reads_eof(&mut stream).await),
            }
        })
        .await;
}
