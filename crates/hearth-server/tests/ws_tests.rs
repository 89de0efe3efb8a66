//! WebSocket upgrade and session behavior over real sockets

mod common;

use std::rc::Rc;

use core::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::task::LocalSet;

use hearth_server::{App, Request, Response, Result, ServerConfig, StatusCode, WsMessage, WsSession};

use common::{masked_frame, read_frame, read_response, reads_eof, send, start, status_of, EchoApp, WsEchoApp};

const CLIENT_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const EXPECTED_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

fn upgrade_request(extra: &str) -> Vec<u8> {
    format!(
        "GET /ws HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {CLIENT_KEY}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         {extra}\r\n"
    )
    .into_bytes()
}

#[tokio::test]
async fn test_upgrade_and_echo_round_trip() {
    LocalSet::new()
        .run_until(async {
            let (addr, handle, join) = start(ServerConfig::testing(), Rc::new(WsEchoApp)).await;

            let mut client = TcpStream::connect(addr).await.unwrap();
            send(&mut client, &upgrade_request("")).await;
            let (head, leftover) = read_response(&mut client).await;
            assert_eq!(status_of(&head), 101);
            assert!(head.contains(&format!("Sec-WebSocket-Accept: {EXPECTED_ACCEPT}")));
            assert!(head.contains("Upgrade: websocket"));

            let mut leftover = leftover;
            send(&mut client, &masked_frame(0x1, b"hello")).await;
            let (opcode, payload) = read_frame(&mut client, &mut leftover).await;
            assert_eq!(opcode, 0x1);
            assert_eq!(payload, b"hello");

            send(&mut client, &masked_frame(0x2, &[1, 2, 3])).await;
            let (opcode, payload) = read_frame(&mut client, &mut leftover).await;
            assert_eq!(opcode, 0x2);
            assert_eq!(payload, vec![1, 2, 3]);

            // close handshake: client 1000, server echoes a close frame
            send(&mut client, &masked_frame(0x8, &1000u16.to_be_bytes())).await;
            let (opcode, payload) = read_frame(&mut client, &mut leftover).await;
            assert_eq!(opcode, 0x8);
            assert_eq!(&payload[..2], &1000u16.to_be_bytes());
            assert!(reads_eof(&mut client).await);

            handle.shutdown();
            join.await.unwrap().unwrap();
        })
        .await;
}

#[tokio::test]
async fn test_slow_handler_receives_every_message_in_order() {
    // an echo handler that is busy while the peer floods the socket;
    // inbound messages must queue against the transport, not get dropped
    struct BusyEchoApp;

    #[async_trait(?Send)]
    impl App for BusyEchoApp {
        async fn call(&self, _request: Request) -> Result<Response> {
            Ok(Response::text(StatusCode::OK, "http"))
        }

        async fn call_ws(&self, mut session: WsSession) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            while let Some(message) = session.recv().await {
                match message {
                    WsMessage::Text(_) => session.send(message).await?,
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            Ok(())
        }

        fn websocket_enabled(&self) -> bool {
            true
        }
    }

    LocalSet::new()
        .run_until(async {
            let (addr, handle, join) = start(ServerConfig::testing(), Rc::new(BusyEchoApp)).await;

            let mut client = TcpStream::connect(addr).await.unwrap();
            send(&mut client, &upgrade_request("")).await;
            let (head, leftover) = read_response(&mut client).await;
            assert_eq!(status_of(&head), 101);

            // more messages than the session queue holds, sent before the
            // handler takes its first one
            let mut leftover = leftover;
            for i in 0..50 {
                let text = format!("m{i}");
                send(&mut client, &masked_frame(0x1, text.as_bytes())).await;
            }
            for i in 0..50 {
                let (opcode, payload) = read_frame(&mut client, &mut leftover).await;
                assert_eq!(opcode, 0x1);
                assert_eq!(payload, format!("m{i}").into_bytes());
            }

            send(&mut client, &masked_frame(0x8, &1000u16.to_be_bytes())).await;
            let (opcode, _) = read_frame(&mut client, &mut leftover).await;
            assert_eq!(opcode, 0x8);

            handle.shutdown();
            join.await.unwrap().unwrap();
        })
        .await;
}

#[tokio::test]
async fn test_ping_answered_with_pong() {
    LocalSet::new()
        .run_until(async {
            let (addr, handle, join) = start(ServerConfig::testing(), Rc::new(WsEchoApp)).await;

            let mut client = TcpStream::connect(addr).await.unwrap();
            send(&mut client, &upgrade_request("")).await;
            let (head, leftover) = read_response(&mut client).await;
            assert_eq!(status_of(&head), 101);

            let mut leftover = leftover;
            send(&mut client, &masked_frame(0x9, b"beat")).await;
            let (opcode, payload) = read_frame(&mut client, &mut leftover).await;
            assert_eq!(opcode, 0xa);
            assert_eq!(payload, b"beat");

            handle.shutdown();
            join.await.unwrap().unwrap();
        })
        .await;
}

#[tokio::test]
async fn test_subprotocol_negotiated_first_match() {
    LocalSet::new()
        .run_until(async {
            let (addr, handle, join) = start(ServerConfig::testing(), Rc::new(WsEchoApp)).await;

            let mut client = TcpStream::connect(addr).await.unwrap();
            send(
                &mut client,
                &upgrade_request("Sec-WebSocket-Protocol: graphql, chat\r\n"),
            )
            .await;
            let (head, _) = read_response(&mut client).await;
            assert_eq!(status_of(&head), 101);
            assert!(head.contains("Sec-WebSocket-Protocol: chat"));

            handle.shutdown();
            join.await.unwrap().unwrap();
        })
        .await;
}

#[tokio::test]
async fn test_invalid_key_rejected_with_400() {
    LocalSet::new()
        .run_until(async {
            let (addr, handle, join) = start(ServerConfig::testing(), Rc::new(WsEchoApp)).await;

            let mut client = TcpStream::connect(addr).await.unwrap();
            send(
                &mut client,
                b"GET /ws HTTP/1.1\r\n\
                  Host: localhost\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Key: too-short\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .await;
            let (head, _) = read_response(&mut client).await;
            assert_eq!(status_of(&head), 400);
            assert!(reads_eof(&mut client).await);

            handle.shutdown();
            join.await.unwrap().unwrap();
        })
        .await;
}

#[tokio::test]
async fn test_upgrade_refused_when_app_has_no_ws_support() {
    LocalSet::new()
        .run_until(async {
            let (app, calls) = EchoApp::new();
            let (addr, handle, join) = start(ServerConfig::testing(), app).await;

            let mut client = TcpStream::connect(addr).await.unwrap();
            send(&mut client, &upgrade_request("")).await;
            let (head, _) = read_response(&mut client).await;
            assert_eq!(status_of(&head), 400);
            assert_eq!(calls.get(), 0);
            assert!(reads_eof(&mut client).await);

            handle.shutdown();
            join.await.unwrap().unwrap();
        })
        .await;
}

#[tokio::test]
async fn test_unmasked_client_frame_fails_the_session() {
    LocalSet::new()
        .run_until(async {
            let (addr, handle, join) = start(ServerConfig::testing(), Rc::new(WsEchoApp)).await;

            let mut client = TcpStream::connect(addr).await.unwrap();
            send(&mut client, &upgrade_request("")).await;
            let (head, leftover) = read_response(&mut client).await;
            assert_eq!(status_of(&head), 101);

            // unmasked text frame; server must answer 1002 and close
            let mut leftover = leftover;
            send(&mut client, &[0x81, 0x02, b'h', b'i']).await;
            let (opcode, payload) = read_frame(&mut client, &mut leftover).await;
            assert_eq!(opcode, 0x8);
            assert_eq!(&payload[..2], &1002u16.to_be_bytes());
            assert!(reads_eof(&mut client).await);

            handle.shutdown();
            join.await.unwrap().unwrap();
        })
        .await;
}
