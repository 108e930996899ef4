//! Per-connection task: forward inbound text frames to the coordinator and
//! drain the outbound queue into the socket.
//!
//! The task never inspects or mutates relay state. Everything it reads goes
//! to the coordinator queue; everything it writes comes from its outbox.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::coordinator::{CoordinatorEvent, CoordinatorHandle};
use crate::protocol::{encode, ErrorCode, ServerMessage};
use crate::registry::{ConnId, Outbound, Outbox};

/// Close code for a peer that cannot keep up with its outbound queue.
const OVERFLOW_CLOSE_CODE: u16 = 1008;

/// Serve one upgraded socket until either side closes it.
pub async fn handle_connection(
    ws: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    handle: CoordinatorHandle,
    outbound_queue: usize,
) {
    let conn = handle.next_conn_id();
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(outbound_queue);
    let kill = CancellationToken::new();

    if handle
        .send(CoordinatorEvent::Connected {
            conn,
            addr,
            outbox: Outbox::new(tx, kill.clone()),
        })
        .await
        .is_err()
    {
        tracing::warn!(peer = %addr, "Coordinator stopped, refusing connection");
        return;
    }

    tracing::debug!(peer = %addr, %conn, "Client connected");

    loop {
        tokio::select! {
            _ = kill.cancelled() => {
                tracing::warn!(peer = %addr, %conn, "Closing slow connection");
                let _ = sink.send(close_message(OVERFLOW_CLOSE_CODE, "Outbound queue overflow")).await;
                break;
            }

            // Coordinator → this client's socket
            item = rx.recv() => match item {
                Some(Outbound::Text(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let _ = sink.send(close_message(code, &reason)).await;
                    break;
                }
                None => break,
            },

            // This client's socket → coordinator
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let event = CoordinatorEvent::Frame {
                        conn,
                        text: text.as_str().to_owned(),
                    };
                    if handle.send(event).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    let error = encode(&ServerMessage::Error {
                        code: ErrorCode::InvalidMessage,
                        message: "Binary frames are not supported".into(),
                    });
                    if sink.send(Message::Text(error.into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(peer = %addr, %conn, error = %e, "WS error");
                    break;
                }
                _ => {}
            },
        }
    }

    tracing::debug!(peer = %addr, %conn, "Client disconnected");
    let _ = handle.send(CoordinatorEvent::Disconnected { conn }).await;
    let _ = sink.close().await;
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_owned().into(),
    }))
}
