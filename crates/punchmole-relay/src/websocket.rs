//! Public WebSocket relay
//!
//! Each public WebSocket on a registered domain is pumped by its own task.
//! Frames from the public client become session commands; frames the agent
//! relays back arrive on an unbounded [`SocketFrame`] channel owned by the
//! session's socket table.

use crate::session::{SessionCommand, SessionHandle};
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use punchmole_proto::{Headers, StreamId};
use tokio::sync::mpsc;
use tracing::debug;

/// Frame travelling from the agent towards a public WebSocket
#[derive(Debug)]
pub enum SocketFrame {
    Message { data: Bytes, binary: bool },
    Close,
}

/// Session-side entry for one relayed WebSocket
#[derive(Debug)]
pub(crate) struct PublicSocket {
    pub(crate) sink: mpsc::UnboundedSender<SocketFrame>,
    /// Set once the agent reports its outbound socket open
    pub(crate) opened: bool,
}

impl PublicSocket {
    pub(crate) fn new(sink: mpsc::UnboundedSender<SocketFrame>) -> Self {
        Self {
            sink,
            opened: false,
        }
    }
}

fn to_message(data: Bytes, binary: bool) -> Message {
    if binary {
        Message::Binary(data)
    } else {
        Message::Text(String::from_utf8_lossy(&data).into_owned().into())
    }
}

/// Relay one upgraded public socket through `session` until either side closes
pub(crate) async fn pump_public_socket(
    socket: WebSocket,
    session: SessionHandle,
    url: String,
    headers: Headers,
) {
    let id = StreamId::random();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
    let (mut sink, mut stream) = socket.split();

    let open = SessionCommand::OpenSocket {
        id: id.clone(),
        url,
        headers,
        socket: frame_tx,
    };
    if session.send(open).await.is_err() {
        let _ = sink.send(Message::Close(None)).await;
        return;
    }

    let mut closed_by_agent = false;
    loop {
        tokio::select! {
            incoming = stream.next() => {
                let command = match incoming {
                    Some(Ok(Message::Text(text))) => SessionCommand::SocketMessage {
                        id: id.clone(),
                        data: Bytes::copy_from_slice(text.as_str().as_bytes()),
                        binary: false,
                    },
                    Some(Ok(Message::Binary(data))) => SessionCommand::SocketMessage {
                        id: id.clone(),
                        data,
                        binary: true,
                    },
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(stream_id = %id, "Public websocket error: {}", e);
                        let _ = session
                            .send(SessionCommand::SocketError {
                                id: id.clone(),
                                error: e.to_string(),
                            })
                            .await;
                        break;
                    }
                };
                if session.send(command).await.is_err() {
                    closed_by_agent = true;
                    break;
                }
            }
            frame = frame_rx.recv() => match frame {
                Some(SocketFrame::Message { data, binary }) => {
                    if sink.send(to_message(data, binary)).await.is_err() {
                        break;
                    }
                }
                Some(SocketFrame::Close) | None => {
                    closed_by_agent = true;
                    break;
                }
            },
        }
    }

    if closed_by_agent {
        let _ = sink.send(Message::Close(None)).await;
    } else {
        let _ = session
            .send(SessionCommand::SocketClosed { id: id.clone() })
            .await;
    }
    let _ = sink.close().await;
    debug!(stream_id = %id, closed_by_agent, "Public websocket finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_frames_stay_text() {
        match to_message(Bytes::from_static(b"hello"), false) {
            Message::Text(text) => assert_eq!(text.as_str(), "hello"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_binary_frames_stay_binary() {
        match to_message(Bytes::from_static(&[0, 159, 255]), true) {
            Message::Binary(data) => assert_eq!(&data[..], &[0, 159, 255]),
            other => panic!("unexpected {:?}", other),
        }
    }
}
