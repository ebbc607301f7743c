//! Outbound WebSockets to the internal service
//!
//! The relay may forward frames for a socket before the outbound handshake
//! has finished. Those frames wait in the slot's pending queue and are
//! flushed, in arrival order, when the connect task reports the socket open.

use crate::config::AgentConfig;
use crate::session::{SessionEvent, Upstream};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use punchmole_proto::{AgentMessage, Headers, StreamId};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handshake headers owned by the outbound client, never forwarded
const EXCLUDED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SocketFrame {
    Message { data: Bytes, binary: bool },
    Close,
}

#[derive(Debug)]
enum SlotState {
    Connecting {
        pending: VecDeque<SocketFrame>,
        close_requested: bool,
    },
    Open {
        sink: mpsc::UnboundedSender<SocketFrame>,
    },
}

/// Session-side view of one relayed WebSocket
#[derive(Debug)]
pub(crate) struct SocketSlot {
    state: SlotState,
    cancel: CancellationToken,
}

impl SocketSlot {
    pub(crate) fn connecting(cancel: CancellationToken) -> Self {
        Self {
            state: SlotState::Connecting {
                pending: VecDeque::new(),
                close_requested: false,
            },
            cancel,
        }
    }

    /// Queue or forward a frame from the relay
    pub(crate) fn deliver(&mut self, frame: SocketFrame) {
        match &mut self.state {
            SlotState::Connecting { pending, .. } => pending.push_back(frame),
            SlotState::Open { sink } => {
                let _ = sink.send(frame);
            }
        }
    }

    /// Switch to open and flush the pending queue into `sink`.
    ///
    /// Returns `false` when the relay already asked for the socket to be
    /// closed; the slot is then finished and should be dropped.
    pub(crate) fn open(&mut self, sink: mpsc::UnboundedSender<SocketFrame>) -> bool {
        let (pending, close_requested) = match &mut self.state {
            SlotState::Connecting {
                pending,
                close_requested,
            } => (std::mem::take(pending), *close_requested),
            SlotState::Open { .. } => return true,
        };

        for frame in pending {
            let _ = sink.send(frame);
        }

        if close_requested {
            let _ = sink.send(SocketFrame::Close);
            return false;
        }

        self.state = SlotState::Open { sink };
        true
    }

    /// Relay closed the socket.
    ///
    /// Returns `true` when the slot is finished. A socket that is still
    /// connecting stays in place and closes as soon as it opens.
    pub(crate) fn close(&mut self) -> bool {
        match &mut self.state {
            SlotState::Connecting {
                close_requested, ..
            } => {
                *close_requested = true;
                false
            }
            SlotState::Open { sink } => {
                let _ = sink.send(SocketFrame::Close);
                true
            }
        }
    }

    pub(crate) fn close_requested(&self) -> bool {
        matches!(
            self.state,
            SlotState::Connecting {
                close_requested: true,
                ..
            }
        )
    }

    /// Abort the socket whatever its state
    pub(crate) fn abort(self) {
        self.cancel.cancel();
    }
}

/// Start connecting an outbound socket for a relayed public WebSocket
pub(crate) fn open(
    config: &AgentConfig,
    id: StreamId,
    url: String,
    headers: Headers,
    upstream: Upstream,
) -> SocketSlot {
    let cancel = CancellationToken::new();
    let target = config.target_ws_url(&url);
    info!(stream_id = %id, target = %target, "Opening websocket to remote service");

    tokio::spawn(run_socket(id, target, url, headers, upstream, cancel.clone()));

    SocketSlot::connecting(cancel)
}

async fn run_socket(
    id: StreamId,
    target: String,
    url: String,
    headers: Headers,
    upstream: Upstream,
    cancel: CancellationToken,
) {
    let Upstream { messages: out, events } = upstream;
    let mut request = match target.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            warn!(stream_id = %id, "Invalid websocket target {}: {}", target, e);
            let _ = events.send(SessionEvent::SocketClosed { id });
            return;
        }
    };
    for (name, value) in headers.iter() {
        if EXCLUDED_HEADERS.iter().any(|excluded| *excluded == name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            request.headers_mut().append(name, value);
        }
    }

    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(stream_id = %id, "Websocket cancelled while connecting");
            let _ = events.send(SessionEvent::SocketClosed { id });
            return;
        }
        result = connect_async(request) => result,
    };
    let (socket, response) = match connected {
        Ok(connected) => connected,
        Err(e) => {
            warn!(stream_id = %id, "Websocket to remote service failed: {}", e);
            let _ = events.send(SessionEvent::SocketClosed { id });
            return;
        }
    };

    let response_headers: Headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let _ = out.send(AgentMessage::WebsocketConnection {
        id: id.clone(),
        headers: response_headers,
        url,
    });

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
    let _ = events.send(SessionEvent::SocketOpened {
        id: id.clone(),
        sink: frame_tx,
    });

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frame_rx.recv() => match frame {
                Some(SocketFrame::Message { data, binary }) => {
                    let message = if binary {
                        Message::Binary(data.to_vec())
                    } else {
                        Message::Text(String::from_utf8_lossy(&data).into_owned())
                    };
                    if let Err(e) = sink.send(message).await {
                        debug!(stream_id = %id, "Websocket write failed: {}", e);
                        break;
                    }
                }
                Some(SocketFrame::Close) | None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = out.send(AgentMessage::WebsocketMessage {
                        id: id.clone(),
                        raw_data: text.into_bytes().into(),
                        binary: false,
                    });
                }
                Some(Ok(Message::Binary(data))) => {
                    let _ = out.send(AgentMessage::WebsocketMessage {
                        id: id.clone(),
                        raw_data: data.into(),
                        binary: true,
                    });
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(stream_id = %id, "Websocket read failed: {}", e);
                    break;
                }
            },
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
    debug!(stream_id = %id, "Websocket to remote service closed");
    let _ = events.send(SessionEvent::SocketClosed { id });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> SocketFrame {
        SocketFrame::Message {
            data: Bytes::copy_from_slice(s.as_bytes()),
            binary: false,
        }
    }

    #[test]
    fn test_pending_frames_flush_in_order() {
        let mut slot = SocketSlot::connecting(CancellationToken::new());
        slot.deliver(text("1"));
        slot.deliver(text("2"));
        slot.deliver(text("3"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(slot.open(tx));
        slot.deliver(text("4"));

        for expected in ["1", "2", "3", "4"] {
            assert_eq!(rx.try_recv().unwrap(), text(expected));
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_close_while_connecting_closes_on_open() {
        let mut slot = SocketSlot::connecting(CancellationToken::new());
        slot.deliver(text("last words"));
        assert!(!slot.close());
        assert!(slot.close_requested());

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(!slot.open(tx));
        assert_eq!(rx.try_recv().unwrap(), text("last words"));
        assert_eq!(rx.try_recv().unwrap(), SocketFrame::Close);
    }

    #[test]
    fn test_close_when_open() {
        let mut slot = SocketSlot::connecting(CancellationToken::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(slot.open(tx));
        assert!(slot.close());
        assert_eq!(rx.try_recv().unwrap(), SocketFrame::Close);
    }

    #[test]
    fn test_abort_cancels_connect() {
        let cancel = CancellationToken::new();
        let slot = SocketSlot::connecting(cancel.clone());
        slot.abort();
        assert!(cancel.is_cancelled());
    }
}
