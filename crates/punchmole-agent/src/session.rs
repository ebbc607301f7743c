//! One control connection lifetime
//!
//! [`AgentSession::run`] connects to the relay, registers the domain and then
//! serves the connection from a single loop that owns the socket's write half
//! together with the exchange and socket tables. Exchange and socket tasks
//! talk back to it over [`Upstream`] channels.

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::forwarder::{self, AgentExchange};
use crate::websocket::{self, SocketFrame, SocketSlot};
use futures_util::{SinkExt, StreamExt};
use punchmole_proto::{AgentMessage, ControlCodec, ControlMessage, RelayMessage, StreamId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

/// How a control connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The relay or the network closed the connection
    Closed,
    /// The relay refused the registration
    Rejected(String),
}

/// Notifications from exchange and socket tasks to the session loop
#[derive(Debug)]
pub(crate) enum SessionEvent {
    ExchangeFinished {
        id: StreamId,
    },
    SocketOpened {
        id: StreamId,
        sink: mpsc::UnboundedSender<SocketFrame>,
    },
    SocketClosed {
        id: StreamId,
    },
}

/// Channels back into the session loop
#[derive(Debug, Clone)]
pub(crate) struct Upstream {
    /// Messages to write to the relay, in order
    pub(crate) messages: mpsc::UnboundedSender<AgentMessage>,
    pub(crate) events: mpsc::UnboundedSender<SessionEvent>,
}

pub struct AgentSession {
    config: Arc<AgentConfig>,
    http: reqwest::Client,
}

impl AgentSession {
    pub fn new(config: Arc<AgentConfig>) -> Result<Self, AgentError> {
        // Redirects are answered by the public client, not followed here
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Connect, register and serve until the control connection ends
    pub async fn run(&self) -> Result<SessionEnd, AgentError> {
        let (socket, _) = connect_async(self.config.endpoint_url.as_str())
            .await
            .map_err(|e| {
                AgentError::ConnectionFailed(format!("{}: {}", self.config.endpoint_url, e))
            })?;
        info!(endpoint = %self.config.endpoint_url, "Connection with upstream server opened");

        let (mut sink, mut stream) = socket.split();

        let register = AgentMessage::Register {
            api_key: self.config.api_key.clone(),
            domain: self.config.domain.clone(),
        };
        sink.send(Message::Text(ControlCodec::encode(&register)?))
            .await?;

        let (messages_tx, mut messages_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher {
            config: self.config.clone(),
            http: self.http.clone(),
            upstream: Upstream {
                messages: messages_tx,
                events: events_tx,
            },
            exchanges: HashMap::new(),
            sockets: HashMap::new(),
        };

        let period = self.config.ping_interval;
        let mut ping = interval_at(Instant::now() + period, period);

        let result = loop {
            tokio::select! {
                frame = stream.next() => {
                    let message = match frame {
                        Some(Ok(Message::Text(text))) => ControlCodec::decode::<RelayMessage>(&text),
                        Some(Ok(Message::Binary(data))) => ControlCodec::decode_bytes::<RelayMessage>(&data),
                        Some(Ok(Message::Close(_))) | None => break Ok(SessionEnd::Closed),
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => break Err(AgentError::from(e)),
                    };
                    match message {
                        Ok(message) => {
                            if let Some(end) = dispatcher.on_relay_message(message) {
                                break Ok(end);
                            }
                        }
                        Err(e) => warn!("Dropping malformed control frame: {}", e),
                    }
                }
                Some(message) = messages_rx.recv() => {
                    let text = match ControlCodec::encode(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(kind = message.kind(), "Failed to encode control message: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        break Err(AgentError::from(e));
                    }
                }
                Some(event) = events_rx.recv() => dispatcher.on_event(event),
                _ = ping.tick() => {
                    trace!("Sending keepalive ping");
                    if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                        break Err(AgentError::from(e));
                    }
                }
            }
        };

        dispatcher.shutdown();
        let _ = sink.close().await;
        result
    }
}

/// Routes relay messages to exchanges and sockets
struct Dispatcher {
    config: Arc<AgentConfig>,
    http: reqwest::Client,
    upstream: Upstream,
    exchanges: HashMap<StreamId, AgentExchange>,
    sockets: HashMap<StreamId, SocketSlot>,
}

impl Dispatcher {
    fn on_relay_message(&mut self, message: RelayMessage) -> Option<SessionEnd> {
        trace!(kind = message.kind(), stream_id = ?message.stream_id(), "Control message");

        match message {
            RelayMessage::Registered { domain } => {
                info!(domain = %domain, "Registration successful");
            }

            RelayMessage::Error { message } => {
                error!(domain = %self.config.domain, "Error received from upstream server: {}", message);
                return Some(SessionEnd::Rejected(message));
            }

            RelayMessage::RequestStart {
                id,
                method,
                url,
                headers,
            } => {
                if self.exchanges.contains_key(&id) {
                    warn!(stream_id = %id, "Duplicate request-start, ignoring");
                    return None;
                }
                let exchange = forwarder::start(
                    &self.http,
                    &self.config,
                    id.clone(),
                    method,
                    url,
                    headers,
                    self.upstream.clone(),
                );
                self.exchanges.insert(id, exchange);
            }

            RelayMessage::RequestData { id, data } => {
                if let Some(exchange) = self.exchanges.get(&id) {
                    exchange.push_body(data.into_bytes());
                }
            }

            RelayMessage::RequestDataEnd { id } => {
                if let Some(exchange) = self.exchanges.get_mut(&id) {
                    debug!(stream_id = %id, "Request body complete");
                    exchange.end_body();
                }
            }

            RelayMessage::RequestEnd { id } => {
                if let Some(exchange) = self.exchanges.remove(&id) {
                    exchange.abort();
                }
            }

            RelayMessage::WebsocketConnection { id, headers, url } => {
                if self.sockets.contains_key(&id) {
                    warn!(stream_id = %id, "Duplicate websocket-connection, ignoring");
                    return None;
                }
                let slot = websocket::open(
                    &self.config,
                    id.clone(),
                    url,
                    headers,
                    self.upstream.clone(),
                );
                self.sockets.insert(id, slot);
            }

            RelayMessage::WebsocketMessage {
                id,
                raw_data,
                binary,
            } => {
                if let Some(slot) = self.sockets.get_mut(&id) {
                    slot.deliver(SocketFrame::Message {
                        data: raw_data.into_bytes(),
                        binary,
                    });
                }
            }

            RelayMessage::WebsocketConnectionClosed { id } => {
                if let Some(slot) = self.sockets.get_mut(&id) {
                    debug!(stream_id = %id, "Public websocket closed");
                    if slot.close() {
                        self.sockets.remove(&id);
                    }
                }
            }

            RelayMessage::WebsocketError { id, error } => {
                info!(stream_id = %id, "Public websocket reported an error: {}", error);
            }
        }

        None
    }

    fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::ExchangeFinished { id } => {
                self.exchanges.remove(&id);
            }

            SessionEvent::SocketOpened { id, sink } => {
                if let Some(slot) = self.sockets.get_mut(&id) {
                    if !slot.open(sink) {
                        self.sockets.remove(&id);
                    }
                }
            }

            SessionEvent::SocketClosed { id } => {
                // Sockets the relay already closed are not echoed back
                let Some(slot) = self.sockets.remove(&id) else {
                    return;
                };
                if !slot.close_requested() {
                    let _ = self
                        .upstream
                        .messages
                        .send(AgentMessage::WebsocketConnectionClosed { id });
                }
            }
        }
    }

    /// Abort everything tied to the connection
    fn shutdown(&mut self) {
        let exchanges = self.exchanges.len();
        let sockets = self.sockets.len();

        for (_, exchange) in self.exchanges.drain() {
            exchange.abort();
        }
        for (_, slot) in self.sockets.drain() {
            slot.abort();
        }

        if exchanges > 0 || sockets > 0 {
            info!(
                aborted_exchanges = exchanges,
                closed_sockets = sockets,
                "Control connection gone, aborted in-flight streams"
            );
        }
    }
}
