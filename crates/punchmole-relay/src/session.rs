//! Control session
//!
//! One [`ControlSession`] task runs per agent control connection. It is the
//! only owner of the socket's write half and of the exchange and WebSocket
//! tables for that connection; everything else reaches it by sending a
//! [`SessionCommand`] through a [`SessionHandle`].

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::exchange::{PendingResponse, RelayExchange};
use crate::registry::DomainRegistry;
use crate::websocket::{PublicSocket, SocketFrame};
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use punchmole_proto::{AgentMessage, ControlCodec, Headers, RelayMessage, StreamId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Capacity of a session's command queue. Public handlers wait when it is full.
const COMMAND_BUFFER: usize = 256;

/// Work handed to a control session by public-facing handlers
#[derive(Debug)]
pub enum SessionCommand {
    StartExchange {
        id: StreamId,
        method: String,
        url: String,
        headers: Headers,
        response: PendingResponse,
    },
    RequestData {
        id: StreamId,
        data: Bytes,
    },
    RequestDataEnd {
        id: StreamId,
    },
    /// The public side of an exchange went away before it completed
    CancelExchange {
        id: StreamId,
    },
    OpenSocket {
        id: StreamId,
        url: String,
        headers: Headers,
        socket: mpsc::UnboundedSender<SocketFrame>,
    },
    SocketMessage {
        id: StreamId,
        data: Bytes,
        binary: bool,
    },
    SocketError {
        id: StreamId,
        error: String,
    },
    SocketClosed {
        id: StreamId,
    },
}

/// Cloneable address of a running control session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    connection_id: Arc<str>,
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub(crate) fn new(connection_id: String, commands: mpsc::Sender<SessionCommand>) -> Self {
        Self {
            connection_id: connection_id.into(),
            commands,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Whether the session task has exited
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub(crate) async fn send(&self, command: SessionCommand) -> Result<(), RelayError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RelayError::SessionClosed)
    }

    /// Queue a cancellation without awaiting. Used from `Drop`.
    pub(crate) fn cancel_exchange(&self, id: StreamId) {
        match self.commands.try_send(SessionCommand::CancelExchange { id }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(command)) => {
                let commands = self.commands.clone();
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    runtime.spawn(async move {
                        let _ = commands.send(command).await;
                    });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Whether the control loop keeps running after handling a frame
enum Flow {
    Continue,
    Close,
}

pub(crate) struct ControlSession {
    connection_id: String,
    config: Arc<RelayConfig>,
    registry: DomainRegistry,
    handle: SessionHandle,
    commands: mpsc::Receiver<SessionCommand>,
    sink: SplitSink<WebSocket, Message>,
    domains: HashSet<String>,
    exchanges: HashMap<StreamId, RelayExchange>,
    sockets: HashMap<StreamId, PublicSocket>,
}

impl ControlSession {
    /// Serve one control connection until it closes
    pub(crate) async fn run(socket: WebSocket, config: Arc<RelayConfig>, registry: DomainRegistry) {
        let connection_id = format!("ctl-{}", StreamId::random());
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (sink, mut stream) = socket.split();

        let mut session = Self {
            handle: SessionHandle::new(connection_id.clone(), tx),
            connection_id,
            config,
            registry,
            commands: rx,
            sink,
            domains: HashSet::new(),
            exchanges: HashMap::new(),
            sockets: HashMap::new(),
        };

        info!(connection_id = %session.connection_id, "Control connection opened");

        if let Err(e) = session.drive(&mut stream).await {
            warn!(connection_id = %session.connection_id, "Control connection failed: {}", e);
        }

        session.teardown().await;
    }

    async fn drive(
        &mut self,
        stream: &mut futures_util::stream::SplitStream<WebSocket>,
    ) -> Result<(), RelayError> {
        loop {
            tokio::select! {
                frame = stream.next() => {
                    let message = match frame {
                        Some(Ok(Message::Text(text))) => ControlCodec::decode::<AgentMessage>(text.as_str()),
                        Some(Ok(Message::Binary(data))) => ControlCodec::decode_bytes::<AgentMessage>(&data),
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(connection_id = %self.connection_id, "Control connection closed by agent");
                            return Ok(());
                        }
                        Some(Err(e)) => {
                            debug!(connection_id = %self.connection_id, "Control connection read error: {}", e);
                            return Ok(());
                        }
                    };

                    match message {
                        Ok(message) => {
                            if let Flow::Close = self.on_agent_message(message).await? {
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            warn!(connection_id = %self.connection_id, "Dropping malformed control frame: {}", e);
                        }
                    }
                }
                Some(command) = self.commands.recv() => {
                    self.on_command(command).await?;
                }
            }
        }
    }

    async fn on_agent_message(&mut self, message: AgentMessage) -> Result<Flow, RelayError> {
        match message {
            AgentMessage::Register { api_key, domain } => {
                if !self.config.accepts_key(&api_key) {
                    warn!(
                        connection_id = %self.connection_id,
                        domain = %domain,
                        "Given api key is wrong/not recognised, stopping connection"
                    );
                    self.send(RelayMessage::Error {
                        message: "invalid api key".to_string(),
                    })
                    .await?;
                    return Ok(Flow::Close);
                }

                info!(connection_id = %self.connection_id, domain = %domain, "Registering control connection");
                self.registry.register(&domain, self.handle.clone());
                self.domains.insert(domain.clone());
                self.send(RelayMessage::Registered { domain }).await?;
            }

            AgentMessage::ResponseStart {
                id,
                status_code,
                status_message,
                headers,
            } => match self.exchanges.get_mut(&id) {
                Some(exchange) => {
                    debug!(stream_id = %id, status = status_code, "Response started");
                    if let Err(e) = exchange.start_response(status_code, status_message, headers) {
                        warn!(stream_id = %id, "Ignoring response-start: {}", e);
                    }
                }
                None => debug!(stream_id = %id, "response-start for unknown exchange, ignoring"),
            },

            AgentMessage::Data { id, data } => match self.exchanges.get_mut(&id) {
                Some(exchange) => {
                    if let Err(e) = exchange.push_data(data.into_bytes()) {
                        warn!(stream_id = %id, "Ignoring data: {}", e);
                    }
                }
                None => debug!(stream_id = %id, "data for unknown exchange, ignoring"),
            },

            AgentMessage::DataEnd { id } => match self.exchanges.remove(&id) {
                Some(exchange) => match exchange.finish() {
                    Ok(_) => debug!(stream_id = %id, "Exchange completed"),
                    Err(e) => warn!(stream_id = %id, "Ignoring data-end: {}", e),
                },
                None => debug!(stream_id = %id, "data-end for unknown exchange, ignoring"),
            },

            AgentMessage::WebsocketConnection { id, .. } => match self.sockets.get_mut(&id) {
                Some(socket) => {
                    socket.opened = true;
                    debug!(stream_id = %id, "Agent opened websocket to target");
                }
                None => debug!(stream_id = %id, "websocket-connection for unknown socket"),
            },

            AgentMessage::WebsocketMessage { id, raw_data, binary } => {
                if let Some(socket) = self.sockets.get(&id) {
                    let _ = socket.sink.send(SocketFrame::Message {
                        data: raw_data.into_bytes(),
                        binary,
                    });
                }
            }

            AgentMessage::WebsocketConnectionClosed { id } => {
                if let Some(socket) = self.sockets.remove(&id) {
                    debug!(stream_id = %id, "Agent closed websocket");
                    let _ = socket.sink.send(SocketFrame::Close);
                }
            }
        }

        Ok(Flow::Continue)
    }

    async fn on_command(&mut self, command: SessionCommand) -> Result<(), RelayError> {
        match command {
            SessionCommand::StartExchange {
                id,
                method,
                url,
                headers,
                response,
            } => {
                debug!(stream_id = %id, method = %method, url = %url, "Forwarding request");
                self.exchanges
                    .insert(id.clone(), RelayExchange::new(response));
                self.send(RelayMessage::RequestStart {
                    id,
                    method,
                    url,
                    headers,
                })
                .await?;
            }

            SessionCommand::RequestData { id, data } => {
                if self.exchanges.contains_key(&id) {
                    self.send(RelayMessage::RequestData {
                        id,
                        data: data.into(),
                    })
                    .await?;
                }
            }

            SessionCommand::RequestDataEnd { id } => {
                if self.exchanges.contains_key(&id) {
                    self.send(RelayMessage::RequestDataEnd { id }).await?;
                }
            }

            SessionCommand::CancelExchange { id } => {
                if let Some(exchange) = self.exchanges.remove(&id) {
                    let phase = exchange.abort();
                    info!(stream_id = %id, ?phase, "Public client went away, ending exchange");
                    self.send(RelayMessage::RequestEnd { id }).await?;
                }
            }

            SessionCommand::OpenSocket {
                id,
                url,
                headers,
                socket,
            } => {
                debug!(stream_id = %id, url = %url, "Relaying websocket");
                self.sockets.insert(id.clone(), PublicSocket::new(socket));
                self.send(RelayMessage::WebsocketConnection { id, headers, url })
                    .await?;
            }

            SessionCommand::SocketMessage { id, data, binary } => {
                if self.sockets.contains_key(&id) {
                    self.send(RelayMessage::WebsocketMessage {
                        id,
                        raw_data: data.into(),
                        binary,
                    })
                    .await?;
                }
            }

            SessionCommand::SocketError { id, error } => {
                if self.sockets.contains_key(&id) {
                    self.send(RelayMessage::WebsocketError { id, error }).await?;
                }
            }

            SessionCommand::SocketClosed { id } => {
                if self.sockets.remove(&id).is_some() {
                    self.send(RelayMessage::WebsocketConnectionClosed { id })
                        .await?;
                }
            }
        }

        Ok(())
    }

    async fn send(&mut self, message: RelayMessage) -> Result<(), RelayError> {
        let text = ControlCodec::encode(&message)
            .map_err(|e| RelayError::ControlWrite(e.to_string()))?;

        if let Err(e) = self.sink.send(Message::Text(text.into())).await {
            error!(connection_id = %self.connection_id, "Failed to write to control connection: {}", e);
            for domain in &self.domains {
                self.registry.mark_stale(domain, &self.connection_id);
            }
            return Err(RelayError::ControlWrite(e.to_string()));
        }
        Ok(())
    }

    async fn teardown(mut self) {
        for domain in &self.domains {
            self.registry.unregister(domain, &self.connection_id);
        }

        let exchanges = self.exchanges.len();
        let sockets = self.sockets.len();
        for (_, exchange) in self.exchanges.drain() {
            exchange.abort();
        }
        for (_, socket) in self.sockets.drain() {
            let _ = socket.sink.send(SocketFrame::Close);
        }

        // Stop accepting work; handles still held by public handlers now fail fast
        self.commands.close();

        let _ = self.sink.close().await;
        info!(
            connection_id = %self.connection_id,
            aborted_exchanges = exchanges,
            closed_sockets = sockets,
            "Control connection closed"
        );
    }
}
