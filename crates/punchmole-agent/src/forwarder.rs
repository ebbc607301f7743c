//! Outbound HTTP exchanges
//!
//! Every `request-start` becomes one reqwest request against the target. The
//! request body is fed from `request-data` frames through a channel, and the
//! response is streamed back as `response-start`, `data`* and `data-end`.

use crate::config::AgentConfig;
use crate::session::{SessionEvent, Upstream};
use bytes::Bytes;
use futures_util::StreamExt;
use punchmole_proto::{
    AgentMessage, ExchangeEvent, ExchangePhase, Headers, StreamId, SERVICE_UNAVAILABLE_BODY,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use std::io;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Session-side handle of a running exchange
#[derive(Debug)]
pub(crate) struct AgentExchange {
    body: Option<mpsc::UnboundedSender<Bytes>>,
    cancel: CancellationToken,
}

impl AgentExchange {
    pub(crate) fn push_body(&self, data: Bytes) {
        if let Some(body) = &self.body {
            let _ = body.send(data);
        }
    }

    /// Close the outbound request body
    pub(crate) fn end_body(&mut self) {
        self.body = None;
    }

    /// Abort the outbound request. Nothing more is sent for this exchange.
    pub(crate) fn abort(self) {
        self.cancel.cancel();
    }
}

/// A request carries a body only if it declares one
pub(crate) fn has_body(headers: &Headers) -> bool {
    let declared_length = headers
        .get("content-length")
        .is_some_and(|len| len.trim() != "0");
    declared_length || headers.contains("transfer-encoding")
}

pub(crate) fn start(
    http: &reqwest::Client,
    config: &AgentConfig,
    id: StreamId,
    method: String,
    url: String,
    headers: Headers,
    upstream: Upstream,
) -> AgentExchange {
    let target = config.target_http_url(&url);
    info!(stream_id = %id, method = %method, target = %target, "Forwarding request");

    let (body_tx, body_rx) = if has_body(&headers) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };
    let request = build_request(http, &method, &target, headers, body_rx);

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {
                info!(stream_id = %id, "Ending stream, remote client closed connection");
            }
            _ = run(&id, request, &upstream.messages) => {}
        }
        let _ = upstream.events.send(SessionEvent::ExchangeFinished { id });
    });

    AgentExchange {
        body: body_tx,
        cancel,
    }
}

fn build_request(
    http: &reqwest::Client,
    method: &str,
    target: &str,
    mut headers: Headers,
    body: Option<mpsc::UnboundedReceiver<Bytes>>,
) -> Result<reqwest::RequestBuilder, String> {
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|e| format!("invalid method {}: {}", method, e))?;

    headers.strip_hop_by_hop();
    let mut map = HeaderMap::new();
    for (name, value) in headers.iter() {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => debug!(header = %name, "Skipping invalid request header"),
        }
    }

    let mut builder = http.request(method, target).headers(map);
    if let Some(body) = body {
        let stream = UnboundedReceiverStream::new(body).map(Ok::<Bytes, io::Error>);
        builder = builder.body(reqwest::Body::wrap_stream(stream));
    }
    Ok(builder)
}

fn advance(id: &StreamId, phase: &mut ExchangePhase, event: ExchangeEvent) {
    match phase.apply(event) {
        Ok(next) => *phase = next,
        Err(e) => warn!(stream_id = %id, "{}", e),
    }
}

async fn run(
    id: &StreamId,
    request: Result<reqwest::RequestBuilder, String>,
    out: &mpsc::UnboundedSender<AgentMessage>,
) {
    let mut phase = ExchangePhase::Created;

    let sent = match request {
        Ok(builder) => builder.send().await.map_err(|e| e.to_string()),
        Err(e) => Err(e),
    };
    let mut response = match sent {
        Ok(response) => response,
        Err(e) => {
            warn!(stream_id = %id, "Remote service not available: {}", e);
            respond_unavailable(id, &e, out);
            return;
        }
    };

    let status = response.status();
    let headers: Headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let _ = out.send(AgentMessage::ResponseStart {
        id: id.clone(),
        status_code: status.as_u16(),
        status_message: status.canonical_reason().map(str::to_string),
        headers,
    });
    advance(id, &mut phase, ExchangeEvent::HeadersSent);

    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let _ = out.send(AgentMessage::Data {
                    id: id.clone(),
                    data: chunk.into(),
                });
                advance(id, &mut phase, ExchangeEvent::Data);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(stream_id = %id, "Response from remote service failed mid-stream: {}", e);
                break;
            }
        }
    }

    let _ = out.send(AgentMessage::DataEnd { id: id.clone() });
    advance(id, &mut phase, ExchangeEvent::DataEnd);
    advance(id, &mut phase, ExchangeEvent::Finish);
    debug!(stream_id = %id, ?phase, "Exchange finished");
}

/// Terminal 503 for an exchange whose target could not be reached
fn respond_unavailable(id: &StreamId, error: &str, out: &mpsc::UnboundedSender<AgentMessage>) {
    let status = StatusCode::SERVICE_UNAVAILABLE;
    let mut headers = Headers::new();
    headers.append("content-type", "text/plain");

    let _ = out.send(AgentMessage::ResponseStart {
        id: id.clone(),
        status_code: status.as_u16(),
        status_message: status.canonical_reason().map(str::to_string),
        headers,
    });
    let _ = out.send(AgentMessage::Data {
        id: id.clone(),
        data: format!("{}: {}", SERVICE_UNAVAILABLE_BODY, error)
            .into_bytes()
            .into(),
    });
    let _ = out.send(AgentMessage::DataEnd { id: id.clone() });
}
