//! Public HTTP exchanges
//!
//! A public request is handed to the control session as a
//! [`SessionCommand::StartExchange`] carrying a [`PendingResponse`]. The
//! session fills the response head through a oneshot and streams body
//! chunks through an unbounded channel, so a slow public client never
//! blocks the control connection for other exchanges.

use crate::session::{SessionCommand, SessionHandle};
use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use punchmole_proto::{ExchangeEvent, ExchangePhase, Headers, InvalidTransition, StreamId};
use std::io;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Status line and headers reported by the agent
#[derive(Debug)]
pub struct ResponseHead {
    pub status_code: u16,
    pub status_message: Option<String>,
    pub headers: Headers,
}

#[derive(Debug)]
pub enum BodyEvent {
    Chunk(Bytes),
    End,
}

/// Channels the control session uses to answer one public request
#[derive(Debug)]
pub struct PendingResponse {
    head: oneshot::Sender<ResponseHead>,
    body: mpsc::UnboundedSender<BodyEvent>,
}

impl PendingResponse {
    pub fn channel() -> (
        Self,
        oneshot::Receiver<ResponseHead>,
        mpsc::UnboundedReceiver<BodyEvent>,
    ) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        (
            Self {
                head: head_tx,
                body: body_tx,
            },
            head_rx,
            body_rx,
        )
    }
}

/// Session-side state of one exchange
#[derive(Debug)]
pub(crate) struct RelayExchange {
    phase: ExchangePhase,
    head: Option<oneshot::Sender<ResponseHead>>,
    body: mpsc::UnboundedSender<BodyEvent>,
}

impl RelayExchange {
    pub(crate) fn new(response: PendingResponse) -> Self {
        Self {
            phase: ExchangePhase::Created,
            head: Some(response.head),
            body: response.body,
        }
    }

    pub(crate) fn start_response(
        &mut self,
        status_code: u16,
        status_message: Option<String>,
        headers: Headers,
    ) -> Result<(), InvalidTransition> {
        self.phase = self.phase.apply(ExchangeEvent::HeadersSent)?;
        if let Some(head) = self.head.take() {
            // The public handler may already be gone; its guard cancels the exchange
            let _ = head.send(ResponseHead {
                status_code,
                status_message,
                headers,
            });
        }
        Ok(())
    }

    pub(crate) fn push_data(&mut self, data: Bytes) -> Result<(), InvalidTransition> {
        self.phase = self.phase.apply(ExchangeEvent::Data)?;
        let _ = self.body.send(BodyEvent::Chunk(data));
        Ok(())
    }

    /// Close the body and retire the exchange
    pub(crate) fn finish(mut self) -> Result<ExchangePhase, InvalidTransition> {
        self.phase = self.phase.apply(ExchangeEvent::DataEnd)?;
        let _ = self.body.send(BodyEvent::End);
        self.phase = self.phase.apply(ExchangeEvent::Finish)?;
        Ok(self.phase)
    }

    /// Drop the response channels. The public side observes the closed
    /// channels and fails its response.
    pub(crate) fn abort(mut self) -> ExchangePhase {
        let previous = self.phase;
        self.phase = self
            .phase
            .apply(ExchangeEvent::Abort)
            .unwrap_or(self.phase);
        previous
    }
}

/// Cancels the exchange on the control connection unless it completed.
///
/// Owned by the public handler (and then by the response body stream), so
/// any way the public side goes away drops it exactly once.
pub(crate) struct ExchangeGuard {
    id: StreamId,
    session: SessionHandle,
    completed: bool,
}

impl ExchangeGuard {
    pub(crate) fn new(id: StreamId, session: SessionHandle) -> Self {
        Self {
            id,
            session,
            completed: false,
        }
    }

    pub(crate) fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        if !self.completed {
            debug!(stream_id = %self.id, "Exchange dropped before completion");
            self.session.cancel_exchange(self.id.clone());
        }
    }
}

/// Forward one public request over `session` and build the public response
pub(crate) async fn forward(
    session: SessionHandle,
    method: String,
    url: String,
    headers: Headers,
    body: Body,
) -> Response<Body> {
    let id = StreamId::random();
    let (pending, head_rx, body_rx) = PendingResponse::channel();

    let start = SessionCommand::StartExchange {
        id: id.clone(),
        method,
        url,
        headers,
        response: pending,
    };
    if session.send(start).await.is_err() {
        return service_unavailable();
    }

    let guard = ExchangeGuard::new(id.clone(), session.clone());
    tokio::spawn(pump_request_body(id.clone(), session, body));

    let head = match head_rx.await {
        Ok(head) => head,
        Err(_) => {
            warn!(stream_id = %id, "Control connection lost before response started");
            return (
                StatusCode::BAD_GATEWAY,
                "control connection closed before response",
            )
                .into_response();
        }
    };

    build_response(head, response_body(body_rx, guard))
}

/// Stream the public request body to the session as `request-data`
async fn pump_request_body(id: StreamId, session: SessionHandle, body: Body) {
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(data) if data.is_empty() => {}
            Ok(data) => {
                let command = SessionCommand::RequestData {
                    id: id.clone(),
                    data,
                };
                if session.send(command).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(stream_id = %id, "Public request body failed: {}", e);
                let _ = session.send(SessionCommand::CancelExchange { id }).await;
                return;
            }
        }
    }
    let _ = session.send(SessionCommand::RequestDataEnd { id }).await;
}

/// Body stream fed by the session. Ends cleanly on `BodyEvent::End`; a
/// channel closed without it surfaces as an error so the public response
/// is aborted instead of looking complete.
fn response_body(
    body_rx: mpsc::UnboundedReceiver<BodyEvent>,
    guard: ExchangeGuard,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
    futures_util::stream::unfold(Some((body_rx, guard)), |state| async move {
        let (mut body_rx, mut guard) = state?;
        match body_rx.recv().await {
            Some(BodyEvent::Chunk(data)) => Some((Ok(data), Some((body_rx, guard)))),
            Some(BodyEvent::End) => {
                guard.complete();
                None
            }
            None => Some((
                Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "control connection closed mid-response",
                )),
                None,
            )),
        }
    })
}

fn build_response<S>(head: ResponseHead, body: S) -> Response<Body>
where
    S: Stream<Item = Result<Bytes, io::Error>> + Send + 'static,
{
    let status = StatusCode::from_u16(head.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = head.headers;
    headers.strip_hop_by_hop();

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = status;

    for (name, value) in headers.iter() {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().append(name, value);
            }
            _ => debug!(header = %name, "Skipping invalid response header"),
        }
    }

    if let Some(message) = head.status_message {
        if status.canonical_reason() != Some(message.as_str()) {
            if let Ok(reason) = hyper::ext::ReasonPhrase::try_from(message.into_bytes()) {
                response.extensions_mut().insert(reason);
            }
        }
    }

    response
}

pub(crate) fn service_unavailable() -> Response<Body> {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        punchmole_proto::SERVICE_UNAVAILABLE_BODY,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(capacity: usize) -> (SessionHandle, mpsc::Receiver<SessionCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (SessionHandle::new("c1".to_string(), tx), rx)
    }

    #[tokio::test]
    async fn test_guard_cancels_once_when_dropped() {
        let (session, mut rx) = session(4);
        let guard = ExchangeGuard::new(StreamId::from("s1"), session);
        drop(guard);

        match rx.try_recv() {
            Ok(SessionCommand::CancelExchange { id }) => assert_eq!(id.as_str(), "s1"),
            other => panic!("expected cancel, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_completed_guard_does_not_cancel() {
        let (session, mut rx) = session(4);
        let mut guard = ExchangeGuard::new(StreamId::from("s1"), session);
        guard.complete();
        drop(guard);

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_guard_cancels_through_full_queue() {
        let (session, mut rx) = session(1);
        session
            .send(SessionCommand::RequestDataEnd {
                id: StreamId::from("busy"),
            })
            .await
            .unwrap();

        drop(ExchangeGuard::new(StreamId::from("s1"), session));

        assert!(matches!(
            rx.recv().await,
            Some(SessionCommand::RequestDataEnd { .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(SessionCommand::CancelExchange { .. })
        ));
    }

    #[tokio::test]
    async fn test_body_stream_ends_on_end_event() {
        let (session, mut rx) = session(4);
        let (pending, _head_rx, body_rx) = PendingResponse::channel();
        let mut exchange = RelayExchange::new(pending);

        exchange
            .start_response(200, None, Headers::new())
            .unwrap();
        exchange.push_data(Bytes::from_static(b"hello ")).unwrap();
        exchange.push_data(Bytes::from_static(b"world")).unwrap();
        assert_eq!(exchange.finish().unwrap(), ExchangePhase::Completed);

        let guard = ExchangeGuard::new(StreamId::from("s1"), session);
        let chunks: Vec<_> = response_body(body_rx, guard).collect().await;
        let body: Vec<u8> = chunks
            .into_iter()
            .flat_map(|c| c.unwrap().to_vec())
            .collect();
        assert_eq!(body, b"hello world");

        // Completed exchanges are not cancelled
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_body_stream_errors_when_session_drops_exchange() {
        let (session, _rx) = session(4);
        let (pending, _head_rx, body_rx) = PendingResponse::channel();
        let mut exchange = RelayExchange::new(pending);
        exchange
            .start_response(200, None, Headers::new())
            .unwrap();
        exchange.push_data(Bytes::from_static(b"partial")).unwrap();
        assert_eq!(exchange.abort(), ExchangePhase::Streaming);

        let guard = ExchangeGuard::new(StreamId::from("s1"), session);
        let items: Vec<_> = response_body(body_rx, guard).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
    }

    #[test]
    fn test_data_before_response_start_is_rejected() {
        let (pending, _head_rx, _body_rx) = PendingResponse::channel();
        let mut exchange = RelayExchange::new(pending);
        assert!(exchange.push_data(Bytes::from_static(b"x")).is_err());
    }

    #[tokio::test]
    async fn test_response_strips_hop_by_hop_headers() {
        let mut headers = Headers::new();
        headers.append("content-type", "text/plain");
        headers.append("set-cookie", "a=1");
        headers.append("set-cookie", "b=2");
        headers.append("transfer-encoding", "chunked");
        headers.append("connection", "keep-alive");

        let head = ResponseHead {
            status_code: 201,
            status_message: Some("Created".to_string()),
            headers,
        };
        let response = build_response(head, futures_util::stream::empty());

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["content-type"], "text/plain");
        assert_eq!(response.headers().get_all("set-cookie").iter().count(), 2);
        assert!(response.headers().get("transfer-encoding").is_none());
        assert!(response.headers().get("connection").is_none());
    }
}
