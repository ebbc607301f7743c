//! Public listener
//!
//! A single fallback handler serves every path:
//! - a WebSocket upgrade on the control endpoint becomes a control session
//! - any other upgrade is relayed to the agent registered for its domain
//! - plain requests are forwarded as HTTP exchanges

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::exchange;
use crate::registry::DomainRegistry;
use crate::session::ControlSession;
use crate::websocket;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use punchmole_proto::Headers;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Banner served on `/` for hosts without a registration
const BANNER: &str = "http server is running";

#[derive(Clone)]
struct RelayState {
    config: Arc<RelayConfig>,
    registry: DomainRegistry,
}

pub struct RelayServer {
    listener: TcpListener,
    state: RelayState,
}

impl RelayServer {
    /// Validate `config` and bind the public listener
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;

        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            let port = config.bind_addr.port();
            let address = config.bind_addr.ip().to_string();
            let reason = e.to_string();
            RelayError::BindError {
                address,
                port,
                reason,
            }
        })?;

        Ok(Self {
            listener,
            state: RelayState {
                config: Arc::new(config),
                registry: DomainRegistry::new(),
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> DomainRegistry {
        self.state.registry.clone()
    }

    pub async fn serve(self) -> Result<(), RelayError> {
        self.serve_with_shutdown(CancellationToken::new()).await
    }

    /// Serve until `shutdown` is cancelled
    pub async fn serve_with_shutdown(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        let addr = self.local_addr()?;
        info!(
            "Relay listening on {} (control endpoint {})",
            addr, self.state.config.endpoint_path
        );

        let app = Router::new().fallback(dispatch).with_state(self.state);

        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Relay stopped");
        Ok(())
    }
}

async fn dispatch(State(state): State<RelayState>, request: Request) -> Response {
    let (mut parts, body) = request.into_parts();

    if !is_websocket_upgrade(&parts.headers) {
        return handle_request(state, parts, body).await;
    }

    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    if parts.uri.path() == state.config.endpoint_path {
        let RelayState { config, registry } = state;
        return upgrade.on_upgrade(move |socket| ControlSession::run(socket, config, registry));
    }

    handle_upgrade(state, parts, upgrade)
}

async fn handle_request(state: RelayState, parts: Parts, body: Body) -> Response {
    let Some(domain) = requested_domain(&parts) else {
        return (StatusCode::BAD_REQUEST, "missing host header").into_response();
    };

    let Some(session) = state.registry.lookup_live(&domain) else {
        debug!(domain = %domain, path = %parts.uri.path(), "No registration for domain");
        if parts.method == Method::GET && parts.uri.path() == "/" {
            return (StatusCode::OK, BANNER).into_response();
        }
        return exchange::service_unavailable();
    };

    exchange::forward(
        session,
        parts.method.to_string(),
        request_url(&parts),
        headers_of(&parts.headers),
        body,
    )
    .await
}

fn handle_upgrade(state: RelayState, parts: Parts, upgrade: WebSocketUpgrade) -> Response {
    let Some(domain) = requested_domain(&parts) else {
        return (StatusCode::BAD_REQUEST, "missing host header").into_response();
    };

    let url = request_url(&parts);
    let headers = headers_of(&parts.headers);

    match state.registry.lookup_live(&domain) {
        Some(session) => upgrade.on_upgrade(move |socket| {
            websocket::pump_public_socket(socket, session, url, headers)
        }),
        None => {
            debug!(domain = %domain, "No registration for websocket, closing");
            upgrade.on_upgrade(|mut socket| async move {
                let _ = socket.send(Message::Close(None)).await;
            })
        }
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

fn request_url(parts: &Parts) -> String {
    parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}

fn headers_of(map: &HeaderMap) -> Headers {
    map.iter()
        .map(|(name, value)| {
            (
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Domain a public request is addressed to, without any port.
///
/// Taken from the `Host` header, or from the URI authority for HTTP/2.
pub fn requested_domain(parts: &Parts) -> Option<String> {
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.authority().map(|a| a.as_str()))?;

    let domain = strip_port(host.trim());
    if domain.is_empty() {
        None
    } else {
        Some(domain.to_string())
    }
}

/// Remove a trailing `:port` from a host
pub fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port))
            if !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit())
                && (!name.contains(':') || name.ends_with(']')) =>
        {
            name
        }
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request as HttpRequest;

    fn parts(builder: axum::http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("localhost:"), "localhost:");
        assert_eq!(strip_port("[::1]:3000"), "[::1]");
        assert_eq!(strip_port("::1"), "::1");
    }

    #[test]
    fn test_requested_domain_from_host_header() {
        let parts = parts(
            HttpRequest::builder()
                .uri("/x")
                .header("host", "a.test:1234"),
        );
        assert_eq!(requested_domain(&parts).as_deref(), Some("a.test"));
    }

    #[test]
    fn test_requested_domain_falls_back_to_authority() {
        let parts = parts(HttpRequest::builder().uri("http://b.test:8080/x"));
        assert_eq!(requested_domain(&parts).as_deref(), Some("b.test"));
    }

    #[test]
    fn test_requested_domain_missing() {
        let parts = parts(HttpRequest::builder().uri("/x"));
        assert_eq!(requested_domain(&parts), None);
    }

    #[test]
    fn test_websocket_upgrade_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_websocket_upgrade(&headers));
        headers.insert(header::UPGRADE, "WebSocket".parse().unwrap());
        assert!(is_websocket_upgrade(&headers));
    }

    #[test]
    fn test_request_url_keeps_query() {
        let parts = parts(HttpRequest::builder().uri("/search?q=1&r=2"));
        assert_eq!(request_url(&parts), "/search?q=1&r=2");
    }

    #[test]
    fn test_headers_keep_repeated_values() {
        let mut map = HeaderMap::new();
        map.append("x-forwarded-for", "1.1.1.1".parse().unwrap());
        map.append("x-forwarded-for", "2.2.2.2".parse().unwrap());
        map.insert(header::HOST, "a.test".parse().unwrap());

        let headers = headers_of(&map);
        assert_eq!(headers.len(), 3);
        assert_eq!(headers.get("host"), Some("a.test"));
    }
}
