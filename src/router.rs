//! # Upgrade Router
//!
//! The public listener. Every connection is classified from its request head
//! before a single byte is consumed:
//!
//! | Request head | Action |
//! |---|---|
//! | `Upgrade` header, target contains the path marker | WebSocket handshake, new relay session |
//! | `Upgrade` header, any other target | socket dropped, no status line |
//! | `Upgrade` header, target not in origin form (`/path?query`) | socket dropped |
//! | no `Upgrade` header | spliced to the internal HTTP server |
//! | malformed, oversized or too slow | socket dropped |
//!
//! The router holds no per-request state; each connection runs on its own task.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::RelayError;
use crate::relay::{SessionRelay, UpstreamConnector};
use crate::state::AppState;

const MAX_HEAD_BYTES: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;
const PEEK_INTERVAL: Duration = Duration::from_millis(10);
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// What to do with a connection, decided from its request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Relay this upgrade; holds the original request target
    Relay(String),
    /// Drop the socket; holds the reason for the logs
    Reject(String),
    /// Plain HTTP for the internal server
    Http,
}

/// Classify a request head. `None` means the head is not complete yet.
pub fn route_request(head: &[u8], marker: &str) -> Option<Route> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(head) {
        Ok(httparse::Status::Partial) => None,
        Err(e) => Some(Route::Reject(format!("malformed request head: {}", e))),
        Ok(httparse::Status::Complete(_)) => {
            let target = req.path.unwrap_or_default();
            let is_upgrade = req
                .headers
                .iter()
                .any(|header| header.name.eq_ignore_ascii_case("upgrade"));

            if !is_upgrade {
                Some(Route::Http)
            } else if !target.starts_with('/') {
                // Absolute or authority form would let the browser name a host
                Some(Route::Reject(format!("request target is not origin-form: {}", target)))
            } else if target.contains(marker) {
                Some(Route::Relay(target.to_string()))
            } else {
                Some(Route::Reject(format!("unrecognized upgrade target: {}", target)))
            }
        }
    }
}

#[derive(Clone)]
pub struct UpgradeRouter {
    app: AppState,
    http_backend: SocketAddr,
    head_timeout: Duration,
    /// `None` when no credential is configured; every session is then refused.
    connector: Option<UpstreamConnector>,
}

impl UpgradeRouter {
    pub fn new(app: AppState, http_backend: SocketAddr) -> Self {
        let connector = app
            .config()
            .credential()
            .map(|credential| UpstreamConnector::new(app.config().upstream.endpoint.clone(), credential));

        Self {
            head_timeout: app.config().request_head_timeout(),
            app,
            http_backend,
            connector,
        }
    }

    /// Accept connections forever, one task per connection.
    pub async fn serve(self, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let router = self.clone();
            tokio::spawn(async move {
                router.handle(stream, peer).await;
            });
        }
    }

    async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, "Could not disable Nagle: {}", e);
        }

        match peek_route(&stream, &self.app.config().upstream.path_marker, self.head_timeout).await {
            Route::Relay(target) => self.accept_session(stream, peer, target).await,
            Route::Http => splice(stream, peer, self.http_backend).await,
            Route::Reject(reason) => {
                self.app.record_rejected_upgrade();
                let err = RelayError::RejectedUpgrade(reason);
                debug!(peer = %peer, "{}", err);
                drop(stream);
            }
        }
    }

    async fn accept_session(&self, stream: TcpStream, peer: SocketAddr, target: String) {
        let mut ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(peer = %peer, "WebSocket handshake failed: {}", e);
                return;
            }
        };

        let Some(connector) = self.connector.clone() else {
            self.app.record_missing_credential();
            let err = RelayError::MissingCredential;
            error!(peer = %peer, "{}; refusing session", err);
            let _ = tokio::time::timeout(CLOSE_GRACE, async {
                if ws.close(err.inbound_close_frame()).await.is_ok() {
                    while let Some(Ok(_)) = ws.next().await {}
                }
            })
            .await;
            return;
        };

        let relay = SessionRelay::new(self.app.clone(), target.clone());
        let span = info_span!("session", id = %relay.id(), peer = %peer);
        let connect = async move { connector.connect(&target).await };
        relay.run(ws, connect).instrument(span).await;
    }
}

/// Peek at the request head until it can be routed, without consuming it.
async fn peek_route(stream: &TcpStream, marker: &str, head_timeout: Duration) -> Route {
    let deadline = Instant::now() + head_timeout;
    let mut buf = vec![0u8; MAX_HEAD_BYTES];

    loop {
        let n = match tokio::time::timeout_at(deadline, stream.peek(&mut buf)).await {
            Ok(Ok(0)) => return Route::Reject("connection closed before request head".to_string()),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Route::Reject(format!("peek failed: {}", e)),
            Err(_) => return Route::Reject("request head timed out".to_string()),
        };

        if let Some(route) = route_request(&buf[..n], marker) {
            return route;
        }
        if n == buf.len() {
            return Route::Reject("request head too large".to_string());
        }

        // peek returns immediately while any byte is buffered, so wait for more
        if Instant::now() + PEEK_INTERVAL >= deadline {
            return Route::Reject("request head timed out".to_string());
        }
        tokio::time::sleep(PEEK_INTERVAL).await;
    }
}

/// Hand a plain HTTP connection to the internal server, byte for byte.
async fn splice(mut stream: TcpStream, peer: SocketAddr, backend: SocketAddr) {
    let mut backend_stream = match TcpStream::connect(backend).await {
        Ok(s) => s,
        Err(e) => {
            error!(peer = %peer, backend = %backend, "Internal HTTP server unreachable: {}", e);
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut stream, &mut backend_stream).await {
        Ok((sent, received)) => debug!(peer = %peer, sent, received, "HTTP connection finished"),
        Err(e) => debug!(peer = %peer, "HTTP connection ended: {}", e),
    }
}

/// Bind the public listener.
pub async fn bind(addr: &str) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!("Relay listening on {}", listener.local_addr()?);
    Ok(listener)
}
