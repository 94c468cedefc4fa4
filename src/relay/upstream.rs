//! # Upstream Connector
//!
//! Builds the outbound URL for a session and opens the outbound WebSocket.
//!
//! ## URL construction:
//! 1. Take the path and query the browser asked for
//! 2. Collapse a run of leading `/` into one (client SDKs have been seen to
//!    send `//ws/...`)
//! 3. Put it behind the configured upstream scheme and host
//! 4. Set the credential query parameter
//!
//! Exactly one connection attempt is made per session. Retrying is the
//! browser's business: it can simply open a new session.

use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::credential::Credential;
use crate::error::{RelayError, RelayResult};

pub type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Collapse leading path separators so the target never starts with `//`.
///
/// The rest of the target, including any query, is left untouched.
pub fn normalize_target(target: &str) -> String {
    format!("/{}", target.trim_start_matches('/'))
}

/// Combine the upstream endpoint with the browser's request target and the
/// credential.
///
/// `target` must be in origin form (`/path?query`); anything else is refused
/// so the browser cannot steer the relay to another host.
pub fn build_upstream_url(endpoint: &str, target: &str, credential: &Credential) -> RelayResult<Url> {
    if !target.starts_with('/') {
        return Err(RelayError::RejectedUpgrade(format!(
            "request target is not origin-form: {}",
            target
        )));
    }

    let endpoint = endpoint.trim_end_matches('/');
    let mut url = Url::parse(&format!("{}{}", endpoint, normalize_target(target)))?;
    credential.apply(&mut url);
    Ok(url)
}

/// The URL with its query removed, safe to log.
pub fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}

/// Opens outbound connections for sessions.
///
/// Cheap to clone; every session gets its own copy.
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    endpoint: String,
    credential: Credential,
}

impl UpstreamConnector {
    pub fn new(endpoint: impl Into<String>, credential: Credential) -> Self {
        Self {
            endpoint: endpoint.into(),
            credential,
        }
    }

    pub fn url_for(&self, target: &str) -> RelayResult<Url> {
        build_upstream_url(&self.endpoint, target, &self.credential)
    }

    /// Open the outbound connection for `target`. One attempt, no retry.
    pub async fn connect(&self, target: &str) -> RelayResult<UpstreamStream> {
        let url = self.url_for(target)?;
        debug!(upstream = %redacted(&url), "Opening upstream connection");

        let (stream, response) = connect_async(url.as_str())
            .await
            .map_err(|e| RelayError::UpstreamConnect(e.to_string()))?;

        info!(
            upstream = %redacted(&url),
            status = response.status().as_u16(),
            "Connected to upstream"
        );
        Ok(stream)
    }
}
