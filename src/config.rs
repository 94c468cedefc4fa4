//! # Configuration Management
//!
//! This module handles loading the relay configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization between Rust structs and data formats
//! - **derive macros**: Generate Debug, Clone, Serialize, Deserialize implementations
//! - **Option<T>**: The credential may legitimately be absent at startup
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Credential variables (GEMINI_API_KEY, then NEXT_PUBLIC_GEMINI_API_KEY)
//! 2. Platform variables (HOST, PORT)
//! 3. Environment variables (APP_SERVER__PORT, APP_RELAY__MAX_QUEUED_MESSAGES, etc.)
//! 4. Configuration file (config.toml)
//! 5. Default values (defined in the Default impl)
//!
//! The configuration is loaded once before the router starts and is never
//! mutated afterwards.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::credential::{Credential, CredentialKind};

/// Environment variables consulted for the upstream secret, in order.
const CREDENTIAL_ENV_VARS: [&str; 2] = ["GEMINI_API_KEY", "NEXT_PUBLIC_GEMINI_API_KEY"];

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// The public listener, the upstream service and the relay limits change for
/// different reasons, so each gets its own section in config.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub relay: RelayConfig,
}

/// Public listener settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How long a new connection may take to send its request head
    pub request_head_timeout_ms: u64,
}

/// Where sessions are relayed to, and how they authenticate.
#[derive(Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Scheme and host of the streaming API, e.g. `wss://generativelanguage.googleapis.com`
    pub endpoint: String,

    /// Substring an upgrade request target must contain to be relayed
    pub path_marker: String,

    /// Long-lived API key or short-lived access token
    pub credential_kind: CredentialKind,

    /// Overrides the query parameter implied by `credential_kind`
    #[serde(default)]
    pub credential_param: Option<String>,

    /// The secret itself. Never serialized, so it cannot leak through the
    /// config endpoint or the defaults layer.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

// Hand-written so the secret never reaches a log line.
impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("endpoint", &self.endpoint)
            .field("path_marker", &self.path_marker)
            .field("credential_kind", &self.credential_kind)
            .field("credential_param", &self.credential_param)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Per-session relay limits.
///
/// ## Tuning guidelines:
/// - The queue only holds messages sent before the upstream handshake
///   completes, so it stays small in practice.
/// - A short handshake timeout frees resources quickly when the upstream is
///   silent, but may cut off slow networks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub max_queued_messages: usize,
    pub max_queued_bytes: usize,
    pub handshake_timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3001,
                request_head_timeout_ms: 5_000,
            },
            upstream: UpstreamConfig {
                endpoint: "wss://generativelanguage.googleapis.com".to_string(),
                path_marker: "/ws/google.ai.generativelanguage".to_string(),
                credential_kind: CredentialKind::ApiKey,
                credential_param: None,
                api_key: None,
            },
            relay: RelayConfig {
                max_queued_messages: 256,
                max_queued_bytes: 4 * 1024 * 1024,
                handshake_timeout_ms: 10_000,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_UPSTREAM__ENDPOINT=ws://127.0.0.1:9000`: Point at a local upstream
    /// - `APP_RELAY__HANDSHAKE_TIMEOUT_MS=3000`: Shorter handshake timeout
    /// - `PORT=3000`: Special case for deployment platforms
    /// - `GEMINI_API_KEY=...`: The upstream credential
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Deployment platforms set these without the APP_ prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let mut config: AppConfig = settings.build()?.try_deserialize()?;

        if let Some(secret) = credential_from_env() {
            config.upstream.api_key = Some(secret);
        }

        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// A missing credential is deliberately not checked here: the process still
    /// serves health checks, and every relay session is refused instead.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.request_head_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Request head timeout must be greater than 0"));
        }

        let endpoint = url::Url::parse(&self.upstream.endpoint)
            .map_err(|e| anyhow::anyhow!("Invalid upstream endpoint '{}': {}", self.upstream.endpoint, e))?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(anyhow::anyhow!(
                "Upstream endpoint must use ws:// or wss://, got '{}'",
                endpoint.scheme()
            ));
        }

        if self.upstream.path_marker.is_empty() {
            return Err(anyhow::anyhow!("Upstream path marker cannot be empty"));
        }

        if let Some(param) = &self.upstream.credential_param {
            if param.is_empty() {
                return Err(anyhow::anyhow!("Credential parameter name cannot be empty"));
            }
        }

        if self.relay.max_queued_messages == 0 {
            return Err(anyhow::anyhow!("Max queued messages must be greater than 0"));
        }

        if self.relay.max_queued_bytes == 0 {
            return Err(anyhow::anyhow!("Max queued bytes must be greater than 0"));
        }

        if self.relay.handshake_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Handshake timeout must be greater than 0"));
        }

        Ok(())
    }

    /// The credential injected into outbound URLs, if one is configured.
    pub fn credential(&self) -> Option<Credential> {
        let secret = self.upstream.api_key.as_deref().filter(|s| !s.is_empty())?;
        let credential = Credential::new(self.upstream.credential_kind, secret);
        Some(match &self.upstream.credential_param {
            Some(param) => credential.with_param(param.clone()),
            None => credential,
        })
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.relay.handshake_timeout_ms)
    }

    pub fn request_head_timeout(&self) -> Duration {
        Duration::from_millis(self.server.request_head_timeout_ms)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn credential_from_env() -> Option<String> {
    CREDENTIAL_ENV_VARS
        .iter()
        .filter_map(|name| env::var(name).ok())
        .find(|value| !value.is_empty())
}
