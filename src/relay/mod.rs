//! # Relay
//!
//! Per-session duplex relay between a browser WebSocket and the upstream
//! streaming API.
//!
//! ## Key Components:
//! - **upstream**: outbound URL construction and the one-shot connector
//! - **queue**: bounded buffer for messages sent before the upstream is open
//! - **session**: the pump and the close/error propagation state machine
//! - **state**: connection and session lifecycle enums

pub mod queue;
pub mod session;
pub mod state;
pub mod upstream;

pub use session::SessionRelay;
pub use upstream::UpstreamConnector;
