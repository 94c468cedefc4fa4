//! Server-held upstream credential.
//!
//! The secret is injected into the outbound URL as a query parameter and must
//! never travel back to the browser or into the logs. The same injection point
//! serves a long-lived API key and a short-lived access token minted by an
//! external issuer; only the parameter name differs.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Which kind of secret the relay holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// Long-lived API key, sent as `key=`
    ApiKey,
    /// Ephemeral token, sent as `access_token=`
    AccessToken,
}

impl CredentialKind {
    pub fn default_param(&self) -> &'static str {
        match self {
            CredentialKind::ApiKey => "key",
            CredentialKind::AccessToken => "access_token",
        }
    }
}

#[derive(Clone)]
pub struct Credential {
    kind: CredentialKind,
    param: String,
    secret: String,
}

impl Credential {
    pub fn new(kind: CredentialKind, secret: impl Into<String>) -> Self {
        Self {
            kind,
            param: kind.default_param().to_string(),
            secret: secret.into(),
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = param.into();
        self
    }

    pub fn param(&self) -> &str {
        &self.param
    }

    /// Set the credential parameter on `url`, replacing any value the client
    /// supplied under the same name. Other parameters keep their order.
    pub fn apply(&self, url: &mut Url) {
        let retained: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(name, _)| name != self.param.as_str())
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();

        url.query_pairs_mut()
            .clear()
            .extend_pairs(retained)
            .append_pair(&self.param, &self.secret);
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("kind", &self.kind)
            .field("param", &self.param)
            .field("secret", &"<redacted>")
            .finish()
    }
}
