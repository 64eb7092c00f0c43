//! Connection address for the killmail socket.
//!
//! The address has the form
//! `ws[s]://host[:port]/socket/websocket?vsn=2.0.0&client_identifier=<id>`.
//! The client identifier only shows up in server logs.

use std::fmt;

use crate::codec::ProtocolError;
use crate::version::{PROTOCOL_VERSION, SOCKET_PATH};

/// Maximum client identifier length.
pub const MAX_CLIENT_IDENTIFIER_LENGTH: usize = 64;

/// Default client identifier sent to the server.
pub const DEFAULT_CLIENT_IDENTIFIER: &str = "killfeed_rust_client";

/// Validate a client identifier.
///
/// The identifier goes into the query string unescaped, so it is limited to
/// URL-safe characters.
///
/// # Errors
///
/// Returns an error message if the identifier is invalid.
pub fn validate_client_identifier(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("Client identifier cannot be empty");
    }
    if id.len() > MAX_CLIENT_IDENTIFIER_LENGTH {
        return Err("Client identifier too long");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err("Client identifier contains invalid characters");
    }
    Ok(())
}

/// A resolved socket endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    base: String,
    client_identifier: String,
}

impl Endpoint {
    /// Build an endpoint from a server base URL.
    ///
    /// `http://` and `https://` are rewritten to `ws://` and `wss://`.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheme is unsupported or the client identifier
    /// is invalid.
    pub fn new(
        server_url: &str,
        client_identifier: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        let client_identifier = client_identifier.into();
        validate_client_identifier(&client_identifier)
            .map_err(|e| ProtocolError::Invalid(e.to_string()))?;

        let trimmed = server_url.trim().trim_end_matches('/');
        let base = if let Some(rest) = trimmed.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if let Some(rest) = trimmed.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
            trimmed.to_string()
        } else {
            return Err(ProtocolError::Invalid(format!(
                "unsupported server URL scheme: {server_url}"
            )));
        };

        let host = base.split_once("://").map_or("", |(_, host)| host);
        if host.is_empty() {
            return Err(ProtocolError::Invalid(format!(
                "server URL has no host: {server_url}"
            )));
        }

        Ok(Self {
            base,
            client_identifier,
        })
    }

    /// Base URL with a websocket scheme.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// The client identifier.
    #[must_use]
    pub fn client_identifier(&self) -> &str {
        &self.client_identifier
    }

    /// Check if the endpoint needs TLS.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.base.starts_with("wss://")
    }

    /// Full connection URL.
    #[must_use]
    pub fn url(&self) -> String {
        format!(
            "{}{}?vsn={}&client_identifier={}",
            self.base, SOCKET_PATH, PROTOCOL_VERSION, self.client_identifier
        )
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}
