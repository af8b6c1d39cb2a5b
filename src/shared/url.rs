//! Server URL parsing.
//!
//! Accepts `znsocket://host:port[/path]` plus `http://` and `https://` for
//! embedding in an existing HTTP stack, and produces the WebSocket endpoint
//! the client connects to.

use crate::error::{Error, Result};
use url::Url;

/// Default server port, shared with the CLI.
pub const DEFAULT_PORT: u16 = 5000;

/// A parsed server address.
///
/// # Examples
///
/// ```rust
/// use znsocket::shared::ServerUrl;
///
/// let url = ServerUrl::parse("znsocket://example.com:1234/data").unwrap();
/// assert_eq!(url.host, "example.com");
/// assert_eq!(url.port, 1234);
/// assert_eq!(url.path.as_deref(), Some("data"));
/// assert_eq!(url.websocket_url(), "ws://example.com:1234/data");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUrl {
    /// Host name or address.
    pub host: String,
    /// TCP port (defaults to 5000 when the URL has none).
    pub port: u16,
    /// Optional path with surrounding slashes stripped.
    pub path: Option<String>,
    /// Whether to use TLS (`https://` scheme).
    pub secure: bool,
}

impl ServerUrl {
    /// Parse a server address.
    pub fn parse(input: &str) -> Result<ServerUrl> {
        let parsed = Url::parse(input).map_err(|_| Error::Connection {
            address: input.to_string(),
        })?;
        let secure = match parsed.scheme() {
            "znsocket" | "http" | "ws" => false,
            "https" | "wss" => true,
            other => {
                return Err(Error::Protocol(format!(
                    "unsupported URL scheme '{other}'"
                )))
            },
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::Connection {
                address: input.to_string(),
            })?
            .to_string();
        let port = parsed.port().unwrap_or(DEFAULT_PORT);
        let path = match parsed.path().trim_matches('/') {
            "" => None,
            p => Some(p.to_string()),
        };
        Ok(ServerUrl {
            host,
            port,
            path,
            secure,
        })
    }

    /// The base URL without the path, e.g. `znsocket://host:port`.
    pub fn base_url(&self) -> String {
        format!("znsocket://{}:{}", self.host, self.port)
    }

    /// The WebSocket endpoint to connect to.
    pub fn websocket_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        match &self.path {
            Some(path) => format!("{scheme}://{}:{}/{path}", self.host, self.port),
            None => format!("{scheme}://{}:{}", self.host, self.port),
        }
    }
}

impl std::fmt::Display for ServerUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}/{path}", self.base_url()),
            None => write!(f, "{}", self.base_url()),
        }
    }
}
