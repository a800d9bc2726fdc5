//! Endpoint address URIs and peer-string helpers.
//!
//! Three schemes are supported: `dns:<host>:<port>`, `unix://<abs-path>`
//! (three slashes total), and `unix-abstract:<name>` for the Linux abstract
//! socket namespace (the implicit leading NUL is not part of the name).

use crate::error::{Result, TransportError};

/// Formats a DNS endpoint URI: `dns:<host>:<port>`.
pub fn format_dns_uri(host: &str, port: u16) -> String {
    format!("dns:{host}:{port}")
}

/// Formats a unix-domain-socket endpoint URI: `unix://<abs-path>`.
pub fn format_unix_uri(path: &str) -> String {
    format!("unix://{path}")
}

/// Formats an abstract-namespace socket URI: `unix-abstract:<name>`.
pub fn format_unix_abstract_uri(name: &str) -> String {
    format!("unix-abstract:{name}")
}

/// An endpoint a server can listen on or a client can dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP on `0.0.0.0:<port>`.
    Port(u16),
    /// Any endpoint URI in one of the supported schemes.
    Uri(String),
}

impl Endpoint {
    /// Canonical URI string for the endpoint.
    pub fn uri(&self) -> String {
        match self {
            Endpoint::Port(port) => format_dns_uri("0.0.0.0", *port),
            Endpoint::Uri(uri) => uri.clone(),
        }
    }

    /// Validates that the endpoint URI uses a supported scheme.
    pub fn validate(&self) -> Result<()> {
        let uri = self.uri();
        let supported = uri.starts_with("dns:")
            || uri.starts_with("unix://")
            || uri.starts_with("unix-abstract:");
        if !supported {
            return Err(TransportError::InvalidUri {
                uri,
                reason: "expected dns:, unix:// or unix-abstract: scheme".to_string(),
            });
        }
        if let Some(path) = uri.strip_prefix("unix://") {
            if !path.starts_with('/') {
                return Err(TransportError::InvalidUri {
                    uri,
                    reason: "unix:// requires an absolute path".to_string(),
                });
            }
        }
        Ok(())
    }
}

impl From<u16> for Endpoint {
    fn from(port: u16) -> Self {
        Endpoint::Port(port)
    }
}

impl From<&str> for Endpoint {
    fn from(uri: &str) -> Self {
        Endpoint::Uri(uri.to_string())
    }
}

impl From<String> for Endpoint {
    fn from(uri: String) -> Self {
        Endpoint::Uri(uri)
    }
}

/// Un-escapes a transport peer string by replacing `%5B`/`%5D` with
/// `[`/`]` for IPv6 presentation. Other percent-escapes are left alone.
pub fn unescape_peer(peer: &str) -> String {
    peer.replace("%5B", "[").replace("%5D", "]")
}

/// Returns `true` if the peer string identifies a caller on this host.
pub fn is_local_peer(peer: &str) -> bool {
    const LOCAL_PREFIXES: [&str; 4] = [
        "ipv4:127.0.0.1:",
        "ipv6:[::1]:",
        "ipv6:[::ffff:127.0.0.1]:",
        "unix:",
    ];
    LOCAL_PREFIXES.iter().any(|prefix| peer.starts_with(prefix))
}
