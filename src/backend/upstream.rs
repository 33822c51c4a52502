//! A single upstream server and its liveness flag.

use http::uri::{Authority, Scheme};
use http::Uri;
use parking_lot::RwLock;
use std::fmt;
use thiserror::Error;

/// Errors produced when parsing a backend address.
#[derive(Debug, Error)]
pub enum BackendAddrError {
    #[error("invalid backend URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: http::uri::InvalidUri,
    },

    #[error("backend URL '{0}' has no scheme (expected http://host[:port])")]
    MissingScheme(String),

    #[error("backend URL '{url}' uses unsupported scheme '{scheme}' (only http is supported)")]
    UnsupportedScheme { url: String, scheme: String },

    #[error("backend URL '{0}' has no host")]
    MissingHost(String),

    #[error("backend URL '{url}' has invalid port '{port}'")]
    InvalidPort { url: String, port: String },

    /// The URL itself is left out so credentials never reach logs.
    #[error("backend URL for host '{0}' must not contain credentials")]
    UserInfo(String),
}

/// One upstream server.
///
/// The address is fixed at construction. Liveness is shared between request
/// tasks and the health checker, so it sits behind a reader-writer lock that
/// is only ever held for the duration of the read or write.
pub struct Backend {
    url: Uri,
    scheme: Scheme,
    authority: Authority,
    alive: RwLock<bool>,
}

impl Backend {
    /// Parse a backend from a URL such as `http://10.0.0.1:8080`.
    ///
    /// Any path or query on the URL is ignored; requests are always sent to
    /// the backend root. New backends start alive.
    pub fn parse(url: &str) -> Result<Self, BackendAddrError> {
        let uri: Uri = url.trim().parse().map_err(|source| BackendAddrError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;

        let scheme = uri
            .scheme()
            .cloned()
            .ok_or_else(|| BackendAddrError::MissingScheme(url.to_string()))?;

        if scheme != Scheme::HTTP {
            return Err(BackendAddrError::UnsupportedScheme {
                url: url.to_string(),
                scheme: scheme.to_string(),
            });
        }

        let authority = uri
            .authority()
            .cloned()
            .filter(|a| !a.host().is_empty())
            .ok_or_else(|| BackendAddrError::MissingHost(url.to_string()))?;

        if authority.as_str().contains('@') {
            return Err(BackendAddrError::UserInfo(authority.host().to_string()));
        }

        // `port_u16` is None both for "no port" and for an out-of-range one
        let after_host = authority
            .as_str()
            .strip_prefix(authority.host())
            .unwrap_or("");
        if let Some(port) = after_host.strip_prefix(':') {
            if !port.is_empty() && port.parse::<u16>().is_err() {
                return Err(BackendAddrError::InvalidPort {
                    url: url.to_string(),
                    port: port.to_string(),
                });
            }
        }

        let url = Uri::builder()
            .scheme(scheme.clone())
            .authority(authority.clone())
            .path_and_query("/")
            .build()
            .map_err(|_| BackendAddrError::MissingHost(url.to_string()))?;

        Ok(Self {
            url,
            scheme,
            authority,
            alive: RwLock::new(true),
        })
    }

    /// The normalized backend URL (`scheme://authority/`).
    pub fn url(&self) -> &Uri {
        &self.url
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Host and port for a TCP reachability probe.
    ///
    /// Falls back to the scheme's default port when the URL has none.
    pub fn probe_target(&self) -> (String, u16) {
        let port = self.authority.port_u16().unwrap_or(80);
        let host = self
            .authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        (host, port)
    }

    /// Overwrite the liveness flag.
    pub fn set_alive(&self, alive: bool) {
        *self.alive.write() = alive;
    }

    /// Current liveness.
    pub fn is_alive(&self) -> bool {
        *self.alive.read()
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("url", &self.url)
            .field("alive", &self.is_alive())
            .finish()
    }
}
