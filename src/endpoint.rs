//! Endpoint identity: a base URI plus the expected certificate thumbprint.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::TetherError;
use crate::tls::Thumbprint;

/// Transport scheme an endpoint is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointScheme {
    /// A TLS listening peer; the runtime dials it directly.
    Https,
    /// Indirection through a pending-request queue drained by a polling
    /// peer; no network endpoint of its own.
    Poll,
}

/// Identity of a remote peer: a base URI whose scheme is `https` or `poll`,
/// and the remote's expected certificate thumbprint.
///
/// Equality and hashing consider the base URI only, so a pool or route
/// table keyed by endpoint ignores thumbprint differences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    base_uri: Url,
    thumbprint: Thumbprint,
}

impl ServiceEndpoint {
    /// Parses `uri` and pairs it with the expected thumbprint.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the URI does not parse.
    /// Unsupported schemes are accepted here and surface at send time.
    pub fn new(uri: &str, thumbprint: Thumbprint) -> Result<Self, TetherError> {
        let base_uri = Url::parse(uri)
            .map_err(|e| TetherError::Configuration(format!("invalid endpoint URI '{uri}': {e}")))?;
        Ok(Self::from_url(base_uri, thumbprint))
    }

    /// Pairs an already-parsed URI with the expected thumbprint.
    #[must_use]
    pub fn from_url(base_uri: Url, thumbprint: Thumbprint) -> Self {
        Self {
            base_uri,
            thumbprint,
        }
    }

    /// The endpoint's base URI.
    #[must_use]
    pub fn base_uri(&self) -> &Url {
        &self.base_uri
    }

    /// The expected certificate thumbprint of the remote.
    #[must_use]
    pub fn thumbprint(&self) -> &Thumbprint {
        &self.thumbprint
    }

    /// Resolves the scheme, rejecting anything other than `https`/`poll`.
    pub fn scheme(&self) -> Result<EndpointScheme, TetherError> {
        match self.base_uri.scheme() {
            "https" => Ok(EndpointScheme::Https),
            "poll" => Ok(EndpointScheme::Poll),
            other => Err(TetherError::Configuration(format!(
                "unsupported scheme '{other}' in endpoint '{}'",
                self.base_uri
            ))),
        }
    }

    /// Host to dial (and to present as SNI) for an `https` endpoint.
    pub fn host(&self) -> Result<&str, TetherError> {
        self.base_uri
            .host_str()
            .ok_or_else(|| TetherError::Configuration(format!("endpoint '{}' has no host", self.base_uri)))
    }

    /// Port to dial for an `https` endpoint (defaults to 443).
    #[must_use]
    pub fn port(&self) -> u16 {
        self.base_uri.port_or_known_default().unwrap_or(443)
    }
}

impl PartialEq for ServiceEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.base_uri == other.base_uri
    }
}

impl Eq for ServiceEndpoint {}

impl Hash for ServiceEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.base_uri.hash(state);
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base_uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp(s: &str) -> Thumbprint {
        Thumbprint::new(s)
    }

    #[test]
    fn https_uri_normalizes_with_trailing_slash() {
        let ep = ServiceEndpoint::new("https://node-a:8433", tp("AA")).unwrap();
        assert_eq!(ep.base_uri().as_str(), "https://node-a:8433/");
        assert_eq!(ep.scheme().unwrap(), EndpointScheme::Https);
        assert_eq!(ep.host().unwrap(), "node-a");
        assert_eq!(ep.port(), 8433);
    }

    #[test]
    fn poll_uri_preserves_subscription_case() {
        let ep = ServiceEndpoint::new("poll://SQ-TENTAPOLL", tp("AA")).unwrap();
        assert_eq!(ep.scheme().unwrap(), EndpointScheme::Poll);
        assert!(ep.base_uri().as_str().contains("SQ-TENTAPOLL"));
    }

    #[test]
    fn equality_ignores_thumbprint() {
        let a = ServiceEndpoint::new("https://node-a:8433/", tp("AA")).unwrap();
        let b = ServiceEndpoint::new("https://node-a:8433", tp("BB")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_scheme_surfaces_at_scheme_resolution() {
        let ep = ServiceEndpoint::new("ftp://node-a/", tp("AA")).unwrap();
        let err = ep.scheme().unwrap_err();
        assert!(err.to_string().contains("unsupported scheme 'ftp'"), "{err}");
    }
}
