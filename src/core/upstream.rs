use http::uri::{Authority, PathAndQuery, Scheme, Uri};
use thiserror::Error;

/// Error raised when an upstream address or request URI cannot be formed
#[derive(Error, Debug)]
#[error("invalid upstream address: {0}")]
pub struct UpstreamError(String);

/// Where proxied requests go: scheme plus `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    scheme: Scheme,
    authority: Authority,
}

impl UpstreamTarget {
    pub fn new(tls: bool, host: &str, port: u16) -> Result<Self, UpstreamError> {
        let authority = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        let authority = authority
            .parse::<Authority>()
            .map_err(|e| UpstreamError(format!("{authority}: {e}")))?;

        Ok(Self {
            scheme: if tls { Scheme::HTTPS } else { Scheme::HTTP },
            authority,
        })
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Point `original` at the upstream, keeping its path and query.
    pub fn rewrite(&self, original: &Uri) -> Result<Uri, UpstreamError> {
        let path_and_query = original
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| UpstreamError(e.to_string()))
    }
}

impl std::fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}
