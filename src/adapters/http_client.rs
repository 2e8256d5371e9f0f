use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::{Result, WrapErr};
use hyper::{HeaderMap, Request, Response, Version, header};
use tracing::Instrument;

use crate::{
    core::{OutboundTransport, TransportHolder, TransportSettings, UpstreamTarget},
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
    tracing_setup::create_upstream_span,
};

/// Headers that only make sense for a single hop.
const HOP_BY_HOP_HEADERS: [header::HeaderName; 8] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HeaderName::from_static("keep-alive"),
];

/// Upstream client that relays requests over whatever transport is current.
///
/// Every request reads the [`TransportHolder`] afresh, so a reload takes effect
/// for the next request without touching ones already in flight. When the
/// holder is empty (plain mode) a default transport without client identity
/// is used.
pub struct UpstreamClient {
    holder: Arc<TransportHolder>,
    fallback: Arc<OutboundTransport>,
    upstream: UpstreamTarget,
}

impl UpstreamClient {
    pub fn new(
        holder: Arc<TransportHolder>,
        upstream: UpstreamTarget,
        settings: TransportSettings,
    ) -> Result<Self> {
        let fallback = OutboundTransport::plain(settings)
            .wrap_err("Failed to create default upstream transport")?;
        tracing::info!("Created upstream client for {upstream}");
        Ok(Self {
            holder,
            fallback: Arc::new(fallback),
            upstream,
        })
    }

    pub fn upstream(&self) -> &UpstreamTarget {
        &self.upstream
    }

    /// Transport the next request will use.
    pub fn current_transport(&self) -> Arc<OutboundTransport> {
        self.holder
            .load()
            .unwrap_or_else(|| self.fallback.clone())
    }

    fn prepare(&self, req: Request<AxumBody>) -> HttpClientResult<Request<AxumBody>> {
        let (mut parts, body) = req.into_parts();
        parts.uri = self
            .upstream
            .rewrite(&parts.uri)
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
        // ALPN decides the wire version; hyper fills in Host / :authority from the URI.
        parts.version = Version::HTTP_11;
        parts.headers.remove(header::HOST);
        strip_hop_by_hop(&mut parts.headers);
        Ok(Request::from_parts(parts, body))
    }
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<header::HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| header::HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP_HEADERS.iter()) {
        headers.remove(name);
    }
    headers.remove("proxy-connection");
}

#[async_trait]
impl HttpClient for UpstreamClient {
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
        let transport = self.current_transport();
        let outgoing = self.prepare(req)?;

        let span = create_upstream_span(
            &self.upstream.to_string(),
            outgoing.method().as_str(),
            outgoing.uri().path(),
            transport.generation(),
        );

        async move {
            let method = outgoing.method().clone();
            let uri = outgoing.uri().clone();

            match transport.client().request(outgoing).await {
                Ok(response) => {
                    tracing::Span::current().record("http.status_code", response.status().as_u16());
                    let (mut parts, hyper_body) = response.into_parts();
                    strip_hop_by_hop(&mut parts.headers);
                    Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
                }
                Err(e) => {
                    tracing::error!("Error making request to upstream ({method} {uri}): {e:?}");
                    Err(HttpClientError::ConnectionError(format!(
                        "Request to {method} {uri} failed: {e}"
                    )))
                }
            }
        }
        .instrument(span)
        .await
    }
}
