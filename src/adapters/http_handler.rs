use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body as AxumBody,
    extract::{ConnectInfo, Request},
    http::{HeaderValue, StatusCode, header},
    response::Response,
    routing::any,
};
use tower_http::trace::TraceLayer;

use crate::ports::http_client::HttpClient;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Body returned on every non-metrics path.
pub const LIVENESS_BODY: &str = "ok";

/// HTTP handler for the metrics proxy
pub struct HttpHandler {
    client: Arc<dyn HttpClient>,
    metrics_path: String,
}

impl HttpHandler {
    pub fn new(client: Arc<dyn HttpClient>, metrics_path: impl Into<String>) -> Self {
        Self {
            client,
            metrics_path: metrics_path.into(),
        }
    }

    pub fn metrics_path(&self) -> &str {
        &self.metrics_path
    }

    /// Proxy the metrics path upstream; answer everything else locally.
    pub async fn handle_request(
        &self,
        req: Request,
        client_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        if req.uri().path() != self.metrics_path {
            return liveness();
        }
        self.handle_metrics(req, client_addr).await
    }

    async fn handle_metrics(
        &self,
        mut req: Request,
        client_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        tracing::info!("server: proxy metrics request to upstream");

        if let Some(addr) = client_addr {
            append_forwarded_for(req.headers_mut(), addr);
        }

        match self.client.send_request(req).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Upstream request failed: {e}");
                plain_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }
}

fn liveness() -> Response<AxumBody> {
    plain_response(StatusCode::OK, LIVENESS_BODY)
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn append_forwarded_for(headers: &mut header::HeaderMap, addr: SocketAddr) {
    let client_ip = addr.ip().to_string();
    let value = match headers
        .get(X_FORWARDED_FOR)
        .and_then(|existing| existing.to_str().ok())
    {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Build the axum router serving every path through `handler`.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` to get
/// `X-Forwarded-For` populated.
pub fn router(handler: Arc<HttpHandler>) -> Router {
    let route = any(move |req: Request| {
        let handler = handler.clone();
        async move {
            let client_addr = req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr);
            Ok::<_, Infallible>(handler.handle_request(req, client_addr).await)
        }
    });

    Router::new()
        .route("/", route.clone())
        .route("/{*path}", route)
        .layer(TraceLayer::new_for_http())
}
