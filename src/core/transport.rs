//! Outbound transports and the single-slot holder the request path reads from.
//!
//! An [`OutboundTransport`] wraps a pooled hyper client. It is built once and
//! never mutated: credential rotation produces a brand new transport which is
//! swapped into the [`TransportHolder`].
use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use arc_swap::{ArcSwapOption, Guard};
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::Uri;
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioTimer},
};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls_native_certs::load_native_certs;
use tower::Service;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Connector stack shared by plain and TLS transports.
pub type UpstreamConnector = HandshakeTimeout<HttpsConnector<HttpConnector>>;

/// Pooled client used to reach the upstream.
pub type UpstreamHttpClient = Client<UpstreamConnector, AxumBody>;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Connection pooling and timeout parameters applied to every transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    /// Idle connections kept per upstream host.
    pub max_idle_connections: usize,
    /// How long an idle pooled connection is kept before being closed.
    pub idle_timeout: Duration,
    /// Upper bound for TCP connect plus TLS handshake.
    pub handshake_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_idle_connections: 100,
            idle_timeout: Duration::from_secs(90),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// What a TLS transport was built from. Plain transports carry none.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportIdentity {
    /// Certificates accepted as trust anchors for the upstream.
    pub trust_roots: Vec<CertificateDer<'static>>,
    /// Client certificate chain presented to the upstream.
    pub client_chain: Vec<CertificateDer<'static>>,
    /// Name the upstream certificate must be valid for.
    pub server_name: ServerName<'static>,
}

/// An immutable, reusable HTTP client for the upstream.
pub struct OutboundTransport {
    client: UpstreamHttpClient,
    identity: Option<TransportIdentity>,
    generation: u64,
}

impl std::fmt::Debug for OutboundTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundTransport")
            .field("generation", &self.generation)
            .field("tls", &self.identity.is_some())
            .finish()
    }
}

impl OutboundTransport {
    /// Build a TLS transport around an already assembled rustls config.
    ///
    /// The connector only dials `https://` URIs and verifies the upstream
    /// certificate against `identity.server_name`, whatever host is dialled.
    pub fn with_tls(
        tls_config: rustls::ClientConfig,
        identity: TransportIdentity,
        settings: TransportSettings,
    ) -> Self {
        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_only()
            .with_server_name_resolver(hyper_rustls::FixedServerNameResolver::new(
                identity.server_name.clone(),
            ))
            .enable_http1()
            .enable_http2()
            .wrap_connector(http_connector(&settings));

        Self::from_connector(https_connector, Some(identity), settings)
    }

    /// Build the default unconfigured transport: plain HTTP allowed, HTTPS
    /// verified against the platform trust store, no client identity.
    pub fn plain(settings: TransportSettings) -> Result<Self> {
        install_crypto_provider();

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        let (added, ignored) = root_cert_store.add_parsable_certificates(native_certs.certs);
        tracing::debug!(added, ignored, "Loaded native root certificates");
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS13,
            &rustls::version::TLS12,
        ])
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http_connector(&settings));

        Ok(Self::from_connector(https_connector, None, settings))
    }

    fn from_connector(
        connector: HttpsConnector<HttpConnector>,
        identity: Option<TransportIdentity>,
        settings: TransportSettings,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(settings.idle_timeout)
            .pool_max_idle_per_host(settings.max_idle_connections)
            .build::<_, AxumBody>(HandshakeTimeout::new(connector, settings.handshake_timeout));

        Self {
            client,
            identity,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn client(&self) -> &UpstreamHttpClient {
        &self.client
    }

    pub fn identity(&self) -> Option<&TransportIdentity> {
        self.identity.as_ref()
    }

    pub fn is_tls(&self) -> bool {
        self.identity.is_some()
    }

    /// Process-unique, increasing build number.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Give up the caller's reference to a transport that has been replaced.
    ///
    /// Idle pooled connections belong to the client's pool, which is torn down
    /// when the last clone of the client goes away. Requests still running on
    /// this transport keep it alive until they finish; nothing new can pick it
    /// up once it has left the holder.
    pub fn retire(self: Arc<Self>) {
        let borrowers = Arc::strong_count(&self).saturating_sub(1);
        tracing::info!(
            target: "tls_reload",
            generation = self.generation,
            borrowers,
            "Retiring outbound transport"
        );
    }
}

fn http_connector(settings: &TransportSettings) -> HttpConnector {
    let mut http_connector = HttpConnector::new();
    http_connector.enforce_http(false);
    http_connector.set_connect_timeout(Some(settings.handshake_timeout));
    http_connector.set_nodelay(true);
    http_connector
}

/// Install aws-lc-rs as the process crypto provider unless one already is.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Connector wrapper bounding the whole connect (TCP + TLS handshake).
#[derive(Debug, Clone)]
pub struct HandshakeTimeout<C> {
    inner: C,
    timeout: Duration,
}

impl<C> HandshakeTimeout<C> {
    pub fn new(inner: C, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl<C> Service<Uri> for HandshakeTimeout<C>
where
    C: Service<Uri> + Send + 'static,
    C::Response: Send + 'static,
    C::Error: Into<BoxError>,
    C::Future: Send + 'static,
{
    type Response = C::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let timeout = self.timeout;
        let connecting = self.inner.call(uri);
        Box::pin(async move {
            match tokio::time::timeout(timeout, connecting).await {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("upstream connect timed out after {timeout:?}"),
                )
                .into()),
            }
        })
    }
}

/// Single-slot, lock-free holder for the current [`OutboundTransport`].
///
/// Readers never block writers and never observe a partially built value:
/// every load returns either a complete transport or nothing.
#[derive(Debug, Default)]
pub struct TransportHolder {
    current: ArcSwapOption<OutboundTransport>,
}

impl TransportHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport(transport: Arc<OutboundTransport>) -> Self {
        Self {
            current: ArcSwapOption::new(Some(transport)),
        }
    }

    /// Replace the current transport.
    pub fn store(&self, transport: Arc<OutboundTransport>) {
        self.current.store(Some(transport));
    }

    /// Replace the current transport and hand back the one it displaced.
    pub fn swap(&self, transport: Arc<OutboundTransport>) -> Option<Arc<OutboundTransport>> {
        self.current.swap(Some(transport))
    }

    /// Most recently stored transport, if any.
    pub fn load(&self) -> Option<Arc<OutboundTransport>> {
        self.current.load_full()
    }

    /// Borrow the current transport without touching the reference count.
    pub fn peek(&self) -> Guard<Option<Arc<OutboundTransport>>> {
        self.current.load()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_none()
    }
}

#[cfg(test)]
mod tests {
    use std::{convert::Infallible, net::SocketAddr, sync::atomic::AtomicUsize};

    use http_body_util::BodyExt;
    use hyper::{Request, Response, body::Incoming, server::conn::http1, service::service_fn};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    use super::*;

    fn plain() -> Arc<OutboundTransport> {
        Arc::new(OutboundTransport::plain(TransportSettings::default()).unwrap())
    }

    /// HTTP/1 upstream reporting how many connections it currently has open.
    async fn spawn_counting_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let open = Arc::new(AtomicUsize::new(0));
        let counter = open.clone();

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let counter = counter.clone();
                tokio::spawn(async move {
                    let service = service_fn(|_req: Request<Incoming>| async {
                        Ok::<_, Infallible>(Response::new(AxumBody::from("up 1\n")))
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(tcp), service)
                        .await;
                    counter.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
        (addr, open)
    }

    async fn wait_for_open(open: &AtomicUsize, expected: usize) -> usize {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let current = open.load(Ordering::SeqCst);
            if current == expected || tokio::time::Instant::now() >= deadline {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_empty_holder_loads_nothing() {
        let holder = TransportHolder::new();
        assert!(holder.is_empty());
        assert!(holder.load().is_none());
    }

    #[tokio::test]
    async fn test_store_then_load_returns_same_instance() {
        let holder = TransportHolder::new();
        let transport = plain();
        holder.store(transport.clone());

        let loaded = holder.load().unwrap();
        assert!(Arc::ptr_eq(&loaded, &transport));
        assert!(!loaded.is_tls());
    }

    #[tokio::test]
    async fn test_swap_returns_previous() {
        let first = plain();
        let second = plain();
        let holder = TransportHolder::with_transport(first.clone());

        let previous = holder.swap(second.clone()).unwrap();
        assert!(Arc::ptr_eq(&previous, &first));
        assert!(Arc::ptr_eq(&holder.load().unwrap(), &second));
    }

    #[tokio::test]
    async fn test_generations_increase() {
        let first = plain();
        let second = plain();
        assert!(second.generation() > first.generation());
    }

    #[tokio::test]
    async fn test_retire_leaves_borrowed_clone_usable() {
        let transport = plain();
        let in_flight = transport.clone();
        transport.retire();

        assert_eq!(Arc::strong_count(&in_flight), 1);
        assert!(!in_flight.is_tls());
        assert!(in_flight.generation() > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retire_closes_idle_pooled_connections() {
        let (addr, open) = spawn_counting_upstream().await;
        let holder = TransportHolder::with_transport(plain());

        {
            let current = holder.load().unwrap();
            let request = Request::get(format!("http://{addr}/metrics"))
                .body(AxumBody::empty())
                .unwrap();
            let response = current.client().request(request).await.unwrap();
            response.into_body().collect().await.unwrap();
        }
        // The finished request leaves its connection idle in the pool.
        assert_eq!(wait_for_open(&open, 1).await, 1);

        let previous = holder.swap(plain()).unwrap();
        previous.retire();

        assert_eq!(wait_for_open(&open, 0).await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_loads_see_whole_transports() {
        let initial = plain();
        let holder = Arc::new(TransportHolder::with_transport(initial.clone()));
        let candidates: Vec<_> = (0..4).map(|_| plain()).collect();
        let mut known: Vec<u64> = candidates.iter().map(|t| t.generation()).collect();
        known.push(initial.generation());

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let holder = holder.clone();
                let known = known.clone();
                tokio::spawn(async move {
                    for _ in 0..1_000 {
                        let current = holder.load().expect("holder never empties");
                        assert!(known.contains(&current.generation()));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for _ in 0..50 {
            for candidate in &candidates {
                holder.store(candidate.clone());
            }
            tokio::task::yield_now().await;
        }

        for reader in readers {
            reader.await.unwrap();
        }
    }
}
