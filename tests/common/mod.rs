#![allow(dead_code)]

use std::{fs, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use axum::{Router, body::Body as AxumBody, http::HeaderMap, routing::get};
use http_body_util::BodyExt;
use hyper::{Request, StatusCode};
use hyper_util::{
    client::legacy::Client,
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
    service::TowerToHyperService,
};
use metrics_proxy::{
    GracefulShutdown, HttpHandler, Startup, UpstreamClient,
    core::{CredentialSet, TransportSettings, transport::install_crypto_provider},
    router,
};
use rcgen::generate_simple_self_signed;
use rustls::{
    RootCertStore, ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    server::WebPkiClientVerifier,
};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_rustls::TlsAcceptor;

/// A self-signed certificate and its key, in both encodings.
#[derive(Clone)]
pub struct Identity {
    pub label: String,
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: CertificateDer<'static>,
    key_der: Vec<u8>,
}

impl Identity {
    pub fn generate(label: &str, dns_name: &str) -> Self {
        let generated = generate_simple_self_signed(vec![dns_name.to_string()]).unwrap();
        Self {
            label: label.to_string(),
            cert_pem: generated.cert.pem(),
            key_pem: generated.signing_key.serialize_pem(),
            cert_der: generated.cert.der().clone(),
            key_der: generated.signing_key.serialize_der(),
        }
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivatePkcs8KeyDer::from(self.key_der.clone()).into()
    }
}

/// Credential files in a temporary directory.
pub struct CredentialDir {
    pub dir: tempfile::TempDir,
    pub set: CredentialSet,
}

impl CredentialDir {
    pub fn new(server_name: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let set = CredentialSet::new(
            dir.path().join("ca.crt"),
            dir.path().join("tls.crt"),
            dir.path().join("tls.key"),
            server_name,
        );
        Self { dir, set }
    }

    pub fn write_ca(&self, ca: &Identity) {
        fs::write(&self.set.ca_path, &ca.cert_pem).unwrap();
    }

    /// Write certificate then key, the way a rotation tool would.
    pub async fn write_client(&self, client: &Identity) {
        fs::write(&self.set.cert_path, &client.cert_pem).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        fs::write(&self.set.key_path, &client.key_pem).unwrap();
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Upstream handler: echoes what it learned about the caller.
fn upstream_router(scheme: &'static str, client_label: String) -> Router {
    Router::new().route(
        "/metrics",
        get(move |headers: HeaderMap| async move {
            let forwarded = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_string();
            format!("scheme={scheme} client={client_label} xff={forwarded}\n")
        }),
    )
}

/// Plain HTTP upstream on an ephemeral port.
pub async fn spawn_plain_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = upstream_router("http", "-".to_string());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// TLS upstream requiring a client certificate from `clients`.
///
/// Responses name the client identity that was presented on the connection.
pub async fn spawn_tls_upstream(server: &Identity, clients: &[Identity]) -> SocketAddr {
    install_crypto_provider();

    let mut roots = RootCertStore::empty();
    for client in clients {
        roots.add(client.cert_der.clone()).unwrap();
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .unwrap();
    let mut config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![server.cert_der.clone()], server.private_key())
        .unwrap();
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    let acceptor = TlsAcceptor::from(Arc::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let clients: Arc<Vec<Identity>> = Arc::new(clients.to_vec());

    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let clients = clients.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(tcp).await else {
                    return;
                };
                let label = tls
                    .get_ref()
                    .1
                    .peer_certificates()
                    .and_then(|chain| chain.first())
                    .and_then(|presented| clients.iter().find(|c| &c.cert_der == presented))
                    .map(|c| c.label.clone())
                    .unwrap_or_else(|| "unknown".to_string());

                let service = TowerToHyperService::new(upstream_router("https", label));
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(tls), service)
                    .await;
            });
        }
    });
    addr
}

/// The proxy's HTTP surface bound to an ephemeral port.
pub struct RunningProxy {
    pub addr: SocketAddr,
    pub shutdown: GracefulShutdown,
    pub handle: JoinHandle<()>,
}

pub async fn spawn_proxy(startup: &Startup, metrics_path: &str) -> RunningProxy {
    let client = UpstreamClient::new(
        startup.holder.clone(),
        startup.upstream.clone(),
        TransportSettings::default(),
    )
    .unwrap();
    let app = router(Arc::new(HttpHandler::new(Arc::new(client), metrics_path)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = GracefulShutdown::new();
    let signal = shutdown.clone();

    let handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            signal.wait_for_shutdown_signal().await;
        })
        .await
        .unwrap();
    });

    RunningProxy {
        addr,
        shutdown,
        handle,
    }
}

/// GET `path` from `addr` over plain HTTP and return status and body.
pub async fn http_get(addr: SocketAddr, path: &str) -> (StatusCode, String) {
    let client = Client::builder(TokioExecutor::new()).build_http::<AxumBody>();
    let req = Request::get(format!("http://{addr}{path}"))
        .body(AxumBody::empty())
        .unwrap();
    let response = client.request(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

/// Poll `path` until the body satisfies `accept` or `timeout` elapses.
pub async fn wait_for_body(
    addr: SocketAddr,
    path: &str,
    timeout: Duration,
    accept: impl Fn(&str) -> bool,
) -> Option<String> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let (_, body) = http_get(addr, path).await;
        if accept(&body) {
            return Some(body);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
