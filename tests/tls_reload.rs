// Mutual TLS to the upstream with credentials rotated on disk while serving
mod common;

use std::{fs, sync::Arc, time::Duration};

use common::{CredentialDir, Identity, http_get, spawn_proxy, spawn_tls_upstream, wait_for_body};
use hyper::StatusCode;
use metrics_proxy::{
    NotifyChangeSource, ProxyMode, Startup, UpstreamPorts,
    core::{CredentialLoader, DebouncedReloader},
};

const QUIET_PERIOD: Duration = Duration::from_millis(100);
const RELOAD_DEADLINE: Duration = Duration::from_secs(10);

struct Fixture {
    creds: CredentialDir,
    startup: Startup,
    reloader: Arc<DebouncedReloader>,
    server: Identity,
    first: Identity,
    second: Identity,
}

async fn tls_fixture() -> Fixture {
    let server = Identity::generate("server", "localhost");
    let first = Identity::generate("one", "client-one");
    let second = Identity::generate("two", "client-two");
    let upstream = spawn_tls_upstream(&server, &[first.clone(), second.clone()]).await;

    let creds = CredentialDir::new("localhost");
    creds.write_ca(&server);
    creds.write_client(&first).await;

    let startup = Startup::establish(
        creds.set.clone(),
        CredentialLoader::default(),
        "127.0.0.1",
        UpstreamPorts {
            tls: upstream.port(),
            plain: 1,
        },
    )
    .unwrap();
    assert_eq!(startup.mode, ProxyMode::TlsManaged);

    let (reloader, _watch) = startup
        .spawn_watcher(NotifyChangeSource::new().unwrap(), QUIET_PERIOD)
        .unwrap();
    // Let the watch loop subscribe before anything is rotated.
    tokio::time::sleep(Duration::from_millis(200)).await;

    Fixture {
        creds,
        startup,
        reloader,
        server,
        first,
        second,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_certificate_rotation_is_picked_up() {
    let fx = tls_fixture().await;
    let proxy = spawn_proxy(&fx.startup, "/metrics").await;

    let (status, body) = http_get(proxy.addr, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with("scheme=https client=one "), "unexpected body: {body}");

    let before = fx.startup.holder.load().unwrap();
    fx.creds.write_client(&fx.second).await;

    let rotated = wait_for_body(proxy.addr, "/metrics", RELOAD_DEADLINE, |body| {
        body.contains("client=two")
    })
    .await;
    assert!(rotated.is_some(), "proxy never presented the rotated certificate");

    let after = fx.startup.holder.load().unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert!(after.generation() > before.generation());
    assert_eq!(
        after.identity().unwrap().client_chain,
        vec![fx.second.cert_der.clone()]
    );
    assert!(fx.reloader.stats().successes() >= 1);
    assert_eq!(fx.reloader.stats().failures(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_corrupted_rotation_keeps_serving_previous_credentials() {
    let fx = tls_fixture().await;
    let proxy = spawn_proxy(&fx.startup, "/metrics").await;
    let before = fx.startup.holder.load().unwrap();

    // Certificate of the second identity with the key of the first: a mismatch.
    fs::write(&fx.creds.set.cert_path, &fx.second.cert_pem).unwrap();

    let deadline = tokio::time::Instant::now() + RELOAD_DEADLINE;
    while fx.reloader.stats().failures() == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "reload of the corrupted certificate never ran"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(Arc::ptr_eq(&before, &fx.startup.holder.load().unwrap()));
    let (status, body) = http_get(proxy.addr, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("client=one"), "unexpected body: {body}");

    // Completing the rotation recovers.
    fs::write(&fx.creds.set.key_path, &fx.second.key_pem).unwrap();
    let rotated = wait_for_body(proxy.addr, "/metrics", RELOAD_DEADLINE, |body| {
        body.contains("client=two")
    })
    .await;
    assert!(rotated.is_some(), "proxy never recovered after the key was written");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rewriting_identical_files_rebuilds_equivalent_transport() {
    let fx = tls_fixture().await;
    let before = fx.startup.holder.load().unwrap();

    fx.creds.write_ca(&fx.server);
    fx.creds.write_client(&fx.first).await;

    let deadline = tokio::time::Instant::now() + RELOAD_DEADLINE;
    while fx.reloader.stats().successes() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "no reload observed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let after = fx.startup.holder.load().unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(before.identity(), after.identity());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unrelated_file_in_watched_directory_is_ignored() {
    let fx = tls_fixture().await;

    for i in 0..5 {
        fs::write(fx.creds.path().join(format!("notes-{i}.txt")), "x").unwrap();
    }
    tokio::time::sleep(QUIET_PERIOD * 5).await;

    assert_eq!(fx.reloader.stats().attempts(), 0);
    assert!(!fx.reloader.is_pending());
}
