//! Deciding between plain and TLS-managed operation at startup.
use std::{sync::Arc, time::Duration};

use eyre::{Result, WrapErr};

use super::{
    credentials::{CredentialError, CredentialLoader, CredentialSet},
    reloader::DebouncedReloader,
    transport::TransportHolder,
    upstream::UpstreamTarget,
    watch_index::WatchTargetIndex,
    watcher::ChangeWatcher,
};
use crate::ports::change_source::ChangeSource;

/// How the proxy talks to its upstream for the rest of the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    /// The CA was unreadable at startup: plain HTTP, no live reload.
    Plain,
    /// Credentials loaded; transports are reloaded when the files change.
    TlsManaged,
}

/// Upstream ports for each mode.
///
/// A TLS-managed proxy reaches the upstream's client port. In plain mode the
/// upstream is expected to serve unauthenticated metrics on the same port the
/// proxy listens on, as etcd does with `--listen-metrics-urls`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamPorts {
    pub tls: u16,
    pub plain: u16,
}

/// Outcome of startup credential handling.
pub struct Startup {
    pub mode: ProxyMode,
    pub holder: Arc<TransportHolder>,
    pub upstream: UpstreamTarget,
    credentials: CredentialSet,
    loader: CredentialLoader,
}

impl Startup {
    /// Load the initial credentials and pick the mode.
    ///
    /// An unreadable CA selects [`ProxyMode::Plain`]. Once the CA is readable
    /// the operator has opted into TLS, so any other credential problem is an
    /// error.
    pub fn establish(
        credentials: CredentialSet,
        loader: CredentialLoader,
        upstream_host: &str,
        ports: UpstreamPorts,
    ) -> Result<Self> {
        let holder = Arc::new(TransportHolder::new());

        let mode = match loader.load(&credentials) {
            Ok(transport) => {
                tracing::info!(
                    target: "tls_reload",
                    generation = transport.generation(),
                    server_name = %credentials.server_name,
                    "Loaded initial upstream TLS credentials"
                );
                holder.store(Arc::new(transport));
                ProxyMode::TlsManaged
            }
            Err(CredentialError::CaRead { path, source }) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %source,
                    "CA file unreadable; proxying to the upstream over plain HTTP"
                );
                ProxyMode::Plain
            }
            Err(e) => {
                return Err(e).wrap_err("Failed to load upstream TLS credentials");
            }
        };

        let upstream = match mode {
            ProxyMode::TlsManaged => UpstreamTarget::new(true, upstream_host, ports.tls)?,
            ProxyMode::Plain => UpstreamTarget::new(false, upstream_host, ports.plain)?,
        };
        tracing::info!("will proxy: {upstream}");

        Ok(Self {
            mode,
            holder,
            upstream,
            credentials,
            loader,
        })
    }

    pub fn credentials(&self) -> &CredentialSet {
        &self.credentials
    }

    /// Build the reload pipeline and spawn its watch loop.
    ///
    /// Returns `None` in plain mode, where the watcher is never started.
    pub fn spawn_watcher<S: ChangeSource>(
        &self,
        source: S,
        quiet_period: Duration,
    ) -> Option<(Arc<DebouncedReloader>, tokio::task::JoinHandle<()>)> {
        if self.mode != ProxyMode::TlsManaged {
            return None;
        }

        let reloader = Arc::new(DebouncedReloader::new(
            self.credentials.clone(),
            self.loader,
            self.holder.clone(),
            quiet_period,
        ));
        let index = WatchTargetIndex::build(self.credentials.paths());
        let watcher = ChangeWatcher::new(source, index, reloader.clone());

        let handle = tokio::spawn(async move {
            let exit = watcher.run().await;
            tracing::info!(target: "tls_reload", ?exit, "Credential watcher stopped");
        });
        Some((reloader, handle))
    }

    /// [`Startup::spawn_watcher`] for a source that may have failed to start.
    ///
    /// A missing source only disables live reload; the initial transport keeps
    /// serving.
    pub fn start_watcher<S: ChangeSource>(
        &self,
        source: Result<S>,
        quiet_period: Duration,
    ) -> Option<(Arc<DebouncedReloader>, tokio::task::JoinHandle<()>)> {
        if self.mode != ProxyMode::TlsManaged {
            return None;
        }

        match source {
            Ok(source) => self.spawn_watcher(source, quiet_period),
            Err(e) => {
                tracing::error!(
                    target: "tls_reload",
                    error = %e,
                    "Failed to create credential file watcher; live reload disabled"
                );
                None
            }
        }
    }
}
