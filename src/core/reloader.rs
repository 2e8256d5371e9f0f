//! Debounced credential reloads.
//!
//! Change notifications arrive in bursts: a rotation that writes a new
//! certificate, a new key and then swaps a symlink can easily produce a dozen
//! events within a few milliseconds. [`DebouncedReloader`] keeps a single
//! re-armable deferred reload so that a whole burst results in one rebuild,
//! performed once the files have been quiet for `quiet_period`.
use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::task::JoinHandle;

use super::{
    credentials::{CredentialError, CredentialLoader, CredentialSet},
    transport::TransportHolder,
};

/// Quiet period applied when none is configured.
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(250);

/// Counters describing reload activity since startup.
#[derive(Debug, Default)]
pub struct ReloadStats {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl ReloadStats {
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Acquire)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }
}

/// The part of the reloader that runs on blocking workers.
struct ReloadTask {
    credentials: CredentialSet,
    loader: CredentialLoader,
    holder: Arc<TransportHolder>,
    stats: ReloadStats,
    // Serializes reload bodies; the last one to run reads the newest files.
    reload_lock: Mutex<()>,
}

impl ReloadTask {
    fn run(&self) -> Result<u64, CredentialError> {
        let _serialized = self
            .reload_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.stats.attempts.fetch_add(1, Ordering::AcqRel);

        let transport = match self.loader.load(&self.credentials) {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::AcqRel);
                tracing::error!(
                    target: "tls_reload",
                    error = %e,
                    "Credential reload failed; keeping the current transport"
                );
                return Err(e);
            }
        };

        let generation = transport.generation();
        if let Some(previous) = self.holder.swap(transport) {
            previous.retire();
        }
        self.stats.successes.fetch_add(1, Ordering::AcqRel);
        tracing::info!(
            target: "tls_reload",
            generation,
            "TLS configuration reloaded successfully"
        );
        Ok(generation)
    }
}

/// Coalesces change notifications into single, serialized reload attempts.
pub struct DebouncedReloader {
    task: Arc<ReloadTask>,
    quiet_period: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl DebouncedReloader {
    pub fn new(
        credentials: CredentialSet,
        loader: CredentialLoader,
        holder: Arc<TransportHolder>,
        quiet_period: Duration,
    ) -> Self {
        Self {
            task: Arc::new(ReloadTask {
                credentials,
                loader,
                holder,
                stats: ReloadStats::default(),
                reload_lock: Mutex::new(()),
            }),
            quiet_period,
            pending: Mutex::new(None),
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    pub fn stats(&self) -> &ReloadStats {
        &self.task.stats
    }

    /// (Re-)arm the deferred reload so it fires `quiet_period` from now.
    ///
    /// A timer that has not fired yet is cancelled and replaced. A reload that
    /// is already running is left alone. Must be called from within a tokio
    /// runtime.
    pub fn on_relevant_event(&self) {
        let task = self.task.clone();
        let quiet_period = self.quiet_period;

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = pending.take() {
            timer.abort();
        }
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(quiet_period).await;
            // Detached: aborting this timer later must not cancel the reload.
            drop(tokio::task::spawn_blocking(move || {
                let _ = task.run();
            }));
        }));
    }

    /// Whether a reload is scheduled but has not started yet.
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    /// Rebuild the transport right now, on the calling thread.
    ///
    /// On success returns the generation of the installed transport. On
    /// failure the holder is left exactly as it was.
    pub fn perform_reload(&self) -> Result<u64, CredentialError> {
        self.task.run()
    }
}

impl Drop for DebouncedReloader {
    fn drop(&mut self) {
        if let Some(timer) = self
            .pending
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
    }
}
