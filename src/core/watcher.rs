use std::sync::Arc;

use crate::ports::change_source::{ChangeEvent, ChangeSource};

use super::{reloader::DebouncedReloader, watch_index::WatchTargetIndex};

/// How the watch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchExit {
    /// The notification stream closed.
    StreamClosed,
    /// The stream had already been taken from the source.
    NoStream,
}

/// Feeds relevant credential file changes into a [`DebouncedReloader`].
pub struct ChangeWatcher<S> {
    source: S,
    index: Arc<WatchTargetIndex>,
    reloader: Arc<DebouncedReloader>,
}

impl<S: ChangeSource> ChangeWatcher<S> {
    pub fn new(source: S, index: WatchTargetIndex, reloader: Arc<DebouncedReloader>) -> Self {
        Self {
            source,
            index: Arc::new(index),
            reloader,
        }
    }

    pub fn index(&self) -> &WatchTargetIndex {
        &self.index
    }

    /// Subscribe to every indexed directory. Failures are logged and skipped;
    /// returns how many subscriptions succeeded.
    pub fn subscribe_all(&mut self) -> usize {
        let mut watching = 0;
        for dir in self.index.watch_dirs() {
            match self.source.subscribe(dir) {
                Ok(()) => {
                    tracing::info!(target: "tls_reload", dir = %dir.display(), "Watching credential directory");
                    watching += 1;
                }
                Err(e) => {
                    tracing::error!(
                        target: "tls_reload",
                        dir = %dir.display(),
                        error = %e,
                        "Failed to watch credential directory; changes there will not be picked up"
                    );
                }
            }
        }
        watching
    }

    /// Whether `event` should re-arm the reload timer.
    pub fn is_trigger(&self, event: &ChangeEvent) -> bool {
        event.kind.is_content_change() && self.index.is_relevant(&event.path)
    }

    /// Subscribe and consume notifications until the stream closes.
    ///
    /// The source is owned for the whole loop so its subscriptions stay alive.
    pub async fn run(mut self) -> WatchExit {
        self.subscribe_all();

        let Some(mut events) = self.source.events() else {
            tracing::error!(target: "tls_reload", "Change stream unavailable; live reload disabled");
            return WatchExit::NoStream;
        };

        while let Some(next) = events.recv().await {
            match next {
                Ok(event) if self.is_trigger(&event) => {
                    tracing::info!(
                        target: "tls_reload",
                        path = %event.path.display(),
                        kind = ?event.kind,
                        "Detected credential change"
                    );
                    self.reloader.on_relevant_event();
                }
                Ok(event) => {
                    tracing::trace!(target: "tls_reload", path = %event.path.display(), "Ignoring change");
                }
                Err(e) => {
                    tracing::warn!(target: "tls_reload", error = %e, "Watcher error");
                }
            }
        }

        tracing::error!(
            target: "tls_reload",
            "Change stream closed; credentials will no longer be reloaded"
        );
        WatchExit::StreamClosed
    }
}
