use std::path::Path;

use eyre::{Result, WrapErr};
use notify::{
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::ModifyKind,
};
use tokio::sync::mpsc;

use crate::ports::change_source::{
    ChangeEvent, ChangeKind, ChangeSource, ChangeSourceError, ChangeSourceResult, ChangeStream,
};

/// Change source backed by the platform's native filesystem notifications.
pub struct NotifyChangeSource {
    // Dropping the watcher stops notifications and closes the stream.
    watcher: RecommendedWatcher,
    events: Option<ChangeStream>,
}

impl NotifyChangeSource {
    pub fn new() -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    let kind = classify(&event.kind);
                    for path in event.paths {
                        // Receiver gone means the watch loop has exited.
                        let _ = tx.send(Ok(ChangeEvent::new(path, kind)));
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(ChangeSourceError::Backend(e.to_string())));
                }
            }
        })
        .wrap_err("Failed to create filesystem watcher")?;

        Ok(Self {
            watcher,
            events: Some(rx),
        })
    }
}

impl ChangeSource for NotifyChangeSource {
    fn subscribe(&mut self, dir: &Path) -> ChangeSourceResult<()> {
        self.watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| ChangeSourceError::Subscribe {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            })?;
        tracing::debug!(target: "tls_reload", dir = %dir.display(), "Watching directory");
        Ok(())
    }

    fn events(&mut self) -> Option<ChangeStream> {
        self.events.take()
    }
}

fn classify(kind: &EventKind) -> ChangeKind {
    match kind {
        EventKind::Create(_) => ChangeKind::Create,
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => ChangeKind::Write,
        EventKind::Modify(ModifyKind::Name(_)) => ChangeKind::Rename,
        EventKind::Modify(ModifyKind::Metadata(_)) => ChangeKind::Chmod,
        EventKind::Modify(ModifyKind::Other) => ChangeKind::Write,
        EventKind::Remove(_) => ChangeKind::Remove,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => ChangeKind::Other,
    }
}
