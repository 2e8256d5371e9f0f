use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for filesystem change notification
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ChangeSourceError {
    /// The directory could not be subscribed to
    #[error("failed to watch {path}: {reason}")]
    Subscribe { path: PathBuf, reason: String },

    /// The notification backend reported a problem after subscribing
    #[error("watcher error: {0}")]
    Backend(String),
}

/// Result type for change source operations
pub type ChangeSourceResult<T> = Result<T, ChangeSourceError>;

/// Kind of change observed on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Write,
    Remove,
    Rename,
    /// Permission or other metadata change
    Chmod,
    /// Anything else (e.g. plain reads); never triggers a reload
    Other,
}

impl ChangeKind {
    /// Whether this kind of change can alter what a credential file holds.
    pub fn is_content_change(self) -> bool {
        !matches!(self, ChangeKind::Other)
    }
}

/// A single change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Stream of change notifications (or backend errors) for subscribed directories.
pub type ChangeStream = mpsc::UnboundedReceiver<ChangeSourceResult<ChangeEvent>>;

/// ChangeSource defines the port for filesystem change notification
pub trait ChangeSource: Send + 'static {
    /// Start receiving notifications for entries directly inside `dir`.
    fn subscribe(&mut self, dir: &Path) -> ChangeSourceResult<()>;

    /// Take the notification stream. Returns `None` once it has been taken.
    fn events(&mut self) -> Option<ChangeStream>;
}
