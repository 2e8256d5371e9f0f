pub mod credentials;
pub mod reloader;
pub mod startup;
pub mod transport;
pub mod upstream;
pub mod watch_index;
pub mod watcher;

pub use credentials::{CredentialError, CredentialLoader, CredentialSet};
pub use reloader::{DebouncedReloader, ReloadStats};
pub use startup::{ProxyMode, Startup, UpstreamPorts};
pub use transport::{OutboundTransport, TransportHolder, TransportSettings};
pub use upstream::UpstreamTarget;
pub use watch_index::WatchTargetIndex;
pub use watcher::ChangeWatcher;
