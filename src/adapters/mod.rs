pub mod http_client;
pub mod http_handler;
pub mod notify_source;

/// Re-export commonly used types from adapters
pub use http_client::UpstreamClient;
pub use http_handler::{HttpHandler, router};
pub use notify_source::NotifyChangeSource;
