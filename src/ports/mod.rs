pub mod change_source;
pub mod http_client;
