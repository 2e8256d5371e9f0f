//! metrics-proxy - a metrics reverse proxy with live TLS credential reload.
//!
//! The proxy exposes an HTTP endpoint and relays requests for one path (by default
//! `/metrics`) to an upstream metrics endpoint, typically an etcd member that requires
//! mutual TLS. Every other path answers `200 ok` so the listener doubles as a liveness
//! probe.
//!
//! The upstream CA, client certificate and client key are files that get rotated on
//! disk. Their directories are watched; bursts of change events are debounced into a
//! single reload, and a freshly built outbound transport is swapped in atomically.
//! A reload that fails leaves the previous transport serving. Requests already in
//! flight finish on the transport they started with.
//!
//! If the CA cannot be read at startup the proxy runs in plain mode for the rest of
//! its lifetime: upstream requests go over plain HTTP and nothing is watched.
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations) while keeping
//! the reload machinery inside `core`:
//! - [`core::TransportHolder`] publishes the current transport,
//! - [`core::CredentialLoader`] turns the three files into a transport,
//! - [`core::ChangeWatcher`] filters filesystem events and feeds
//!   [`core::DebouncedReloader`].
//!
//! # Error Handling
//! Domain failures are typed (`CredentialError`, `ValidationError`, ...). Application
//! plumbing returns `eyre::Result<T>` with `WrapErr` context attached.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{HttpHandler, NotifyChangeSource, UpstreamClient, router},
    core::{ProxyMode, Startup, UpstreamPorts},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
