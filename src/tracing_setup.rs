use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingConfig};

/// Build the filter: `RUST_LOG` when set, otherwise the configured level.
pub fn build_env_filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}")),
    }
}

/// Initialize logging from the `logging` section of the configuration
pub fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let env_filter = build_env_filter(&logging.level)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match logging.format {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(false)
                    .with_span_list(true),
            )
            .try_init(),
        LogFormat::Pretty => Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init(),
    }
    .wrap_err("Failed to install tracing subscriber")?;

    tracing::info!(
        level = %logging.level,
        format = %logging.format,
        "metrics-proxy logging initialized"
    );
    Ok(())
}

/// Create the span wrapping one request relayed to the upstream
pub fn create_upstream_span(
    upstream_url: &str,
    method: &str,
    path: &str,
    generation: u64,
) -> tracing::Span {
    tracing::info_span!(
        "upstream_request",
        upstream.url = upstream_url,
        http.method = method,
        http.path = path,
        transport.generation = generation,
        http.status_code = tracing::field::Empty,
    )
}
