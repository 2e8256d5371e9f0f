use std::path::{Path, PathBuf};

use config::{Config, ConfigBuilder, Environment, File, FileFormat, builder::DefaultState};
use eyre::{Result, WrapErr};

use crate::config::models::{LogFormat, ProxyConfig};

/// Prefix for environment overrides, e.g. `METRICS_PROXY_UPSTREAM_HOST` or
/// `METRICS_PROXY_RELOAD__DEBOUNCE`.
pub const ENV_PREFIX: &str = "METRICS_PROXY";

/// Values given on the command line. `None` leaves lower layers untouched.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub upstream_host: Option<String>,
    pub upstream_port: Option<u16>,
    pub upstream_server_name: Option<String>,
    pub etcd_ca: Option<PathBuf>,
    pub etcd_cert: Option<PathBuf>,
    pub etcd_key: Option<PathBuf>,
    pub metrics_path: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
}

/// Load configuration from defaults, an optional file, the environment and
/// command-line overrides, later layers winning.
pub fn load_config(config_path: Option<&Path>, overrides: &ConfigOverrides) -> Result<ProxyConfig> {
    load_config_from_env(config_path, overrides, Environment::with_prefix(ENV_PREFIX))
}

/// Like [`load_config`] with an explicit environment source.
pub fn load_config_from_env(
    config_path: Option<&Path>,
    overrides: &ConfigOverrides,
    environment: Environment,
) -> Result<ProxyConfig> {
    let mut builder = Config::builder();

    if let Some(path) = config_path {
        builder = builder.add_source(File::new(
            path.to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))?,
            file_format(path),
        ));
    }

    builder = builder.add_source(environment.prefix_separator("_").separator("__"));
    builder = apply_overrides(builder, overrides)?;

    let settings = builder
        .build()
        .wrap_err("Failed to build configuration")?;

    let proxy_config: ProxyConfig = settings
        .try_deserialize()
        .wrap_err("Failed to deserialize configuration")?;

    Ok(proxy_config)
}

/// Determine file format based on extension
fn file_format(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml,
    }
}

fn apply_overrides(
    builder: ConfigBuilder<DefaultState>,
    overrides: &ConfigOverrides,
) -> Result<ConfigBuilder<DefaultState>> {
    let path_value = |p: &Option<PathBuf>| p.as_ref().map(|p| p.to_string_lossy().into_owned());

    builder
        .set_override_option("port", overrides.port.map(i64::from))?
        .set_override_option("upstream_host", overrides.upstream_host.clone())?
        .set_override_option("upstream_port", overrides.upstream_port.map(i64::from))?
        .set_override_option(
            "upstream_server_name",
            overrides.upstream_server_name.clone(),
        )?
        .set_override_option("etcd_ca", path_value(&overrides.etcd_ca))?
        .set_override_option("etcd_cert", path_value(&overrides.etcd_cert))?
        .set_override_option("etcd_key", path_value(&overrides.etcd_key))?
        .set_override_option("metrics_path", overrides.metrics_path.clone())?
        .set_override_option("logging.level", overrides.log_level.clone())?
        .set_override_option(
            "logging.format",
            overrides.log_format.map(|f| f.to_string()),
        )
        .wrap_err("Invalid command-line override")
}
