use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use clap::Parser;
use color_eyre::{Result, eyre::WrapErr};
use metrics_proxy::{
    GracefulShutdown, HttpHandler, NotifyChangeSource, ProxyMode, Startup, UpstreamClient,
    config::{ConfigOverrides, ConfigValidator, LogFormat, ProxyConfig, load_config},
    core::{CredentialError, CredentialLoader, transport::install_crypto_provider},
    router, tracing_setup,
};
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(flatten)]
    options: ProxyArgs,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Start the proxy (default)
    Serve,
    /// Validate configuration and try loading the upstream credentials once
    Validate,
}

#[derive(clap::Args, Debug)]
struct ProxyArgs {
    /// Optional configuration file (YAML, JSON or TOML)
    #[clap(short, long, global = true)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[clap(long, global = true)]
    port: Option<u16>,

    /// Upstream metrics host
    #[clap(long, global = true)]
    upstream_host: Option<String>,

    /// Upstream metrics port
    #[clap(long, global = true)]
    upstream_port: Option<u16>,

    /// Name the upstream server certificate must be valid for
    #[clap(long, global = true)]
    upstream_server_name: Option<String>,

    /// CA bundle trusted for the upstream
    #[clap(long, global = true)]
    etcd_ca: Option<PathBuf>,

    /// Client certificate presented to the upstream
    #[clap(long, global = true)]
    etcd_cert: Option<PathBuf>,

    /// Private key for the client certificate
    #[clap(long, global = true)]
    etcd_key: Option<PathBuf>,

    /// Path that is proxied to the upstream
    #[clap(long, global = true)]
    metrics_path: Option<String>,

    /// Log filter, e.g. "info" or "info,tls_reload=debug"
    #[clap(long, global = true)]
    log_level: Option<String>,

    /// Log output format: json or pretty
    #[clap(long, global = true)]
    log_format: Option<LogFormat>,
}

impl ProxyArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            port: self.port,
            upstream_host: self.upstream_host.clone(),
            upstream_port: self.upstream_port,
            upstream_server_name: self.upstream_server_name.clone(),
            etcd_ca: self.etcd_ca.clone(),
            etcd_cert: self.etcd_cert.clone(),
            etcd_key: self.etcd_key.clone(),
            metrics_path: self.metrics_path.clone(),
            log_level: self.log_level.clone(),
            log_format: self.log_format,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let config = load_config(args.options.config.as_deref(), &args.options.overrides())?;

    match args.command.unwrap_or(Commands::Serve) {
        Commands::Validate => validate_command(&config),
        Commands::Serve => serve(config).await,
    }
}

async fn serve(config: ProxyConfig) -> Result<()> {
    tracing_setup::init_tracing(&config.logging)?;
    ConfigValidator::validate(&config).wrap_err("Invalid configuration")?;

    install_crypto_provider();

    let settings = config
        .transport_settings()
        .wrap_err("Invalid transport timeouts")?;
    let debounce = config
        .reload_debounce()
        .wrap_err("Invalid reload debounce")?;

    let startup = Startup::establish(
        config.credential_set(),
        CredentialLoader::new(settings),
        &config.upstream_host,
        config.upstream_ports(),
    )?;

    let watcher = match startup.mode {
        ProxyMode::TlsManaged => startup.start_watcher(NotifyChangeSource::new(), debounce),
        ProxyMode::Plain => None,
    };

    let client = UpstreamClient::new(startup.holder.clone(), startup.upstream.clone(), settings)?;
    let handler = Arc::new(HttpHandler::new(Arc::new(client), config.metrics_path.clone()));
    let app = router(handler);

    let listen_addr = config.listen_addr();
    let listener = TcpListener::bind(listen_addr)
        .await
        .wrap_err_with(|| format!("Failed to bind {listen_addr}"))?;
    tracing::info!("Listening on {listen_addr}, proxying {}", config.metrics_path);

    let shutdown = GracefulShutdown::new();
    let signal_handler = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { shutdown.run_signal_handler().await })
    };

    let drain_signal = shutdown.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let reason = drain_signal.wait_for_shutdown_signal().await;
        tracing::info!("Shutdown signal received: {:?}, draining connections", reason);
    });

    let server_result = tokio::select! {
        result = server => result.wrap_err("Server error"),
        _ = async {
            shutdown.wait_for_shutdown_signal().await;
            tokio::time::sleep(shutdown.drain_timeout()).await;
        } => {
            tracing::warn!("Drain timeout exceeded ({:?}), forcing shutdown", shutdown.drain_timeout());
            Ok(())
        }
    };

    signal_handler.abort();
    if let Some((reloader, handle)) = watcher {
        handle.abort();
        let stats = reloader.stats();
        tracing::info!(
            target: "tls_reload",
            attempts = stats.attempts(),
            successes = stats.successes(),
            failures = stats.failures(),
            "Credential reloads during this run"
        );
    }

    server_result?;
    tracing::info!("Graceful shutdown completed");
    Ok(())
}

fn validate_command(config: &ProxyConfig) -> Result<()> {
    println!("🔍 Validating metrics-proxy configuration");

    if let Err(e) = ConfigValidator::validate(config) {
        eprintln!("❌ Configuration validation failed:");
        eprintln!("{e}");
        std::process::exit(1);
    }
    println!("✅ Configuration validation: OK");

    let settings = config.transport_settings()?;
    let credentials = config.credential_set();
    let mode = match CredentialLoader::new(settings).load(&credentials) {
        Ok(_) => ProxyMode::TlsManaged,
        Err(CredentialError::CaRead { path, source }) => {
            println!("⚠️  CA {} unreadable ({source})", path.display());
            ProxyMode::Plain
        }
        Err(e) => {
            eprintln!("❌ Credential check failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    let ports = config.upstream_ports();
    let (scheme, upstream_port) = match mode {
        ProxyMode::TlsManaged => ("https", ports.tls),
        ProxyMode::Plain => ("http", ports.plain),
    };

    println!();
    println!("📋 Configuration Summary:");
    println!("   • Listen Address: {}", config.listen_addr());
    println!(
        "   • Upstream: {scheme}://{}:{upstream_port}",
        config.upstream_host
    );
    println!("   • Metrics Path: {}", config.metrics_path);
    println!("   • Mode: {mode:?}");
    if mode == ProxyMode::TlsManaged {
        println!("   • Server Name: {}", credentials.server_name);
        println!("   • Reload Debounce: {}", config.reload.debounce);
    }
    println!();
    println!("🎉 Configuration is valid and ready to use!");
    Ok(())
}
