//! Command line entry point for the intercepting proxy.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use time::OffsetDateTime;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use tlstap::bootstrap::{self, ROOT_CA_PATH};
use tlstap::cert;
use tlstap::config::Config;
use tlstap::handler::{FileHandler, LocalRouter};
use tlstap::HttpHandler;

/// Intercepting HTTP/HTTPS forward proxy
#[derive(Parser)]
#[command(name = "tlstap")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server
    Start {
        /// Address to listen on (overrides config)
        #[arg(short, long)]
        listen: Option<String>,

        /// Path to the root certificate (overrides config)
        #[arg(long)]
        ca_cert: Option<PathBuf>,

        /// Path to the root private key (overrides config)
        #[arg(long)]
        ca_key: Option<PathBuf>,
    },

    /// Generate a root certificate and key
    GenerateCa {
        /// Overwrite existing root material
        #[arg(long)]
        force: bool,
    },

    /// Print the root certificate PEM
    ShowCa,
}

#[tokio::main]
async fn main() {
    // Must happen before any TLS configuration is built.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    if let Err(e) = run_command(cli).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn load_config(cli_path: &Option<PathBuf>) -> anyhow::Result<Config> {
    let mut config = match cli_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.expand_paths();
    config.validate()?;
    Ok(config)
}

async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli.config)?;
    match cli.command {
        Commands::Start {
            listen,
            ca_cert,
            ca_key,
        } => cmd_start(config, listen, ca_cert, ca_key).await,
        Commands::GenerateCa { force } => cmd_generate_ca(config, force).await,
        Commands::ShowCa => cmd_show_ca(config),
    }
}

async fn cmd_start(
    mut config: Config,
    listen: Option<String>,
    ca_cert: Option<PathBuf>,
    ca_key: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(listen) = listen {
        config.proxy.listen = listen;
    }
    if let Some(path) = ca_cert {
        config.ca.cert_path = path;
    }
    if let Some(path) = ca_key {
        config.ca.key_path = path;
    }

    if !config.ca.cert_path.exists() || !config.ca.key_path.exists() {
        info!("no root material found, generating a fresh root");
        generate_root(&config, false).await?;
    }

    let root_cert_pem = std::fs::read_to_string(&config.ca.cert_path)
        .with_context(|| format!("failed to read {}", config.ca.cert_path.display()))?;
    let root_key_pem = std::fs::read_to_string(&config.ca.key_path)
        .with_context(|| format!("failed to read {}", config.ca.key_path.display()))?;

    info!(
        "root certificate download available at http://proxy{ROOT_CA_PATH} (via the proxy) \
         or from {}",
        config.ca.cert_path.display()
    );

    let local: std::sync::Arc<dyn HttpHandler> = std::sync::Arc::new(LocalRouter::new().route(
        ROOT_CA_PATH,
        std::sync::Arc::new(FileHandler::new("text/plain", root_cert_pem.clone())),
    ));

    bootstrap::serve_proxy(
        &config.proxy.listen,
        root_cert_pem,
        root_key_pem,
        Some(local),
        config.hijack.hijacker_config(),
    )
    .await?;
    Ok(())
}

async fn cmd_generate_ca(config: Config, force: bool) -> anyhow::Result<()> {
    if !force && (config.ca.cert_path.exists() || config.ca.key_path.exists()) {
        bail!(
            "root material already exists at {} (use --force to overwrite)",
            config.ca.cert_path.display()
        );
    }
    generate_root(&config, true).await
}

async fn generate_root(config: &Config, announce_trust_steps: bool) -> anyhow::Result<()> {
    let valid_until =
        OffsetDateTime::now_utc() + time::Duration::days(i64::from(config.ca.root_validity_days));
    let (cert_pem, key_pem) = tokio::task::spawn_blocking(move || cert::sign_root(valid_until))
        .await
        .context("root generation task failed")??;

    write_pem(&config.ca.cert_path, &cert_pem)?;
    write_pem(&config.ca.key_path, &key_pem)?;
    info!("root certificate written to {:?}", config.ca.cert_path);
    info!("root private key written to {:?}", config.ca.key_path);

    if announce_trust_steps {
        println!("Root certificate generated.");
        println!();
        println!("To trust this root:");
        println!("  1. Import {} into your browser or system store", config.ca.cert_path.display());
        println!("  2. Or point your client at it, e.g. curl --cacert {}", config.ca.cert_path.display());
    }
    Ok(())
}

fn cmd_show_ca(config: Config) -> anyhow::Result<()> {
    let pem = std::fs::read_to_string(&config.ca.cert_path).with_context(|| {
        format!(
            "failed to read {} (run `tlstap generate-ca` first)",
            config.ca.cert_path.display()
        )
    })?;
    print!("{pem}");
    Ok(())
}

fn write_pem(path: &Path, pem: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, pem).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
