//! netlogd - print datagrams received on named UDP services
//!
//! Usage:
//!   netlogd 1979 1980
//!   netlogd --print-config

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use netlog_config::{init_logging, log_cli_info, log_cli_warn, Config, LogLevel};
use netlog_server::{Datagram, Registry};

#[derive(Parser)]
#[command(name = "netlogd")]
#[command(version, about = "Print datagrams received on named UDP services", long_about = None)]
struct Cli {
    /// Service names or ports to listen on ("0" picks a free port)
    #[arg(default_value = "0")]
    services: Vec<String>,

    /// Config file (default: ~/.netlog/config.toml, then .netlog/config.toml)
    #[arg(long, env = "NETLOG_CONFIG")]
    config: Option<PathBuf>,

    /// Log level override (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Print the default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_config {
        print!("{}", Config::default_toml());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => netlog_config::reload().context("Failed to load config")?,
    };

    let level: LogLevel = match &cli.log_level {
        Some(level) => level.parse().map_err(anyhow::Error::msg)?,
        None => config.log.level(),
    };
    init_logging(level);

    let registry = Registry::new(&config);
    registry
        .initialize()
        .context("Failed to initialize registry")?;

    let mut opened = 0;
    for service in &cli.services {
        let endpoint = match registry.create_or_get(Some(service)) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                log_cli_warn!(
                    "Skipping service",
                    service = service.as_str(),
                    code = e.code(),
                    error = tracing::field::display(&e),
                );
                continue;
            }
        };

        let addr = endpoint
            .local_addr()
            .with_context(|| format!("Endpoint for {} has no address", service))?;
        log_cli_info!(
            "Listening",
            service = service.as_str(),
            addr = tracing::field::display(addr),
        );

        endpoint.attach_callback(
            |datagram: &Datagram, label: &String| print_datagram(label, datagram),
            format!("{}@{}", service, addr.port()),
        );
        opened += 1;
    }

    if opened == 0 {
        anyhow::bail!("No service could be opened");
    }

    // Runs until the process is terminated.
    registry.join()?;
    Ok(())
}

fn print_datagram(label: &str, datagram: &Datagram) {
    if datagram.is_empty() {
        println!("[{}] {}: (empty)", label, datagram.peer());
        return;
    }
    println!(
        "[{}] {}: {}",
        label,
        datagram.peer(),
        datagram.text().trim_end_matches(['\r', '\n'])
    );
}
