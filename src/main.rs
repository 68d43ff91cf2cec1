use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use webserv::config;
use webserv::server::{describe, Server};

/// Single-process HTTP/1.1 server
#[derive(Parser, Debug)]
#[command(name = "webserv", version, long_about = None)]
struct Cli {
    /// Configuration file; the built-in default is used when omitted
    config: Option<PathBuf>,

    /// Load and validate the configuration, print a summary and exit
    #[arg(long, default_value_t = false)]
    check: bool,

    /// Log filter used when RUST_LOG is not set (e.g. debug, webserv=trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let source = cli
        .config
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "built-in default".to_string());
    let (config, warnings) =
        config::load(cli.config.as_deref()).with_context(|| format!("invalid configuration ({})", source))?;
    for warning in &warnings {
        warn!("{}", warning);
    }

    if cli.check {
        print!("{}", describe(&config));
        println!("configuration {} is valid", source);
        return Ok(());
    }

    let mut server = Server::from_config(&config).context("server startup failed")?;
    let shutdown = server.shutdown_handle();
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, std::sync::Arc::clone(&shutdown))
            .with_context(|| format!("cannot install handler for signal {}", signal))?;
    }
    server.enable_stdin_control();

    info!(config = %source, "webserv started");
    let stats = server.run().context("event loop failed")?;
    info!(requests = stats.requests_served, "bye");
    Ok(())
}
