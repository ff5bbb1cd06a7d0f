use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use pathfinderd::config::{Config, LogLevel};
use pathfinderd::{server, telemetry};

/// Pathfinder service discovery server.
#[derive(Debug, Parser)]
#[command(
    name = "pathfinderd",
    disable_version_flag = true,
    about = "Light-weight service discovery domain server"
)]
struct Cli {
    /// Listener addresses; each becomes its own domain.
    #[arg(value_name = "DOMAIN-ADDR")]
    addrs: Vec<String>,

    /// Instantiate a multi-socket domain from '+'-separated addresses.
    #[arg(short = 'm', value_name = "ADDR0+...+ADDRN")]
    multi: Vec<String>,

    /// Read configuration from a file.
    #[arg(short = 'f', value_name = "CONF-FILE")]
    conf_file: Option<PathBuf>,

    /// Enable logging to console.
    #[arg(short = 's')]
    console: bool,

    /// Disable logging to syslog.
    #[arg(short = 'n')]
    no_syslog: bool,

    /// Log to a file.
    #[arg(short = 'o', value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Number of rotated log file backups to keep.
    #[arg(short = 'b', value_name = "COUNT")]
    log_file_backup: Option<u64>,

    /// Log file size at which rotation happens.
    #[arg(short = 'x', value_name = "BYTES")]
    log_file_max_size: Option<u64>,

    /// Syslog facility to use.
    #[arg(short = 'y', value_name = "FACILITY")]
    facility: Option<String>,

    /// Filter log records below this level.
    #[arg(short = 'l', value_name = "LEVEL")]
    level: Option<String>,

    /// Maximum number of connected clients (0 = no limit).
    #[arg(short = 'c', value_name = "MAX-CLIENTS")]
    max_clients: Option<u64>,

    /// Print the server version.
    #[arg(short = 'v')]
    version: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.version {
        println!("pathfinderd {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let _telemetry = match telemetry::init(&config.log) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Error setting up logging: {err}.");
            return ExitCode::FAILURE;
        }
    };

    let mut handles = Vec::new();
    for settings in config.domain_settings() {
        match server::start(settings) {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                tracing::error!("terminating: {err}");
                eprintln!("Error starting server: {err}.");
                for handle in handles {
                    handle.shutdown();
                }
                return ExitCode::FAILURE;
            }
        }
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        domains = handles.len(),
        "server started"
    );

    for handle in handles {
        handle.wait();
    }
    ExitCode::SUCCESS
}

fn build_config(cli: &Cli) -> Result<Config, String> {
    let mut config = match &cli.conf_file {
        Some(path) => {
            Config::load(path).map_err(|err| format!("Error reading configuration: {err}."))?
        }
        None => Config::default(),
    };

    let mut groups: Vec<Vec<String>> = cli.addrs.iter().map(|addr| vec![addr.clone()]).collect();
    for multi in &cli.multi {
        groups.push(multi.split('+').map(str::to_string).collect());
    }
    if !groups.is_empty() {
        config
            .set_domains(&groups)
            .map_err(|err| format!("Error parsing command line: {err}."))?;
    }

    if config.domains.is_empty() {
        return Err("No domains configured.".to_string());
    }

    if cli.console {
        config.log.console = true;
    }
    if cli.no_syslog {
        config.log.syslog = false;
    }
    if let Some(log_file) = &cli.log_file {
        config.log.log_file = Some(log_file.clone());
    }
    if let Some(backup) = cli.log_file_backup {
        config.log.log_file_backup = backup;
    }
    if let Some(max_size) = cli.log_file_max_size {
        config.log.log_file_max_size = max_size;
    }
    if let Some(facility) = &cli.facility {
        config.log.facility = facility.clone();
    }
    if let Some(level) = &cli.level {
        config.log.filter =
            LogLevel::parse(level).map_err(|err| format!("Error parsing command line: {err}."))?;
    }
    if let Some(max_clients) = cli.max_clients {
        config.resources.total.clients = if max_clients == 0 {
            None
        } else {
            Some(max_clients)
        };
    }

    Ok(config)
}
