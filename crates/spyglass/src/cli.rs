//! Command-line interface for the Spyglass proxy.

use clap::{Arg, Command};
use std::path::PathBuf;

/// Command line arguments parsed from user input.
///
/// Every option here overrides the corresponding configuration file
/// setting.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file.
    pub config_path: PathBuf,
    /// Optional override for the local listener port.
    pub proxy_port: Option<u16>,
    /// Optional override for the upstream server address.
    pub server_address: Option<String>,
    /// Optional override for the module directory.
    pub modules_dir: Option<PathBuf>,
    /// Optional override for the log level.
    pub log_level: Option<String>,
    /// Whether to force JSON log output.
    pub json_logs: bool,
}

impl CliArgs {
    /// Parses command line arguments using clap.
    pub fn parse() -> Self {
        let matches = Command::new("Spyglass Proxy")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Man-in-the-middle game protocol proxy with hot-reloadable modules")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("spyglass.toml"),
            )
            .arg(
                Arg::new("port")
                    .short('p')
                    .long("port")
                    .value_name("PORT")
                    .help("Local listener port")
                    .value_parser(clap::value_parser!(u16)),
            )
            .arg(
                Arg::new("server")
                    .short('s')
                    .long("server")
                    .value_name("ADDRESS")
                    .help("Upstream server address"),
            )
            .arg(
                Arg::new("modules")
                    .short('m')
                    .long("modules")
                    .value_name("DIR")
                    .help("Module directory path"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(clap::ArgAction::SetTrue),
            )
            .get_matches();

        Self {
            config_path: PathBuf::from(
                matches
                    .get_one::<String>("config")
                    .expect("default config path should always be set"),
            ),
            proxy_port: matches.get_one::<u16>("port").copied(),
            server_address: matches.get_one::<String>("server").cloned(),
            modules_dir: matches.get_one::<String>("modules").map(PathBuf::from),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}
