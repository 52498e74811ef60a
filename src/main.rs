//! tcpnet - TCP echo and HTTP status services

use std::path::PathBuf;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use tcpnet::app::Runtime;
use tcpnet::config::Config;
use tcpnet::error::{Error, Result};

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if let Some(config_type) = args.gen_config {
        let mut config = Config::default_config();
        match config_type.as_str() {
            "full" => {}
            "http" => config.tcp = None,
            "tcp" => config.http = None,
            _ => {
                eprintln!("Unknown config type: {}. Use 'full', 'http' or 'tcp'", config_type);
                std::process::exit(1);
            }
        }
        let json = serde_json::to_string_pretty(&config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        println!("{}", json);
        return Ok(());
    }

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default_config(),
    };

    // Initialize logging; RUST_LOG wins over the config file
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| config.log.level.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("Failed to set tracing subscriber: {}", e)))?;

    if args.config.is_none() {
        info!("No config file specified, using default config");
    }
    info!("tcpnet v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let runtime = Runtime::from_config(config)?;
        runtime.run().await
    })?;

    info!("Goodbye!");
    Ok(())
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    gen_config: Option<String>,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut gen_config = None;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--gen-config" => {
                    let kind = args
                        .get(i + 1)
                        .filter(|a| !a.starts_with('-'))
                        .cloned();
                    if kind.is_some() {
                        i += 1;
                    }
                    gen_config = Some(kind.unwrap_or_else(|| "full".to_string()));
                }
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            config,
            gen_config,
            version,
        }
    }
}

fn print_help() {
    println!(r#"tcpnet - TCP echo and HTTP status services

USAGE:
    tcpnet [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    --gen-config [TYPE]     Print an example config (full/http/tcp)
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    tcpnet -c config.json
    tcpnet --gen-config http > http.json

HTTP ENDPOINTS:
    GET /                   Version banner
    GET /health             Liveness check
    GET /metrics            Prometheus metrics
"#);
}

fn print_version() {
    println!("tcpnet v{}", env!("CARGO_PKG_VERSION"));
}
