//! Shadowmux - a multi-key Shadowsocks TCP proxy server

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use shadowmux::app::{start_api_server, PrometheusTcpMetrics, TcpMetrics, TcpServer};
use shadowmux::config::{ApiConfig, Config, KeyConfig};
use shadowmux::error::{Error, Result};

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if args.gen_config {
        let config = Config::default_server();
        println!("{}", serde_json::to_string_pretty(&config).unwrap());
        return Ok(());
    }

    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    // Load configuration; flags override file values
    let mut config = if let Some(path) = &args.config {
        Config::load(path)?
    } else {
        let Some(listen) = &args.listen else {
            print_help();
            std::process::exit(1);
        };
        Config {
            listen: parse_addr(listen)?,
            metrics: None,
            keys: Vec::new(),
        }
    };

    if let Some(listen) = &args.listen {
        config.listen = parse_addr(listen)?;
    }
    if !args.ciphers.is_empty() {
        config.keys = args
            .ciphers
            .iter()
            .map(|entry| {
                let (cipher, secret) = entry.split_once(':').ok_or_else(|| {
                    Error::Config(format!("Invalid cipher entry {:?}: missing colon", entry))
                })?;
                Ok(KeyConfig {
                    cipher: cipher.to_string(),
                    secret: secret.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
    }
    if let Some(metrics) = &args.metrics {
        config.metrics = Some(ApiConfig {
            listen: parse_addr(metrics)?,
        });
    }

    config.validate()?;
    let ciphers = config.build_ciphers()?;

    info!("Shadowmux v{} starting", env!("CARGO_PKG_VERSION"));
    info!("{} access keys configured", ciphers.len());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (shutdown_tx, _) = broadcast::channel(1);

        let sink: Arc<dyn TcpMetrics> = Arc::new(PrometheusTcpMetrics::new());
        let server = Arc::new(TcpServer::new(config.listen, ciphers, sink));

        let api_handle = config.metrics.as_ref().map(|api| {
            let shutdown_rx = shutdown_tx.subscribe();
            let addr = api.listen;
            tokio::spawn(async move {
                start_api_server(addr, shutdown_rx).await;
            })
        });

        let mut server_handle = tokio::spawn(server.run(shutdown_tx.subscribe()));

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                let _ = shutdown_tx.send(());
                let _ = (&mut server_handle).await;
            }
            result = &mut server_handle => {
                if let Ok(Err(e)) = result {
                    error!("Server error: {}", e);
                }
                let _ = shutdown_tx.send(());
            }
        }

        if let Some(handle) = api_handle {
            let _ = handle.await;
        }

        Ok::<(), Error>(())
    })?;

    info!("Goodbye!");
    Ok(())
}

fn parse_addr(s: &str) -> Result<std::net::SocketAddr> {
    s.parse()
        .map_err(|_| Error::Config(format!("Invalid address: {}", s)))
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    listen: Option<String>,
    ciphers: Vec<String>,
    metrics: Option<String>,
    gen_config: bool,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut listen = None;
        let mut ciphers = Vec::new();
        let mut metrics = None;
        let mut gen_config = false;
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
                "-s" | "--listen" => {
                    if i + 1 < args.len() {
                        listen = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "-u" | "--cipher" => {
                    if i + 1 < args.len() {
                        ciphers.push(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--metrics" => {
                    if i + 1 < args.len() {
                        metrics = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--gen-config" => gen_config = true,
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    // Positional argument: treat as config file
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            config,
            listen,
            ciphers,
            metrics,
            gen_config,
            version,
        }
    }
}

fn print_help() {
    println!(
        r#"Shadowmux - a multi-key Shadowsocks TCP proxy server

USAGE:
    shadowmux [OPTIONS]

OPTIONS:
    -c, --config <FILE>          Path to configuration file
    -s, --listen <ADDR>          TCP listen address (e.g., 0.0.0.0:8388)
    -u, --cipher <NAME:SECRET>   Add an access key (repeatable; trial order)
    --metrics <ADDR>             Prometheus metrics listen address
    --gen-config                 Print an example configuration
    -v, --version                Print version information
    -h, --help                   Print help information

EXAMPLES:
    shadowmux -c config.json
    shadowmux -s 0.0.0.0:8388 -u aes-256-gcm:secret0 -u aes-128-gcm:secret1
    shadowmux -c config.json --metrics 127.0.0.1:9091
    shadowmux --gen-config > config.json

CIPHERS:
    aes-128-gcm, aes-256-gcm, chacha20-ietf-poly1305

METRICS ENDPOINT:
    GET /metrics    Prometheus metrics (for Grafana/Prometheus)
"#
    );
}

fn print_version() {
    println!("Shadowmux v{}", env!("CARGO_PKG_VERSION"));
    println!("A multi-key Shadowsocks TCP proxy server");
}
