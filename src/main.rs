//! Wireflow - Mesh VPN Data-Plane Agent
//!
//! Runs the agent daemon, the WRRP relay server and a few helper
//! commands for keys, tokens and configuration.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wireflow::config::{AgentConfig, LoggingConfig, NodeConfig};
use wireflow::device::{uapi, MemoryDevice, TunnelDevice, UapiServer};
use wireflow::error::{Error, Result};
use wireflow::peer::{PeerRegistry, PrivateKey};
use wireflow::wrrp::{RelaySignaler, WrrpClient, WrrpServer};
use wireflow::Agent;

/// Wireflow - Mesh VPN Data-Plane Agent
#[derive(Parser)]
#[command(name = "wireflow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wireflow.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to logging.level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent
    Up {
        /// Tunnel interface name
        #[arg(long)]
        interface_name: Option<String>,

        /// Only use the relay path
        #[arg(long)]
        force_relay: bool,

        /// Management backend URL
        #[arg(long)]
        management_url: Option<String>,

        /// Signaling service URL
        #[arg(long)]
        signaling_url: Option<String>,

        /// TURN server URL
        #[arg(long)]
        turn_url: Option<String>,

        /// WRRP relay address (host:port)
        #[arg(long)]
        relay_url: Option<String>,
    },

    /// Stop a running agent
    Stop,

    /// Show the device configuration of a running agent
    Status,

    /// Manage join tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Run a WRRP relay server
    Relay {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:6266")]
        listen: String,

        /// Largest accepted payload in bytes
        #[arg(long, default_value_t = 65535)]
        max_frame_size: usize,
    },

    /// Initialize a new configuration file with a fresh key
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wireflow.toml")]
        output: PathBuf,

        /// Tunnel interface name
        #[arg(long, default_value = "wf0")]
        interface_name: String,
    },

    /// Validate configuration file
    Validate,

    /// Print a new private key and its public key
    Genkey,
}

#[derive(Subcommand)]
enum TokenCommands {
    /// Create a token peers use to join the network
    Create {
        /// Token name
        name: String,

        /// Namespace of the token
        #[arg(short, long, default_value = "")]
        namespace: String,

        /// Token expiry (e.g. 168h)
        #[arg(short, long, default_value = "")]
        expiry: String,

        /// Number of peers allowed to use the token
        #[arg(short, long, default_value_t = 0)]
        limit: u32,
    },
}

/// Flag overrides for `up`
struct UpOverrides {
    interface_name: Option<String>,
    force_relay: bool,
    management_url: Option<String>,
    signaling_url: Option<String>,
    turn_url: Option<String>,
    relay_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let logging = LoggingConfig::from_file_or_default(&cli.config);
    let level = cli.log_level.clone().unwrap_or_else(|| logging.level.clone());
    init_logging(&level, logging.is_compact());

    match cli.command {
        Commands::Up {
            interface_name,
            force_relay,
            management_url,
            signaling_url,
            turn_url,
            relay_url,
        } => {
            let overrides = UpOverrides {
                interface_name,
                force_relay,
                management_url,
                signaling_url,
                turn_url,
                relay_url,
            };
            run_up(cli.config, overrides).await
        }
        Commands::Stop => run_stop(cli.config).await,
        Commands::Status => run_status(cli.config).await,
        Commands::Token { command } => match command {
            TokenCommands::Create {
                name,
                namespace,
                expiry,
                limit,
            } => run_token_create(cli.config, name, namespace, expiry, limit).await,
        },
        Commands::Relay { listen, max_frame_size } => run_relay(listen, max_frame_size).await,
        Commands::Init { output, interface_name } => run_init(output, interface_name),
        Commands::Validate => run_validate(cli.config),
        Commands::Genkey => run_genkey(),
    }
}

/// Initialize logging
fn init_logging(level: &str, compact: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let (compact_layer, pretty_layer) = if compact {
        (Some(tracing_subscriber::fmt::layer().compact()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer().pretty()))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(compact_layer)
        .with(pretty_layer)
        .init();
}

/// Start the agent daemon
async fn run_up(config_path: PathBuf, overrides: UpOverrides) -> Result<()> {
    tracing::info!("Starting Wireflow agent...");

    let mut config = match AgentConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };

    if let Some(name) = overrides.interface_name {
        config.node.interface = name;
    }
    if overrides.force_relay {
        config.node.force_relay = true;
    }
    if let Some(url) = overrides.management_url {
        config.management.url = url;
    }
    if overrides.signaling_url.is_some() {
        config.signaling.url = overrides.signaling_url;
    }
    if overrides.turn_url.is_some() {
        config.relay.turn_url = overrides.turn_url;
    }
    if overrides.relay_url.is_some() {
        config.relay.url = overrides.relay_url;
    }
    config.validate()?;

    // Signaling rides on the relay session
    let relay_url = match config.relay.url.clone() {
        Some(url) => url,
        None => {
            tracing::error!("relay.url is required to exchange signaling");
            return Err(Error::Config("relay.url is required".into()));
        }
    };

    let private_key = config.private_key()?;
    let public_key = private_key.public_key();
    tracing::info!("Public key: {}", public_key);

    let (relay, relay_inbox) = match WrrpClient::connect(&relay_url, &public_key, &config.relay).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("Failed to register with relay {}: {}", relay_url, e);
            return Err(e);
        }
    };

    let registry = Arc::new(PeerRegistry::new());
    let signal = Arc::new(RelaySignaler::new(Arc::clone(&relay), Arc::clone(&registry)));
    let device: Arc<dyn TunnelDevice> = Arc::new(MemoryDevice::new(
        config.node.interface.clone(),
        Some(private_key),
    ));
    let socket_path = config.socket_path();

    let agent = Agent::new(config, registry, signal, Some(relay), Arc::clone(&device)).await?;

    let uapi_server = Arc::new(UapiServer::new(socket_path, device, agent.cancel_token()));
    let uapi_handle = {
        let server = Arc::clone(&uapi_server);
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                tracing::error!("UAPI server error: {}", e);
            }
        })
    };

    let agent_handle = tokio::spawn(Arc::clone(&agent).run(None, Some(relay_inbox)));

    let cancel_token = agent.cancel_token();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
        _ = cancel_token.cancelled() => {
            tracing::info!("Stop requested");
        }
    }

    agent.shutdown().await;
    uapi_server.stop();
    let _ = agent_handle.await;
    let _ = uapi_handle.await;

    tracing::info!("Wireflow shutdown complete");
    Ok(())
}

/// Ask a running agent to stop
async fn run_stop(config_path: PathBuf) -> Result<()> {
    let config = AgentConfig::from_file(&config_path)?;
    let reply = uapi::request(&config.socket_path(), "stop\n").await?;
    print!("{}", reply);
    Ok(())
}

/// Print the device configuration of a running agent
async fn run_status(config_path: PathBuf) -> Result<()> {
    let config = AgentConfig::from_file(&config_path)?;
    let body = uapi::request(&config.socket_path(), "get=1\n\n").await?;

    println!("Interface: {}", config.node.interface);
    for line in body.lines() {
        match line.split_once('=') {
            Some(("private_key", _)) => {}
            Some(("public_key", key)) => println!("\npeer: {}", key),
            Some((key, value)) => println!("  {}: {}", key, value),
            None => {}
        }
    }
    Ok(())
}

/// Create a join token through the management API
async fn run_token_create(
    config_path: PathBuf,
    name: String,
    namespace: String,
    expiry: String,
    limit: u32,
) -> Result<()> {
    let config = AgentConfig::from_file(&config_path)?;
    let url = format!("{}/api/v1/tokens", config.management.url.trim_end_matches('/'));
    let body = serde_json::json!({
        "name": name,
        "namespace": namespace,
        "expiry": expiry,
        "limit": limit,
    });

    let response = reqwest::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| Error::Management(e.to_string()))?;
    if !response.status().is_success() {
        let status = response.status();
        eprintln!("Failed to create token: {}", status);
        return Err(Error::Management(format!("{} returned {}", url, status)));
    }

    let token: serde_json::Value = response
        .json()
        .await
        .map_err(|e| Error::Management(e.to_string()))?;
    println!("{}", serde_json::to_string_pretty(&token)?);
    Ok(())
}

/// Run a WRRP relay server
async fn run_relay(listen: String, max_frame_size: usize) -> Result<()> {
    tracing::info!("Starting WRRP relay on {}", listen);
    let server = Arc::new(WrrpServer::new(listen, max_frame_size));

    let serving = Arc::clone(&server);
    let handle = tokio::spawn(async move { serving.start().await });

    tokio::select! {
        result = handle => {
            match result {
                Ok(Err(e)) => {
                    tracing::error!("Relay server error: {}", e);
                    return Err(e);
                }
                Ok(Ok(())) => {}
                Err(e) => tracing::error!("Relay task failed: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            server.stop();
        }
    }
    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, interface_name: String) -> Result<()> {
    if output.exists() {
        eprintln!("Refusing to overwrite {}", output.display());
        return Err(Error::Config(format!("{} already exists", output.display())));
    }

    let private_key = PrivateKey::generate();
    let mut node = NodeConfig::new(&private_key);
    node.interface = interface_name;
    let config = AgentConfig::new(node);
    config.save(&output)?;

    println!("Configuration written to: {}", output.display());
    println!("Public key: {}", private_key.public_key());
    println!("Set relay.url and add [[peers]] before running `wireflow up`.");
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match AgentConfig::from_file(&config_path) {
        Ok(config) => {
            let public_key = config.private_key()?.public_key();
            println!("✓ Configuration is valid");
            println!("  Interface: {}", config.node.interface);
            println!("  Public Key: {}", public_key);
            println!("  Relay: {}", config.relay.url.as_deref().unwrap_or("(none)"));
            println!("  Force Relay: {}", config.node.force_relay);
            println!("  Peers: {}", config.peers.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration is invalid: {}", e);
            Err(e)
        }
    }
}

/// Print a fresh key pair
fn run_genkey() -> Result<()> {
    let private_key = PrivateKey::generate();
    println!("private_key = {}", private_key.to_base64());
    println!("public_key  = {}", private_key.public_key().to_base64());
    Ok(())
}
