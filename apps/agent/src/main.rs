use anyhow::Result;
use clap::Parser;
use peershare_agent::device::DeviceInfo;
use peershare_agent::{Agent, AgentEvent, Config};
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

/// CLI arguments for the bandwidth-sharing agent
#[derive(Parser, Debug)]
#[command(name = "psa")]
#[command(about = "Peer bandwidth-sharing agent", long_about = None)]
#[command(version)]
struct Args {
    /// Relay WebSocket endpoint
    #[arg(
        short,
        long,
        env = "PSA_RELAY",
        default_value = "wss://relay.peershare.io/agent"
    )]
    relay: String,

    /// Authentication token (opaque, issued at registration)
    #[arg(short, long, env = "PSA_TOKEN")]
    token: Option<String>,

    /// Local ingress port
    #[arg(short = 'p', long, default_value = "8899")]
    ingress_port: u16,

    /// Local ingress host address
    #[arg(long, default_value = "127.0.0.1")]
    ingress_host: String,

    /// Country code reported to the relay
    #[arg(long, env = "PSA_COUNTRY", default_value = "")]
    country: String,

    /// Carrier name reported to the relay
    #[arg(long, env = "PSA_CARRIER", default_value = "")]
    carrier: String,

    /// Device model reported to the relay
    #[arg(long, default_value = "generic")]
    model: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn config_from_args(args: &Args) -> Result<Config> {
    let ingress_addr: SocketAddr =
        format!("{}:{}", args.ingress_host, args.ingress_port).parse()?;
    let mut config = Config::new(args.relay.clone(), args.token.clone());
    config.ingress_addr = ingress_addr;
    config.device = DeviceInfo {
        country: args.country.clone(),
        carrier: args.carrier.clone(),
        model: args.model.clone(),
        os_version: std::env::consts::OS.to_string(),
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("Peershare agent v{}", env!("CARGO_PKG_VERSION"));
    info!("Relay endpoint: {}", args.relay);
    info!("Ingress: {}:{}", args.ingress_host, args.ingress_port);

    let config = config_from_args(&args)?;
    let (agent, mut events) = Agent::new(config)?;

    let event_loop = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                AgentEvent::Connected { device_id } => {
                    info!("Connected to relay as device {}", device_id);
                }
                AgentEvent::Disconnected => warn!("Disconnected from relay"),
                AgentEvent::Traffic {
                    bytes_in,
                    bytes_out,
                } => debug!("Transferred {} bytes in / {} bytes out", bytes_in, bytes_out),
            }
        }
    });

    tokio::select! {
        result = agent.run() => {
            if let Err(e) = result {
                error!("Agent exited: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down gracefully...");
            agent.shutdown();
        }
    }

    event_loop.abort();
    Ok(())
}
