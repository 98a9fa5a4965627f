//! Broker node entry point (§4.5).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use worldcache::broker::{transport, BrokerNode};
use worldcache::config::Config;

#[tokio::main]
async fn main() -> worldcache::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config_path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("worldcache-broker.toml"));
    let config = Config::load_from_file(&config_path)?;

    let port = config.broker_port.unwrap_or(7100);
    info!(port, "starting broker node");

    let broker = Arc::new(BrokerNode::new());
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    transport::serve(addr, broker).await?;
    Ok(())
}
