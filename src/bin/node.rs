//! Processor node entry point. Wires configuration, the spatial cache, the
//! tick-driven updater, and the TCP transport together. Concrete handler
//! bodies are an external collaborator (§1) and are not registered here;
//! this binary exists to exercise the dispatch state machine end to end.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use worldcache::behavior::BehaviorRegistry;
use worldcache::cache::SpatialCache;
use worldcache::config::Config;
use worldcache::node::dbcontext::InMemoryDbContext;
use worldcache::node::transport::{self, TcpBrokerLink};
use worldcache::node::ProcessorNode;
use worldcache::updater::{CacheUpdater, TickDriver};

#[tokio::main]
async fn main() -> worldcache::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config_path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("worldcache.toml"));
    let config = Config::load_from_file(&config_path)?;
    info!(workers = config.workers, tcp_port = config.tcp_port, "starting processor node");

    let bounds_side: i64 = 1000;
    let cache = Arc::new(SpatialCache::new(0, 0, bounds_side, bounds_side, 8));

    let updater = CacheUpdater::new(256, BehaviorRegistry::new());
    let tick_cache = Arc::clone(&cache);
    let _tick_driver = TickDriver::spawn(Duration::from_millis(50), move |now_ms| {
        updater.tick(&tick_cache, now_ms);
    });

    let area_id = config.area_id;
    let broker_link = if let Some(addr) = config.broker_socket_addr() {
        info!(%addr, "connecting to broker");
        Some(TcpBrokerLink::connect(addr).await? as Arc<dyn worldcache::node::BrokerLink>)
    } else {
        None
    };

    let id_source = Arc::new(AtomicU64::new(1));
    let context_factory: worldcache::node::dbcontext::ContextFactoryFn = {
        let id_source = Arc::clone(&id_source);
        Box::new(move || Box::new(InMemoryDbContext::new(Arc::clone(&id_source))) as Box<dyn worldcache::node::dbcontext::DbContext>)
    };

    let node = Arc::new(ProcessorNode::new(config.workers.max(1), Some(context_factory), area_id, broker_link));

    let addr: SocketAddr = format!("0.0.0.0:{}", config.tcp_port).parse()?;
    transport::serve(addr, node, config.workers.max(1)).await?;
    Ok(())
}
