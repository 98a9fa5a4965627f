//! Minimal tokio TCP transport for the broker, mirroring
//! `node::transport`'s framing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{CacheError, Result};
use crate::node::connection::{Connection, ConnectionId, Outbox};

use super::BrokerNode;

struct TcpOutbox {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Outbox for TcpOutbox {
    fn enqueue(&self, payload: Vec<u8>) -> Result<()> {
        self.tx.send(payload).map_err(|_| CacheError::Internal("connection closed".into()))
    }
}

pub async fn serve(addr: SocketAddr, broker: Arc<BrokerNode>) -> Result<()> {
    bind(addr, broker).await?;
    std::future::pending::<()>().await;
    Ok(())
}

/// Bind `addr` and accept connections in a background task, returning the
/// bound address (useful for tests that bind to port `0`).
pub async fn bind(addr: SocketAddr, broker: Arc<BrokerNode>) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "broker node listening");
    let next_conn_id = Arc::new(AtomicU64::new(1));
    tokio::spawn(async move {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            let broker = Arc::clone(&broker);
            let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, conn_id, broker).await {
                    warn!(%peer, error = %e, "broker connection closed with error");
                }
            });
        }
    });
    Ok(local_addr)
}

async fn handle_connection(socket: tokio::net::TcpStream, conn_id: ConnectionId, broker: Arc<BrokerNode>) -> Result<()> {
    let (mut read_half, mut write_half) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let outbox: Arc<dyn Outbox> = Arc::new(TcpOutbox { tx });
    let conn = Arc::new(Connection::new(conn_id, outbox));

    loop {
        let mut header = [0u8; 6];
        if read_half.read_exact(&mut header).await.is_err() {
            break;
        }
        let category = header[0];
        let method = header[1];
        let len = u32::from_le_bytes([header[2], header[3], header[4], header[5]]) as usize;
        let mut payload = vec![0u8; len];
        if len > 0 && read_half.read_exact(&mut payload).await.is_err() {
            break;
        }
        if let Err(e) = broker.dispatch_frame(&conn, category, method, &payload) {
            warn!(error = %e, "broker frame rejected");
        }
    }
    broker.on_disconnect(&conn);
    Ok(())
}
