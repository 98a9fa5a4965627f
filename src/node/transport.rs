//! A minimal tokio TCP transport so the dispatch state machine is runnable
//! end to end, deliberately thin (§1, §4.4): wire-level request framing is an
//! external collaborator in general, but the core needs *some* concrete
//! transport to be exercised outside a unit test. This frames
//! `(category: u8, method: u8, len: u32, parameters)` inbound and
//! `(result_code: u16, [len: u32, body])` outbound, matching §6.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{CacheError, Result};

use super::connection::{Connection, ConnectionId, Outbox};
use super::result::ResultCode;
use super::{BrokerLink, ProcessorNode};

struct TcpOutbox {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Outbox for TcpOutbox {
    fn enqueue(&self, payload: Vec<u8>) -> Result<()> {
        self.tx.send(payload).map_err(|_| CacheError::Internal("connection closed".into()))
    }
}

/// Accept connections on `addr` forever, dispatching each inbound frame to
/// `node` on a worker chosen by round-robining the connection id.
pub async fn serve(addr: SocketAddr, node: Arc<ProcessorNode>, workers: usize) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "processor node listening");
    let next_conn_id = Arc::new(AtomicU64::new(1));
    loop {
        let (socket, peer) = listener.accept().await?;
        let node = Arc::clone(&node);
        let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, conn_id, node, workers).await {
                warn!(%peer, error = %e, "connection closed with error");
            }
        });
    }
}

async fn handle_connection(socket: TcpStream, conn_id: ConnectionId, node: Arc<ProcessorNode>, workers: usize) -> Result<()> {
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
    let worker_id = (conn_id as usize) % workers.max(1);

    loop {
        let mut header = [0u8; 6];
        if read_half.read_exact(&mut header).await.is_err() {
            break;
        }
        let category = header[0];
        let method = header[1];
        let len = u32::from_le_bytes([header[2], header[3], header[4], header[5]]) as usize;
        let mut parameters = vec![0u8; len];
        if len > 0 && read_half.read_exact(&mut parameters).await.is_err() {
            break;
        }

        let outcome = node.dispatch_request(worker_id, &conn, category, method, &parameters).await;
        if outcome.result_code == ResultCode::NoResponse {
            continue;
        }
        let mut frame = Vec::with_capacity(2 + outcome.response.as_ref().map_or(0, |r| 4 + r.len()));
        frame.extend_from_slice(&outcome.result_code.code().to_le_bytes());
        if let Some(body) = &outcome.response {
            frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
            frame.extend_from_slice(body);
        }
        if conn.send(frame).is_err() {
            break;
        }
    }
    node.on_disconnect(&conn);
    Ok(())
}

/// The outbound connection a processor node with a nonzero `area_id` opens to
/// the broker (§4.4 "Broker linkage").
pub struct TcpBrokerLink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl TcpBrokerLink {
    pub async fn connect(addr: SocketAddr) -> Result<Arc<Self>> {
        let socket = TcpStream::connect(addr).await?;
        let (_read_half, mut write_half) = socket.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });
        Ok(Arc::new(Self { tx }))
    }
}

impl BrokerLink for TcpBrokerLink {
    fn send_frame(&self, category: u8, method: u8, payload: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(6 + payload.len());
        frame.push(category);
        frame.push(method);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        self.tx.send(frame).map_err(|_| CacheError::Internal("broker connection closed".into()))
    }
}
