//! Connection state and the authenticated-clients mapping (§4.4 "Connection
//! state", §4.4/4.5 "Concurrency contract").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::object::ObjectId;

pub type ConnectionId = u64;

/// Delegates an outbound send to the framework's outgoing queue. A
/// nonblocking enqueue, never held across I/O (§4.4/4.5 concurrency
/// contract).
pub trait Outbox: Send + Sync {
    fn enqueue(&self, payload: Vec<u8>) -> Result<()>;
}

/// A single client connection. Carries a tagged `authenticated_id` (`0` =
/// unauthenticated) and, for broker-registered connections, the `area_id` it
/// was tagged with.
pub struct Connection {
    pub id: ConnectionId,
    authenticated_id: AtomicU64,
    area_tag: AtomicU64,
    outbox: Arc<dyn Outbox>,
}

impl Connection {
    pub fn new(id: ConnectionId, outbox: Arc<dyn Outbox>) -> Self {
        Self { id, authenticated_id: AtomicU64::new(0), area_tag: AtomicU64::new(0), outbox }
    }

    pub fn authenticated_id(&self) -> ObjectId {
        self.authenticated_id.load(Ordering::Acquire)
    }

    pub fn set_authenticated_id(&self, id: ObjectId) {
        self.authenticated_id.store(id, Ordering::Release);
    }

    pub fn area_tag(&self) -> ObjectId {
        self.area_tag.load(Ordering::Acquire)
    }

    pub fn set_area_tag(&self, area_id: ObjectId) {
        self.area_tag.store(area_id, Ordering::Release);
    }

    pub fn send(&self, payload: Vec<u8>) -> Result<()> {
        self.outbox.enqueue(payload)
    }
}

/// Maps an identifier (authenticated client id, or broker-side area id) to
/// the ordered list of connections bearing it. Mutations are serialized by a
/// single mutex, held only for the add/remove operation, never across I/O.
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<ObjectId, Vec<Arc<Connection>>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: ObjectId, conn: Arc<Connection>) {
        self.clients.lock().entry(id).or_default().push(conn);
    }

    pub fn remove(&self, id: ObjectId, conn_id: ConnectionId) {
        let mut guard = self.clients.lock();
        if let Some(bucket) = guard.get_mut(&id) {
            bucket.retain(|c| c.id != conn_id);
            if bucket.is_empty() {
                guard.remove(&id);
            }
        }
    }

    /// Enqueue `payload` on every connection registered under `id`. Returns
    /// how many connections accepted it.
    pub fn send_to(&self, id: ObjectId, payload: &[u8]) -> usize {
        let guard = self.clients.lock();
        let mut delivered = 0;
        if let Some(bucket) = guard.get(&id) {
            for conn in bucket {
                if conn.send(payload.to_vec()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub fn connection_count(&self, id: ObjectId) -> usize {
        self.clients.lock().get(&id).map(Vec::len).unwrap_or(0)
    }
}
