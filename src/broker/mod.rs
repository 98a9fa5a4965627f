//! The broker node (§4.5): a fan-out switch that forwards inter-area messages
//! keyed by target area identifier, grounded in
//! `original_source/C++/src/BrokerNode.h`/`.cpp`.
//!
//! Conceptually a processor node whose handler surface is trivial (a single
//! override instead of a handler table); implemented standalone rather than
//! atop [`crate::node::ProcessorNode`] since it shares only the connection
//! registry, not the handler-dispatch machinery.

pub mod transport;

use std::sync::Arc;

use crate::error::{CacheError, Result};
use crate::node::connection::{ClientRegistry, Connection};
use crate::object::ObjectId;

const AREA_ID_LEN: usize = 8;

pub struct BrokerNode {
    clients: ClientRegistry,
}

impl BrokerNode {
    pub fn new() -> Self {
        Self { clients: ClientRegistry::new() }
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Handle one inbound frame (§4.5).
    ///
    /// - `(category=0, method=0)`: the payload is exactly the 8-byte
    ///   `area_id`; tag the connection and register it.
    /// - anything else: the trailing 8 bytes are the target `area_id`; the
    ///   remaining bytes are forwarded verbatim to every connection
    ///   registered under that area.
    pub fn dispatch_frame(&self, conn: &Arc<Connection>, category: u8, method: u8, payload: &[u8]) -> Result<()> {
        if category == 0 && method == 0 {
            self.register(conn, payload)
        } else {
            self.forward(category, method, payload)
        }
    }

    fn register(&self, conn: &Arc<Connection>, payload: &[u8]) -> Result<()> {
        if payload.len() != AREA_ID_LEN {
            return Err(CacheError::InvalidParameters("registration payload must be exactly 8 bytes".into()));
        }
        let area_id = ObjectId::from_le_bytes(payload.try_into().expect("length checked above"));
        conn.set_area_tag(area_id);
        self.clients.add(area_id, Arc::clone(conn));
        Ok(())
    }

    fn forward(&self, category: u8, method: u8, payload: &[u8]) -> Result<()> {
        if payload.len() < AREA_ID_LEN {
            return Err(CacheError::InvalidParameters("forward payload missing trailing area id".into()));
        }
        let split = payload.len() - AREA_ID_LEN;
        let (body, tail) = payload.split_at(split);
        let target_area = ObjectId::from_le_bytes(tail.try_into().expect("length checked above"));

        let mut frame = Vec::with_capacity(6 + body.len());
        frame.push(category);
        frame.push(method);
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(body);
        self.clients.send_to(target_area, &frame);
        Ok(())
    }

    pub fn on_disconnect(&self, conn: &Connection) {
        let area = conn.area_tag();
        if area != 0 {
            self.clients.remove(area, conn.id);
        }
    }
}

impl Default for BrokerNode {
    fn default() -> Self {
        Self::new()
    }
}
