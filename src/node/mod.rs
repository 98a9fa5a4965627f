//! The request-dispatch node (`processor_node` / `processor_node_db`, §4.4):
//! connection lifecycle, per-worker handler dispatch, and the
//! transaction/retry loop.

pub mod connection;
pub mod dbcontext;
pub mod handler;
pub mod result;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::{CacheError, Result};
use crate::object::ObjectId;

use connection::{ClientRegistry, Connection};
use dbcontext::{ContextFactoryFn, DbContext, IsolationLevel};
use handler::{handler_key, Handler, HandlerFactory};
use result::ResultCode;

/// Outbound link to the broker for a processor node with a nonzero
/// `area_id` (§4.4 "Broker linkage").
pub trait BrokerLink: Send + Sync {
    fn send_frame(&self, category: u8, method: u8, payload: &[u8]) -> Result<()>;
}

struct HandlerSlot {
    instances: Vec<Mutex<Box<dyn Handler>>>,
}

/// The outcome of dispatching one request: the result code, and the
/// serialized response body when one should be written (§6).
pub struct DispatchOutcome {
    pub result_code: ResultCode,
    pub response: Option<Vec<u8>>,
}

pub struct ProcessorNode {
    workers: usize,
    unauthenticated: HashMap<u16, HandlerSlot>,
    authenticated: HashMap<u16, HandlerSlot>,
    clients: ClientRegistry,
    db_contexts: Option<Vec<Mutex<Box<dyn DbContext>>>>,
    area_id: ObjectId,
    broker_link: Option<Arc<dyn BrokerLink>>,
}

impl ProcessorNode {
    pub fn new(workers: usize, context_factory: Option<ContextFactoryFn>, area_id: ObjectId, broker_link: Option<Arc<dyn BrokerLink>>) -> Self {
        let db_contexts = context_factory.map(|factory| (0..workers).map(|_| Mutex::new(factory())).collect());
        let node = Self {
            workers,
            unauthenticated: HashMap::new(),
            authenticated: HashMap::new(),
            clients: ClientRegistry::new(),
            db_contexts,
            area_id,
            broker_link,
        };
        if area_id != 0 {
            if let Some(link) = &node.broker_link {
                let payload = area_id.to_le_bytes();
                if let Err(e) = link.send_frame(0, 0, &payload) {
                    error!(error = %e, area_id, "failed to send broker registration frame");
                }
            }
        }
        node
    }

    pub fn register_handler(&mut self, category: u8, method: u8, authenticated: bool, factory: HandlerFactory) {
        let key = handler_key(category, method);
        let instances = (0..self.workers).map(|_| Mutex::new(factory())).collect();
        let slot = HandlerSlot { instances };
        if authenticated {
            self.authenticated.insert(key, slot);
        } else {
            self.unauthenticated.insert(key, slot);
        }
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn area_id(&self) -> ObjectId {
        self.area_id
    }

    /// Frame and send a notification to a remote area over the broker link
    /// (§4.4 "Broker linkage"): the target `area_id` is appended as the
    /// trailing 8 bytes.
    pub fn send_to_area(&self, target_area: ObjectId, category: u8, method: u8, payload: &[u8]) -> Result<()> {
        let link = self
            .broker_link
            .as_ref()
            .ok_or_else(|| CacheError::Internal("processor node has no broker link configured".into()))?;
        let mut framed = Vec::with_capacity(payload.len() + 8);
        framed.extend_from_slice(payload);
        framed.extend_from_slice(&target_area.to_le_bytes());
        link.send_frame(category, method, &framed)
    }

    /// Run the state machine of §4.4 for one inbound request on `worker_id`.
    pub async fn dispatch_request(&self, worker_id: usize, conn: &Arc<Connection>, category: u8, method: u8, parameters: &[u8]) -> DispatchOutcome {
        let start_id = conn.authenticated_id();
        let key = handler_key(category, method);
        let table = if start_id != 0 { &self.authenticated } else { &self.unauthenticated };

        let slot = match table.get(&key) {
            Some(slot) => slot,
            None => {
                debug!(category, method, "invalid request type");
                return DispatchOutcome { result_code: ResultCode::InvalidRequestType, response: None };
            }
        };
        let mut handler = slot.instances[worker_id % slot.instances.len()].lock();

        if let Err(e) = handler.deserialize(parameters) {
            debug!(error = %e, "invalid parameters");
            return DispatchOutcome { result_code: ResultCode::InvalidParameters, response: None };
        }

        let mut db_guard = self.db_contexts.as_ref().map(|contexts| contexts[worker_id % contexts.len()].lock());
        if let Some(ctx) = db_guard.as_deref_mut() {
            if let Err(e) = ctx.begin_transaction(IsolationLevel::RepeatableRead).await {
                error!(error = %e, "failed to begin transaction");
                return DispatchOutcome { result_code: ResultCode::ServerError, response: None };
            }
        }

        let mut authenticated_id = start_id;
        let process_result = {
            let db_ref: Option<&mut dyn DbContext> = db_guard.as_deref_mut().map(|b| &mut **b as &mut dyn DbContext);
            handler.process(&mut authenticated_id, db_ref)
        };

        let result_code = match process_result {
            Ok(code) => code,
            Err(CacheError::Synchronization(reason)) => {
                warn!(reason, "synchronization conflict, retrying later");
                if let Some(ctx) = db_guard.as_deref_mut() {
                    let _ = ctx.rollback_transaction().await;
                }
                return DispatchOutcome { result_code: ResultCode::RetryLater, response: None };
            }
            Err(e) => {
                error!(error = %e, "fatal error during process");
                if let Some(ctx) = db_guard.as_deref_mut() {
                    let _ = ctx.rollback_transaction().await;
                }
                return DispatchOutcome { result_code: ResultCode::ServerError, response: None };
            }
        };

        // `process` returned without a synchronization conflict: commit
        // unconditionally, domain-error result codes included, so that any
        // state the handler legitimately wrote before choosing a non-success
        // code is preserved (matches the original's unconditional commit
        // whenever `process` returns without throwing).
        if let Some(ctx) = db_guard.as_deref_mut() {
            if !ctx.committed() {
                if let Err(e) = ctx.commit_transaction().await {
                    warn!(error = %e, "commit failed, retrying later");
                    let _ = ctx.rollback_transaction().await;
                    return DispatchOutcome { result_code: ResultCode::RetryLater, response: None };
                }
            }
        }
        drop(db_guard);

        let response = if result_code == ResultCode::Success {
            let mut buf = Vec::new();
            match handler.serialize(&mut buf) {
                Ok(()) => Some(buf),
                Err(e) => {
                    error!(error = %e, "serialize failed");
                    return DispatchOutcome { result_code: ResultCode::ServerError, response: None };
                }
            }
        } else {
            None
        };
        drop(handler);

        if authenticated_id != start_id {
            conn.set_authenticated_id(authenticated_id);
            if authenticated_id != 0 {
                self.clients.add(authenticated_id, Arc::clone(conn));
            } else {
                self.clients.remove(start_id, conn.id);
            }
        }

        let response = if result_code == ResultCode::NoResponse { None } else { response };
        DispatchOutcome { result_code, response }
    }

    pub fn on_disconnect(&self, conn: &Connection) {
        let id = conn.authenticated_id();
        if id != 0 {
            self.clients.remove(id, conn.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::connection::Outbox;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct NoopOutbox;
    impl Outbox for NoopOutbox {
        fn enqueue(&self, _payload: Vec<u8>) -> Result<()> {
            Ok(())
        }
    }

    fn test_conn() -> Arc<Connection> {
        Arc::new(Connection::new(1, Arc::new(NoopOutbox)))
    }

    /// A `DbContext` that records every call it receives into a shared log,
    /// so a test can assert commit-vs-rollback without inspecting opaque
    /// node-internal state.
    struct RecordingDbContext {
        log: Arc<StdMutex<Vec<&'static str>>>,
        committed: bool,
    }

    #[async_trait]
    impl DbContext for RecordingDbContext {
        async fn begin_transaction(&mut self, _isolation: IsolationLevel) -> Result<()> {
            self.log.lock().unwrap().push("begin");
            self.committed = false;
            Ok(())
        }

        async fn commit_transaction(&mut self) -> Result<()> {
            self.log.lock().unwrap().push("commit");
            self.committed = true;
            Ok(())
        }

        async fn rollback_transaction(&mut self) -> Result<()> {
            self.log.lock().unwrap().push("rollback");
            self.committed = true;
            Ok(())
        }

        fn committed(&self) -> bool {
            self.committed
        }

        async fn get_new_id(&mut self) -> Result<ObjectId> {
            Ok(1)
        }
    }

    /// Returns a fixed outcome from `process`, either a `ResultCode` or a
    /// synchronization conflict, so individual dispatch paths can be driven
    /// in isolation.
    struct StubHandler {
        outcome: std::result::Result<ResultCode, ()>,
        auth_delta: Option<ObjectId>,
    }

    impl Handler for StubHandler {
        fn deserialize(&mut self, _parameters: &[u8]) -> Result<()> {
            Ok(())
        }

        fn process(&mut self, authenticated_id: &mut ObjectId, _db: Option<&mut dyn DbContext>) -> Result<ResultCode> {
            if let Some(id) = self.auth_delta {
                *authenticated_id = id;
            }
            match self.outcome {
                Ok(code) => Ok(code),
                Err(()) => Err(CacheError::Synchronization("conflict".into())),
            }
        }

        fn serialize(&mut self, _response: &mut Vec<u8>) -> Result<()> {
            Ok(())
        }
    }

    fn node_with_handler(outcome: std::result::Result<ResultCode, ()>, log: Arc<StdMutex<Vec<&'static str>>>) -> ProcessorNode {
        let factory: ContextFactoryFn = {
            let log = Arc::clone(&log);
            Box::new(move || Box::new(RecordingDbContext { log: Arc::clone(&log), committed: false }) as Box<dyn DbContext>)
        };
        let mut node = ProcessorNode::new(1, Some(factory), 0, None);
        node.register_handler(1, 1, false, Box::new(move || Box::new(StubHandler { outcome, auth_delta: None })));
        node
    }

    #[tokio::test]
    async fn dispatch_commits_on_domain_error_result_code() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let node = node_with_handler(Ok(ResultCode::OutOfBounds), Arc::clone(&log));
        let conn = test_conn();

        let outcome = node.dispatch_request(0, &conn, 1, 1, &[]).await;

        assert_eq!(outcome.result_code, ResultCode::OutOfBounds);
        assert_eq!(*log.lock().unwrap(), vec!["begin", "commit"]);
    }

    #[tokio::test]
    async fn dispatch_rolls_back_on_synchronization_conflict() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let node = node_with_handler(Err(()), Arc::clone(&log));
        let conn = test_conn();

        let outcome = node.dispatch_request(0, &conn, 1, 1, &[]).await;

        assert_eq!(outcome.result_code, ResultCode::RetryLater);
        assert_eq!(*log.lock().unwrap(), vec!["begin", "rollback"]);
    }

    #[tokio::test]
    async fn dispatch_commits_on_success() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let node = node_with_handler(Ok(ResultCode::Success), Arc::clone(&log));
        let conn = test_conn();

        let outcome = node.dispatch_request(0, &conn, 1, 1, &[]).await;

        assert_eq!(outcome.result_code, ResultCode::Success);
        assert_eq!(*log.lock().unwrap(), vec!["begin", "commit"]);
    }

    #[tokio::test]
    async fn dispatch_returns_invalid_request_type_for_unregistered_handler() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let node = node_with_handler(Ok(ResultCode::Success), log);
        let conn = test_conn();

        let outcome = node.dispatch_request(0, &conn, 9, 9, &[]).await;

        assert_eq!(outcome.result_code, ResultCode::InvalidRequestType);
    }

    #[tokio::test]
    async fn dispatch_registers_authenticated_connection_on_login() {
        let factory: ContextFactoryFn = Box::new(|| Box::new(RecordingDbContext { log: Arc::new(StdMutex::new(Vec::new())), committed: false }) as Box<dyn DbContext>);
        let mut node = ProcessorNode::new(1, Some(factory), 0, None);
        node.register_handler(2, 1, false, Box::new(|| Box::new(StubHandler { outcome: Ok(ResultCode::Success), auth_delta: Some(42) })));
        let conn = test_conn();

        let outcome = node.dispatch_request(0, &conn, 2, 1, &[]).await;

        assert_eq!(outcome.result_code, ResultCode::Success);
        assert_eq!(conn.authenticated_id(), 42);
        assert_eq!(node.clients().connection_count(42), 1);
    }
}
