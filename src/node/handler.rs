//! The handler surface (§4.4): `deserialize` / `process` / `serialize`,
//! registered per `(category, method)` key with one instance per worker.

use crate::error::Result;
use crate::node::dbcontext::DbContext;
use crate::node::result::ResultCode;
use crate::object::ObjectId;

/// A per-request scratchpad. One instance is created per worker at
/// registration time and reused across requests on that worker.
pub trait Handler: Send + 'static {
    fn deserialize(&mut self, parameters: &[u8]) -> Result<()>;

    /// `authenticated_id` is the connection's current tag; the handler may
    /// mutate it to log in (set nonzero) or log out (set to `0`). `db` is
    /// `None` when the node was constructed without a context factory.
    fn process(&mut self, authenticated_id: &mut ObjectId, db: Option<&mut dyn DbContext>) -> Result<ResultCode>;

    fn serialize(&mut self, response: &mut Vec<u8>) -> Result<()>;
}

pub type HandlerFactory = Box<dyn Fn() -> Box<dyn Handler> + Send + Sync>;

pub(crate) fn handler_key(category: u8, method: u8) -> u16 {
    ((category as u16) << 8) | method as u16
}
