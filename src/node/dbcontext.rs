//! The database-transaction external collaborator (§4.4) and the identifier
//! block allocator (§6, grounded in `original_source/Game Server/DBContext.cpp`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::object::ObjectId;

/// Builds one [`DbContext`] per worker at node construction time.
pub type ContextFactoryFn = Box<dyn Fn() -> Box<dyn DbContext> + Send + Sync>;

/// Transaction isolation level, passed to [`DbContext::begin_transaction`].
/// The processor node always opens with `RepeatableRead` (§4.4 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    RepeatableRead,
}

/// Per-worker database transaction handle. One instance per worker; never
/// shared (§4.4 "Shared resources").
#[async_trait]
pub trait DbContext: Send {
    /// Begin a transaction at `isolation`. The processor node always requests
    /// `RepeatableRead` (§4.4 step 4); implementors must honor it.
    async fn begin_transaction(&mut self, isolation: IsolationLevel) -> Result<()>;
    async fn commit_transaction(&mut self) -> Result<()>;
    async fn rollback_transaction(&mut self) -> Result<()>;

    /// Whether the handler body already committed (or rolled back) this
    /// transaction itself. The processor node only attempts its own commit
    /// when this is still `false` after `process` returns (§4.4 step 5).
    fn committed(&self) -> bool;

    async fn get_new_id(&mut self) -> Result<ObjectId>;
}

/// Issues identifier blocks of `block_size` from a single `Config` row,
/// serving subsequent ids from the in-memory block until exhausted.
///
/// Grounded in `original_source/Game Server/DBContext.cpp`: each exhaustion
/// performs `UPDATE Config SET FieldNumber = FieldNumber + block_size ...
/// RETURNING FieldNumber`; the returned value is the exclusive upper bound of
/// the freshly issued block.
#[async_trait]
pub trait IdBlockSource: Send + Sync {
    async fn allocate_block(&self, block_size: u64) -> Result<u64>;
}

pub struct IdAllocator {
    source: Arc<dyn IdBlockSource>,
    block_size: u64,
    state: Mutex<IdAllocatorState>,
}

struct IdAllocatorState {
    next_id: u64,
    upper_bound: u64,
}

impl IdAllocator {
    pub fn new(source: Arc<dyn IdBlockSource>, block_size: u64) -> Self {
        Self { source, block_size, state: Mutex::new(IdAllocatorState { next_id: 0, upper_bound: 0 }) }
    }

    pub async fn next_id(&self) -> Result<u64> {
        let needs_block = {
            let state = self.state.lock();
            state.next_id >= state.upper_bound
        };
        if needs_block {
            let upper_bound = self.source.allocate_block(self.block_size).await?;
            let mut state = self.state.lock();
            // Another caller may have already refilled the block while we
            // awaited the database; only apply ours if we're still exhausted.
            if state.next_id >= state.upper_bound {
                state.upper_bound = upper_bound;
                state.next_id = upper_bound - self.block_size;
            }
        }
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        Ok(id)
    }
}

/// An in-process stand-in for a real database driver: no SQL, no I/O,
/// identifiers drawn from a shared atomic counter (standing in for the
/// `Config` table's single `NextId` row).
pub struct InMemoryDbContext {
    ids: Arc<AtomicU64>,
    committed: bool,
}

impl InMemoryDbContext {
    pub fn new(ids: Arc<AtomicU64>) -> Self {
        Self { ids, committed: false }
    }
}

#[async_trait]
impl DbContext for InMemoryDbContext {
    async fn begin_transaction(&mut self, _isolation: IsolationLevel) -> Result<()> {
        self.committed = false;
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        self.committed = true;
        Ok(())
    }

    async fn rollback_transaction(&mut self) -> Result<()> {
        self.committed = true;
        Ok(())
    }

    fn committed(&self) -> bool {
        self.committed
    }

    async fn get_new_id(&mut self) -> Result<ObjectId> {
        Ok(self.ids.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedBlockSource;

    #[async_trait]
    impl IdBlockSource for FixedBlockSource {
        async fn allocate_block(&self, block_size: u64) -> Result<u64> {
            Ok(block_size)
        }
    }

    #[tokio::test]
    async fn allocator_serves_a_full_block_before_refetching() {
        let allocator = IdAllocator::new(Arc::new(FixedBlockSource), 5000);
        let mut seen = Vec::new();
        for _ in 0..5000 {
            seen.push(allocator.next_id().await.unwrap());
        }
        assert_eq!(seen[0], 0);
        assert_eq!(seen[4999], 4999);
    }

    #[tokio::test]
    async fn in_memory_context_allocates_unique_ids() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut a = InMemoryDbContext::new(Arc::clone(&counter));
        let mut b = InMemoryDbContext::new(Arc::clone(&counter));
        let id1 = a.get_new_id().await.unwrap();
        let id2 = b.get_new_id().await.unwrap();
        assert_ne!(id1, id2);
    }
}
