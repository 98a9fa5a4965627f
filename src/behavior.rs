//! Pluggable per-type update logic (§4.1, §9).
//!
//! The core implements the `Updatable` capability's tick/dispatch contract in
//! full but keeps the business logic of concrete entity subtypes out of the
//! core (an explicit Non-goal). A `Behavior` is resolved by `behavior_tag`
//! through a registry, generalizing the teacher's closed
//! `transaction::occ::ValidationStrategy` enum to an open, pluggable set since
//! entity behaviors are not a fixed, closed list.

use std::collections::HashMap;
use std::sync::Arc;

use crate::object::GameObject;

/// Per-type tick logic resolved by `behavior_tag`.
pub trait Behavior: Send + Sync {
    /// Advance `object` by `delta_ms` milliseconds. Implementations mutate
    /// the object's own fields; the cache updater stamps `last_updated_ms`
    /// after this call returns (§4.3).
    fn update(&self, object: &mut GameObject, delta_ms: u64);
}

/// A behavior that does nothing, used for tags with no registered logic so a
/// missing registration degrades to a no-op tick rather than a panic.
struct NoopBehavior;

impl Behavior for NoopBehavior {
    fn update(&self, _object: &mut GameObject, _delta_ms: u64) {}
}

/// Maps `behavior_tag` to a `Behavior` implementation.
#[derive(Clone)]
pub struct BehaviorRegistry {
    behaviors: HashMap<u32, Arc<dyn Behavior>>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self { behaviors: HashMap::new() }
    }

    pub fn register(&mut self, tag: u32, behavior: Arc<dyn Behavior>) {
        self.behaviors.insert(tag, behavior);
    }

    /// Run the behavior for `object`'s `behavior_tag`, or a no-op if none is
    /// registered.
    pub fn apply(&self, object: &mut GameObject, delta_ms: u64) {
        let tag = match &object.updatable {
            Some(u) => u.behavior_tag,
            None => return,
        };
        match self.behaviors.get(&tag) {
            Some(b) => b.update(object, delta_ms),
            None => NoopBehavior.update(object, delta_ms),
        }
    }
}

impl Default for BehaviorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DoubleOwner;
    impl Behavior for DoubleOwner {
        fn update(&self, object: &mut GameObject, _delta_ms: u64) {
            object.header.owner *= 2;
        }
    }

    #[test]
    fn registered_tag_runs_its_behavior() {
        let mut registry = BehaviorRegistry::new();
        registry.register(1, Arc::new(DoubleOwner));
        let mut obj = GameObject::new(1, 0).with_owner(3).with_updatable(1);
        registry.apply(&mut obj, 10);
        assert_eq!(obj.header.owner, 6);
    }

    #[test]
    fn unregistered_tag_is_noop() {
        let registry = BehaviorRegistry::new();
        let mut obj = GameObject::new(1, 0).with_owner(3).with_updatable(99);
        registry.apply(&mut obj, 10);
        assert_eq!(obj.header.owner, 3);
    }

    #[test]
    fn non_updatable_object_is_untouched() {
        let mut registry = BehaviorRegistry::new();
        registry.register(1, Arc::new(DoubleOwner));
        let mut obj = GameObject::new(1, 0).with_owner(3);
        registry.apply(&mut obj, 10);
        assert_eq!(obj.header.owner, 3);
    }
}
