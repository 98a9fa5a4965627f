//! The tick-driven updater (§4.3): a cooperative tick loop for updatable
//! entities, in two variants, plus the timer thread that drives either one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::behavior::BehaviorRegistry;
use crate::cache::SpatialCache;
use crate::object::{GameObject, ObjectId};

struct ListUpdaterState {
    entries: Vec<GameObject>,
    cursor: usize,
}

/// Holds a mutable ordered sequence of updatables with its own mutex,
/// independent of any [`SpatialCache`] (§4.3 "list updater").
pub struct ListUpdater {
    state: Mutex<ListUpdaterState>,
    updates_per_tick: usize,
    behaviors: BehaviorRegistry,
}

impl ListUpdater {
    pub fn new(updates_per_tick: usize, behaviors: BehaviorRegistry) -> Self {
        Self { state: Mutex::new(ListUpdaterState { entries: Vec::new(), cursor: 0 }), updates_per_tick, behaviors }
    }

    pub fn push(&self, object: GameObject) {
        self.state.lock().entries.push(object);
    }

    pub fn remove(&self, id: ObjectId) {
        self.state.lock().entries.retain(|o| o.header.id != id);
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<GameObject> {
        self.state.lock().entries.clone()
    }

    /// Advance up to `updates_per_tick` entries from the cursor, wrapping.
    pub fn tick(&self, now_ms: u64) {
        let mut state = self.state.lock();
        let total = state.entries.len();
        if total == 0 {
            state.cursor = 0;
            return;
        }
        let count = self.updates_per_tick.min(total);
        for _ in 0..count {
            if state.cursor >= state.entries.len() {
                state.cursor = 0;
            }
            let idx = state.cursor;
            let last_updated = state.entries[idx].updatable.as_ref().map(|u| u.last_updated_ms).unwrap_or(now_ms);
            let delta = now_ms.saturating_sub(last_updated);
            self.behaviors.apply(&mut state.entries[idx], delta);
            if let Some(u) = state.entries[idx].updatable.as_mut() {
                u.last_updated_ms = now_ms;
            }
            state.cursor += 1;
        }
    }
}

/// Drives the updatable iteration order inside a [`SpatialCache`] under the
/// cache's own lock (§4.3 "cache updater").
pub struct CacheUpdater {
    updates_per_tick: usize,
    behaviors: BehaviorRegistry,
}

impl CacheUpdater {
    pub fn new(updates_per_tick: usize, behaviors: BehaviorRegistry) -> Self {
        Self { updates_per_tick, behaviors }
    }

    pub fn tick(&self, cache: &SpatialCache, now_ms: u64) {
        cache.begin_update();
        let batch = cache.take_tick_batch(self.updates_per_tick);
        for id in batch {
            if let Some(mut object) = cache.get_by_id(id) {
                let last_updated = object.updatable.as_ref().map(|u| u.last_updated_ms).unwrap_or(now_ms);
                let delta = now_ms.saturating_sub(last_updated);
                self.behaviors.apply(&mut object, delta);
                if let Some(u) = object.updatable.as_mut() {
                    u.last_updated_ms = now_ms;
                }
                // A concurrent removal between the read above and here fails
                // this update with a synchronization error; that's fine, the
                // object is gone and the next tick simply won't see it.
                let _ = cache.update(&object);
            }
        }
        cache.end_update();
    }
}

/// A timer thread driving a tick callback at microsecond-resolution cadence.
///
/// Deliberately a plain OS thread with a sleep loop rather than an async
/// task: a long-running `update()` call must block the *next* tick as wall
/// clock time, not yield cooperatively, because ticks are themselves
/// cooperative with respect to the cache lock (§5).
pub struct TickDriver {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TickDriver {
    pub fn spawn<F>(interval: Duration, mut on_tick: F) -> Self
    where
        F: FnMut(u64) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            while !stop_flag.load(Ordering::Relaxed) {
                let now_ms = start.elapsed().as_millis() as u64;
                on_tick(now_ms);
                std::thread::sleep(interval);
            }
        });
        Self { stop, handle: Some(handle) }
    }

    /// Signal the timer thread to stop and wait for it to finish its current
    /// tick.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TickDriver {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    struct DoubleOwner;
    impl crate::behavior::Behavior for DoubleOwner {
        fn update(&self, object: &mut GameObject, _delta_ms: u64) {
            object.header.owner *= 2;
        }
    }

    #[test]
    fn list_updater_advances_cursor_and_wraps() {
        let mut registry = BehaviorRegistry::new();
        registry.register(1, StdArc::new(DoubleOwner));
        let updater = ListUpdater::new(1, registry);
        updater.push(GameObject::new(1, 0).with_owner(1).with_updatable(1));
        updater.push(GameObject::new(2, 0).with_owner(1).with_updatable(1));

        updater.tick(10);
        let snap = updater.snapshot();
        assert_eq!(snap[0].header.owner, 2);
        assert_eq!(snap[1].header.owner, 1);

        updater.tick(20);
        let snap = updater.snapshot();
        assert_eq!(snap[1].header.owner, 2);
    }

    #[test]
    fn cache_updater_applies_behavior_under_lock() {
        let mut registry = BehaviorRegistry::new();
        registry.register(1, StdArc::new(DoubleOwner));
        let cache = SpatialCache::new(0, 0, 10, 10, 2);
        cache.begin_update();
        cache.add(&GameObject::new(1, 0).with_owner(3).with_map(0, 1, 1, 1, 1).with_updatable(1)).unwrap();
        cache.end_update();

        let updater = CacheUpdater::new(4, registry);
        updater.tick(&cache, 100);

        assert_eq!(cache.get_by_id(1).unwrap().header.owner, 6);
    }
}
