//! The spatial object cache (`cache_provider`, §4.2): a concurrent,
//! multi-indexed store with an explicit transactional update protocol, LOS
//! queries, and optimistic-concurrency detection.

mod lock;

use std::cell::UnsafeCell;
use std::collections::{HashMap, HashSet};

use crate::error::{CacheError, Result};
use crate::object::{CacheVersion, GameObject, ObjectId, OwnerId, Rect};
use lock::RecursiveLock;

struct CacheInner {
    bounds: Rect,
    los_radius: i64,
    id_index: HashMap<ObjectId, GameObject>,
    owner_index: HashMap<OwnerId, Vec<ObjectId>>,
    location_index: HashMap<(i64, i64), ObjectId>,
    updatable_order: Vec<ObjectId>,
    update_cursor: usize,
}

impl CacheInner {
    fn new(start_x: i64, start_y: i64, width: i64, height: i64, los_radius: i64) -> Self {
        Self {
            bounds: Rect::new(start_x, start_y, width, height),
            los_radius,
            id_index: HashMap::new(),
            owner_index: HashMap::new(),
            location_index: HashMap::new(),
            updatable_order: Vec::new(),
            update_cursor: 0,
        }
    }

    fn add(&mut self, object: &GameObject) -> Result<()> {
        let mut copy = object.deep_copy();
        if let Some(spatial) = &copy.spatial {
            let rect = spatial.rect();
            for point in rect.points() {
                if self.location_index.contains_key(&point) {
                    return Err(CacheError::Synchronization(format!(
                        "lattice point ({}, {}) already occupied",
                        point.0, point.1
                    )));
                }
            }
            for point in rect.points() {
                self.location_index.insert(point, copy.header.id);
            }
        }
        copy.header.version = 1;
        let id = copy.header.id;
        if copy.is_owned() {
            self.owner_index.entry(copy.header.owner).or_default().push(id);
        }
        if copy.is_updatable() {
            self.updatable_order.push(id);
        }
        self.id_index.insert(id, copy);
        Ok(())
    }

    fn remove(&mut self, object: &GameObject) -> Result<()> {
        let id = object.header.id;
        let stored = self
            .id_index
            .get(&id)
            .ok_or_else(|| CacheError::Synchronization(format!("object {id} not present")))?;
        if stored.header.version != object.header.version {
            return Err(CacheError::Synchronization(format!("stale version for object {id}")));
        }
        let removed = self.id_index.remove(&id).expect("checked above");
        if let Some(spatial) = &removed.spatial {
            for point in spatial.rect().points() {
                self.location_index.remove(&point);
            }
        }
        if removed.is_owned() {
            if let Some(bucket) = self.owner_index.get_mut(&removed.header.owner) {
                bucket.retain(|&oid| oid != id);
            }
        }
        if removed.is_updatable() {
            self.updatable_order.retain(|&oid| oid != id);
        }
        Ok(())
    }

    fn update(&mut self, new_object: &GameObject) -> Result<()> {
        let id = new_object.header.id;
        let old = self
            .id_index
            .get(&id)
            .ok_or_else(|| CacheError::Synchronization(format!("object {id} not present")))?;
        if old.header.version != new_object.header.version {
            return Err(CacheError::Synchronization(format!("stale version for object {id}")));
        }

        let old_origin = old.spatial.as_ref().map(|s| (s.x, s.y));
        let new_origin = new_object.spatial.as_ref().map(|s| (s.x, s.y));
        let loc_changed = old_origin != new_origin;
        let own_changed = old.header.owner != new_object.header.owner;

        if loc_changed {
            if let Some(new_spatial) = &new_object.spatial {
                for point in new_spatial.rect().points() {
                    if let Some(occupant) = self.location_index.get(&point) {
                        if *occupant != id {
                            return Err(CacheError::Synchronization(format!(
                                "target location ({}, {}) occupied by another object",
                                point.0, point.1
                            )));
                        }
                    }
                }
            }
        }

        let mut stamped = new_object.deep_copy();
        stamped.header.version = old.header.version + 1;

        let old_owner = old.header.owner;
        let old_rect = old.rect();

        if loc_changed {
            if let Some(r) = old_rect {
                for point in r.points() {
                    self.location_index.remove(&point);
                }
            }
        }
        if own_changed {
            if let Some(bucket) = self.owner_index.get_mut(&old_owner) {
                bucket.retain(|&oid| oid != id);
            }
        }

        self.id_index.insert(id, stamped.clone());

        if loc_changed {
            if let Some(s) = &stamped.spatial {
                for point in s.rect().points() {
                    self.location_index.insert(point, id);
                }
            }
        }
        if own_changed && stamped.is_owned() {
            self.owner_index.entry(stamped.header.owner).or_default().push(id);
        }

        Ok(())
    }

    fn get_by_id(&self, id: ObjectId) -> Option<GameObject> {
        self.id_index.get(&id).map(GameObject::deep_copy)
    }

    fn get_at_location(&self, x: i64, y: i64) -> Option<GameObject> {
        let id = self.location_index.get(&(x, y))?;
        self.id_index.get(id).map(GameObject::deep_copy)
    }

    fn get_in_area(&self, x: i64, y: i64, width: i64, height: i64) -> HashMap<ObjectId, GameObject> {
        let mut out = HashMap::new();
        let clamped = match Rect::new(x, y, width, height).clamped_to(&self.bounds) {
            Some(r) => r,
            None => return out,
        };
        for point in clamped.points() {
            if let Some(id) = self.location_index.get(&point) {
                out.entry(*id).or_insert_with(|| self.id_index[id].deep_copy());
            }
        }
        out
    }

    fn get_users_with_los_at(&self, x: i64, y: i64) -> HashSet<OwnerId> {
        let mut out = HashSet::new();
        let clamped = match Rect::centered_square(x, y, self.los_radius).clamped_to(&self.bounds) {
            Some(r) => r,
            None => return out,
        };
        for point in clamped.points() {
            if let Some(id) = self.location_index.get(&point) {
                if let Some(obj) = self.id_index.get(id) {
                    if obj.is_owned() {
                        out.insert(obj.header.owner);
                    }
                }
            }
        }
        out
    }

    fn get_by_owner(&self, owner: OwnerId) -> HashMap<ObjectId, GameObject> {
        let mut out = HashMap::new();
        if let Some(ids) = self.owner_index.get(&owner) {
            for id in ids {
                if let Some(obj) = self.id_index.get(id) {
                    out.insert(*id, obj.deep_copy());
                }
            }
        }
        out
    }

    fn get_in_owner_los(&self, owner: OwnerId, filter: Option<Rect>) -> HashMap<ObjectId, GameObject> {
        let mut out = HashMap::new();
        let owned_ids = match self.owner_index.get(&owner) {
            Some(ids) => ids.clone(),
            None => return out,
        };
        for oid in owned_ids {
            let origin = match self.id_index.get(&oid).and_then(|o| o.spatial.as_ref()) {
                Some(s) => (s.x, s.y),
                None => continue,
            };
            let square = match Rect::centered_square(origin.0, origin.1, self.los_radius).clamped_to(&self.bounds) {
                Some(r) => r,
                None => continue,
            };
            let region = match filter {
                Some(f) => match square.clamped_to(&f) {
                    Some(r) => r,
                    None => continue,
                },
                None => square,
            };
            for point in region.points() {
                if let Some(id) = self.location_index.get(&point) {
                    out.entry(*id).or_insert_with(|| self.id_index[id].deep_copy());
                }
            }
        }
        out
    }

    fn is_area_empty(&self, x: i64, y: i64, width: i64, height: i64) -> bool {
        match Rect::new(x, y, width, height).clamped_to(&self.bounds) {
            Some(r) => !r.points().any(|p| self.location_index.contains_key(&p)),
            None => true,
        }
    }

    fn is_location_in_los(&self, x: i64, y: i64, owner: OwnerId) -> bool {
        self.get_users_with_los_at(x, y).contains(&owner)
    }

    fn is_location_in_bounds(&self, x: i64, y: i64, width: i64, height: i64) -> bool {
        self.bounds.contains_rect(&Rect::new(x, y, width, height))
    }

    fn is_user_present(&self, id: ObjectId) -> bool {
        self.id_index.contains_key(&id)
    }

    fn take_tick_batch(&mut self, updates_per_tick: usize) -> Vec<ObjectId> {
        let total = self.updatable_order.len();
        if total == 0 {
            self.update_cursor = 0;
            return Vec::new();
        }
        let count = updates_per_tick.min(total);
        let mut batch = Vec::with_capacity(count);
        for _ in 0..count {
            if self.update_cursor >= self.updatable_order.len() {
                self.update_cursor = 0;
            }
            batch.push(self.updatable_order[self.update_cursor]);
            self.update_cursor += 1;
        }
        batch
    }
}

/// A concurrent, multi-indexed in-memory store of game objects (§3, §4.2).
///
/// All mutation is gated by [`SpatialCache::begin_update`] /
/// [`SpatialCache::end_update`]; reads acquire the same lock for their
/// duration and always return deep copies.
pub struct SpatialCache {
    lock: RecursiveLock,
    inner: UnsafeCell<CacheInner>,
}

// SAFETY: every access to `inner` goes through `RecursiveLock`, which admits
// at most one thread (reentrantly) at a time.
unsafe impl Sync for SpatialCache {}
unsafe impl Send for SpatialCache {}

impl SpatialCache {
    pub fn new(start_x: i64, start_y: i64, width: i64, height: i64, los_radius: i64) -> Self {
        Self { lock: RecursiveLock::new(), inner: UnsafeCell::new(CacheInner::new(start_x, start_y, width, height, los_radius)) }
    }

    /// Acquire the update lock. Reentrant: calling this again from the same
    /// thread increments a depth counter rather than deadlocking.
    pub fn begin_update(&self) {
        self.lock.acquire();
    }

    /// Release one level of the update lock.
    pub fn end_update(&self) {
        self.lock.release();
    }

    fn require_lock_holder(&self) -> Result<()> {
        if self.lock.is_held_by_current_thread() {
            Ok(())
        } else {
            Err(CacheError::Synchronization("update lock not held by calling thread".into()))
        }
    }

    fn inner_mut(&self) -> &mut CacheInner {
        // SAFETY: only reachable while the calling thread holds `self.lock`.
        unsafe { &mut *self.inner.get() }
    }

    fn with_read_lock<R>(&self, f: impl FnOnce(&CacheInner) -> R) -> R {
        self.lock.acquire();
        let result = f(self.inner_mut());
        self.lock.release();
        result
    }

    pub fn add(&self, object: &GameObject) -> Result<()> {
        self.require_lock_holder()?;
        self.inner_mut().add(object)
    }

    pub fn remove(&self, object: &GameObject) -> Result<()> {
        self.require_lock_holder()?;
        self.inner_mut().remove(object)
    }

    pub fn update(&self, object: &GameObject) -> Result<()> {
        self.require_lock_holder()?;
        self.inner_mut().update(object)
    }

    /// Reconfigure the cache's bounds and LOS radius (§3 supplement).
    pub fn set_bounds(&self, start_x: i64, start_y: i64, width: i64, height: i64, los_radius: i64) -> Result<()> {
        self.require_lock_holder()?;
        let inner = self.inner_mut();
        inner.bounds = Rect::new(start_x, start_y, width, height);
        inner.los_radius = los_radius;
        Ok(())
    }

    /// Bracket a single `add` with `begin_update`/`end_update` for callers
    /// that do not need a multi-operation transactional scope.
    pub fn add_single(&self, object: &GameObject) -> Result<()> {
        self.begin_update();
        let result = self.add(object);
        self.end_update();
        result
    }

    pub fn remove_single(&self, object: &GameObject) -> Result<()> {
        self.begin_update();
        let result = self.remove(object);
        self.end_update();
        result
    }

    pub fn update_single(&self, object: &GameObject) -> Result<()> {
        self.begin_update();
        let result = self.update(object);
        self.end_update();
        result
    }

    pub fn get_by_id(&self, id: ObjectId) -> Option<GameObject> {
        self.with_read_lock(|inner| inner.get_by_id(id))
    }

    pub fn get_at_location(&self, x: i64, y: i64) -> Option<GameObject> {
        self.with_read_lock(|inner| inner.get_at_location(x, y))
    }

    pub fn get_in_area(&self, x: i64, y: i64, width: i64, height: i64) -> HashMap<ObjectId, GameObject> {
        self.with_read_lock(|inner| inner.get_in_area(x, y, width, height))
    }

    pub fn get_users_with_los_at(&self, x: i64, y: i64) -> HashSet<OwnerId> {
        self.with_read_lock(|inner| inner.get_users_with_los_at(x, y))
    }

    pub fn get_by_owner(&self, owner: OwnerId) -> HashMap<ObjectId, GameObject> {
        self.with_read_lock(|inner| inner.get_by_owner(owner))
    }

    pub fn get_in_owner_los(&self, owner: OwnerId) -> HashMap<ObjectId, GameObject> {
        self.with_read_lock(|inner| inner.get_in_owner_los(owner, None))
    }

    pub fn get_in_owner_los_within(&self, owner: OwnerId, x: i64, y: i64, width: i64, height: i64) -> HashMap<ObjectId, GameObject> {
        let filter = Rect::new(x, y, width, height);
        self.with_read_lock(|inner| inner.get_in_owner_los(owner, Some(filter)))
    }

    pub fn is_area_empty(&self, x: i64, y: i64, width: i64, height: i64) -> bool {
        self.with_read_lock(|inner| inner.is_area_empty(x, y, width, height))
    }

    pub fn is_location_in_los(&self, x: i64, y: i64, owner: OwnerId) -> bool {
        self.with_read_lock(|inner| inner.is_location_in_los(x, y, owner))
    }

    /// Whether the `width × height` rectangle at `(x, y)` fits entirely
    /// within the cache's bounds. `width`/`height` default to `1, 1` for a
    /// single-point check.
    pub fn is_location_in_bounds(&self, x: i64, y: i64, width: i64, height: i64) -> bool {
        self.with_read_lock(|inner| inner.is_location_in_bounds(x, y, width, height))
    }

    pub fn is_user_present(&self, id: ObjectId) -> bool {
        self.with_read_lock(|inner| inner.is_user_present(id))
    }

    /// Pull up to `updates_per_tick` identifiers from the updatable order,
    /// advancing and wrapping the cursor. Used by [`crate::updater::CacheUpdater`].
    pub fn take_tick_batch(&self, updates_per_tick: usize) -> Vec<ObjectId> {
        self.require_lock_holder().expect("caller must hold the update lock");
        self.inner_mut().take_tick_batch(updates_per_tick)
    }

    pub fn version_of(&self, id: ObjectId) -> Option<CacheVersion> {
        self.with_read_lock(|inner| inner.id_index.get(&id).map(|o| o.header.version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::GameObject;
    use std::sync::Arc;
    use std::thread;

    fn map_object(id: ObjectId, owner: OwnerId, x: i64, y: i64, w: i64, h: i64) -> GameObject {
        GameObject::new(id, 0).with_owner(owner).with_map(0, x, y, w, h)
    }

    #[test]
    fn scenario_simple_add() {
        let cache = SpatialCache::new(0, 0, 10, 10, 2);
        cache.begin_update();
        cache.add(&map_object(1, 7, 3, 3, 2, 2)).unwrap();
        cache.end_update();

        assert_eq!(cache.get_at_location(3, 3).unwrap().header.id, 1);
        assert_eq!(cache.get_at_location(4, 4).unwrap().header.id, 1);
        assert!(cache.get_at_location(5, 5).is_none());
        assert!(!cache.is_area_empty(3, 3, 1, 1));
        assert!(cache.is_area_empty(6, 6, 1, 1));
    }

    #[test]
    fn scenario_collision_leaves_cache_unchanged() {
        let cache = SpatialCache::new(0, 0, 10, 10, 2);
        cache.begin_update();
        cache.add(&map_object(1, 7, 3, 3, 2, 2)).unwrap();
        let result = cache.add(&map_object(2, 7, 4, 4, 2, 2));
        cache.end_update();

        assert!(result.is_err());
        assert_eq!(cache.get_at_location(4, 4).unwrap().header.id, 1);
        assert!(cache.get_by_id(2).is_none());
    }

    #[test]
    fn scenario_move() {
        let cache = SpatialCache::new(0, 0, 10, 10, 2);
        cache.begin_update();
        cache.add(&map_object(1, 7, 3, 3, 2, 2)).unwrap();
        let snapshot = cache.get_by_id(1).unwrap();
        let moved = GameObject { header: snapshot.header.clone(), ..map_object(1, 7, 6, 6, 2, 2) };
        cache.update(&moved).unwrap();
        cache.end_update();

        assert!(cache.get_at_location(3, 3).is_none());
        assert_eq!(cache.get_at_location(6, 6).unwrap().header.id, 1);
        assert!(cache.version_of(1).unwrap() > snapshot.header.version);
    }

    #[test]
    fn scenario_stale_update_fails() {
        let cache = SpatialCache::new(0, 0, 10, 10, 2);
        cache.begin_update();
        cache.add(&map_object(1, 7, 3, 3, 2, 2)).unwrap();
        let stale_snapshot = cache.get_by_id(1).unwrap();
        let moved = GameObject { header: stale_snapshot.header.clone(), ..map_object(1, 7, 6, 6, 2, 2) };
        cache.update(&moved).unwrap();

        let second_attempt = GameObject { header: stale_snapshot.header.clone(), ..map_object(1, 7, 9, 9, 1, 1) };
        let result = cache.update(&second_attempt);
        cache.end_update();

        assert!(result.is_err());
    }

    #[test]
    fn scenario_los() {
        let cache = SpatialCache::new(0, 0, 100, 100, 5);
        cache.begin_update();
        cache.add(&map_object(1, 9, 50, 50, 1, 1)).unwrap();
        cache.end_update();

        assert!(cache.is_location_in_los(50, 50, 9));
        assert!(!cache.is_location_in_los(60, 60, 9));
        assert!(cache.get_users_with_los_at(51, 51).contains(&9));
    }

    #[test]
    fn round_trip_add_then_remove() {
        let cache = SpatialCache::new(0, 0, 10, 10, 2);
        cache.begin_update();
        cache.add(&map_object(1, 7, 1, 1, 1, 1)).unwrap();
        let stored = cache.get_by_id(1).unwrap();
        cache.remove(&stored).unwrap();
        cache.end_update();

        assert!(!cache.is_user_present(1));
    }

    #[test]
    fn concurrent_update_exactly_one_succeeds() {
        let cache = Arc::new(SpatialCache::new(0, 0, 10, 10, 2));
        cache.begin_update();
        cache.add(&map_object(1, 7, 0, 0, 1, 1)).unwrap();
        cache.end_update();

        let shared_snapshot = cache.get_by_id(1).unwrap();

        let mut handles = Vec::new();
        for dest in [(1, 1), (2, 2)] {
            let cache = Arc::clone(&cache);
            let snapshot = shared_snapshot.clone();
            handles.push(thread::spawn(move || {
                cache.begin_update();
                let moved = GameObject { header: snapshot.header.clone(), ..map_object(1, 7, dest.0, dest.1, 1, 1) };
                let result = cache.update(&moved);
                cache.end_update();
                result.is_ok()
            }));
        }

        let outcomes: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(outcomes.iter().filter(|&&ok| ok).count(), 1);
    }

    #[test]
    fn mutation_without_lock_is_synchronization_error() {
        let cache = SpatialCache::new(0, 0, 10, 10, 2);
        let result = cache.add(&map_object(1, 7, 0, 0, 1, 1));
        assert!(matches!(result, Err(CacheError::Synchronization(_))));
    }

    #[test]
    fn location_in_bounds_checks_the_whole_rectangle() {
        let cache = SpatialCache::new(0, 0, 10, 10, 2);
        assert!(cache.is_location_in_bounds(8, 8, 1, 1));
        assert!(cache.is_location_in_bounds(8, 8, 2, 2));
        assert!(!cache.is_location_in_bounds(9, 9, 2, 2));
        assert!(!cache.is_location_in_bounds(-1, 0, 1, 1));
    }
}
