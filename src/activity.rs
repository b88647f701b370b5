//! Activity hierarchy: the memory-scheduling resource principal (spec
//! §4.4).
//!
//! Grounded on the teacher's `kern::task::Task` tree (parent/child links,
//! per-task accounting), reworked from a CPU-scheduling task into a
//! memory-only resource principal: no run queues, only frame counters and
//! per-priority LRU lists. Activities live in a single arena
//! (`ActivityTable`) and reference each other by [`ActivityId`], per spec
//! §9's "arena + OID indices" mandate.

use crate::types::{Oid, Policy};
pub use crate::types::ActivityId;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use hashbrown::HashMap;

pub const ACTIVITY_STATS_PERIODS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityError {
    NotFound,
    RootUndestroyable,
    CounterUnderflow,
}

pub type ActivityResult<T> = Result<T, ActivityError>;

/// Priority/weight pair governing how an activity competes against its
/// siblings (`sibling_rel`) or its own children (`child_rel`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Relation {
    pub priority: i8,
    pub weight: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ActivityPolicy {
    pub child_rel: Relation,
    pub sibling_rel: Relation,
    pub folios_quota: u32,
}

/// Per-period snapshot feeding the stats ring (spec §4.4 [SUPPLEMENT]).
#[derive(Debug, Clone, Copy, Default)]
pub struct PeriodStats {
    pub active: u32,
    pub inactive: u32,
    pub available: u32,
    pub evicted: u32,
    pub pressure: u32,
}

#[derive(Debug, Default)]
struct PriorityLists {
    active: VecDeque<Oid>,
    inactive: VecDeque<Oid>,
}

/// The self-paging bookkeeping the pager drives (spec §4.4 "free-goal").
#[derive(Debug, Clone, Copy, Default)]
pub struct FreeGoal {
    pub goal: u32,
    pub free_allocations: u32,
    pub bad_karma_cycles: u32,
}

pub struct Activity {
    pub parent: Option<ActivityId>,
    pub children: Vec<ActivityId>,
    pub policy: ActivityPolicy,
    pub frames_local: i64,
    pub frames_total: i64,
    pub frames_pending_eviction: i64,
    pub frames_excluded: i64,
    pub folio_count: u32,
    pub folios: Vec<u64>,
    lists: HashMap<i8, PriorityLists>,
    pub eviction_clean: VecDeque<Oid>,
    pub eviction_dirty: VecDeque<Oid>,
    pub stats_period: usize,
    pub stats: [PeriodStats; ACTIVITY_STATS_PERIODS],
    pub free_goal: Option<FreeGoal>,
}

impl Activity {
    fn new(parent: Option<ActivityId>, policy: ActivityPolicy) -> Self {
        Self {
            parent,
            children: Vec::new(),
            policy,
            frames_local: 0,
            frames_total: 0,
            frames_pending_eviction: 0,
            frames_excluded: 0,
            folio_count: 0,
            folios: Vec::new(),
            lists: HashMap::new(),
            eviction_clean: VecDeque::new(),
            eviction_dirty: VecDeque::new(),
            stats_period: 0,
            stats: [PeriodStats::default(); ACTIVITY_STATS_PERIODS],
            free_goal: None,
        }
    }

    pub fn active_list(&self, priority: i8) -> &VecDeque<Oid> {
        static EMPTY: VecDeque<Oid> = VecDeque::new();
        self.lists.get(&priority).map(|l| &l.active).unwrap_or(&EMPTY)
    }

    pub fn inactive_list(&self, priority: i8) -> &VecDeque<Oid> {
        static EMPTY: VecDeque<Oid> = VecDeque::new();
        self.lists.get(&priority).map(|l| &l.inactive).unwrap_or(&EMPTY)
    }

    pub fn push_active(&mut self, priority: i8, oid: Oid) {
        self.lists.entry(priority).or_default().active.push_front(oid);
    }

    pub fn push_inactive_front(&mut self, priority: i8, oid: Oid) {
        self.lists.entry(priority).or_default().inactive.push_front(oid);
    }

    pub fn push_inactive_back(&mut self, priority: i8, oid: Oid) {
        self.lists.entry(priority).or_default().inactive.push_back(oid);
    }

    pub fn remove_from_lru(&mut self, priority: i8, oid: Oid) {
        if let Some(lists) = self.lists.get_mut(&priority) {
            lists.active.retain(|&o| o != oid);
            lists.inactive.retain(|&o| o != oid);
        }
    }

    /// `frames_total - frames_excluded - frames_pending_eviction -
    /// (active >> factor)` (spec §4.5 step 2). `factor` is the freeness
    /// factor itself (1, 2, 4, 8, or 16), used directly as the shift count,
    /// not its base-2 log, so the first pass (`factor == 1`) discounts
    /// only half the active count, not all of it.
    pub fn effective_frames(&self, factor: u32) -> i64 {
        let active_total: i64 = self.lists.values().map(|l| l.active.len() as i64).sum();
        self.frames_total - self.frames_excluded - self.frames_pending_eviction - (active_total >> factor)
    }
}

pub struct ActivityTable {
    activities: HashMap<ActivityId, Activity>,
    pub root: ActivityId,
    next_id: i64,
}

impl ActivityTable {
    pub fn new() -> Self {
        let root = ActivityId(0);
        let mut activities = HashMap::new();
        activities.insert(root, Activity::new(None, ActivityPolicy::default()));
        Self { activities, root, next_id: 1 }
    }

    pub fn get(&self, id: ActivityId) -> ActivityResult<&Activity> {
        self.activities.get(&id).ok_or(ActivityError::NotFound)
    }

    pub fn get_mut(&mut self, id: ActivityId) -> ActivityResult<&mut Activity> {
        self.activities.get_mut(&id).ok_or(ActivityError::NotFound)
    }

    /// `activity_create(parent, child)`: attach a freshly allocated child
    /// to `parent`'s child list, keeping descending `sibling_rel.priority`
    /// order.
    pub fn create(&mut self, parent: ActivityId, policy: ActivityPolicy) -> ActivityResult<ActivityId> {
        if !self.activities.contains_key(&parent) {
            return Err(ActivityError::NotFound);
        }
        let id = ActivityId(self.next_id);
        self.next_id += 1;
        self.activities.insert(id, Activity::new(Some(parent), policy));
        self.insert_sorted(parent, id)?;
        Ok(id)
    }

    fn insert_sorted(&mut self, parent: ActivityId, child: ActivityId) -> ActivityResult<()> {
        self.get_mut(parent)?.children.push(child);
        self.resort_children(parent, 0)
    }

    fn resort_children(&mut self, parent: ActivityId, _just_inserted_priority: i8) -> ActivityResult<()> {
        let priorities: Vec<(ActivityId, i8)> = {
            let parent_act = self.get(parent)?;
            parent_act
                .children
                .iter()
                .map(|&c| (c, self.activities.get(&c).map(|a| a.policy.sibling_rel.priority).unwrap_or(0)))
                .collect()
        };
        let mut sorted = priorities;
        sorted.sort_by(|a, b| b.1.cmp(&a.1));
        self.get_mut(parent)?.children = sorted.into_iter().map(|(c, _)| c).collect();
        Ok(())
    }

    /// `activity_policy_update`: re-sort among siblings if priority changed.
    pub fn policy_update(&mut self, id: ActivityId, policy: ActivityPolicy) -> ActivityResult<()> {
        let parent = self.get(id)?.parent;
        self.get_mut(id)?.policy = policy;
        if let Some(parent) = parent {
            self.resort_children(parent, policy.sibling_rel.priority)?;
        }
        Ok(())
    }

    /// `activity_charge(act, ±n)`: update `frames_local` on `act` and
    /// `frames_total` on every ancestor, with underflow assertions (spec
    /// §4.4).
    pub fn charge(&mut self, id: ActivityId, delta: i64) -> ActivityResult<()> {
        {
            let act = self.get_mut(id)?;
            let new_local = act.frames_local + delta;
            if new_local < 0 {
                return Err(ActivityError::CounterUnderflow);
            }
            act.frames_local = new_local;
        }
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let act = self.get_mut(current)?;
            let new_total = act.frames_total + delta;
            if new_total < 0 {
                return Err(ActivityError::CounterUnderflow);
            }
            act.frames_total = new_total;
            cursor = act.parent;
        }
        Ok(())
    }

    /// `activity_destroy(parent, victim)`: free all folios (caller already
    /// did so via the store and passes the now-empty victim here),
    /// reparent every still-resident frame to `victim.parent` at minimum
    /// priority, and remove the victim from the tree. `root` may never be
    /// destroyed.
    pub fn destroy(&mut self, victim: ActivityId) -> ActivityResult<()> {
        if victim == self.root {
            return Err(ActivityError::RootUndestroyable);
        }
        let parent = self.get(victim)?.parent.ok_or(ActivityError::RootUndestroyable)?;

        // Reparent victim's children up to victim's parent (spec doesn't
        // forbid a destroyed activity having live children; treat them the
        // way a process tree treats an orphan: re-home under the parent).
        let children = self.get(victim)?.children.clone();
        for child in &children {
            self.get_mut(*child)?.parent = Some(parent);
        }

        let min_priority = Policy::PRIORITY_MIN;
        let (active_oids, inactive_oids, dirty_oids, frames_total, frames_pending_eviction) = {
            let victim_act = self.get(victim)?;
            let active: Vec<Oid> = victim_act.lists.values().flat_map(|l| l.active.iter().copied()).collect();
            let inactive: Vec<Oid> = victim_act.lists.values().flat_map(|l| l.inactive.iter().copied()).collect();
            let dirty: Vec<Oid> = victim_act.eviction_dirty.iter().copied().collect();
            (active, inactive, dirty, victim_act.frames_total, victim_act.frames_pending_eviction)
        };

        {
            let parent_act = self.get_mut(parent)?;
            for oid in active_oids.iter().chain(inactive_oids.iter()) {
                parent_act.push_inactive_front(min_priority, *oid);
            }
            for oid in dirty_oids.iter() {
                parent_act.eviction_dirty.push_back(*oid);
            }
            parent_act.frames_total += frames_total;
            parent_act.frames_pending_eviction += frames_pending_eviction;
            parent_act.children.extend(children.iter().copied());
            parent_act.children.retain(|&c| c != victim);
        }
        self.resort_children(parent, 0)?;
        self.activities.remove(&victim);
        Ok(())
    }

    pub fn candidates_of(&self, node: ActivityId) -> ActivityResult<Vec<ActivityId>> {
        let act = self.get(node)?;
        let mut out = Vec::with_capacity(act.children.len() + 1);
        out.push(node);
        out.extend(act.children.iter().copied());
        Ok(out)
    }
}

impl Default for ActivityTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_orders_children_by_descending_sibling_priority() {
        let mut table = ActivityTable::new();
        let low = table
            .create(table.root, ActivityPolicy { sibling_rel: Relation { priority: -5, weight: 1 }, ..Default::default() })
            .unwrap();
        let high = table
            .create(table.root, ActivityPolicy { sibling_rel: Relation { priority: 10, weight: 1 }, ..Default::default() })
            .unwrap();
        let root = table.get(table.root).unwrap();
        assert_eq!(root.children, alloc::vec![high, low]);
    }

    #[test]
    fn charge_propagates_to_every_ancestor() {
        let mut table = ActivityTable::new();
        let mid = table.create(table.root, ActivityPolicy::default()).unwrap();
        let leaf = table.create(mid, ActivityPolicy::default()).unwrap();
        table.charge(leaf, 5).unwrap();
        assert_eq!(table.get(leaf).unwrap().frames_local, 5);
        assert_eq!(table.get(mid).unwrap().frames_total, 5);
        assert_eq!(table.get(table.root).unwrap().frames_total, 5);
    }

    #[test]
    fn charge_rejects_underflow() {
        let mut table = ActivityTable::new();
        let child = table.create(table.root, ActivityPolicy::default()).unwrap();
        assert_eq!(table.charge(child, -1), Err(ActivityError::CounterUnderflow));
    }

    #[test]
    fn destroy_reparents_resident_frames_and_counters() {
        let mut table = ActivityTable::new();
        let a = table.root;
        let c = table.create(a, ActivityPolicy::default()).unwrap();
        let g = table.create(c, ActivityPolicy::default()).unwrap();

        table.get_mut(g).unwrap().push_active(0, 100);
        table.get_mut(g).unwrap().push_active(0, 101);
        table.get_mut(g).unwrap().eviction_dirty.push_back(102);
        table.get_mut(g).unwrap().frames_total = 3;
        table.get_mut(g).unwrap().frames_pending_eviction = 1;
        table.charge(c, 3).unwrap(); // keep ancestor totals coherent before destroy

        table.destroy(c).unwrap();

        let a_act = table.get(a).unwrap();
        assert!(a_act.children.contains(&g));
        assert_eq!(a_act.inactive_list(Policy::PRIORITY_MIN).len(), 2);
        assert_eq!(a_act.eviction_dirty.len(), 1);
        assert!(table.get(c).is_err());
    }

    #[test]
    fn root_cannot_be_destroyed() {
        let mut table = ActivityTable::new();
        assert_eq!(table.destroy(table.root), Err(ActivityError::RootUndestroyable));
    }
}
