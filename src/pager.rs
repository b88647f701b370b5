//! Working-set pager: victim selection and eviction (spec §4.5).
//!
//! Grounded on the teacher's `mach_vm::vm_pageout` sweep (low/high water
//! marks, a tree of "what to reclaim next"), reworked from Mach's global
//! inactive/active page queues into the spec's per-activity, priority-
//! weighted tree walk. The activity tree itself lives in [`crate::activity`];
//! this module only holds pager-specific state (water marks, the
//! allocation-delta throttle) and the selection/reclamation algorithms.

use crate::activity::{ActivityId, ActivityResult, ActivityTable};
use crate::types::{Oid, Policy};
use alloc::vec::Vec;

/// Something the pager can deliver a pressure notification to, and ask
/// whether a victim has a waiter requesting one (spec §4.5 "Self-paging
/// opportunity"). Implemented by `server::Manager`, which owns the
/// messenger wait queues.
pub trait PressureChannel {
    fn has_pressure_waiter(&self, activity: ActivityId) -> bool;
    fn deliver_pressure(&mut self, activity: ActivityId, goal: u32);
}

/// Tells the pager whether a resident object is dirty and not discardable —
/// the one fact `evict_one` needs from the object store, which this module
/// otherwise has no visibility into (spec §4.5 "Disposition").
pub trait DirtyOracle {
    fn is_dirty_sticky(&self, oid: Oid) -> bool;
}

/// Where a reclaimed frame landed (spec §4.5 "Forced reclamation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimDisposition {
    Laundry,
    Available,
}

#[derive(Debug, Clone, Copy)]
pub struct ReclaimedFrame {
    pub oid: Oid,
    pub activity: ActivityId,
    pub disposition: ReclaimDisposition,
}

pub struct Pager {
    pub memory_total: u64,
    /// Allocation count as of the last `pager_collect`; `pager_query`
    /// throttles on the delta since then (spec §4.5 [SUPPLEMENT]
    /// `pager_min_alloc_before_next_collect`).
    last_collect_alloc_count: u64,
    pub pager_min_alloc_before_next_collect: u64,
    pub laundry: Vec<Oid>,
    pub available: Vec<Oid>,
}

impl Pager {
    pub fn new(memory_total: u64) -> Self {
        let low_water = memory_total / 8;
        let high_water = memory_total * 3 / 16;
        Self {
            memory_total,
            last_collect_alloc_count: 0,
            pager_min_alloc_before_next_collect: high_water.saturating_sub(low_water),
            laundry: Vec::new(),
            available: Vec::new(),
        }
    }

    pub fn low_water(&self) -> u64 {
        self.memory_total / 8
    }

    pub fn high_water(&self) -> u64 {
        self.memory_total * 3 / 16
    }

    /// Called at every quiescent point (after each RPC, spec §5). Runs
    /// `pager_collect` only once the allocation-delta budget has elapsed.
    pub fn query<C: PressureChannel + DirtyOracle>(
        &mut self,
        activities: &mut ActivityTable,
        channel: &mut C,
        alloc_count: u64,
    ) -> ActivityResult<Vec<ReclaimedFrame>> {
        let available_plus_half_laundry = self.available.len() as u64 + (self.laundry.len() as u64) / 2;
        if available_plus_half_laundry >= self.low_water() {
            return Ok(Vec::new());
        }
        let delta = alloc_count.saturating_sub(self.last_collect_alloc_count);
        if delta < self.pager_min_alloc_before_next_collect {
            return Ok(Vec::new());
        }
        self.last_collect_alloc_count = alloc_count;
        let goal = self.high_water().saturating_sub(available_plus_half_laundry);
        self.collect(activities, channel, goal as u32)
    }

    /// `pager_collect(goal)` (spec §4.5): select a victim via the
    /// freeness-weighted tree walk, then either grant a self-paging
    /// opportunity or forcibly reclaim from it.
    pub fn collect<C: PressureChannel + DirtyOracle>(
        &mut self,
        activities: &mut ActivityTable,
        channel: &mut C,
        goal: u32,
    ) -> ActivityResult<Vec<ReclaimedFrame>> {
        let root = activities.root;
        let victim = select_victim(activities, root, goal)?;

        if channel.has_pressure_waiter(victim) {
            let half_goal = goal / 2;
            let act = activities.get_mut(victim)?;
            act.free_goal = Some(crate::activity::FreeGoal {
                goal: half_goal,
                free_allocations: 1000,
                bad_karma_cycles: 0,
            });
            let mut cursor = act.parent;
            let frames_local = act.frames_local;
            drop(act);
            while let Some(current) = cursor {
                let ancestor = activities.get_mut(current)?;
                ancestor.frames_excluded += frames_local;
                cursor = ancestor.parent;
            }
            channel.deliver_pressure(victim, half_goal);
            return Ok(Vec::new());
        }

        self.reclaim_from(activities, channel, victim, goal)
    }

    /// `reclaim_from(victim, N)` (spec §4.5 "Forced reclamation"): drain
    /// inactive before active, lowest priority first.
    pub fn reclaim_from<O: DirtyOracle>(
        &mut self,
        activities: &mut ActivityTable,
        oracle: &O,
        victim: ActivityId,
        n: u32,
    ) -> ActivityResult<Vec<ReclaimedFrame>> {
        let mut reclaimed = Vec::new();
        let mut remaining = n;

        for priority in Policy::PRIORITY_MIN..=Policy::PRIORITY_MAX {
            if remaining == 0 {
                break;
            }
            let inactive: Vec<Oid> = activities.get(victim)?.inactive_list(priority).iter().copied().collect();
            for oid in inactive {
                if remaining == 0 {
                    break;
                }
                self.evict_one(activities, oracle, victim, priority, oid, &mut reclaimed)?;
                remaining -= 1;
            }
            if remaining == 0 {
                break;
            }
            let active: Vec<Oid> = activities.get(victim)?.active_list(priority).iter().copied().collect();
            for oid in active {
                if remaining == 0 {
                    break;
                }
                self.evict_one(activities, oracle, victim, priority, oid, &mut reclaimed)?;
                remaining -= 1;
            }
        }
        Ok(reclaimed)
    }

    fn evict_one<O: DirtyOracle>(
        &mut self,
        activities: &mut ActivityTable,
        oracle: &O,
        victim: ActivityId,
        priority: i8,
        oid: Oid,
        reclaimed: &mut Vec<ReclaimedFrame>,
    ) -> ActivityResult<()> {
        let act = activities.get_mut(victim)?;
        act.remove_from_lru(priority, oid);

        // Dirty-and-not-discardable frames go to the laundry and count as
        // pending eviction on every ancestor; everything else goes
        // straight to `available` and is dropped from `frames_total`.
        let is_dirty_and_sticky = oracle.is_dirty_sticky(oid);
        if is_dirty_and_sticky {
            act.eviction_dirty.push_back(oid);
            self.laundry.push(oid);
            drop(act);
            let mut cursor = Some(victim);
            while let Some(current) = cursor {
                let ancestor = activities.get_mut(current)?;
                ancestor.frames_pending_eviction += 1;
                cursor = ancestor.parent;
            }
            reclaimed.push(ReclaimedFrame { oid, activity: victim, disposition: ReclaimDisposition::Laundry });
        } else {
            act.eviction_clean.push_back(oid);
            act.frames_local -= 1;
            drop(act);
            self.available.push(oid);
            let mut cursor = Some(victim);
            while let Some(current) = cursor {
                let ancestor = activities.get_mut(current)?;
                ancestor.frames_total -= 1;
                cursor = ancestor.parent;
            }
            reclaimed.push(ReclaimedFrame { oid, activity: victim, disposition: ReclaimDisposition::Available });
        }
        Ok(())
    }
}

/// Victim selection (spec §4.5): a tree walk from `root_activity`. At each
/// node the freeness factor starts at 1 and doubles up to 16 within that
/// node's own retry loop, escalating only when the current factor leaves
/// no candidate above `goal/1000`. The factor resets to 1 when the walk
/// descends into the winning child (spec §4.5 step 5: "Descend into the
/// winner and repeat").
fn select_victim(activities: &ActivityTable, mut node: ActivityId, goal: u32) -> ActivityResult<ActivityId> {
    loop {
        let candidates = activities.candidates_of(node)?;
        if candidates.len() <= 1 {
            return Ok(node);
        }

        let mut factor = 1u32;
        let winner = loop {
            let mut best: Option<(ActivityId, i8, i64)> = None;
            for &candidate in &candidates {
                let act = activities.get(candidate)?;
                if act.free_goal.is_some() {
                    continue;
                }
                let effective = act.effective_frames(factor);
                if effective <= (goal as i64) / 1000 {
                    continue;
                }
                let priority = if candidate == node { act.policy.child_rel.priority } else { act.policy.sibling_rel.priority };
                let weight = (if candidate == node { act.policy.child_rel.weight } else { act.policy.sibling_rel.weight }).max(1);
                let excess = effective - (effective / weight as i64);

                let better = match best {
                    None => true,
                    Some((_, best_priority, _)) if priority > best_priority => true,
                    Some((_, best_priority, best_excess)) if priority == best_priority && excess > best_excess => true,
                    _ => false,
                };
                if better {
                    best = Some((candidate, priority, excess));
                }
            }

            if let Some((winner, _, _)) = best {
                break Some(winner);
            }
            if factor >= 16 {
                break None;
            }
            factor = (factor * 2).min(16);
        };

        let Some(winner) = winner else {
            return Ok(node);
        };
        if winner == node || activities.get(winner)?.children.is_empty() {
            return Ok(winner);
        }
        node = winner;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityPolicy;

    struct NoPressure;
    impl PressureChannel for NoPressure {
        fn has_pressure_waiter(&self, _activity: ActivityId) -> bool {
            false
        }
        fn deliver_pressure(&mut self, _activity: ActivityId, _goal: u32) {}
    }
    impl DirtyOracle for NoPressure {
        fn is_dirty_sticky(&self, _oid: Oid) -> bool {
            false
        }
    }

    #[test]
    fn water_marks_follow_spec_fractions() {
        let pager = Pager::new(1600);
        assert_eq!(pager.low_water(), 200);
        assert_eq!(pager.high_water(), 300);
    }

    #[test]
    fn reclaim_from_moves_clean_frames_to_available_and_updates_counters() {
        let mut activities = ActivityTable::new();
        let root = activities.root;
        activities.get_mut(root).unwrap().push_inactive_front(0, 10);
        activities.get_mut(root).unwrap().push_inactive_front(0, 11);
        activities.charge(root, 2).unwrap();

        let mut pager = Pager::new(1600);
        let reclaimed = pager.reclaim_from(&mut activities, &NoPressure, root, 2).unwrap();
        assert_eq!(reclaimed.len(), 2);
        assert_eq!(pager.available.len(), 2);
        assert_eq!(activities.get(root).unwrap().frames_total, 0);
    }

    #[test]
    fn collect_grants_self_paging_when_waiter_present() {
        struct AlwaysPressure {
            delivered: Vec<(ActivityId, u32)>,
        }
        impl PressureChannel for AlwaysPressure {
            fn has_pressure_waiter(&self, _activity: ActivityId) -> bool {
                true
            }
            fn deliver_pressure(&mut self, activity: ActivityId, goal: u32) {
                self.delivered.push((activity, goal));
            }
        }
        impl DirtyOracle for AlwaysPressure {
            fn is_dirty_sticky(&self, _oid: Oid) -> bool {
                false
            }
        }

        let mut activities = ActivityTable::new();
        let root = activities.root;
        activities.get_mut(root).unwrap().frames_total = 100;
        let mut pager = Pager::new(1600);
        let mut channel = AlwaysPressure { delivered: Vec::new() };
        let reclaimed = pager.collect(&mut activities, &mut channel, 100).unwrap();
        assert!(reclaimed.is_empty());
        assert_eq!(channel.delivered.len(), 1);
        assert!(activities.get(root).unwrap().free_goal.is_some());
    }

    #[test]
    fn select_victim_prefers_higher_sibling_priority() {
        let mut activities = ActivityTable::new();
        let root = activities.root;
        let low = activities
            .create(root, ActivityPolicy { sibling_rel: crate::activity::Relation { priority: 0, weight: 1 }, ..Default::default() })
            .unwrap();
        let high = activities
            .create(root, ActivityPolicy { sibling_rel: crate::activity::Relation { priority: 5, weight: 1 }, ..Default::default() })
            .unwrap();
        activities.get_mut(low).unwrap().frames_total = 50;
        activities.get_mut(high).unwrap().frames_total = 50;
        let winner = select_victim(&activities, root, 10).unwrap();
        assert_eq!(winner, high);
    }
}
