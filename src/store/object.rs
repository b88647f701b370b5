//! Resident object descriptors (spec §3 "Object descriptor").
//!
//! A descriptor is the in-memory, never-persisted record of a live object:
//! its identity, the activity that owns it, its policy, and the linkage
//! that places it on exactly one LRU/eviction/laundry list at a time.
//! Grounded on the teacher's `mach_vm::vm_object::VmObject` shape, reworked
//! from a Mach VM object (backed by a `BTreeMap` of pages) to a single
//! page-sized slot per object, per spec §3.

use crate::types::{ActivityId, Oid, Policy, Version};

/// The reserved object variants (spec §3 "Object variants"). Every slot is
/// exactly one of these at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Void,
    Page,
    Cappage,
    Folio,
    Thread,
    Activity,
    Messenger,
}

/// Which list a descriptor currently sits on (spec §8 invariant 1: "on no
/// other list"). Kept as an explicit enum rather than four linkage fields
/// so that membership is structurally exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMembership {
    /// On `activity`'s active or inactive list at the given priority.
    ActivityLru { activity: ActivityId, priority: i8, active: bool },
    /// On the global clean-eviction list (and the owning activity's
    /// `eviction_clean` list).
    EvictionClean,
    /// On the global laundry list (and the owning activity's
    /// `eviction_dirty` list).
    Laundry,
    /// Not yet placed; freshly allocated or mid-teardown.
    Pending,
}

bitflags::bitflags! {
    /// Descriptor status flags (spec §3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectFlags: u16 {
        const LIVE               = 1 << 0;
        const DIRTY              = 1 << 1;
        const REFERENCED         = 1 << 2;
        const USER_DIRTY         = 1 << 3;
        const USER_REFERENCED    = 1 << 4;
        const EVICTION_CANDIDATE = 1 << 5;
        const FLOATING           = 1 << 6;
        const SHARED             = 1 << 7;
        const MAPPED             = 1 << 8;
    }
}

/// Resident per-object descriptor (spec §3).
#[derive(Debug, Clone)]
pub struct ObjectDescriptor {
    pub ty: ObjectType,
    pub oid: Oid,
    pub version: Version,
    pub owner: Option<ActivityId>,
    pub policy: Policy,
    /// Two-bit age counter: bumped to 3 on access, decayed by the pager sweep.
    pub age: u8,
    pub flags: ObjectFlags,
    pub membership: ListMembership,
}

impl ObjectDescriptor {
    pub const MAX_AGE: u8 = 3;

    pub fn new(ty: ObjectType, oid: Oid, version: Version) -> Self {
        Self {
            ty,
            oid,
            version,
            owner: None,
            policy: Policy::DEFAULT,
            age: Self::MAX_AGE,
            flags: ObjectFlags::LIVE,
            membership: ListMembership::Pending,
        }
    }

    pub fn touch(&mut self) {
        self.age = Self::MAX_AGE;
        self.flags |= ObjectFlags::REFERENCED;
    }

    /// Decay one step; returns `true` if the descriptor should drop to the
    /// inactive list (age reached zero).
    pub fn decay(&mut self) -> bool {
        if self.flags.contains(ObjectFlags::REFERENCED) && self.flags.contains(ObjectFlags::MAPPED) {
            self.age = Self::MAX_AGE;
            self.flags.remove(ObjectFlags::REFERENCED);
            false
        } else if self.age > 0 {
            self.age -= 1;
            self.age == 0
        } else {
            true
        }
    }

    pub fn is_discardable(&self) -> bool {
        self.policy.discardable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_descriptor_ages_out_after_max_age_steps() {
        let mut d = ObjectDescriptor::new(ObjectType::Page, 0, 1);
        d.flags.remove(ObjectFlags::REFERENCED);
        let mut dropped = false;
        for _ in 0..ObjectDescriptor::MAX_AGE as u32 + 1 {
            dropped = d.decay();
            if dropped {
                break;
            }
        }
        assert!(dropped);
    }

    #[test]
    fn touch_resets_age_and_marks_referenced() {
        let mut d = ObjectDescriptor::new(ObjectType::Page, 0, 1);
        d.age = 0;
        d.touch();
        assert_eq!(d.age, ObjectDescriptor::MAX_AGE);
        assert!(d.flags.contains(ObjectFlags::REFERENCED));
    }
}
