//! Folios: the only unit of persistent storage (spec §3, §4.3).
//!
//! A folio is a fixed-size container of [`FOLIO_OBJECTS`] slots plus
//! per-slot metadata; every other object is carved from one. Grounded on
//! the teacher's `mach_vm::memory_object` lifecycle bookkeeping, reworked
//! from a Mach memory-object-to-pager binding into a flat slot table, per
//! spec §3's folio layout.

use crate::store::object::ObjectType;
use crate::types::{ActivityId, Oid, Policy, Version, FOLIO_OBJECTS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolioError {
    QuotaExceeded,
    OutOfMemory,
    BadIndex,
}

pub type FolioResult<T> = Result<T, FolioError>;

/// Per-slot metadata kept in the folio itself (spec §3), independent of
/// whether the slot's object is currently resident.
#[derive(Debug, Clone, Copy)]
pub struct FolioSlot {
    pub ty: ObjectType,
    pub version: Version,
    pub content: bool,
    pub discarded: bool,
    pub referenced: bool,
    pub dirty: bool,
    pub policy: Policy,
    /// OID of the wait queue head for this slot, if anything is enqueued.
    pub wait_queue_head: Option<Oid>,
}

impl Default for FolioSlot {
    fn default() -> Self {
        Self {
            ty: ObjectType::Void,
            version: 0,
            content: false,
            discarded: false,
            referenced: false,
            dirty: false,
            policy: Policy::DEFAULT,
            wait_queue_head: None,
        }
    }
}

/// A folio: 128 object slots plus the folio's own policy and its sibling
/// linkage within the owning activity's folio list (spec §3, §4.4).
pub struct Folio {
    pub index: u64,
    pub version: Version,
    pub owner: ActivityId,
    pub policy: Policy,
    pub slots: [FolioSlot; FOLIO_OBJECTS],
    pub prev_sibling: Option<u64>,
    pub next_sibling: Option<u64>,
}

impl Folio {
    pub fn new(index: u64, owner: ActivityId) -> Self {
        Self {
            index,
            version: 0,
            owner,
            policy: Policy::DEFAULT,
            slots: [FolioSlot::default(); FOLIO_OBJECTS],
            prev_sibling: None,
            next_sibling: None,
        }
    }

    pub fn slot(&self, idx: i32) -> FolioResult<&FolioSlot> {
        self.slots.get(idx as usize).ok_or(FolioError::BadIndex)
    }

    pub fn slot_mut(&mut self, idx: i32) -> FolioResult<&mut FolioSlot> {
        self.slots.get_mut(idx as usize).ok_or(FolioError::BadIndex)
    }

    pub fn oid_of(&self, slot: i32) -> Oid {
        crate::types::oid_of(self.index, slot)
    }

    /// Free the folio: every contained object's version is bumped, so any
    /// outstanding capability to the old contents is invalidated (spec §3
    /// "Freeing bumps the folio's own version and frees all 128 contained
    /// objects (version bumps cascade)").
    pub fn free_all(&mut self) {
        self.version = self.version.wrapping_add(1);
        for slot in self.slots.iter_mut() {
            if slot.ty != ObjectType::Void {
                slot.version = slot.version.wrapping_add(1);
            }
            *slot = FolioSlot {
                version: slot.version,
                ..FolioSlot::default()
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_all_bumps_every_occupied_slot_version() {
        let mut folio = Folio::new(0, ActivityId(0));
        folio.slots[3].ty = ObjectType::Page;
        folio.slots[3].version = 5;
        folio.free_all();
        assert_eq!(folio.slots[3].version, 6);
        assert_eq!(folio.slots[3].ty, ObjectType::Void);
    }

    #[test]
    fn oid_of_matches_folio_index() {
        let folio = Folio::new(7, ActivityId(0));
        let (idx, slot) = crate::types::split_oid(folio.oid_of(3));
        assert_eq!(idx, 7);
        assert_eq!(slot, 3);
    }
}
