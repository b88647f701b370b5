//! Object store: OID→frame hash, frame table, and folio table (spec §4.2).
//!
//! This is the leaf-most stateful layer above the zone allocator. It
//! answers "what object does this OID currently resolve to" and owns the
//! aging sweep that feeds the pager's eviction lists. Capability
//! resolution, activity accounting, and messenger/thread teardown live in
//! their own modules and are handed descriptors by reference; the store
//! itself never reaches upward into them (spec §9: enclose global state in
//! one owning struct, but keep each subsystem's algorithm in its own
//! module).

pub mod folio;
pub mod frame;
pub mod object;

use crate::types::{ActivityId, Oid, Policy, Version};
use crate::zone::ZoneAllocator;
use folio::{Folio, FolioError, FolioResult};
use frame::{FrameId, FrameTable};
use hashbrown::HashMap;
use object::{ListMembership, ObjectDescriptor, ObjectType};

/// Target load factor for the OID hash (spec §3 [SUPPLEMENT], grounded on
/// `viengoos/object.c`'s comment against the conventional 80% default).
const OID_HASH_LOAD_FACTOR: f64 = 0.30;

pub struct Store {
    oid_index: HashMap<Oid, FrameId>,
    frames: FrameTable,
    folios: HashMap<u64, Folio>,
    next_folio_index: u64,
}

impl Store {
    /// `frame_capacity_hint` is the number of physical frames the zone
    /// allocator donated at boot; the OID hash is pre-sized to keep chains
    /// short under [`OID_HASH_LOAD_FACTOR`].
    pub fn new(frame_capacity_hint: usize) -> Self {
        let hash_capacity = ((frame_capacity_hint as f64) / OID_HASH_LOAD_FACTOR) as usize;
        Self {
            oid_index: HashMap::with_capacity(hash_capacity),
            frames: FrameTable::new(),
            folios: HashMap::new(),
            next_folio_index: 0,
        }
    }

    pub fn folio(&self, index: u64) -> Option<&Folio> {
        self.folios.get(&index)
    }

    pub fn folio_mut(&mut self, index: u64) -> Option<&mut Folio> {
        self.folios.get_mut(&index)
    }

    /// Allocate a fresh folio index and record it in the table, charged to
    /// `owner`. Quota enforcement up the ancestor chain is the caller's
    /// responsibility (spec §4.3: it spans the activity tree, which this
    /// module does not own).
    pub fn allocate_folio(&mut self, owner: ActivityId) -> u64 {
        let index = self.next_folio_index;
        self.next_folio_index += 1;
        self.folios.insert(index, Folio::new(index, owner));
        index
    }

    /// Free a folio: bump every contained slot's version (invalidating
    /// outstanding capabilities, spec §8 invariant 3) and destroy every
    /// resident object it held.
    pub fn free_folio(&mut self, index: u64) -> FolioResult<()> {
        let folio = self.folios.get_mut(&index).ok_or(FolioError::BadIndex)?;
        folio.free_all();
        let header_oid = crate::types::oid_of(index, -1);
        for slot in -1i32..(crate::types::FOLIO_OBJECTS as i32) {
            let oid = if slot == -1 { header_oid } else { crate::types::oid_of(index, slot) };
            self.destroy(oid);
        }
        Ok(())
    }

    /// Look up an object, allocating a resident frame on cache miss (spec
    /// §4.2 `object_find`). Returns `Ok(None)` for a discarded object (the
    /// caller must explicitly clear the discarded bit via
    /// [`Store::clear_discarded`]); `Err` only if frame allocation failed
    /// even via the fallback chain.
    pub fn object_find(
        &mut self,
        zone: &ZoneAllocator,
        activity: ActivityId,
        oid: Oid,
        policy: Policy,
    ) -> FolioResult<Option<FrameId>> {
        if let Some(&id) = self.oid_index.get(&oid) {
            let frame = self.frames.get_mut(id).expect("hash entry without frame");
            if frame.descriptor.owner.is_none() {
                frame.descriptor.owner = Some(activity);
                frame.descriptor.policy = policy;
            }
            frame.descriptor.touch();
            return Ok(Some(id));
        }

        let (folio_index, slot) = crate::types::split_oid(oid);
        let folio = self.folios.get(&folio_index).ok_or(FolioError::BadIndex)?;
        let slot_meta = *folio.slot(slot)?;
        if slot_meta.ty == ObjectType::Void {
            return Err(FolioError::BadIndex);
        }
        if slot_meta.discarded {
            return Ok(None);
        }

        let id = self.allocate_frame(zone, slot_meta.ty, oid, slot_meta.version)?;
        let frame = self.frames.get_mut(id).expect("just inserted");
        frame.descriptor.owner = Some(activity);
        frame.descriptor.policy = policy;
        self.oid_index.insert(oid, id);
        Ok(Some(id))
    }

    /// Like [`Store::object_find`] but never allocates; `None` on miss.
    pub fn object_find_soft(&self, oid: Oid) -> Option<&ObjectDescriptor> {
        self.oid_index.get(&oid).and_then(|&id| self.frames.get(id)).map(|f| &f.descriptor)
    }

    pub fn object_find_soft_mut(&mut self, oid: Oid) -> Option<&mut ObjectDescriptor> {
        if let Some(&id) = self.oid_index.get(&oid) {
            self.frames.get_mut(id).map(|f| &mut f.descriptor)
        } else {
            None
        }
    }

    pub fn clear_discarded(&mut self, oid: Oid) -> FolioResult<()> {
        let (folio_index, slot) = crate::types::split_oid(oid);
        let folio = self.folios.get_mut(&folio_index).ok_or(FolioError::BadIndex)?;
        folio.slot_mut(slot)?.discarded = false;
        Ok(())
    }

    /// Reserve a fresh frame for `oid`, trying the zone allocator first and
    /// falling back to nothing here — the eviction fallback (drain the
    /// `available` list, then invoke the pager) is orchestrated by the
    /// server loop, which has access to both the pager and this store
    /// (spec §4.2 "Frame allocation").
    fn allocate_frame(&mut self, zone: &ZoneAllocator, ty: ObjectType, oid: Oid, version: Version) -> FolioResult<FrameId> {
        if zone.alloc_pages(1).is_none() {
            return Err(FolioError::OutOfMemory);
        }
        let descriptor = ObjectDescriptor::new(ty, oid, version);
        Ok(self.frames.insert(descriptor))
    }

    /// Directly insert a resident frame for `oid` without going through the
    /// zone (used once the server's eviction fallback has freed a frame it
    /// hands in).
    pub fn install_frame(&mut self, oid: Oid, descriptor: ObjectDescriptor) -> FrameId {
        let id = self.frames.insert(descriptor);
        self.oid_index.insert(oid, id);
        id
    }

    pub fn descriptor(&self, oid: Oid) -> Option<&ObjectDescriptor> {
        self.object_find_soft(oid)
    }

    pub fn descriptor_mut(&mut self, oid: Oid) -> Option<&mut ObjectDescriptor> {
        self.object_find_soft_mut(oid)
    }

    pub fn frame(&self, id: FrameId) -> Option<&frame::Frame> {
        self.frames.get(id)
    }

    pub fn frame_mut(&mut self, id: FrameId) -> Option<&mut frame::Frame> {
        self.frames.get_mut(id)
    }

    pub fn frame_id_of(&self, oid: Oid) -> Option<FrameId> {
        self.oid_index.get(&oid).copied()
    }

    /// Destroy a resident object (spec §4.2 `memory_object_destroy`):
    /// unlink it from the OID hash and mark it dead, without freeing its
    /// frame. Returns the descriptor so the caller can dispatch
    /// type-specific teardown (activity/thread/messenger) and return the
    /// frame to the zone allocator.
    pub fn destroy(&mut self, oid: Oid) -> Option<ObjectDescriptor> {
        let id = self.oid_index.remove(&oid)?;
        let mut frame = self.frames.remove(id)?;
        frame.descriptor.flags.remove(object::ObjectFlags::LIVE);
        frame.descriptor.membership = ListMembership::Pending;
        Some(frame.descriptor)
    }

    /// Aging sweep (spec §4.2 "Status bits and aging"): decay every
    /// resident descriptor's age, returning the OIDs that dropped to zero
    /// (and so must move to their activity's inactive list — the caller
    /// owns activity list manipulation).
    pub fn age_sweep(&mut self) -> alloc::vec::Vec<Oid> {
        let mut demoted = alloc::vec::Vec::new();
        for (&oid, &id) in self.oid_index.iter() {
            if let Some(frame) = self.frames.get_mut(id) {
                if frame.descriptor.decay() {
                    demoted.push(oid);
                }
            }
        }
        demoted
    }

    pub fn resident_count(&self) -> usize {
        self.frames.resident_count()
    }
}
