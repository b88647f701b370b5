//! The single-threaded server dispatch loop (spec §4.7 method table, §5).
//!
//! `Manager` is the one owning struct spec §9 calls for ("Enclose [global
//! mutable state] in a single owning struct; accessors borrow it mutably
//! for the duration of one dispatch"). Grounded on the teacher's
//! `kern::sched_prim` run-loop shape and `servers::pager_server` request
//! handling, reworked from a multi-port dispatch table into one global
//! lock guarding every subsystem table this crate defines.

use crate::activation::{self, ActivationHandler, ThreadRegisters, Utcb};
use crate::activity::{ActivityId, ActivityPolicy, ActivityTable};
use crate::boot::{MemoryMap, ReservationTree};
use crate::cap::translate::Container;
use crate::cap::{CapError, CapResult, CapType, Capability, CopyFlags};
use crate::error::{RmError, RmResult};
use crate::futex::{FutexError, PageAccess, WakeOp};
use crate::ipc::RpcLabel;
use crate::messenger::{Messenger, MessengerTable};
use crate::pager::{DirtyOracle, Pager, PressureChannel, ReclaimDisposition, ReclaimedFrame};
use crate::store::object::{ListMembership, ObjectFlags, ObjectType};
use crate::store::Store;
use crate::types::{split_oid, MessengerId, Oid, Policy, ThreadId, Version, CAPPAGE_SLOTS};
use crate::zone::ZoneAllocator;
use alloc::vec::Vec;
use hashbrown::HashMap;
use spin::Mutex;

/// Map an object store variant onto its capability type tag (used when a
/// folio slot is synthesized into a capability by the translation walk).
fn cap_type_for(ty: ObjectType) -> CapType {
    match ty {
        ObjectType::Void => CapType::Void,
        ObjectType::Page => CapType::Page,
        ObjectType::Cappage => CapType::Cappage,
        ObjectType::Folio => CapType::Folio,
        ObjectType::Thread => CapType::Thread,
        ObjectType::Activity => CapType::ActivityControl,
        ObjectType::Messenger => CapType::Messenger,
    }
}

/// A thread's three well-known address-translation slots (spec §4.3
/// "A thread contributes three well-known slots") plus the remaining
/// spec §3 thread-descriptor fields that aren't part of the translation
/// walk: exception-messenger cap, bound kernel-thread id, commissioned
/// bit, display name.
#[derive(Debug, Clone)]
pub struct ThreadSlots {
    pub aspace_root: Capability,
    pub activity: Capability,
    pub utcb_cap: Capability,
    pub exception_messenger: Capability,
    pub utcb: Utcb,
    /// Set on first `thread_start` (spec §3 "commissioned lazily on first
    /// start"); cleared (along with `kernel_thread_id`) on decommission.
    pub commissioned: bool,
    pub kernel_thread_id: Option<u64>,
    pub display_name: heapless::String<{ crate::types::THREAD_NAME_MAX }>,
}

impl Default for ThreadSlots {
    fn default() -> Self {
        Self {
            aspace_root: Capability::VOID,
            activity: Capability::VOID,
            utcb_cap: Capability::VOID,
            exception_messenger: Capability::VOID,
            utcb: Utcb::new(),
            commissioned: false,
            kernel_thread_id: None,
            display_name: heapless::String::new(),
        }
    }
}

/// `object_status` reply shape (spec §4.7 method table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStatus {
    pub live: bool,
    pub dirty: bool,
    pub referenced: bool,
    pub age: u8,
}

/// `activity_info` reply shape (spec §4.4, §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityInfo {
    pub frames_local: i64,
    pub frames_total: i64,
    pub frames_pending_eviction: i64,
    pub frames_excluded: i64,
    pub folio_count: u32,
}

/// Borrows only the store out of a `Manager`, so futex page access and
/// messenger wait-queue manipulation can happen in the same call without
/// the borrow checker seeing a conflict on two disjoint fields reached
/// through one function parameter.
struct StoreAccess<'a>(&'a mut Store);

impl PageAccess for StoreAccess<'_> {
    fn read_u32(&self, oid: Oid, offset: u32) -> Result<u32, FutexError> {
        let id = self.0.frame_id_of(oid).ok_or(FutexError::NotFound)?;
        let frame = self.0.frame(id).ok_or(FutexError::NotFound)?;
        let offset = offset as usize;
        if offset + 4 > frame.data.len() {
            return Err(FutexError::Inval);
        }
        Ok(u32::from_le_bytes(frame.data[offset..offset + 4].try_into().unwrap()))
    }

    fn write_u32(&mut self, oid: Oid, offset: u32, value: u32) -> Result<(), FutexError> {
        let id = self.0.frame_id_of(oid).ok_or(FutexError::NotFound)?;
        let frame = self.0.frame_mut(id).ok_or(FutexError::NotFound)?;
        let offset = offset as usize;
        if offset + 4 > frame.data.len() {
            return Err(FutexError::Inval);
        }
        frame.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

/// Everything the manager owns, under one lock (spec §5, §9).
pub struct Manager {
    pub zone: ZoneAllocator,
    pub store: Store,
    pub activities: ActivityTable,
    pub messengers: MessengerTable,
    pub pager: Pager,
    pub reservations: ReservationTree,
    cappages: HashMap<Oid, alloc::boxed::Box<[Capability; CAPPAGE_SLOTS]>>,
    threads: HashMap<ThreadId, ThreadSlots>,
    alloc_count: u64,
    /// Replies owed to messengers the dispatch loop already unblocked
    /// internally (teardown waiters, pressure subscribers) but hasn't
    /// handed back to the transport yet. Mirrors `futex_wake`'s returned
    /// `Vec<MessengerId>`: this module only ever decides *who* gets
    /// replied to and with *what* word; the transport still owns the wire
    /// send (spec §1 Non-goals).
    pending_replies: Vec<(MessengerId, u32)>,
}

impl Manager {
    pub fn new(zone: ZoneAllocator) -> Self {
        let total_pages = zone.total_pages().max(1);
        Self {
            store: Store::new(total_pages as usize),
            activities: ActivityTable::new(),
            messengers: MessengerTable::new(),
            pager: Pager::new(total_pages),
            reservations: ReservationTree::new(),
            cappages: HashMap::new(),
            threads: HashMap::new(),
            alloc_count: 0,
            pending_replies: Vec::new(),
            zone,
        }
    }

    /// Drain the replies accumulated by teardown waiter wakeups and pressure
    /// notifications since the last drain, for the transport to deliver.
    pub fn drain_pending_replies(&mut self) -> Vec<(MessengerId, u32)> {
        core::mem::take(&mut self.pending_replies)
    }

    pub fn from_memory_map(map: &MemoryMap) -> Self {
        Self::new(ZoneAllocator::from_memory_map(map))
    }

    /// `folio_alloc`: enforce the per-activity quota up the ancestor chain
    /// atomically (spec §4.3).
    pub fn folio_alloc(&mut self, owner: ActivityId) -> RmResult<u64> {
        let mut cursor = Some(owner);
        while let Some(current) = cursor {
            let act = self.activities.get(current).map_err(RmError::from)?;
            if act.folio_count >= act.policy.folios_quota && act.policy.folios_quota > 0 {
                return Err(RmError::NoMem);
            }
            cursor = act.parent;
        }
        let mut cursor = Some(owner);
        while let Some(current) = cursor {
            let act = self.activities.get_mut(current).map_err(RmError::from)?;
            act.folio_count += 1;
            cursor = act.parent;
        }
        let index = self.store.allocate_folio(owner);
        self.activities.get_mut(owner).map_err(RmError::from)?.folios.push(index);
        Ok(index)
    }

    pub fn folio_free(&mut self, owner: ActivityId, index: u64) -> RmResult<()> {
        self.store.free_folio(index).map_err(RmError::from)?;
        let mut cursor = Some(owner);
        while let Some(current) = cursor {
            let act = self.activities.get_mut(current).map_err(RmError::from)?;
            act.folio_count = act.folio_count.saturating_sub(1);
            cursor = act.parent;
        }
        self.activities.get_mut(owner).map_err(RmError::from)?.folios.retain(|&f| f != index);
        Ok(())
    }

    /// `folio_object_alloc(folio, idx, type, policy, return_code)` (spec
    /// §4.3).
    pub fn folio_object_alloc(
        &mut self,
        owner: ActivityId,
        folio_index: u64,
        slot_index: i32,
        ty: ObjectType,
        policy: Policy,
        return_code: u32,
    ) -> RmResult<()> {
        let oid = crate::types::oid_of(folio_index, slot_index);
        let old_ty = self
            .store
            .folio(folio_index)
            .ok_or(RmError::Inval)?
            .slot(slot_index)
            .map_err(RmError::from)?
            .ty;

        if matches!(old_ty, ObjectType::Activity | ObjectType::Thread | ObjectType::Messenger) {
            self.teardown(oid, old_ty, return_code);
        }

        self.store.destroy(oid);

        let folio = self.store.folio_mut(folio_index).ok_or(RmError::Inval)?;
        let slot = folio.slot_mut(slot_index).map_err(RmError::from)?;
        if slot.ty != ObjectType::Void {
            slot.version = slot.version.wrapping_add(1);
        }
        slot.ty = ty;
        slot.policy = policy;
        slot.content = false;
        slot.discarded = false;
        slot.dirty = false;
        let version = slot.version;

        match ty {
            ObjectType::Cappage => {
                self.cappages.insert(oid, alloc::boxed::Box::new([Capability::VOID; CAPPAGE_SLOTS]));
            }
            ObjectType::Thread => {
                self.threads.insert(ThreadId(oid), ThreadSlots::default());
            }
            ObjectType::Messenger => {
                self.messengers.insert(MessengerId(oid), Messenger::new());
            }
            _ => {}
        }

        let descriptor = crate::store::object::ObjectDescriptor::new(ty, oid, version);
        self.store.install_frame(oid, descriptor);
        self.activities
            .get_mut(owner)
            .map_err(RmError::from)?
            .push_active(policy.priority, oid);
        Ok(())
    }

    fn teardown(&mut self, oid: Oid, ty: ObjectType, return_code: u32) {
        match ty {
            ObjectType::Messenger => {
                self.messengers.destroy(MessengerId(oid));
            }
            ObjectType::Thread => {
                self.thread_decommission(ThreadId(oid));
                self.threads.remove(&ThreadId(oid));
            }
            ObjectType::Activity => {
                let _ = self.activities.destroy(ActivityId(oid));
            }
            _ => {}
        }
        // Deliver `return_code` to WAIT_DESTROY waiters, EFAULT to everyone
        // else (spec §4.3, §7).
        while let Some(waiter) = self.messengers.queue(oid).pop_front() {
            let code = match waiter.reason {
                crate::messenger::WaitReason::Destroy => return_code,
                _ => RmError::Fault.as_errno(),
            };
            self.pending_replies.push((waiter.messenger, code));
        }
    }

    pub fn cap_copy(
        &mut self,
        root: Capability,
        src_address: u64,
        dst_address: u64,
        flags: crate::cap::CopyFlags,
        properties: Capability,
    ) -> RmResult<()> {
        let src = crate::cap::translate::as_lookup(self, root, src_address, crate::cap::translate::ReturnMode::WantCap)
            .map_err(RmError::from)?;
        crate::cap::translate::as_mutate(self, root, dst_address, |dst| crate::cap::cap_copy(src, dst, flags, properties))
            .map_err(RmError::from)
    }

    pub fn cap_rubout(&mut self, root: Capability, address: u64) -> RmResult<()> {
        crate::cap::translate::as_mutate(self, root, address, |_| crate::cap::cap_rubout()).map_err(RmError::from)
    }

    pub fn as_dump(&self, root: Capability) -> Vec<crate::cap::translate::AsDumpEntry> {
        crate::cap::translate::as_dump(self, root)
    }

    /// `object_discard` (spec §4.7 method table): client-requested discard,
    /// as opposed to the pager's own discard-on-reclaim (spec §4.5).
    pub fn object_discard(&mut self, oid: Oid) -> RmResult<()> {
        let (folio_index, slot) = split_oid(oid);
        let folio = self.store.folio_mut(folio_index).ok_or(RmError::Inval)?;
        folio.slot_mut(slot).map_err(RmError::from)?.discarded = true;
        self.store.destroy(oid);
        Ok(())
    }

    pub fn object_clear_discarded(&mut self, oid: Oid) -> RmResult<()> {
        self.store.clear_discarded(oid).map_err(RmError::from)
    }

    /// `object_status`: a snapshot of the descriptor's aging/dirty state.
    pub fn object_status(&self, oid: Oid) -> RmResult<ObjectStatus> {
        let d = self.store.descriptor(oid).ok_or(RmError::NoEnt)?;
        Ok(ObjectStatus {
            live: d.flags.contains(ObjectFlags::LIVE),
            dirty: d.flags.contains(ObjectFlags::DIRTY),
            referenced: d.flags.contains(ObjectFlags::REFERENCED),
            age: d.age,
        })
    }

    /// `folio_policy`/`object_policy` (the spec §4.7 table lists both
    /// `folio alloc/free/object_alloc/policy` as one family): update a
    /// slot's policy in the folio and, if resident, its live descriptor.
    pub fn object_policy_update(&mut self, oid: Oid, policy: Policy) -> RmResult<()> {
        let (folio_index, slot) = split_oid(oid);
        let folio = self.store.folio_mut(folio_index).ok_or(RmError::Inval)?;
        folio.slot_mut(slot).map_err(RmError::from)?.policy = policy;
        if let Some(descriptor) = self.store.descriptor_mut(oid) {
            descriptor.policy = policy;
        }
        Ok(())
    }

    pub fn activity_create(&mut self, parent: ActivityId, policy: ActivityPolicy) -> RmResult<ActivityId> {
        self.activities.create(parent, policy).map_err(RmError::from)
    }

    pub fn activity_policy_update(&mut self, id: ActivityId, policy: ActivityPolicy) -> RmResult<()> {
        self.activities.policy_update(id, policy).map_err(RmError::from)
    }

    pub fn activity_info(&self, id: ActivityId) -> RmResult<ActivityInfo> {
        let act = self.activities.get(id).map_err(RmError::from)?;
        Ok(ActivityInfo {
            frames_local: act.frames_local,
            frames_total: act.frames_total,
            frames_pending_eviction: act.frames_pending_eviction,
            frames_excluded: act.frames_excluded,
            folio_count: act.folio_count,
        })
    }

    pub fn futex_wait(&mut self, oid: Oid, offset: u32, caller: MessengerId) {
        crate::futex::wait(&mut self.messengers, oid, offset, caller);
    }

    pub fn futex_wake(&mut self, oid: Oid, offset: u32, n: usize) -> Vec<MessengerId> {
        crate::futex::wake(&mut self.messengers, oid, offset, n)
    }

    pub fn futex_cmp_requeue(
        &mut self,
        oid1: Oid,
        off1: u32,
        wake_n: usize,
        requeue_n: usize,
        oid2: Oid,
        off2: u32,
        expected: u32,
    ) -> Result<(Vec<MessengerId>, usize), FutexError> {
        let access = StoreAccess(&mut self.store);
        crate::futex::cmp_requeue(&access, &mut self.messengers, oid1, off1, wake_n, requeue_n, oid2, off2, expected)
    }

    pub fn futex_wake_op(
        &mut self,
        oid1: Oid,
        off1: u32,
        wake1: usize,
        wake2: usize,
        oid2: Oid,
        off2: u32,
        op: WakeOp,
    ) -> Result<Vec<MessengerId>, FutexError> {
        let mut access = StoreAccess(&mut self.store);
        crate::futex::wake_op(&mut access, &mut self.messengers, oid1, off1, wake1, wake2, oid2, off2, op)
    }

    /// `thread_exregs`: read the thread's saved registers, optionally
    /// overwriting them (register access itself is the external kernel's
    /// job; this only maintains the UTCB-resident copy spec §4.7 models).
    pub fn thread_exregs(&mut self, thread: ThreadId, new: Option<ThreadRegisters>) -> ThreadRegisters {
        let slots = self.threads.entry(thread).or_default();
        let previous = slots.utcb.saved;
        if let Some(regs) = new {
            slots.utcb.saved = regs;
        }
        previous
    }

    pub fn thread_register_activation_handler(&mut self, thread: ThreadId, handler: ActivationHandler) {
        self.threads.entry(thread).or_default().utcb.handler = handler;
    }

    /// `thread_start`: commission the thread (bind a kernel thread id,
    /// create its kernel address space, map its UTCB) on first use (spec
    /// §3 "commissioned lazily on first start"). A no-op if already
    /// commissioned. The actual kernel-thread-id allocation/aspace/UTCB
    /// mapping is the external kernel's job (spec §1 Non-goals); this only
    /// tracks the bookkeeping bit and the id the kernel handed back.
    pub fn thread_start(&mut self, thread: ThreadId, kernel_thread_id: u64) -> RmResult<()> {
        if !self.threads.contains_key(&thread) {
            return Err(RmError::NoEnt);
        }
        let slots = self.threads.entry(thread).or_default();
        slots.commissioned = true;
        slots.kernel_thread_id = Some(kernel_thread_id);
        Ok(())
    }

    /// Reverse of [`Manager::thread_start`], run as part of [`Manager::teardown`]
    /// when a thread's slot is destroyed (spec §3 "decommissioned on
    /// destruction").
    fn thread_decommission(&mut self, thread: ThreadId) {
        if let Some(slots) = self.threads.get_mut(&thread) {
            slots.commissioned = false;
            slots.kernel_thread_id = None;
        }
    }

    /// `object_name` (spec §4.7 method table "object ... name"): read or
    /// set a thread's display name.
    pub fn object_name(&self, thread: ThreadId) -> RmResult<heapless::String<{ crate::types::THREAD_NAME_MAX }>> {
        Ok(self.threads.get(&thread).ok_or(RmError::NoEnt)?.display_name.clone())
    }

    pub fn object_set_name(&mut self, thread: ThreadId, name: &str) -> RmResult<()> {
        let slots = self.threads.get_mut(&thread).ok_or(RmError::NoEnt)?;
        slots.display_name.clear();
        slots.display_name.push_str(name).map_err(|_| RmError::Inval)
    }

    /// `object_reply_on_destruction` (spec §4.7 method table): register
    /// `caller` to be woken with the object's configured destruction return
    /// code when `oid`'s slot is next overwritten or freed (spec §3
    /// "explicitly freed", §7 "A destroyed object pre-empts any pending
    /// wait ... with ... the object's configured destruction return code").
    pub fn object_reply_on_destruction(&mut self, oid: Oid, caller: MessengerId) -> RmResult<()> {
        if self.store.descriptor(oid).is_none() {
            return Err(RmError::NoEnt);
        }
        self.messengers
            .queue(oid)
            .push_back(crate::messenger::Waiter { messenger: caller, reason: crate::messenger::WaitReason::Destroy });
        Ok(())
    }

    /// `fault` (spec §4.7 "fault (bulk pre-fault)"): resolve up to
    /// [`crate::types::FAULT_PREFETCH_CEILING`] addresses against `root` in
    /// one call, granting access where possible and reporting the rest as
    /// fault messages for the caller to deliver (spec §7: "Page fault ...
    /// propagated as a message, not an errno").
    pub fn fault_bulk(
        &mut self,
        thread: ThreadId,
        root: Capability,
        addresses: &[u64],
        write_access: bool,
    ) -> RmResult<alloc::vec::Vec<activation::FaultOutcome>> {
        if addresses.len() > crate::types::FAULT_PREFETCH_CEILING {
            return Err(RmError::Inval);
        }
        Ok(addresses
            .iter()
            .map(|&address| activation::resolve_fault(self, thread, root, address, write_access))
            .collect())
    }

    /// `console_write`/`console_read` (spec §4.7 method table): relay
    /// bytes to/from the installed console driver. Reading is always
    /// empty — the console is an output-only diagnostic device per spec §6
    /// ("Used only for panics and debug logging"); no input backend is
    /// modeled.
    pub fn console_write(&self, bytes: &[u8]) {
        for &byte in bytes {
            crate::console::print(format_args!("{}", byte as char));
        }
    }

    pub fn console_read(&self, _max_len: usize) -> alloc::vec::Vec<u8> {
        alloc::vec::Vec::new()
    }

    /// `thread_activation_collect`: clear activation state once the upcall
    /// handler has run to completion (spec §4.7).
    pub fn thread_activation_collect(&mut self, thread: ThreadId) -> bool {
        activation::collect(&mut self.threads.entry(thread).or_default().utcb)
    }

    pub fn messenger_user_id(&self, messenger: MessengerId) -> RmResult<u64> {
        Ok(self.messengers.get(messenger).map_err(RmError::from)?.user_id)
    }

    /// Advance the allocation counter and run the pager's quiescent-point
    /// check (spec §4.5 `pager_query`, §5 "Suspension points").
    pub fn quiesce(&mut self) {
        self.alloc_count += 1;
        let alloc_count = self.alloc_count;
        // Swap both the activity tree and the pager out to local bindings so
        // `self` (used below only as the `PressureChannel`/`DirtyOracle`,
        // which only touch `self.messengers`/`self.store`) isn't
        // simultaneously borrowed by the `&mut self.pager` /
        // `&mut self.activities` the call also needs.
        let mut activities = core::mem::replace(&mut self.activities, ActivityTable::new());
        let mut pager = core::mem::replace(&mut self.pager, Pager::new(0));
        let reclaimed = pager.query(&mut activities, self, alloc_count).unwrap_or_default();
        self.activities = activities;
        self.pager = pager;
        self.apply_reclaimed(reclaimed);
    }

    /// Fold the pager's eviction decisions back into the store (spec §4.5
    /// "Disposition"): clear the mapped bit, park each frame on the right
    /// membership, and for discardable objects actually vacate the OID so
    /// the next `object_find` regenerates it from scratch (spec §4.2
    /// `clear_discarded`).
    fn apply_reclaimed(&mut self, reclaimed: Vec<ReclaimedFrame>) {
        for frame in reclaimed {
            let discardable = self.store.descriptor(frame.oid).map(|d| d.is_discardable()).unwrap_or(false);
            if let Some(descriptor) = self.store.descriptor_mut(frame.oid) {
                descriptor.flags.insert(ObjectFlags::EVICTION_CANDIDATE);
                descriptor.flags.remove(ObjectFlags::MAPPED);
                descriptor.membership = match frame.disposition {
                    ReclaimDisposition::Laundry => ListMembership::Laundry,
                    ReclaimDisposition::Available => ListMembership::EvictionClean,
                };
            }
            if frame.disposition == ReclaimDisposition::Available && discardable {
                let (folio_index, slot) = split_oid(frame.oid);
                if let Some(folio) = self.store.folio_mut(folio_index) {
                    if let Ok(slot) = folio.slot_mut(slot) {
                        slot.discarded = true;
                    }
                }
                self.store.destroy(frame.oid);
            }
        }
    }

    /// `object_find` with the spec §4.2 "Frame allocation" eviction
    /// fallback: try the zone directly, then reclaim one frame off the
    /// pager's global `available` list and retry, then give up.
    pub fn object_find(&mut self, activity: ActivityId, oid: Oid, policy: Policy) -> RmResult<Option<crate::store::frame::FrameId>> {
        match self.store.object_find(&self.zone, activity, oid, policy) {
            Ok(found) => Ok(found),
            Err(_) => {
                let Some(victim_oid) = self.pager.available.pop() else {
                    return Err(RmError::NoMem);
                };
                self.store.destroy(victim_oid);
                self.store.object_find(&self.zone, activity, oid, policy).map_err(RmError::from)
            }
        }
    }

    pub fn deliver_to_thread(&mut self, thread: ThreadId, current: ThreadRegisters, words: [u64; 2], cap: Capability) -> activation::DeliveryOutcome {
        let slots = self.threads.entry(thread).or_default();
        activation::deliver(&mut slots.utcb, current, words, cap)
    }
}

impl Container for Manager {
    fn cappage_slot(&self, oid: Oid, index: usize) -> CapResult<Capability> {
        Ok(self.cappages.get(&oid).and_then(|p| p.get(index)).copied().unwrap_or(Capability::VOID))
    }

    fn cappage_slot_set(&mut self, oid: Oid, index: usize, cap: Capability) -> CapResult<()> {
        let page = self.cappages.entry(oid).or_insert_with(|| alloc::boxed::Box::new([Capability::VOID; CAPPAGE_SLOTS]));
        *page.get_mut(index).ok_or(CapError::Invalid)? = cap;
        Ok(())
    }

    fn folio_slot(&self, folio_index: u64, index: usize) -> CapResult<Capability> {
        let folio = self.store.folio(folio_index).ok_or(CapError::Invalid)?;
        let slot = folio.slot(index as i32).map_err(|_| CapError::Invalid)?;
        if slot.ty == ObjectType::Void {
            return Ok(Capability::VOID);
        }
        Ok(Capability {
            ty: cap_type_for(slot.ty),
            target: crate::types::oid_of(folio_index, index as i32),
            version: slot.version,
            translator: crate::cap::AddressTranslator::NONE,
            policy: slot.policy,
        })
    }

    fn thread_slot(&self, oid: Oid, index: usize) -> CapResult<Capability> {
        let slots = self.threads.get(&ThreadId(oid)).ok_or(CapError::Invalid)?;
        Ok(match index {
            0 => slots.aspace_root,
            1 => slots.activity,
            2 => slots.utcb_cap,
            _ => Capability::VOID,
        })
    }

    fn messenger_slot(&self, oid: Oid) -> CapResult<Capability> {
        self.messengers.get(MessengerId(oid)).map(|m| m.inline_cap).map_err(|_| CapError::Invalid)
    }

    fn ensure_resident(&mut self, oid: Oid) -> CapResult<()> {
        let root = self.activities.root;
        self.object_find(root, oid, Policy::DEFAULT).map_err(|_| CapError::Invalid)?;
        Ok(())
    }

    fn version_of(&self, oid: Oid) -> CapResult<Version> {
        let (folio_index, slot) = split_oid(oid);
        let folio = self.store.folio(folio_index).ok_or(CapError::Invalid)?;
        if slot == -1 {
            Ok(folio.version)
        } else {
            Ok(folio.slot(slot).map_err(|_| CapError::Invalid)?.version)
        }
    }
}

impl PressureChannel for Manager {
    fn has_pressure_waiter(&self, activity: ActivityId) -> bool {
        self.messengers
            .queue_ref(activity.0)
            .map(|q| q.iter().any(|w| matches!(w.reason, crate::messenger::WaitReason::ActivityInfoPressure)))
            .unwrap_or(false)
    }

    fn deliver_pressure(&mut self, activity: ActivityId, goal: u32) {
        if let Some(waiter) = self
            .messengers
            .queue(activity.0)
            .drain_matching(1, |r| matches!(r, crate::messenger::WaitReason::ActivityInfoPressure))
            .pop()
        {
            self.pending_replies.push((waiter.messenger, goal));
        }
    }
}

impl DirtyOracle for Manager {
    fn is_dirty_sticky(&self, oid: Oid) -> bool {
        self.store
            .descriptor(oid)
            .map(|d| d.flags.contains(ObjectFlags::DIRTY) && !d.is_discardable())
            .unwrap_or(false)
    }
}

impl PageAccess for Manager {
    fn read_u32(&self, oid: Oid, offset: u32) -> Result<u32, crate::futex::FutexError> {
        let id = self.store.frame_id_of(oid).ok_or(crate::futex::FutexError::NotFound)?;
        let frame = self.store.frame(id).ok_or(crate::futex::FutexError::NotFound)?;
        let offset = offset as usize;
        if offset + 4 > frame.data.len() {
            return Err(crate::futex::FutexError::Inval);
        }
        Ok(u32::from_le_bytes(frame.data[offset..offset + 4].try_into().unwrap()))
    }

    fn write_u32(&mut self, oid: Oid, offset: u32, value: u32) -> Result<(), crate::futex::FutexError> {
        let id = self.store.frame_id_of(oid).ok_or(crate::futex::FutexError::NotFound)?;
        let frame = self.store.frame_mut(id).ok_or(crate::futex::FutexError::NotFound)?;
        let offset = offset as usize;
        if offset + 4 > frame.data.len() {
            return Err(crate::futex::FutexError::Inval);
        }
        frame.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

/// The process-wide lock (spec §5: "A process-wide global lock is held
/// across the entire dispatch of one IPC request").
pub static MANAGER: Mutex<Option<Manager>> = Mutex::new(None);

pub fn install(manager: Manager) {
    *MANAGER.lock() = Some(manager);
}

/// One already-decoded kernel-method-table call (spec §4.7 [SUPPLEMENT]).
/// Unmarshalling the wire bytes of an actual IPC message into one of these
/// is the transport's job (spec §1 Non-goals: "wire-level marshalling
/// beyond word/cap counts"); everything from here down is this crate's.
pub enum Request {
    FolioAlloc { owner: ActivityId },
    FolioFree { owner: ActivityId, index: u64 },
    ObjectAlloc { owner: ActivityId, folio_index: u64, slot_index: i32, ty: ObjectType, policy: Policy, return_code: u32 },
    ObjectPolicy { oid: Oid, policy: Policy },
    CapCopy { root: Capability, src_address: u64, dst_address: u64, flags: CopyFlags, properties: Capability },
    CapRubout { root: Capability, address: u64 },
    CapRead { root: Capability, address: u64 },
    ObjectDiscard { oid: Oid },
    ObjectClearDiscarded { oid: Oid },
    ObjectStatus { oid: Oid },
    ThreadExregs { thread: ThreadId, new: Option<ThreadRegisters> },
    ThreadId { messenger: MessengerId },
    ThreadActivationCollect { thread: ThreadId },
    ActivityPolicy { activity: ActivityId, policy: ActivityPolicy },
    ActivityInfo { activity: ActivityId },
    Futex(FutexRequest),
    AsDump { root: Capability },
    MessengerId { messenger: MessengerId },
    ConsoleWrite { bytes: Vec<u8> },
    ConsoleRead { max_len: usize },
    Fault { thread: ThreadId, root: Capability, addresses: Vec<u64>, write_access: bool },
    ObjectName { thread: ThreadId },
    ObjectSetName { thread: ThreadId, name: heapless::String<{ crate::types::THREAD_NAME_MAX }> },
    ObjectReplyOnDestruction { oid: Oid, caller: MessengerId },
}

impl Request {
    /// The wire label this request was (or would be) decoded from (spec
    /// §4.7 [SUPPLEMENT], §6 "first word of the request is the label").
    pub fn label(&self) -> RpcLabel {
        match self {
            Request::FolioAlloc { .. } => RpcLabel::FolioAlloc,
            Request::FolioFree { .. } => RpcLabel::FolioFree,
            Request::ObjectAlloc { .. } => RpcLabel::ObjectAlloc,
            Request::ObjectPolicy { .. } => RpcLabel::FolioPolicy,
            Request::CapCopy { .. } => RpcLabel::CapCopy,
            Request::CapRubout { .. } => RpcLabel::CapRubout,
            Request::CapRead { .. } => RpcLabel::CapRead,
            Request::ObjectDiscard { .. } => RpcLabel::ObjectDiscard,
            Request::ObjectClearDiscarded { .. } => RpcLabel::ObjectClearDiscarded,
            Request::ObjectStatus { .. } => RpcLabel::ObjectStatus,
            Request::ThreadExregs { .. } => RpcLabel::ThreadExregs,
            Request::ThreadId { .. } => RpcLabel::ThreadId,
            Request::ThreadActivationCollect { .. } => RpcLabel::ThreadActivationCollect,
            Request::ActivityPolicy { .. } => RpcLabel::ActivityPolicy,
            Request::ActivityInfo { .. } => RpcLabel::ActivityInfo,
            Request::Futex(_) => RpcLabel::Futex,
            Request::AsDump { .. } => RpcLabel::AsDump,
            Request::MessengerId { .. } => RpcLabel::MessengerId,
            Request::ConsoleWrite { .. } => RpcLabel::ConsoleWrite,
            Request::ConsoleRead { .. } => RpcLabel::ConsoleRead,
            Request::Fault { .. } => RpcLabel::Fault,
            Request::ObjectName { .. } | Request::ObjectSetName { .. } => RpcLabel::ObjectName,
            Request::ObjectReplyOnDestruction { .. } => RpcLabel::ObjectReplyOnDestruction,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FutexRequest {
    Wait { oid: Oid, offset: u32, caller: MessengerId },
    Wake { oid: Oid, offset: u32, n: usize },
    CmpRequeue { oid1: Oid, off1: u32, wake_n: usize, requeue_n: usize, oid2: Oid, off2: u32, expected: u32 },
    WakeOp { oid1: Oid, off1: u32, wake1: usize, wake2: usize, oid2: Oid, off2: u32, op: WakeOp },
}

/// Whatever a successful call hands back to the reply's inline words (the
/// reply's first word — success/errno — is [`RmResult`] itself, per spec §7).
pub enum Response {
    None,
    U64(u64),
    Cap(Capability),
    ObjectStatus(ObjectStatus),
    ActivityInfo(ActivityInfo),
    ThreadRegisters(ThreadRegisters),
    Woken(Vec<MessengerId>),
    Requeued(Vec<MessengerId>, usize),
    AsDump(Vec<crate::cap::translate::AsDumpEntry>),
    Bytes(Vec<u8>),
    Name(heapless::String<{ crate::types::THREAD_NAME_MAX }>),
    FaultResults(Vec<activation::FaultOutcome>),
}

impl Manager {
    /// Execute one decoded request (spec §4.7 method table). Does not run
    /// the pager's quiescent-point check itself — callers go through
    /// [`dispatch_one`] for that, which also holds [`MANAGER`]'s lock.
    pub fn dispatch(&mut self, request: Request) -> RmResult<Response> {
        match request {
            Request::FolioAlloc { owner } => self.folio_alloc(owner).map(Response::U64),
            Request::FolioFree { owner, index } => self.folio_free(owner, index).map(|_| Response::None),
            Request::ObjectAlloc { owner, folio_index, slot_index, ty, policy, return_code } => self
                .folio_object_alloc(owner, folio_index, slot_index, ty, policy, return_code)
                .map(|_| Response::None),
            Request::ObjectPolicy { oid, policy } => self.object_policy_update(oid, policy).map(|_| Response::None),
            Request::CapCopy { root, src_address, dst_address, flags, properties } => {
                self.cap_copy(root, src_address, dst_address, flags, properties).map(|_| Response::None)
            }
            Request::CapRubout { root, address } => self.cap_rubout(root, address).map(|_| Response::None),
            Request::CapRead { root, address } => {
                crate::cap::translate::as_lookup(self, root, address, crate::cap::translate::ReturnMode::WantObject)
                    .map(Response::Cap)
                    .map_err(RmError::from)
            }
            Request::ObjectDiscard { oid } => self.object_discard(oid).map(|_| Response::None),
            Request::ObjectClearDiscarded { oid } => self.object_clear_discarded(oid).map(|_| Response::None),
            Request::ObjectStatus { oid } => self.object_status(oid).map(Response::ObjectStatus),
            Request::ThreadExregs { thread, new } => Ok(Response::ThreadRegisters(self.thread_exregs(thread, new))),
            Request::ThreadId { messenger } => {
                let bound = self.messengers.get(messenger).map_err(RmError::from)?.bound_thread;
                Ok(Response::U64(bound.map(|t| t.0 as u64).unwrap_or(0)))
            }
            Request::ThreadActivationCollect { thread } => Ok(Response::U64(self.thread_activation_collect(thread) as u64)),
            Request::ActivityPolicy { activity, policy } => self.activity_policy_update(activity, policy).map(|_| Response::None),
            Request::ActivityInfo { activity } => self.activity_info(activity).map(Response::ActivityInfo),
            Request::Futex(op) => self.dispatch_futex(op),
            Request::AsDump { root } => Ok(Response::AsDump(self.as_dump(root))),
            Request::MessengerId { messenger } => self.messenger_user_id(messenger).map(Response::U64),
            Request::ConsoleWrite { bytes } => {
                self.console_write(&bytes);
                Ok(Response::None)
            }
            Request::ConsoleRead { max_len } => Ok(Response::Bytes(self.console_read(max_len))),
            Request::Fault { thread, root, addresses, write_access } => {
                self.fault_bulk(thread, root, &addresses, write_access).map(Response::FaultResults)
            }
            Request::ObjectName { thread } => self.object_name(thread).map(Response::Name),
            Request::ObjectSetName { thread, name } => self.object_set_name(thread, &name).map(|_| Response::None),
            Request::ObjectReplyOnDestruction { oid, caller } => {
                self.object_reply_on_destruction(oid, caller).map(|_| Response::None)
            }
        }
    }

    fn dispatch_futex(&mut self, op: FutexRequest) -> RmResult<Response> {
        match op {
            FutexRequest::Wait { oid, offset, caller } => {
                self.futex_wait(oid, offset, caller);
                Ok(Response::None)
            }
            FutexRequest::Wake { oid, offset, n } => Ok(Response::Woken(self.futex_wake(oid, offset, n))),
            FutexRequest::CmpRequeue { oid1, off1, wake_n, requeue_n, oid2, off2, expected } => self
                .futex_cmp_requeue(oid1, off1, wake_n, requeue_n, oid2, off2, expected)
                .map(|(woken, moved)| Response::Requeued(woken, moved))
                .map_err(RmError::from),
            FutexRequest::WakeOp { oid1, off1, wake1, wake2, oid2, off2, op } => self
                .futex_wake_op(oid1, off1, wake1, wake2, oid2, off2, op)
                .map(Response::Woken)
                .map_err(RmError::from),
        }
    }
}

/// Run one dispatch: execute the already-decoded request under the global
/// lock, then run the pager's quiescent-point check before returning (spec
/// §5 "Suspension points... at the top of its loop").
/// Dispatch one request, quiesce the pager afterwards, and hand back both
/// the request's own reply and any replies teardown/pressure bookkeeping
/// queued up for *other* messengers in the process (spec §4.3, §4.4) — the
/// transport delivers both, the direct reply and the side-channel ones,
/// the same way it would treat `futex_wake`'s returned messenger list.
pub fn dispatch_one(request: Request) -> RmResult<(Response, Vec<(MessengerId, u32)>)> {
    let mut guard = MANAGER.lock();
    let manager = guard.as_mut().expect("manager not installed");
    let result = manager.dispatch(request);
    manager.quiesce();
    let pending = manager.drain_pending_replies();
    result.map(|response| (response, pending))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::{MemoryMap, MemoryRegion, MemoryType};

    fn fresh_manager() -> Manager {
        let map = MemoryMap {
            regions: alloc::vec![MemoryRegion { base: 0, length: 16 * 1024 * 1024, ty: MemoryType::Available }],
            modules: alloc::vec::Vec::new(),
        };
        Manager::from_memory_map(&map)
    }

    #[test]
    fn folio_alloc_respects_quota() {
        let mut manager = fresh_manager();
        let root = manager.activities.root;
        manager.activities.get_mut(root).unwrap().policy.folios_quota = 1;
        assert!(manager.folio_alloc(root).is_ok());
        assert_eq!(manager.folio_alloc(root), Err(RmError::NoMem));
    }

    #[test]
    fn folio_object_alloc_then_cap_copy_round_trip() {
        let mut manager = fresh_manager();
        let root = manager.activities.root;
        let folio_index = manager.folio_alloc(root).unwrap();
        manager
            .folio_object_alloc(root, folio_index, 0, ObjectType::Cappage, Policy::DEFAULT, 0)
            .unwrap();
        manager
            .folio_object_alloc(root, folio_index, 1, ObjectType::Page, Policy::DEFAULT, 0)
            .unwrap();

        let cappage_oid = crate::types::oid_of(folio_index, 0);
        let page_cap = Capability {
            ty: CapType::Page,
            target: crate::types::oid_of(folio_index, 1),
            version: 0,
            translator: crate::cap::AddressTranslator::NONE,
            policy: Policy::DEFAULT,
        };
        manager.cappage_slot_set(cappage_oid, 7, page_cap).unwrap();

        let root_cap = Capability {
            ty: CapType::Cappage,
            target: cappage_oid,
            version: 0,
            translator: crate::cap::AddressTranslator::NONE,
            policy: Policy::DEFAULT,
        };
        let address = 7u64 << (crate::types::ADDR_BITS - 8);
        let found = crate::cap::translate::as_lookup(&mut manager, root_cap, address, crate::cap::translate::ReturnMode::WantCap).unwrap();
        assert_eq!(found.target, page_cap.target);
    }

    #[test]
    fn quiesce_applies_reclaimed_frames_discarding_discardable_objects() {
        let mut manager = fresh_manager();
        let root = manager.activities.root;
        let folio_index = manager.folio_alloc(root).unwrap();
        let policy = Policy { discardable: true, priority: 0 };
        manager.folio_object_alloc(root, folio_index, 0, ObjectType::Page, policy, 0).unwrap();
        let oid = crate::types::oid_of(folio_index, 0);
        assert!(manager.store.descriptor(oid).is_some());

        manager.apply_reclaimed(alloc::vec![ReclaimedFrame { oid, activity: root, disposition: ReclaimDisposition::Available }]);

        assert!(manager.store.descriptor(oid).is_none());
        let (fi, slot) = crate::types::split_oid(oid);
        assert!(manager.store.folio(fi).unwrap().slot(slot).unwrap().discarded);
    }

    #[test]
    fn quiesce_parks_laundry_disposition_without_discarding() {
        let mut manager = fresh_manager();
        let root = manager.activities.root;
        let folio_index = manager.folio_alloc(root).unwrap();
        manager.folio_object_alloc(root, folio_index, 0, ObjectType::Page, Policy::DEFAULT, 0).unwrap();
        let oid = crate::types::oid_of(folio_index, 0);

        manager.apply_reclaimed(alloc::vec![ReclaimedFrame { oid, activity: root, disposition: ReclaimDisposition::Laundry }]);

        let descriptor = manager.store.descriptor(oid).unwrap();
        assert_eq!(descriptor.membership, ListMembership::Laundry);
        assert!(descriptor.flags.contains(ObjectFlags::EVICTION_CANDIDATE));
    }

    #[test]
    fn dispatch_folio_alloc_and_object_alloc_round_trip() {
        let mut manager = fresh_manager();
        let root = manager.activities.root;
        let folio_index = match manager.dispatch(Request::FolioAlloc { owner: root }).unwrap() {
            Response::U64(v) => v,
            _ => panic!("expected u64 response"),
        };
        let response = manager
            .dispatch(Request::ObjectAlloc {
                owner: root,
                folio_index,
                slot_index: 0,
                ty: ObjectType::Page,
                policy: Policy::DEFAULT,
                return_code: 0,
            })
            .unwrap();
        assert!(matches!(response, Response::None));
    }

    #[test]
    fn dispatch_futex_wake_returns_waiting_messenger() {
        let mut manager = fresh_manager();
        manager.messengers.insert(MessengerId(1), Messenger::new());
        manager
            .dispatch(Request::Futex(FutexRequest::Wait { oid: 5, offset: 0, caller: MessengerId(1) }))
            .unwrap();
        let response = manager.dispatch(Request::Futex(FutexRequest::Wake { oid: 5, offset: 0, n: 1 })).unwrap();
        match response {
            Response::Woken(woken) => assert_eq!(woken, alloc::vec![MessengerId(1)]),
            _ => panic!("expected Woken response"),
        }
    }

    #[test]
    fn dispatch_object_discard_then_clear_round_trip() {
        let mut manager = fresh_manager();
        let root = manager.activities.root;
        let folio_index = manager.folio_alloc(root).unwrap();
        let policy = Policy { discardable: true, priority: 0 };
        manager.folio_object_alloc(root, folio_index, 0, ObjectType::Page, policy, 0).unwrap();
        let oid = crate::types::oid_of(folio_index, 0);

        manager.dispatch(Request::ObjectDiscard { oid }).unwrap();
        assert!(manager.object_find(root, oid, policy).unwrap().is_none());

        manager.dispatch(Request::ObjectClearDiscarded { oid }).unwrap();
        assert!(manager.object_find(root, oid, policy).unwrap().is_some());
    }

    #[test]
    fn teardown_replies_return_code_to_destroy_waiters_and_fault_to_others() {
        use crate::messenger::{Waiter, WaitReason};

        let mut manager = fresh_manager();
        let root = manager.activities.root;
        let folio_index = manager.folio_alloc(root).unwrap();
        manager.folio_object_alloc(root, folio_index, 0, ObjectType::Messenger, Policy::DEFAULT, 0).unwrap();
        let oid = crate::types::oid_of(folio_index, 0);

        manager.messengers.insert(MessengerId(10), Messenger::new());
        manager.messengers.insert(MessengerId(11), Messenger::new());
        manager.messengers.queue(oid).push_back(Waiter { messenger: MessengerId(10), reason: WaitReason::Destroy });
        manager.messengers.queue(oid).push_back(Waiter { messenger: MessengerId(11), reason: WaitReason::TransferMessage });

        manager.folio_object_alloc(root, folio_index, 0, ObjectType::Page, Policy::DEFAULT, 7).unwrap();

        let replies = manager.drain_pending_replies();
        assert_eq!(replies, alloc::vec![(MessengerId(10), 7), (MessengerId(11), RmError::Fault.as_errno())]);
    }

    #[test]
    fn deliver_pressure_queues_reply_for_subscribed_waiter() {
        use crate::messenger::{Waiter, WaitReason};

        let mut manager = fresh_manager();
        let activity = manager.activities.root;
        manager.messengers.insert(MessengerId(20), Messenger::new());
        manager
            .messengers
            .queue(activity.0)
            .push_back(Waiter { messenger: MessengerId(20), reason: WaitReason::ActivityInfoPressure });

        PressureChannel::deliver_pressure(&mut manager, activity, 42);

        assert_eq!(manager.drain_pending_replies(), alloc::vec![(MessengerId(20), 42)]);
    }

    #[test]
    fn thread_start_commissions_once_and_teardown_decommissions() {
        let mut manager = fresh_manager();
        let root = manager.activities.root;
        let folio_index = manager.folio_alloc(root).unwrap();
        manager.folio_object_alloc(root, folio_index, 0, ObjectType::Thread, Policy::DEFAULT, 0).unwrap();
        let thread = ThreadId(crate::types::oid_of(folio_index, 0));

        manager.thread_start(thread, 77).unwrap();
        assert!(manager.threads.get(&thread).unwrap().commissioned);
        assert_eq!(manager.threads.get(&thread).unwrap().kernel_thread_id, Some(77));

        manager.teardown(thread.0, ObjectType::Thread, 0);
        assert!(manager.threads.get(&thread).is_none());
    }

    #[test]
    fn object_name_round_trips_through_dispatch() {
        let mut manager = fresh_manager();
        let root = manager.activities.root;
        let folio_index = manager.folio_alloc(root).unwrap();
        manager.folio_object_alloc(root, folio_index, 0, ObjectType::Thread, Policy::DEFAULT, 0).unwrap();
        let thread = ThreadId(crate::types::oid_of(folio_index, 0));

        let mut name: heapless::String<{ crate::types::THREAD_NAME_MAX }> = heapless::String::new();
        name.push_str("init").unwrap();
        manager.dispatch(Request::ObjectSetName { thread, name }).unwrap();
        match manager.dispatch(Request::ObjectName { thread }).unwrap() {
            Response::Name(n) => assert_eq!(n.as_str(), "init"),
            _ => panic!("expected Name response"),
        }
    }

    #[test]
    fn object_reply_on_destruction_is_woken_by_teardown() {
        let mut manager = fresh_manager();
        let root = manager.activities.root;
        let folio_index = manager.folio_alloc(root).unwrap();
        manager.folio_object_alloc(root, folio_index, 0, ObjectType::Page, Policy::DEFAULT, 0).unwrap();
        let oid = crate::types::oid_of(folio_index, 0);
        manager.messengers.insert(MessengerId(30), Messenger::new());

        manager
            .dispatch(Request::ObjectReplyOnDestruction { oid, caller: MessengerId(30) })
            .unwrap();
        manager.folio_object_alloc(root, folio_index, 0, ObjectType::Page, Policy::DEFAULT, 9).unwrap();

        assert_eq!(manager.drain_pending_replies(), alloc::vec![(MessengerId(30), 9)]);
    }

    #[test]
    fn fault_bulk_grants_resident_page_and_reports_others_as_faults() {
        let mut manager = fresh_manager();
        let root_activity = manager.activities.root;
        let folio_index = manager.folio_alloc(root_activity).unwrap();
        manager.folio_object_alloc(root_activity, folio_index, 0, ObjectType::Cappage, Policy::DEFAULT, 0).unwrap();
        manager.folio_object_alloc(root_activity, folio_index, 1, ObjectType::Page, Policy::DEFAULT, 0).unwrap();
        let cappage_oid = crate::types::oid_of(folio_index, 0);
        let page_cap = Capability {
            ty: CapType::Page,
            target: crate::types::oid_of(folio_index, 1),
            version: 0,
            translator: crate::cap::AddressTranslator::NONE,
            policy: Policy::DEFAULT,
        };
        manager.cappage_slot_set(cappage_oid, 3, page_cap).unwrap();
        let root_cap = Capability {
            ty: CapType::Cappage,
            target: cappage_oid,
            version: 0,
            translator: crate::cap::AddressTranslator::NONE,
            policy: Policy::DEFAULT,
        };
        let resident_address = 3u64 << (crate::types::ADDR_BITS - 8);
        let void_address = 4u64 << (crate::types::ADDR_BITS - 8);

        let results = manager
            .fault_bulk(ThreadId(0), root_cap, &[resident_address, void_address], false)
            .unwrap();
        assert!(matches!(results[0], activation::FaultOutcome::Granted { .. }));
        assert!(matches!(results[1], activation::FaultOutcome::Fault(_)));
    }

    #[test]
    fn fault_bulk_rejects_requests_past_the_ceiling() {
        let mut manager = fresh_manager();
        let addresses = alloc::vec![0u64; crate::types::FAULT_PREFETCH_CEILING + 1];
        let err = manager
            .fault_bulk(ThreadId(0), Capability::VOID, &addresses, false)
            .unwrap_err();
        assert_eq!(err, RmError::Inval);
    }

    proptest::proptest! {
        /// Invariant 2 (spec §8): a lookup either returns the capability
        /// last written at that slot or, for a slot never written, void.
        #[test]
        fn as_lookup_matches_written_slot_or_returns_void(
            slot_idx in 0usize..256,
            insert in proptest::bool::ANY,
        ) {
            let mut manager = fresh_manager();
            let root = manager.activities.root;
            let folio_index = manager.folio_alloc(root).unwrap();
            manager
                .folio_object_alloc(root, folio_index, 0, ObjectType::Cappage, Policy::DEFAULT, 0)
                .unwrap();
            let cappage_oid = crate::types::oid_of(folio_index, 0);

            let expected_target = if insert {
                manager
                    .folio_object_alloc(root, folio_index, 1, ObjectType::Page, Policy::DEFAULT, 0)
                    .unwrap();
                let page_cap = Capability {
                    ty: CapType::Page,
                    target: crate::types::oid_of(folio_index, 1),
                    version: 0,
                    translator: crate::cap::AddressTranslator::NONE,
                    policy: Policy::DEFAULT,
                };
                manager.cappage_slot_set(cappage_oid, slot_idx, page_cap).unwrap();
                Some(page_cap.target)
            } else {
                None
            };

            let root_cap = Capability {
                ty: CapType::Cappage,
                target: cappage_oid,
                version: 0,
                translator: crate::cap::AddressTranslator::NONE,
                policy: Policy::DEFAULT,
            };
            let address = (slot_idx as u64) << (crate::types::ADDR_BITS - 8);
            let found = crate::cap::translate::as_lookup(
                &mut manager,
                root_cap,
                address,
                crate::cap::translate::ReturnMode::WantCap,
            )
            .unwrap();

            match expected_target {
                Some(target) => proptest::prop_assert_eq!(found.target, target),
                None => proptest::prop_assert_eq!(found.ty, CapType::Void),
            }
        }
    }
}
