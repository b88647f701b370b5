//! Guarded address translation: the shadow page table walk (spec §4.3
//! `as_lookup`, §9 "Capability pointer chains").
//!
//! Grounded on the teacher's `ipc::space::AddressSpace` slot-table
//! indexing, generalized from a flat Mach IPC space into the guarded,
//! multi-level walk the spec describes: a capability's guard is matched
//! against the next bits of the target address, the residual bits index
//! into whatever the capability's target contributes (cappage slots,
//! folio slots, thread's three well-known slots, or a messenger's single
//! inline cap), and the process repeats until the address is exhausted.

use super::{AddressTranslator, CapError, CapResult, CapType, Capability};
use crate::types::{ADDR_BITS, CAPPAGE_SLOTS, FOLIO_OBJECTS, Oid};
use alloc::vec::Vec;

/// Everything a walk needs to resolve what a capability's target
/// contributes, without coupling `cap::translate` directly to `store`,
/// `activity`, or `messenger` (those are glued together by
/// `server::Manager`, which implements this trait).
pub trait Container {
    /// Read a cappage's slot (index < [`CAPPAGE_SLOTS`]).
    fn cappage_slot(&self, oid: Oid, index: usize) -> CapResult<Capability>;
    /// Overwrite a cappage's slot; the only mutable leaf a `want-slot`
    /// lookup can land on.
    fn cappage_slot_set(&mut self, oid: Oid, index: usize, cap: Capability) -> CapResult<()>;
    /// Synthesize the capability a folio slot represents (spec §4.3: "A
    /// folio contributes its 128 object slots directly, synthesizing a
    /// capability from the per-slot metadata").
    fn folio_slot(&self, folio_index: u64, index: usize) -> CapResult<Capability>;
    /// A thread's three well-known slots: 0 = aspace root, 1 = activity, 2 = UTCB.
    fn thread_slot(&self, oid: Oid, index: usize) -> CapResult<Capability>;
    /// A messenger's single inline capability slot.
    fn messenger_slot(&self, oid: Oid) -> CapResult<Capability>;
    /// Force the leaf object resident (want-object mode).
    fn ensure_resident(&mut self, oid: Oid) -> CapResult<()>;
    /// Current version of the object named by `oid`, for validity checks.
    fn version_of(&self, oid: Oid) -> CapResult<crate::types::Version>;
}

/// How the caller wants the resolved leaf returned (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnMode {
    WantCap,
    WantObject,
}

fn index_bits_for(ty: CapType, translator: &AddressTranslator) -> u32 {
    match ty {
        CapType::Cappage | CapType::RCappage => {
            if translator.subpages_log2 == 0 {
                (CAPPAGE_SLOTS as u32).trailing_zeros()
            } else {
                translator.subpages_log2 as u32
            }
        }
        CapType::Folio => (FOLIO_OBJECTS as u32).trailing_zeros(),
        CapType::Thread => 2,
        CapType::Messenger | CapType::RMessenger => 0,
        _ => 0,
    }
}

fn take_bits(address: u64, consumed: &mut u32, bits: u32) -> u64 {
    let shift = ADDR_BITS.saturating_sub(*consumed + bits);
    let mask = if bits == 0 { 0 } else { (1u64 << bits) - 1 };
    *consumed += bits;
    (address >> shift) & mask
}

/// Resolve one step: given the capability currently held and the bits
/// consumed so far, validate its guard, compute the next index, and
/// dereference into the contained slot.
fn step<C: Container>(ctx: &C, cap: Capability, address: u64, consumed: &mut u32) -> CapResult<Capability> {
    if cap.translator.guard_bits > 0 {
        let guard_bits = take_bits(address, consumed, cap.translator.guard_bits as u32);
        if guard_bits != cap.translator.guard {
            return Err(CapError::Invalid);
        }
    }

    let index_bits = index_bits_for(cap.ty, &cap.translator);
    let raw_index = take_bits(address, consumed, index_bits) as usize;

    let weak_parent = cap.ty.is_weak();
    let next = match cap.ty {
        CapType::Cappage | CapType::RCappage => {
            let base = cap.translator.subpage_index as usize * (1usize << cap.translator.subpages_log2);
            ctx.cappage_slot(cap.target, base + raw_index)?
        }
        CapType::Folio => ctx.folio_slot(cap.target as u64 as u64, raw_index)?,
        CapType::Thread => ctx.thread_slot(cap.target, raw_index)?,
        CapType::Messenger | CapType::RMessenger => ctx.messenger_slot(cap.target)?,
        CapType::Page | CapType::RPage => return Err(CapError::Malformed),
        CapType::Void => return Err(CapError::Invalid),
        CapType::ActivityControl | CapType::Activity => return Err(CapError::Malformed),
    };

    if next.is_void() {
        return Err(CapError::Invalid);
    }
    let current_version = ctx.version_of(next.target)?;
    if next.version != current_version {
        return Err(CapError::StaleVersion);
    }

    Ok(Capability {
        ty: next.ty.downgraded_by(weak_parent),
        ..next
    })
}

/// Walk from `root` toward `address`, stopping once the leaf is a `page`/
/// `rpage` (or once `ADDR_BITS` have been consumed). `depth` bounds the
/// number of steps (spec §4.3 "depth bound equal to address-bits").
pub fn as_lookup<C: Container>(
    ctx: &mut C,
    root: Capability,
    address: u64,
    mode: ReturnMode,
) -> CapResult<Capability> {
    let mut cap = root;
    let mut consumed = 0u32;
    let mut steps = 0u32;

    loop {
        if matches!(cap.ty, CapType::Page | CapType::RPage | CapType::Void) || consumed >= ADDR_BITS {
            break;
        }
        if steps >= ADDR_BITS {
            return Err(CapError::DepthExceeded);
        }
        cap = step(ctx, cap, address, &mut consumed)?;
        steps += 1;
    }

    if mode == ReturnMode::WantObject && !cap.is_void() {
        ctx.ensure_resident(cap.target)?;
    }
    Ok(cap)
}

/// `as_lookup` in want-slot mode: walk to the slot *containing* the leaf
/// (one level up from the leaf capability) and apply `mutate` to it in
/// place. Fails with [`CapError::SynthesizedSlot`] if that container isn't
/// a real cappage (i.e. the leaf came from a folio/thread/messenger
/// synthesis, which has no mutable backing slot here).
pub fn as_mutate<C: Container>(
    ctx: &mut C,
    root: Capability,
    address: u64,
    mutate: impl FnOnce(Capability) -> Capability,
) -> CapResult<()> {
    let mut cap = root;
    let mut consumed = 0u32;
    let mut steps = 0u32;
    let mut parent: Option<(Capability, usize)> = None;

    loop {
        if matches!(cap.ty, CapType::Page | CapType::RPage | CapType::Void) || consumed >= ADDR_BITS {
            break;
        }
        if steps >= ADDR_BITS {
            return Err(CapError::DepthExceeded);
        }
        let before_consumed = consumed;
        let _ = before_consumed;

        if matches!(cap.ty, CapType::Cappage | CapType::RCappage) {
            let mut probe = consumed;
            if cap.translator.guard_bits > 0 {
                let _ = take_bits(address, &mut probe, cap.translator.guard_bits as u32);
            }
            let index_bits = index_bits_for(cap.ty, &cap.translator);
            let raw_index = take_bits(address, &mut probe, index_bits) as usize;
            let base = cap.translator.subpage_index as usize * (1usize << cap.translator.subpages_log2);
            let next = step(ctx, cap, address, &mut consumed)?;
            if matches!(next.ty, CapType::Page | CapType::RPage | CapType::Void) {
                parent = Some((cap, base + raw_index));
            }
            cap = next;
        } else {
            cap = step(ctx, cap, address, &mut consumed)?;
            parent = None;
        }
        steps += 1;
    }

    let (container, index) = parent.ok_or(CapError::SynthesizedSlot)?;
    let current = ctx.cappage_slot(container.target, index)?;
    ctx.cappage_slot_set(container.target, index, mutate(current))
}

/// One entry in an `as_dump` tree walk (spec §4.3 [SUPPLEMENT], grounded on
/// `examples/original_source/libhurd-mm/as-dump.c`).
#[derive(Debug, Clone, Copy)]
pub struct AsDumpEntry {
    pub depth: u32,
    pub guard: u64,
    pub guard_bits: u8,
    pub slot_index: usize,
    pub target: Oid,
    pub ty: CapType,
}

/// Render the guarded address-space structure reachable from `root` into a
/// flat list of entries, depth-first. Read-only; never forces residency.
pub fn as_dump<C: Container>(ctx: &C, root: Capability) -> Vec<AsDumpEntry> {
    let mut out = Vec::new();
    as_dump_rec(ctx, root, 0, &mut out);
    out
}

fn as_dump_rec<C: Container>(ctx: &C, cap: Capability, depth: u32, out: &mut Vec<AsDumpEntry>) {
    if cap.is_void() || depth > ADDR_BITS {
        return;
    }
    let slot_count = match cap.ty {
        CapType::Cappage | CapType::RCappage => {
            if cap.translator.subpages_log2 == 0 {
                CAPPAGE_SLOTS
            } else {
                1usize << cap.translator.subpages_log2
            }
        }
        CapType::Folio => FOLIO_OBJECTS,
        CapType::Thread => 3,
        CapType::Messenger | CapType::RMessenger => 1,
        _ => 0,
    };

    for index in 0..slot_count {
        let child = match cap.ty {
            CapType::Cappage | CapType::RCappage => {
                let base = cap.translator.subpage_index as usize * (1usize << cap.translator.subpages_log2.max(0));
                ctx.cappage_slot(cap.target, base + index)
            }
            CapType::Folio => ctx.folio_slot(cap.target as u64, index),
            CapType::Thread => ctx.thread_slot(cap.target, index),
            CapType::Messenger | CapType::RMessenger => ctx.messenger_slot(cap.target),
            _ => Ok(Capability::VOID),
        };
        if let Ok(child) = child {
            if child.is_void() {
                continue;
            }
            out.push(AsDumpEntry {
                depth,
                guard: child.translator.guard,
                guard_bits: child.translator.guard_bits,
                slot_index: index,
                target: child.target,
                ty: child.ty,
            });
            as_dump_rec(ctx, child, depth + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Version;
    use alloc::collections::BTreeMap;

    /// An in-memory `Container` used purely for translation-walk tests;
    /// the real implementation lives on `server::Manager`.
    #[derive(Default)]
    struct FakeSpace {
        cappages: BTreeMap<(Oid, usize), Capability>,
        versions: BTreeMap<Oid, Version>,
    }

    impl Container for FakeSpace {
        fn cappage_slot(&self, oid: Oid, index: usize) -> CapResult<Capability> {
            Ok(self.cappages.get(&(oid, index)).copied().unwrap_or(Capability::VOID))
        }
        fn cappage_slot_set(&mut self, oid: Oid, index: usize, cap: Capability) -> CapResult<()> {
            self.cappages.insert((oid, index), cap);
            Ok(())
        }
        fn folio_slot(&self, _folio_index: u64, _index: usize) -> CapResult<Capability> {
            Ok(Capability::VOID)
        }
        fn thread_slot(&self, _oid: Oid, _index: usize) -> CapResult<Capability> {
            Ok(Capability::VOID)
        }
        fn messenger_slot(&self, _oid: Oid) -> CapResult<Capability> {
            Ok(Capability::VOID)
        }
        fn ensure_resident(&mut self, _oid: Oid) -> CapResult<()> {
            Ok(())
        }
        fn version_of(&self, oid: Oid) -> CapResult<Version> {
            Ok(self.versions.get(&oid).copied().unwrap_or(0))
        }
    }

    fn cappage_root(target: Oid) -> Capability {
        Capability {
            ty: CapType::Cappage,
            target,
            version: 0,
            translator: AddressTranslator::NONE,
            policy: crate::types::Policy::DEFAULT,
        }
    }

    #[test]
    fn lookup_resolves_page_inserted_at_top_level_slot() {
        let mut space = FakeSpace::default();
        space.versions.insert(99, 1);
        let page = Capability {
            ty: CapType::Page,
            target: 99,
            version: 1,
            translator: AddressTranslator::NONE,
            policy: crate::types::Policy::DEFAULT,
        };
        // Top-level cappage has 256 slots -> 8 index bits, consumed from
        // the high end of the 48-bit address; put the page at index 1.
        space.cappage_slot_set(1, 1, page).unwrap();

        let root = cappage_root(1);
        let address = 1u64 << (ADDR_BITS - 8);
        let found = as_lookup(&mut space, root, address, ReturnMode::WantCap).unwrap();
        assert_eq!(found.target, 99);
        assert_eq!(found.ty, CapType::Page);
    }

    #[test]
    fn lookup_returns_invalid_for_void_slot() {
        let mut space = FakeSpace::default();
        let root = cappage_root(1);
        let address = 5u64 << (ADDR_BITS - 8);
        let err = as_lookup(&mut space, root, address, ReturnMode::WantCap).unwrap_err();
        assert_eq!(err, CapError::Invalid);
    }

    #[test]
    fn mutate_then_void_then_retag_round_trip() {
        let mut space = FakeSpace::default();
        space.versions.insert(99, 1);
        let page = Capability {
            ty: CapType::Page,
            target: 99,
            version: 1,
            translator: AddressTranslator::NONE,
            policy: crate::types::Policy::DEFAULT,
        };
        let root = cappage_root(1);
        let address = 2u64 << (ADDR_BITS - 8);

        as_mutate(&mut space, root, address, |_old| page).unwrap();
        let found = as_lookup(&mut space, root, address, ReturnMode::WantCap).unwrap();
        assert_eq!(found.target, 99);

        as_mutate(&mut space, root, address, |_old| Capability::VOID).unwrap();
        let voided = as_lookup(&mut space, root, address, ReturnMode::WantCap).unwrap();
        assert!(voided.is_void());

        as_mutate(&mut space, root, address, |_old| page).unwrap();
        let retagged = as_lookup(&mut space, root, address, ReturnMode::WantCap).unwrap();
        assert_eq!(retagged.target, 99);
    }
}
