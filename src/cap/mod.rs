//! Capabilities: the handle type clients hold (spec §3 "Capability", §4.3).
//!
//! Grounded on the teacher's `ipc::rights::PortRight` (a tagged handle with
//! a weak/strong distinction and explicit ref-counted lifecycle), reworked
//! from Mach port rights into the guarded, versioned capability described
//! by the spec: a type tag, a target OID+version pair for validation, an
//! embedded address translator, and policy overrides.

pub mod translate;

use crate::types::{Oid, Policy, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapError {
    /// Address translation hit a void slot or an out-of-range index.
    Invalid,
    /// `cap.version != target.version`.
    StaleVersion,
    /// A write was attempted through a weak (read-only) capability.
    WeakWrite,
    /// Reserved bits set, or a flag combination that makes no sense.
    Malformed,
    /// The guarded walk exceeded `ADDR_BITS` of depth.
    DepthExceeded,
    /// `as_lookup` in want-slot mode resolved to a capability synthesized
    /// from folio/thread/messenger metadata rather than real cappage
    /// storage, so there is no slot to mutate.
    SynthesizedSlot,
}

pub type CapResult<T> = Result<T, CapError>;

/// The reserved capability type tags (spec §3). An `R`-prefix is the weak
/// variant; folios and threads have no weak counterpart (there is nothing
/// for a write to mutate through them directly — mutation always happens
/// through the slots they contribute, not the container cap itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapType {
    Void,
    Page,
    RPage,
    Cappage,
    RCappage,
    Folio,
    Thread,
    ActivityControl,
    /// Weak activity capability.
    Activity,
    Messenger,
    RMessenger,
}

impl CapType {
    pub fn is_weak(self) -> bool {
        matches!(self, CapType::RPage | CapType::RCappage | CapType::Activity | CapType::RMessenger)
    }

    /// The weak counterpart of a strong type, if one exists.
    pub fn weakened(self) -> CapType {
        match self {
            CapType::Page => CapType::RPage,
            CapType::Cappage => CapType::RCappage,
            CapType::ActivityControl => CapType::Activity,
            CapType::Messenger => CapType::RMessenger,
            other => other,
        }
    }

    /// Dereferencing through a weak capability always yields a weak result
    /// (spec §3 "sub-dereferences downgrade strong→weak").
    pub fn downgraded_by(self, parent_is_weak: bool) -> CapType {
        if parent_is_weak {
            self.weakened()
        } else {
            self
        }
    }
}

/// Guard + guard-bit-count + (for cappages) a sub-page window selector
/// (spec §3, §9 "represent as a struct with explicit fields").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddressTranslator {
    pub guard: u64,
    pub guard_bits: u8,
    /// Which contiguous `2^subpages_log2`-slot window of a cappage is in
    /// scope; `subpages_log2 == 0` with `subpage_index == 0` means "no
    /// sub-page restriction, full cappage in scope" (spec §3).
    pub subpage_index: u16,
    pub subpages_log2: u8,
}

impl AddressTranslator {
    pub const NONE: Self = Self {
        guard: 0,
        guard_bits: 0,
        subpage_index: 0,
        subpages_log2: 0,
    };
}

/// A capability value (spec §3). Copy because capabilities are small,
/// value-typed handles stored inline in cappage/thread/messenger slots —
/// never shared by reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Capability {
    pub ty: CapType,
    pub target: Oid,
    pub version: Version,
    pub translator: AddressTranslator,
    pub policy: Policy,
}

impl Capability {
    pub const VOID: Self = Self {
        ty: CapType::Void,
        target: crate::types::OID_NULL,
        version: 0,
        translator: AddressTranslator::NONE,
        policy: Policy::DEFAULT,
    };

    pub fn is_void(&self) -> bool {
        self.ty == CapType::Void
    }

    /// Validity per spec §8 invariant 2 / §3: `cap.version ==
    /// target_object.version`.
    pub fn is_valid_against(&self, target_version: Version) -> bool {
        !self.is_void() && self.version == target_version
    }

    pub fn weaken(mut self) -> Self {
        self.ty = self.ty.weakened();
        self
    }
}

/// Flags selecting which fields `cap_copy` takes from `properties` instead
/// of preserving from the pre-existing destination (spec §4.3 `cap_copy`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyFlags {
    pub subpage: bool,
    pub guard: bool,
    pub source_guard: bool,
    pub weaken: bool,
    pub discardable: bool,
    pub priority: bool,
}

/// `cap_copy(src, dst, flags, properties)` (spec §4.3). `dst` is taken by
/// value and the updated copy returned; the caller stores it back into the
/// destination slot. Policy propagation into a resident descriptor (when
/// `discardable`/`priority` are set and the target is resident) is the
/// caller's responsibility since it requires the object store.
pub fn cap_copy(src: Capability, mut dst: Capability, flags: CopyFlags, properties: Capability) -> Capability {
    dst.ty = src.ty;
    dst.target = src.target;
    dst.version = src.version;
    dst.translator = src.translator;
    dst.policy = src.policy;

    if flags.subpage {
        dst.translator.subpage_index = properties.translator.subpage_index;
        dst.translator.subpages_log2 = properties.translator.subpages_log2;
    }
    if flags.guard {
        dst.translator.guard = properties.translator.guard;
        dst.translator.guard_bits = properties.translator.guard_bits;
    }
    if flags.source_guard {
        dst.translator.guard = src.translator.guard;
        dst.translator.guard_bits = src.translator.guard_bits;
    }
    if flags.discardable {
        dst.policy.discardable = properties.policy.discardable;
    }
    if flags.priority {
        dst.policy.priority = properties.policy.priority;
    }
    if flags.weaken {
        dst = dst.weaken();
    }
    dst
}

/// `cap_rubout`: shoot-down + zero (spec §4.3). Shoot-down of hardware
/// mappings is orchestrated by the caller (it needs the store); this just
/// produces the zeroed slot value.
pub fn cap_rubout() -> Capability {
    Capability::VOID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weaken_demotes_known_types() {
        assert_eq!(CapType::Page.weakened(), CapType::RPage);
        assert_eq!(CapType::Cappage.weakened(), CapType::RCappage);
        assert_eq!(CapType::Messenger.weakened(), CapType::RMessenger);
        assert_eq!(CapType::ActivityControl.weakened(), CapType::Activity);
    }

    #[test]
    fn cap_copy_with_weaken_flag_downgrades_destination() {
        let src = Capability {
            ty: CapType::Page,
            target: 42,
            version: 1,
            translator: AddressTranslator::NONE,
            policy: Policy::DEFAULT,
        };
        let flags = CopyFlags { weaken: true, ..Default::default() };
        let copied = cap_copy(src, Capability::VOID, flags, Capability::VOID);
        assert_eq!(copied.ty, CapType::RPage);
        assert!(copied.ty.is_weak());
    }

    #[test]
    fn downgraded_by_weak_parent_propagates() {
        assert_eq!(CapType::Cappage.downgraded_by(true), CapType::RCappage);
        assert_eq!(CapType::Cappage.downgraded_by(false), CapType::Cappage);
    }
}
