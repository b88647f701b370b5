//! Shared scalar types: object identity, versions, policy.

/// Number of object slots in a folio (the only unit of persistent storage).
pub const FOLIO_OBJECTS: usize = 128;

/// OID modulus: one more than the slot count, to make room for the folio's
/// own header at slot -1 (see [`oid_of`]).
pub const FOLIO_MODULUS: i64 = FOLIO_OBJECTS as i64 + 1;

/// Number of capability slots in a capability page (sub-pageable down to 2).
pub const CAPPAGE_SLOTS: usize = 256;

/// Page size in bytes; every object occupies exactly one page-sized slot.
pub const PAGE_SIZE: usize = 4096;

/// Number of bits in a virtual address the guarded translation walk covers.
pub const ADDR_BITS: u32 = 48;

/// Fixed ceiling on how many addresses one bulk `fault` (pre-fault) RPC may
/// request (spec §9 Open Questions: "the source's `fault` RPC prefault
/// count is bounded by the transport's word count, which varies per
/// architecture; implementers should choose a fixed, documented ceiling").
/// 32 matches the inline word budget a single IPC message can realistically
/// carry addresses for without an out-of-band buffer (spec §4.6 inline
/// words are ≤2 plus ≤1 cap per phase; a dedicated bulk-fault buffer is
/// assumed to hold up to this many 8-byte addresses).
pub const FAULT_PREFETCH_CEILING: usize = 32;

/// Maximum length of a thread's display name (spec §3 thread object variant
/// "display name"), matching the teacher's short fixed-capacity name fields.
pub const THREAD_NAME_MAX: usize = 32;

/// A persistent object identifier: `folio_index * 129 + slot_index`, where
/// `slot_index == -1` denotes the folio header itself. Signed so that the
/// header of folio 0 (`oid == -1`) is representable without reserving folio
/// index 0 as dead space.
pub type Oid = i64;

/// The distinguished "no object" OID, used for void capability slots.
pub const OID_NULL: Oid = i64::MIN;

/// Compute the OID of a slot within a folio. `slot == -1` addresses the
/// folio's own header.
pub const fn oid_of(folio_index: u64, slot: i32) -> Oid {
    folio_index as i64 * FOLIO_MODULUS + slot as i64
}

/// Split an OID back into its folio index and slot (-1 for the header).
/// Inverse of [`oid_of`]: shifting by one before the euclidean divide moves
/// the header (`slot == -1`) into the previous folio's residue class, where
/// it belongs (`oid_of(f, -1) == f*129 - 1`).
pub const fn split_oid(oid: Oid) -> (u64, i32) {
    let folio_index = (oid + 1).div_euclid(FOLIO_MODULUS);
    let slot = (oid - folio_index * FOLIO_MODULUS) as i32;
    (folio_index as u64, slot)
}

/// A monotonically increasing per-slot version counter. Bumping it
/// invalidates every outstanding capability that targets the old object.
pub type Version = u32;

/// Resident-object discardability and eviction priority, attached both to
/// folio slot metadata and to capabilities (as an override).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub discardable: bool,
    pub priority: i8,
}

impl Policy {
    pub const DEFAULT: Self = Self {
        discardable: false,
        priority: 0,
    };

    pub const PRIORITY_MIN: i8 = -64;
    pub const PRIORITY_MAX: i8 = 63;
    /// The dedicated "least recently used" priority band objects default
    /// into; also the only priority with separate active/inactive lists
    /// participating in ordinary LRU aging (see `activity::ActivityLists`).
    pub const PRIORITY_LRU: i8 = 0;
}

impl Default for Policy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A stable identifier for an activity. Unlike [`ThreadId`]/[`MessengerId`],
/// this is *not* an object-store OID: activities have no folio-backed slot
/// representation, so `ActivityTable` allocates these from its own
/// sequential counter rather than `oid_of` (see DESIGN.md, "ActivityId
/// numbering vs. object-store OIDs"). The newtype still keeps call sites
/// honest about which kind of identifier is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActivityId(pub Oid);

/// A stable identifier for a thread (also just its OID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub Oid);

/// A stable identifier for a messenger (also just its OID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessengerId(pub Oid);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oid_roundtrip_ordinary_slots() {
        for folio in 0u64..4 {
            for slot in 0i32..FOLIO_OBJECTS as i32 {
                let oid = oid_of(folio, slot);
                assert_eq!(split_oid(oid), (folio, slot));
            }
        }
    }

    #[test]
    fn oid_roundtrip_folio_header() {
        for folio in 0u64..4 {
            let oid = oid_of(folio, -1);
            assert_eq!(split_oid(oid), (folio, -1));
        }
    }
}
