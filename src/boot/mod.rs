//! Boot-time interfaces (spec §6).
//!
//! The boot loader, the ELF loader, and the console drivers are external
//! collaborators (spec §1 Non-goals); this module only covers what the
//! manager itself does with what they hand it: parse the Multiboot v1
//! info block, track byte-range reservations so the zone allocator never
//! donates memory still in use, relocate modules away from conflicts, and
//! read the CLI surface from spec §6.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

pub mod multiboot;

pub use multiboot::{MemoryRegion, MemoryType, ModuleInfo};

/// A parsed, owned view of everything the boot loader handed over: the
/// memory map and the module list (spec §6 "Boot-time input").
#[derive(Debug, Clone, Default)]
pub struct MemoryMap {
    pub regions: Vec<MemoryRegion>,
    pub modules: Vec<ModuleInfo>,
}

/// Why a boot module exists, per spec §6's module order contract:
/// `Module[0]` = microkernel image, `Module[1]` = sigma0, `Module[2]` =
/// root server, `Module[3..]` pass through to the root server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Kernel,
    Sigma0,
    RootServer,
    PassThrough(u32),
}

impl ModuleKind {
    pub fn for_index(index: usize) -> Self {
        match index {
            0 => ModuleKind::Kernel,
            1 => ModuleKind::Sigma0,
            2 => ModuleKind::RootServer,
            n => ModuleKind::PassThrough(n as u32),
        }
    }
}

/// A module after relocation, with its owner's kind attached.
#[derive(Debug, Clone, Copy)]
pub struct RelocatedModule {
    pub kind: ModuleKind,
    pub load_addr: u64,
    pub entry_point: u64,
}

/// Reservation owner tag: boot-time byte ranges are released wholesale
/// when the stage that owns them ends (spec §5 "Resource reservation").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReservationKind {
    SelfImage,
    Init,
    Modules,
    System,
}

/// A half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn is_adjacent(&self, other: &ByteRange) -> bool {
        self.end == other.start || other.end == self.start
    }
}

/// Boot-time reservations recorded in a non-overlapping ordered tree keyed
/// on byte range (spec §5). A `BTreeMap<start, ByteRange>` gives ordered
/// iteration and O(log n) neighbor lookups, the same shape the rest of the
/// pack reaches for (e.g. `nexus-peer-lru`) instead of a hand-rolled
/// interval tree.
#[derive(Debug, Default)]
pub struct ReservationTree {
    ranges: BTreeMap<u64, (ByteRange, ReservationKind)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationError {
    Overlap,
}

impl ReservationTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reservation. Fails if it overlaps an existing one of a
    /// *different* kind; overlapping-and-adjacent same-kind reservations
    /// are coalesced instead, per spec §5.
    pub fn reserve(&mut self, range: ByteRange, kind: ReservationKind) -> Result<(), ReservationError> {
        let mut merged = range;
        let mut to_remove = Vec::new();
        for (&start, &(existing, existing_kind)) in self.ranges.iter() {
            let touches = existing.overlaps(&merged) || existing.is_adjacent(&merged);
            if !touches {
                continue;
            }
            if existing_kind != kind {
                return Err(ReservationError::Overlap);
            }
            merged = ByteRange {
                start: merged.start.min(existing.start),
                end: merged.end.max(existing.end),
            };
            to_remove.push(start);
        }
        for start in to_remove {
            self.ranges.remove(&start);
        }
        self.ranges.insert(merged.start, (merged, kind));
        Ok(())
    }

    /// Release every reservation of the given kind, e.g. once the init
    /// stage has finished consuming its modules.
    pub fn release_kind(&mut self, kind: ReservationKind) {
        self.ranges.retain(|_, (_, k)| *k != kind);
    }

    pub fn iter(&self) -> impl Iterator<Item = (ByteRange, ReservationKind)> + '_ {
        self.ranges.values().copied()
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.ranges
            .range(..=addr)
            .next_back()
            .map(|(_, (r, _))| r.start <= addr && addr < r.end)
            .unwrap_or(false)
    }
}

/// Relocation callback registry (spec §6: "notifying each owner by a
/// registered relocation callback"), grounded on
/// `examples/original_source/laden/loader.c`'s per-module relocation
/// handling.
pub struct RelocationRegistry {
    callbacks: Vec<(ModuleKind, fn(&RelocatedModule))>,
}

impl RelocationRegistry {
    pub fn new() -> Self {
        Self {
            callbacks: Vec::new(),
        }
    }

    pub fn register(&mut self, kind: ModuleKind, callback: fn(&RelocatedModule)) {
        self.callbacks.push((kind, callback));
    }

    pub fn notify(&self, module: &RelocatedModule) {
        for (kind, callback) in &self.callbacks {
            if *kind == module.kind {
                callback(module);
            }
        }
    }
}

impl Default for RelocationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Which console backend to install, selected by `--output`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputDriver {
    Serial,
    Vga,
}

/// Exit behavior requested on the CLI, or after an unrecoverable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    IdleHalt,
    TripleFaultReboot,
}

/// Parsed CLI surface (spec §6): `--output DRV`, `--debug`, `--halt`,
/// `--reboot`, `--help`, `--usage`, `--version`.
#[derive(Debug, Clone)]
pub struct BootConfig {
    pub output: OutputDriver,
    pub debug: bool,
    pub exit_action: ExitAction,
    pub show_help: bool,
    pub show_usage: bool,
    pub show_version: bool,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            output: OutputDriver::Serial,
            debug: false,
            exit_action: ExitAction::IdleHalt,
            show_help: false,
            show_usage: false,
            show_version: false,
        }
    }
}

impl BootConfig {
    /// Parse a Multiboot command-line string (already extracted from the
    /// info block by the caller) into a [`BootConfig`].
    pub fn parse(cmdline: &str) -> Self {
        let mut cfg = Self::default();
        let mut tokens = cmdline.split_whitespace();
        while let Some(tok) = tokens.next() {
            match tok {
                "--output" => {
                    cfg.output = match tokens.next() {
                        Some("vga") => OutputDriver::Vga,
                        _ => OutputDriver::Serial,
                    };
                }
                "--debug" => cfg.debug = true,
                "--halt" => cfg.exit_action = ExitAction::IdleHalt,
                "--reboot" => cfg.exit_action = ExitAction::TripleFaultReboot,
                "--help" => cfg.show_help = true,
                "--usage" => cfg.show_usage = true,
                "--version" => cfg.show_version = true,
                _ => {}
            }
        }
        cfg
    }
}

/// Extract a NUL-terminated string from a raw Multiboot pointer.
///
/// # Safety
/// `ptr` must point at a NUL-terminated ASCII string that stays mapped for
/// the call's duration.
pub unsafe fn cstr_at(ptr: u32) -> String {
    let mut bytes = Vec::new();
    let mut cur = ptr as *const u8;
    while *cur != 0 {
        bytes.push(*cur);
        cur = cur.add(1);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}
