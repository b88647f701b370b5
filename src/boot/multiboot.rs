//! Multiboot **v1** information structure (spec §6: "Byte-exact layout per
//! Multiboot spec v1"). Grounded on `examples/original_source/laden/multiboot.h`;
//! the teacher's own `boot::multiboot` module implements Multiboot *2*, so
//! the struct layout here is redefined rather than reused (see DESIGN.md).

/// Magic value the boot loader leaves in the entry register, confirming a
/// Multiboot-compliant handoff.
pub const MULTIBOOT_BOOTLOADER_MAGIC: u32 = 0x2BADB002;

bitflags::bitflags! {
    /// `multiboot_info.flags` bit assignments.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InfoFlags: u32 {
        const MEM            = 1 << 0;
        const BOOT_DEVICE     = 1 << 1;
        const CMDLINE         = 1 << 2;
        const MODS            = 1 << 3;
        const AOUT_SYMS       = 1 << 4;
        const ELF_SHDR        = 1 << 5;
        const MMAP            = 1 << 6;
        const DRIVES          = 1 << 7;
        const CONFIG_TABLE    = 1 << 8;
        const BOOT_LOADER_NAME = 1 << 9;
        const APM_TABLE       = 1 << 10;
        const VBE             = 1 << 11;
    }
}

/// Raw `multiboot_info_t`, byte-exact with the C layout (only the fields
/// the manager consumes are broken out of the symbol-table union; the
/// a.out/ELF section-header union fields are not needed once modules have
/// been located by the boot stub).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawInfo {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub syms: [u32; 4],
    pub mmap_length: u32,
    pub mmap_addr: u32,
    pub drives_length: u32,
    pub drives_addr: u32,
    pub config_table: u32,
    pub boot_loader_name: u32,
    pub apm_table: u32,
    pub vbe_control_info: u32,
    pub vbe_mode_info: u32,
    pub vbe_mode: u32,
    pub vbe_interface_seg: u32,
    pub vbe_interface_off: u32,
    pub vbe_interface_len: u32,
}

/// Raw `module_t` entry: one per boot module (spec §6 module order contract).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawModule {
    pub mod_start: u32,
    pub mod_end: u32,
    pub string: u32,
    pub reserved: u32,
}

/// Raw `memory_map_t` entry. `size` covers the struct except itself, so
/// entries are variable-length and must be walked rather than indexed.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawMmapEntry {
    pub size: u32,
    pub base_addr: u64,
    pub length: u64,
    pub entry_type: u32,
}

/// Multiboot memory region type. Only `Available` (1) is conventional RAM;
/// everything else is reserved from the zone allocator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Available,
    Reserved(u32),
}

impl MemoryType {
    pub fn from_raw(raw: u32) -> Self {
        if raw == 1 {
            MemoryType::Available
        } else {
            MemoryType::Reserved(raw)
        }
    }
}

/// A parsed memory map entry, safe to hold past the raw Multiboot buffer's
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub ty: MemoryType,
}

/// A parsed module descriptor (spec §6 module order contract:
/// `Module[0]` = kernel image, `Module[1]` = sigma0, `Module[2]` = root
/// server, `Module[3..]` pass through).
#[derive(Debug, Clone, Copy)]
pub struct ModuleInfo {
    pub start: u32,
    pub end: u32,
    /// Offset of the command-line string within the info block; resolved
    /// lazily by the caller since it requires the original buffer.
    pub cmdline_ptr: u32,
}

/// Parse the raw Multiboot info block (assumed already validated against
/// [`MULTIBOOT_BOOTLOADER_MAGIC`] by the caller) into owned, safe-to-hold
/// collections.
///
/// # Safety
/// `info` must point at a valid `multiboot_info_t` written by a Multiboot
/// v1 compliant loader, and the regions it references (`mmap_addr`,
/// `mods_addr`) must remain mapped for the duration of this call.
pub unsafe fn parse(
    info: *const RawInfo,
) -> (alloc::vec::Vec<MemoryRegion>, alloc::vec::Vec<ModuleInfo>) {
    let info = &*info;
    let flags = InfoFlags::from_bits_truncate(info.flags);

    let mut regions = alloc::vec::Vec::new();
    if flags.contains(InfoFlags::MMAP) {
        let mut cursor = info.mmap_addr as usize;
        let end = cursor + info.mmap_length as usize;
        while cursor < end {
            let entry = &*(cursor as *const RawMmapEntry);
            regions.push(MemoryRegion {
                base: entry.base_addr,
                length: entry.length,
                ty: MemoryType::from_raw(entry.entry_type),
            });
            // size excludes itself, so the next entry starts 4 bytes
            // (the size field) plus size bytes later.
            cursor += entry.size as usize + core::mem::size_of::<u32>();
        }
    } else if flags.contains(InfoFlags::MEM) {
        regions.push(MemoryRegion {
            base: 0,
            length: (info.mem_lower as u64) * 1024,
            ty: MemoryType::Available,
        });
        regions.push(MemoryRegion {
            base: 0x0010_0000,
            length: (info.mem_upper as u64) * 1024,
            ty: MemoryType::Available,
        });
    }

    let mut modules = alloc::vec::Vec::new();
    if flags.contains(InfoFlags::MODS) {
        let base = info.mods_addr as usize;
        for i in 0..info.mods_count as usize {
            let raw = &*((base + i * core::mem::size_of::<RawModule>()) as *const RawModule);
            modules.push(ModuleInfo {
                start: raw.mod_start,
                end: raw.mod_end,
                cmdline_ptr: raw.string,
            });
        }
    }

    (regions, modules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_type_classification() {
        assert_eq!(MemoryType::from_raw(1), MemoryType::Available);
        assert_eq!(MemoryType::from_raw(2), MemoryType::Reserved(2));
    }

    #[test]
    fn info_flags_round_trip() {
        let flags = InfoFlags::MEM | InfoFlags::MODS | InfoFlags::MMAP;
        assert!(flags.contains(InfoFlags::MEM));
        assert!(flags.contains(InfoFlags::MODS));
        assert!(!flags.contains(InfoFlags::VBE));
    }
}
