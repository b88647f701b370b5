//! Manager binary entry point (spec §6 "Boot-time input" /
//! "Boot-time output and CLI").
//!
//! Grounded on the teacher's `arch::x86_64::boot` module: a minimal
//! `global_asm!` stub sets up a stack and calls into a `kmain` with the
//! boot protocol's two registers as arguments, exactly the shape the
//! teacher uses for its Multiboot2/long-mode entry — simplified here to
//! Multiboot v1's 32-bit protocol (spec §6 names Multiboot v1 byte-exact
//! layout, not v2/long-mode), so the page-table and long-mode transition
//! code the teacher needs for a higher-half 64-bit kernel does not apply.

#![no_std]
#![no_main]

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use core::arch::global_asm;
use core::panic::PanicInfo;

use vgmanager::boot::{self, multiboot, BootConfig, ExitAction, MemoryMap, OutputDriver};
use vgmanager::{console, heap};

const BOOT_STACK_SIZE: usize = 0x4000;
/// Early heap for the manager's own arena/table allocations (`heap.rs`),
/// placed just past a conservative low-memory reservation (spec §5
/// "Resource reservation", `ReservationKind::Init`).
const HEAP_START: usize = 0x0020_0000;
const HEAP_SIZE: usize = 0x0100_0000;

global_asm!(
    ".section .bss",
    ".align 16",
    "boot_stack_bottom:",
    ".skip {stack_size}",
    "boot_stack_top:",
    stack_size = const BOOT_STACK_SIZE,
);

// Multiboot v1 header: no load-address fields (ELF is used as-is), no
// alignment requirement beyond what the assembler already gives this
// section.
global_asm!(
    ".section .multiboot",
    ".align 4",
    "multiboot_header_start:",
    "    .long {magic}",
    "    .long 0",
    "    .long -({magic} + 0)",
    magic = const multiboot::MULTIBOOT_BOOTLOADER_MAGIC,
);

global_asm!(
    ".section .text",
    ".global _start",
    "_start:",
    "    mov esp, offset boot_stack_top",
    "    push ebx", // Multiboot info pointer: kmain's 2nd argument
    "    push eax", // Multiboot magic: kmain's 1st argument
    "    call kmain",
    "2:",
    "    hlt",
    "    jmp 2b",
);

/// Called from the `_start` stub in 32-bit mode with the Multiboot v1
/// registers still in their boot-time convention (spec §6).
#[no_mangle]
pub extern "C" fn kmain(magic: u32, info_addr: u32) -> ! {
    if magic != multiboot::MULTIBOOT_BOOTLOADER_MAGIC {
        loop {
            core::hint::spin_loop();
        }
    }

    // The manager's arena/table allocations need `alloc` before anything
    // else (console installation boxes a driver).
    unsafe {
        heap::init(HEAP_START, HEAP_SIZE);
    }

    let raw = info_addr as *const multiboot::RawInfo;
    let (regions, modules) = unsafe { multiboot::parse(raw) };
    let flags = multiboot::InfoFlags::from_bits_truncate(unsafe { (*raw).flags });
    let cmdline = if flags.contains(multiboot::InfoFlags::CMDLINE) {
        unsafe { boot::cstr_at((*raw).cmdline) }
    } else {
        String::new()
    };
    let config = BootConfig::parse(&cmdline);

    match config.output {
        OutputDriver::Serial => console::init(),
        OutputDriver::Vga => console::install(Box::new(console::VgaDriver::new())),
    }

    vgmanager::println!("\n=== {} v{} ===", vgmanager::NAME, vgmanager::VERSION);
    if config.show_version {
        vgmanager::println!("{} {}", vgmanager::NAME, vgmanager::VERSION);
    }
    if config.show_help || config.show_usage {
        vgmanager::println!("usage: --output {{serial,vga}} --debug --halt|--reboot");
    }

    vgmanager::print!("[INIT] Zone allocator... ");
    let memory_map = MemoryMap { regions, modules };
    let manager = vgmanager::init(memory_map);
    vgmanager::println!("OK");

    vgmanager::println!("manager ready, awaiting root server.");
    let _ = manager;

    match config.exit_action {
        ExitAction::IdleHalt => loop {
            core::hint::spin_loop();
        },
        ExitAction::TripleFaultReboot => trigger_triple_fault(),
    }
}

/// Load a deliberately malformed IDT limit of 0 and `int3`, forcing a
/// triple fault, the conventional x86 software reboot when no ACPI/8042
/// reset line is available (spec §6 `--reboot`).
fn trigger_triple_fault() -> ! {
    #[repr(C, packed)]
    struct NullIdtr {
        limit: u16,
        base: u32,
    }
    let idtr = NullIdtr { limit: 0, base: 0 };
    unsafe {
        core::arch::asm!("lidt [{0}]", in(reg) &idtr);
        core::arch::asm!("int3");
    }
    loop {
        core::hint::spin_loop();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    vgmanager::panic::kernel_panic(info);
}
