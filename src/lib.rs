//! vgmanager - a paged, capability-indexed resource manager
//!
//! This crate is the sole source of storage, address-space structure, and
//! memory-scheduling policy for every task running above a minimalist
//! message-passing kernel. Clients never touch physical frames directly;
//! they hold capabilities that name kernel-managed objects and invoke this
//! manager to allocate, copy, revoke, and page those objects.

#![no_std]
#![cfg_attr(not(test), no_main)]
#![allow(dead_code)]
// The manager's objects are always constructed with an explicit owning
// activity and type; a blanket `Default` would hide that requirement.
#![allow(clippy::new_without_default)]
#![allow(clippy::identity_op)]
#![allow(clippy::large_enum_variant)]
#![allow(clippy::result_large_err)]

extern crate alloc;

pub mod activation;
pub mod activity;
pub mod boot;
pub mod cap;
pub mod console;
pub mod error;
pub mod futex;
pub mod heap;
pub mod ipc;
pub mod messenger;
pub mod pager;
pub mod panic;
pub mod server;
pub mod store;
pub mod types;
pub mod zone;

/// Manager version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Manager name
pub const NAME: &str = "vgmanager";

/// Bring up every subsystem in dependency order and hand back the single
/// owning [`server::Manager`] the dispatch loop will hold the global lock
/// around. Grounded on the teacher's `mach_r::init` bring-up order (zalloc
/// before ipc before task), generalized to this crate's module set.
pub fn init(reservations: boot::MemoryMap) -> server::Manager {
    console::init();
    let zone = zone::ZoneAllocator::from_memory_map(&reservations);
    server::Manager::new(zone)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(NAME, "vgmanager");
        assert!(!VERSION.is_empty());
    }
}
