//! Thread activation (upcall) protocol and page-fault resolution (spec
//! §4.7).
//!
//! Grounded on the teacher's `kern::activation` (Mach's thread activation
//! records), reworked from Mach's RPC-return-oriented activation stack
//! into the spec's explicit-state model: all activation state lives in the
//! thread's UTCB, never on a native call stack (spec §9 "Modeled as
//! explicit state saved in UTCB. Do not attempt to use stack unwinding").

use crate::cap::translate::{as_lookup, Container, ReturnMode};
use crate::cap::{CapResult, CapType, Capability};
use crate::types::ThreadId;

/// The activation-handler entry span a thread registers: activations
/// restart the thread at `ip` with stack `sp`; `end` bounds the handler's
/// own prologue so re-entrant activations can be detected (spec §4.7).
#[derive(Debug, Clone, Copy, Default)]
pub struct ActivationHandler {
    pub ip: u64,
    pub sp: u64,
    pub end: u64,
}

/// A thread's current machine registers, as read by the kernel
/// cross-register query (spec §4.7 step 1). The actual query mechanism is
/// an external collaborator; callers supply the snapshot. `eflags` and
/// `user_handle` round out spec §3's thread descriptor
/// ("saved {sp, ip, eflags, user_handle}") beyond the `sp`/`ip` pair the
/// activation algorithm itself reads and writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRegisters {
    pub sp: u64,
    pub ip: u64,
    pub eflags: u64,
    pub user_handle: u64,
}

/// Per-thread control block (spec §3 "thread", §4.7 "UTCB").
#[derive(Debug, Clone)]
pub struct Utcb {
    pub handler: ActivationHandler,
    pub saved: ThreadRegisters,
    pub pending_message: bool,
    pub inline_words: [u64; 2],
    pub inline_cap: Capability,
    pub activated_mode: bool,
    pub interrupt_in_transition: bool,
    pub alt_stack: u64,
}

impl Utcb {
    pub fn new() -> Self {
        Self {
            handler: ActivationHandler::default(),
            saved: ThreadRegisters::default(),
            pending_message: false,
            inline_words: [0; 2],
            inline_cap: Capability::VOID,
            activated_mode: false,
            interrupt_in_transition: false,
            alt_stack: 0,
        }
    }
}

impl Default for Utcb {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of delivering a message to a thread (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The thread is already mid-activation; the message was queued on the
    /// UTCB's pending flag instead (the messenger itself stays enqueued on
    /// the thread with `WAIT_TRANSFER_MESSAGE` — the caller handles that
    /// enqueue since it owns the messenger table).
    QueuedPending,
    /// The thread should be restarted at `(ip, sp)`.
    Activated { ip: u64, sp: u64 },
}

/// Deliver a message's inline payload to thread `T` (spec §4.7 steps 1-4).
pub fn deliver(utcb: &mut Utcb, current: ThreadRegisters, inline_words: [u64; 2], inline_cap: Capability) -> DeliveryOutcome {
    if utcb.activated_mode {
        utcb.pending_message = true;
        return DeliveryOutcome::QueuedPending;
    }

    utcb.inline_words = inline_words;
    utcb.inline_cap = inline_cap;

    let ip_in_handler_span = current.ip >= utcb.handler.ip && current.ip < utcb.handler.end;
    if ip_in_handler_span {
        utcb.interrupt_in_transition = true;
    } else {
        utcb.saved = current;
    }
    utcb.activated_mode = true;

    DeliveryOutcome::Activated { ip: utcb.handler.ip, sp: utcb.handler.sp }
}

/// Clear activation state once the thread's upcall handler has run to
/// completion and the thread is ready for ordinary scheduling again.
pub fn collect(utcb: &mut Utcb) -> bool {
    let had_pending = utcb.pending_message;
    utcb.activated_mode = false;
    utcb.interrupt_in_transition = false;
    utcb.pending_message = false;
    had_pending
}

/// A synthesized page-fault message, delivered to the faulting thread's
/// exception messenger as an activation (spec §4.7, §7 "Faults ... are
/// delivered as activations, never as panics").
#[derive(Debug, Clone, Copy)]
pub struct FaultMessage {
    pub thread: ThreadId,
    pub address: u64,
    pub write_access: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum FaultOutcome {
    Granted { writable: bool },
    Fault(FaultMessage),
}

/// Resolve a page fault by walking `root`'s address space (spec §4.7
/// "Page faults"). Grants read, or read+write if the leaf is a strong
/// `page` capability and the access was a write; a weak `rpage` never
/// grants write. Any translation failure (void slot, discarded page) is
/// reported as a fault to be delivered to the thread.
pub fn resolve_fault<C: Container>(
    ctx: &mut C,
    thread: ThreadId,
    root: Capability,
    address: u64,
    write_access: bool,
) -> FaultOutcome {
    let lookup: CapResult<Capability> = as_lookup(ctx, root, address, ReturnMode::WantObject);
    match lookup {
        Ok(cap) if cap.ty == CapType::Page => FaultOutcome::Granted { writable: write_access },
        Ok(cap) if cap.ty == CapType::RPage => FaultOutcome::Granted { writable: false },
        _ => FaultOutcome::Fault(FaultMessage { thread, address, write_access }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario D (spec §8): thread at ip=0x8000/sp=0x9000, handler at
    /// 0x1000, not yet activated; deliver a message.
    #[test]
    fn scenario_d_thread_activation() {
        let mut utcb = Utcb::new();
        utcb.handler = ActivationHandler { ip: 0x1000, sp: 0x4000, end: 0x1100 };
        let current = ThreadRegisters { ip: 0x8000, sp: 0x9000, ..ThreadRegisters::default() };

        let outcome = deliver(&mut utcb, current, [1, 2], Capability::VOID);

        assert_eq!(outcome, DeliveryOutcome::Activated { ip: 0x1000, sp: 0x4000 });
        assert_eq!(utcb.saved.ip, 0x8000);
        assert_eq!(utcb.saved.sp, 0x9000);
        assert!(utcb.activated_mode);
        assert_eq!(utcb.inline_words, [1, 2]);
    }

    #[test]
    fn second_delivery_while_activated_queues_pending_instead_of_restarting() {
        let mut utcb = Utcb::new();
        utcb.handler = ActivationHandler { ip: 0x1000, sp: 0x4000, end: 0x1100 };
        let current = ThreadRegisters { ip: 0x8000, sp: 0x9000, ..ThreadRegisters::default() };
        deliver(&mut utcb, current, [0, 0], Capability::VOID);

        let outcome = deliver(&mut utcb, ThreadRegisters { ip: 0x1000, sp: 0x4000, ..ThreadRegisters::default() }, [9, 9], Capability::VOID);
        assert_eq!(outcome, DeliveryOutcome::QueuedPending);
        assert!(utcb.pending_message);
    }

    #[test]
    fn delivery_while_inside_handler_span_sets_interrupt_in_transition() {
        let mut utcb = Utcb::new();
        utcb.handler = ActivationHandler { ip: 0x1000, sp: 0x4000, end: 0x1100 };
        utcb.activated_mode = false;
        let current = ThreadRegisters { ip: 0x1050, sp: 0x4080, ..ThreadRegisters::default() };
        deliver(&mut utcb, current, [0, 0], Capability::VOID);
        assert!(utcb.interrupt_in_transition);
    }
}
