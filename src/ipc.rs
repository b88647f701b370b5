//! IPC wire format, message transfer, and the target-blocking state machine
//! (spec §4.6).
//!
//! Grounded on the teacher's `ipc::mach_msg` call-flag parsing and
//! `ipc::message::Message` wire struct, reworked from Mach's typed-message
//! format (descriptors, port rights) into the spec's untyped word array
//! plus at most one inline capability per messenger. The kernel-method
//! dispatch table (spec §4.7) is enumerated here as [`RpcLabel`] but
//! *executed* by `server::Manager::dispatch`, which is the only place with
//! simultaneous access to the store, activity tree, and messenger table
//! every method needs.

use crate::messenger::{MessengerTable, WaitReason, Waiter};
use crate::types::MessengerId;
use crate::cap::Capability;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    WouldBlock,
    InvalidMessenger,
    Malformed,
}

pub type IpcResult<T> = Result<T, IpcError>;

/// Stable numeric labels for the kernel-implemented messenger method table
/// (spec §4.7 [SUPPLEMENT]), in the order §4.7 lists them. `0` is reserved
/// for "no method" / a malformed first word.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcLabel {
    ConsoleWrite = 1,
    ConsoleRead = 2,
    Fault = 3,
    FolioAlloc = 4,
    FolioFree = 5,
    ObjectAlloc = 6,
    FolioPolicy = 7,
    CapCopy = 8,
    CapRubout = 9,
    CapRead = 10,
    ObjectDiscard = 11,
    ObjectClearDiscarded = 12,
    ObjectStatus = 13,
    ObjectName = 14,
    ObjectReplyOnDestruction = 15,
    ThreadExregs = 16,
    ThreadId = 17,
    ThreadActivationCollect = 18,
    ActivityPolicy = 19,
    ActivityInfo = 20,
    Futex = 21,
    AsDump = 22,
    MessengerId = 23,
}

impl RpcLabel {
    pub fn from_wire(word: u16) -> Option<Self> {
        use RpcLabel::*;
        let table = [
            ConsoleWrite, ConsoleRead, Fault, FolioAlloc, FolioFree, ObjectAlloc, FolioPolicy, CapCopy, CapRubout,
            CapRead, ObjectDiscard, ObjectClearDiscarded, ObjectStatus, ObjectName, ObjectReplyOnDestruction,
            ThreadExregs, ThreadId, ThreadActivationCollect, ActivityPolicy, ActivityInfo, Futex, AsDump,
            MessengerId,
        ];
        table.into_iter().find(|label| *label as u16 == word)
    }
}

bitflags::bitflags! {
    /// The IPC call's flag word (spec §4.6: "a large flag word combining
    /// send and receive phases, each ... optional, nonblocking-optional,
    /// activating-optional").
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IpcFlags: u32 {
        const RECEIVE          = 1 << 0;
        const SEND              = 1 << 1;
        const RECEIVE_NONBLOCK  = 1 << 2;
        const SEND_NONBLOCK     = 1 << 3;
        const RETURN             = 1 << 4;
    }
}

/// The inline payload a messenger carries (spec §3: "inline data area ≤2
/// words + ≤1 cap").
#[derive(Debug, Clone, Copy, Default)]
pub struct InlinePayload {
    pub words: [u64; 2],
    pub cap: Capability,
}

/// Outcome of attempting to transfer a message into a target messenger
/// (spec §4.6 "Message transfer").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Delivered immediately; target is now blocked again.
    Delivered { activate_receiver: bool, activate_sender: bool },
    /// Target was blocked; sender enqueued to wait.
    Enqueued,
}

/// Move `payload` from `sender` to `target` (spec §4.6 "Message transfer",
/// "Target blocking state machine"). Capability-address resolution in
/// either party's address space (slot lookup + `cap_copy` with
/// writability checks) is the caller's responsibility — this function only
/// moves already-resolved inline words/caps and flips blocking state.
pub fn transfer(
    messengers: &mut MessengerTable,
    sender: MessengerId,
    target: MessengerId,
    payload: InlinePayload,
    nonblocking: bool,
) -> IpcResult<TransferOutcome> {
    let target_blocked = messengers.get(target)?.blocked;
    if target_blocked {
        if nonblocking {
            return Err(IpcError::WouldBlock);
        }
        messengers
            .queue(target.0)
            .push_back(Waiter { messenger: sender, reason: WaitReason::TransferMessage });
        return Ok(TransferOutcome::Enqueued);
    }

    let target_messenger = messengers.get_mut(target)?;
    target_messenger.inline_words = payload.words;
    target_messenger.inline_cap = payload.cap;
    // Transfer into T when unblocked -> blocked (spec §4.6).
    target_messenger.blocked = true;
    let activate_receiver = target_messenger.activate_on_receive;
    let activate_sender = messengers.get(sender)?.activate_on_send;

    Ok(TransferOutcome::Delivered { activate_receiver, activate_sender })
}

/// `messenger_unblock` dequeues one pending sender (if any) and retries the
/// transfer immediately (spec §4.6 "Explicit messenger_unblock -> unblocked
/// + drain one pending sender").
pub fn unblock_and_drain(messengers: &mut MessengerTable, target: MessengerId, payload_of: impl FnOnce(MessengerId) -> InlinePayload) -> IpcResult<Option<TransferOutcome>> {
    let drained = messengers.unblock(target.0, target)?;
    match drained {
        Some(waiter) => {
            let payload = payload_of(waiter.messenger);
            Ok(Some(transfer(messengers, waiter.messenger, target, payload, false)?))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_label_round_trips_through_wire_encoding() {
        assert_eq!(RpcLabel::from_wire(1), Some(RpcLabel::ConsoleWrite));
        assert_eq!(RpcLabel::from_wire(21), Some(RpcLabel::Futex));
        assert_eq!(RpcLabel::from_wire(0), None);
    }

    #[test]
    fn transfer_into_unblocked_target_delivers_and_reblocks() {
        let mut messengers = MessengerTable::new();
        messengers.insert(MessengerId(1), crate::messenger::Messenger::new());
        messengers.insert(MessengerId(2), crate::messenger::Messenger::new());
        messengers.get_mut(MessengerId(2)).unwrap().blocked = false;

        let outcome = transfer(&mut messengers, MessengerId(1), MessengerId(2), InlinePayload::default(), false).unwrap();
        assert!(matches!(outcome, TransferOutcome::Delivered { .. }));
        assert!(messengers.get(MessengerId(2)).unwrap().blocked);
    }

    #[test]
    fn transfer_into_blocked_target_enqueues_unless_nonblocking() {
        let mut messengers = MessengerTable::new();
        messengers.insert(MessengerId(1), crate::messenger::Messenger::new());
        messengers.insert(MessengerId(2), crate::messenger::Messenger::new());

        let outcome = transfer(&mut messengers, MessengerId(1), MessengerId(2), InlinePayload::default(), false).unwrap();
        assert_eq!(outcome, TransferOutcome::Enqueued);

        let err = transfer(&mut messengers, MessengerId(1), MessengerId(2), InlinePayload::default(), true).unwrap_err();
        assert_eq!(err, IpcError::WouldBlock);
    }
}
