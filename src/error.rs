//! Crate-wide error unification.
//!
//! Every subsystem exposes its own small `Result` alias (`cap::CapResult`,
//! `store::folio::FolioResult`, ...), the way the teacher's `ipc::IpcError`/
//! `ipc::IpcResult` pair does. [`RmError`] unifies them for the server
//! dispatch loop, which only ever needs one thing: the errno to put in the
//! reply's first word (spec §7).

use crate::activity::ActivityError;
use crate::cap::CapError;
use crate::futex::FutexError;
use crate::ipc::IpcError;
use crate::store::folio::FolioError;

/// Manager-wide error, covering every RPC-visible failure mode from spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmError {
    /// Address translation hit a void slot, a version mismatch, or a stale
    /// pointer.
    NoEnt,
    /// A write was attempted through a weak (read-only) capability.
    Perm,
    /// Type mismatch, out-of-range index, or reserved bits set.
    Inval,
    /// Receive/send against a blocked peer with the nonblocking flag set.
    WouldBlock,
    /// Folio quota exceeded, or frame allocation failed even after the pager ran.
    NoMem,
    /// Synthesized only by the idle-probe watchdog when it suspects a futex
    /// deadlock; never returned by ordinary request handling.
    DeadLk,
    /// Reported to a messenger still queued on an object that was torn
    /// down for a reason other than `WAIT_DESTROY` (spec §4.3, §7).
    Fault,
}

pub type RmResult<T> = Result<T, RmError>;

impl RmError {
    /// The positive errno placed in an RPC reply's first word; 0 means success.
    pub const fn as_errno(self) -> u32 {
        match self {
            RmError::NoEnt => 2,
            RmError::Perm => 1,
            RmError::Inval => 22,
            RmError::WouldBlock => 11,
            RmError::NoMem => 12,
            RmError::DeadLk => 35,
            RmError::Fault => 14,
        }
    }
}

impl From<CapError> for RmError {
    fn from(e: CapError) -> Self {
        match e {
            CapError::Invalid | CapError::StaleVersion => RmError::NoEnt,
            CapError::WeakWrite => RmError::Perm,
            CapError::Malformed | CapError::DepthExceeded => RmError::Inval,
            CapError::SynthesizedSlot => RmError::Inval,
        }
    }
}

impl From<FolioError> for RmError {
    fn from(e: FolioError) -> Self {
        match e {
            FolioError::QuotaExceeded | FolioError::OutOfMemory => RmError::NoMem,
            FolioError::BadIndex => RmError::Inval,
        }
    }
}

impl From<IpcError> for RmError {
    fn from(e: IpcError) -> Self {
        match e {
            IpcError::WouldBlock => RmError::WouldBlock,
            IpcError::InvalidMessenger => RmError::NoEnt,
            IpcError::Malformed => RmError::Inval,
        }
    }
}

impl From<FutexError> for RmError {
    fn from(e: FutexError) -> Self {
        match e {
            FutexError::Inval => RmError::Inval,
            FutexError::NotFound => RmError::NoEnt,
        }
    }
}

impl From<ActivityError> for RmError {
    fn from(e: ActivityError) -> Self {
        match e {
            ActivityError::NotFound => RmError::NoEnt,
            ActivityError::RootUndestroyable | ActivityError::CounterUnderflow => RmError::Inval,
        }
    }
}
