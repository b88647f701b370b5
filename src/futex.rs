//! Futex service: wait/wake/wake_op/cmp_requeue on cap-addressable pages
//! (spec §4.8).
//!
//! Grounded on the teacher's `ipc::mqueue` wait-queue primitives, adapted
//! from a port-bound queue to the spec's page-keyed one: waiters are
//! messengers enqueued on the *page object*'s wait queue (see
//! [`crate::messenger::WaitQueue`]) with [`WaitReason::Futex`] and
//! `arg = offset`.

use crate::messenger::{MessengerTable, WaitReason, Waiter};
use crate::types::{MessengerId, Oid};
use alloc::vec::Vec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutexError {
    Inval,
    NotFound,
}

pub type FutexResult<T> = Result<T, FutexError>;

/// Access to the 32-bit word a futex key names. Implemented by
/// `server::Manager` over the object store's frame data.
pub trait PageAccess {
    fn read_u32(&self, oid: Oid, offset: u32) -> FutexResult<u32>;
    fn write_u32(&mut self, oid: Oid, offset: u32, value: u32) -> FutexResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Set,
    Add,
    Or,
    Andn,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareKind {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// `wake_op`'s packed parameter, unpacked per spec §9 ("represent as a
/// struct with explicit fields, not a packed integer").
#[derive(Debug, Clone, Copy)]
pub struct WakeOp {
    pub op: OpKind,
    pub op_arg: u32,
    pub compare: CompareKind,
    pub compare_arg: u32,
}

impl WakeOp {
    fn apply(&self, old: u32) -> u32 {
        match self.op {
            OpKind::Set => self.op_arg,
            OpKind::Add => old.wrapping_add(self.op_arg),
            OpKind::Or => old | self.op_arg,
            OpKind::Andn => old & !self.op_arg,
            OpKind::Xor => old ^ self.op_arg,
        }
    }

    fn compare(&self, old: u32) -> bool {
        match self.compare {
            CompareKind::Eq => old == self.compare_arg,
            CompareKind::Ne => old != self.compare_arg,
            CompareKind::Lt => old < self.compare_arg,
            CompareKind::Le => old <= self.compare_arg,
            CompareKind::Gt => old > self.compare_arg,
            CompareKind::Ge => old >= self.compare_arg,
        }
    }
}

/// `wait`: enqueue the caller's messenger on `(oid, offset)` with
/// `WAIT_FUTEX`.
pub fn wait(messengers: &mut MessengerTable, oid: Oid, offset: u32, caller: MessengerId) {
    messengers.queue(oid).push_back(Waiter { messenger: caller, reason: WaitReason::Futex { offset } });
}

/// `wake`: dequeue up to `n` waiters matching `offset` and reply success to
/// each (the caller drives the actual reply delivery; this returns who to
/// reply to).
pub fn wake(messengers: &mut MessengerTable, oid: Oid, offset: u32, n: usize) -> Vec<MessengerId> {
    messengers
        .queue(oid)
        .drain_matching(n, |r| matches!(r, WaitReason::Futex { offset: o } if *o == offset))
        .into_iter()
        .map(|w| w.messenger)
        .collect()
}

/// `cmp_requeue(oid1, off1, wake_n, requeue_n, oid2, off2, expected)`: if
/// `*oid1@off1 == expected`, wake up to `wake_n` waiters on `(oid1, off1)`
/// and move up to `requeue_n` of the rest to `(oid2, off2)`.
pub fn cmp_requeue<P: PageAccess>(
    page_access: &P,
    messengers: &mut MessengerTable,
    oid1: Oid,
    off1: u32,
    wake_n: usize,
    requeue_n: usize,
    oid2: Oid,
    off2: u32,
    expected: u32,
) -> FutexResult<(Vec<MessengerId>, usize)> {
    let current = page_access.read_u32(oid1, off1)?;
    if current != expected {
        return Ok((Vec::new(), 0));
    }

    let woken = wake(messengers, oid1, off1, wake_n);
    let to_move = messengers
        .queue(oid1)
        .drain_matching(requeue_n, |r| matches!(r, WaitReason::Futex { offset: o } if *o == off1));
    let moved_count = to_move.len();
    for waiter in to_move {
        messengers.queue(oid2).push_back(Waiter {
            messenger: waiter.messenger,
            reason: WaitReason::Futex { offset: off2 },
        });
    }
    Ok((woken, moved_count))
}

/// `wake_op`: apply `op.apply` to `(oid2, off2)`, wake on `(oid1, off1)`,
/// then conditionally wake on `(oid2, off2)` if `op.compare` holds against
/// the *old* value read at `(oid2, off2)`.
pub fn wake_op<P: PageAccess>(
    page_access: &mut P,
    messengers: &mut MessengerTable,
    oid1: Oid,
    off1: u32,
    wake1: usize,
    wake2: usize,
    oid2: Oid,
    off2: u32,
    op: WakeOp,
) -> FutexResult<Vec<MessengerId>> {
    let old = page_access.read_u32(oid2, off2)?;
    let new = op.apply(old);
    page_access.write_u32(oid2, off2, new)?;

    let mut woken = wake(messengers, oid1, off1, wake1);
    if op.compare(old) {
        woken.extend(wake(messengers, oid2, off2, wake2));
    }
    Ok(woken)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;

    struct FakePages(BTreeMap<(Oid, u32), u32>);

    impl PageAccess for FakePages {
        fn read_u32(&self, oid: Oid, offset: u32) -> FutexResult<u32> {
            Ok(self.0.get(&(oid, offset)).copied().unwrap_or(0))
        }
        fn write_u32(&mut self, oid: Oid, offset: u32, value: u32) -> FutexResult<()> {
            self.0.insert((oid, offset), value);
            Ok(())
        }
    }

    #[test]
    fn cmp_requeue_splits_waiters_between_two_queues() {
        let mut pages = FakePages(BTreeMap::new());
        pages.0.insert((1, 0x100), 7);
        let mut messengers = MessengerTable::new();
        for i in 0..5 {
            wait(&mut messengers, 1, 0x100, MessengerId(i));
        }

        let (woken, moved) = cmp_requeue(&pages, &mut messengers, 1, 0x100, 2, 2, 2, 0x200, 7).unwrap();
        assert_eq!(woken.len(), 2);
        assert_eq!(moved, 2);
        assert_eq!(messengers.queue(1).len(), 1);
        assert_eq!(messengers.queue(2).len(), 2);
    }

    #[test]
    fn cmp_requeue_noop_when_value_mismatches() {
        let pages = FakePages(BTreeMap::new());
        let mut messengers = MessengerTable::new();
        wait(&mut messengers, 1, 0, MessengerId(1));
        let (woken, moved) = cmp_requeue(&pages, &mut messengers, 1, 0, 5, 5, 2, 0, 42).unwrap();
        assert!(woken.is_empty());
        assert_eq!(moved, 0);
        assert_eq!(messengers.queue(1).len(), 1);
    }

    #[test]
    fn wake_op_applies_arithmetic_then_conditionally_wakes_second_queue() {
        let mut pages = FakePages(BTreeMap::new());
        pages.0.insert((2, 0), 10);
        let mut messengers = MessengerTable::new();
        wait(&mut messengers, 1, 0, MessengerId(1));
        wait(&mut messengers, 2, 0, MessengerId(2));

        let op = WakeOp { op: OpKind::Add, op_arg: 5, compare: CompareKind::Ge, compare_arg: 10 };
        let woken = wake_op(&mut pages, &mut messengers, 1, 0, 1, 1, 2, 0, op).unwrap();
        assert_eq!(woken.len(), 2);
        assert_eq!(pages.read_u32(2, 0).unwrap(), 15);
    }
}
