//! Userspace dispatch table.
//!
//! The kernel XSKMAP cannot be read back from userspace, so the control
//! plane keeps this table as the authoritative record of which socket is
//! bound to which receive queue. It doubles as the backing store of the
//! software [`Dispatcher`](crate::dispatcher::Dispatcher).
//!
//! # Layout
//!
//! ```text
//! slot[q]: AtomicU64
//! ┌──────────────────┬──────────────────┐
//! │ bound flag (32b) │ raw fd (32b)     │   0 == unbound
//! └──────────────────┴──────────────────┘
//! ```
//!
//! One word per queue gives lock-free reads and atomic single-key updates: a
//! reader racing a bind/unbind sees either the old or the new handle.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

use xskd_ebpf_common::{QueueLookup, DEFAULT_QUEUE_IDS};

use crate::error::{Result, XskError};

const EMPTY: u64 = 0;
const BOUND: u64 = 1 << 32;

/// Opaque reference to a bound AF_XDP socket.
///
/// Only ever handed to the redirect/bind primitive, never interpreted.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketHandle(RawFd);

impl SocketHandle {
    /// Wrap the raw file descriptor of an AF_XDP socket.
    #[inline]
    pub const fn from_raw_fd(fd: RawFd) -> Self {
        Self(fd)
    }

    #[inline]
    fn encode(self) -> u64 {
        BOUND | u64::from(self.0 as u32)
    }

    #[inline]
    fn decode(word: u64) -> Option<Self> {
        if word == EMPTY {
            None
        } else {
            Some(Self(word as u32 as RawFd))
        }
    }
}

impl AsRawFd for SocketHandle {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Fixed-capacity queue index to socket mapping.
pub struct DispatchTable {
    slots: Box<[AtomicU64]>,
}

impl DispatchTable {
    /// Create a table with [`DEFAULT_QUEUE_IDS`] slots.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_IDS)
    }

    pub fn with_capacity(capacity: u32) -> Self {
        let slots = (0..capacity).map(|_| AtomicU64::new(EMPTY)).collect();
        Self { slots }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Socket bound to `queue`, if any. Out-of-range queues are unbound.
    #[inline]
    pub fn lookup(&self, queue: u32) -> Option<SocketHandle> {
        let slot = self.slots.get(queue as usize)?;
        SocketHandle::decode(slot.load(Ordering::Acquire))
    }

    /// Bind `handle` to `queue`, returning the handle it replaced.
    ///
    /// Queues at or beyond the capacity are rejected and leave every
    /// existing entry untouched.
    pub fn bind(&self, queue: u32, handle: SocketHandle) -> Result<Option<SocketHandle>> {
        let slot = self.slot(queue)?;
        Ok(SocketHandle::decode(slot.swap(handle.encode(), Ordering::AcqRel)))
    }

    /// Remove the binding for `queue`, returning the handle it held.
    pub fn unbind(&self, queue: u32) -> Option<SocketHandle> {
        let slot = self.slots.get(queue as usize)?;
        SocketHandle::decode(slot.swap(EMPTY, Ordering::AcqRel))
    }

    /// Snapshot of all current bindings in queue order.
    ///
    /// Each entry is read atomically; the snapshot as a whole is not.
    pub fn bindings(&self) -> Vec<(u32, SocketHandle)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(queue, slot)| {
                SocketHandle::decode(slot.load(Ordering::Acquire)).map(|h| (queue as u32, h))
            })
            .collect()
    }

    /// Number of bound queues.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.load(Ordering::Relaxed) != EMPTY)
            .count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail with [`XskError::CapacityExceeded`] unless `queue` has a slot.
    #[inline]
    pub fn check_queue(&self, queue: u32) -> Result<()> {
        self.slot(queue).map(|_| ())
    }

    #[inline]
    fn slot(&self, queue: u32) -> Result<&AtomicU64> {
        self.slots
            .get(queue as usize)
            .ok_or(XskError::CapacityExceeded {
                queue,
                capacity: self.capacity(),
            })
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("capacity", &self.capacity())
            .field("bindings", &self.bindings())
            .finish()
    }
}

impl QueueLookup for DispatchTable {
    type Handle = SocketHandle;

    #[inline(always)]
    fn lookup(&self, queue: u32) -> Option<SocketHandle> {
        DispatchTable::lookup(self, queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    fn h(fd: RawFd) -> SocketHandle {
        SocketHandle::from_raw_fd(fd)
    }

    #[test]
    fn test_default_capacity() {
        let table = DispatchTable::default();
        assert_eq!(table.capacity(), DEFAULT_QUEUE_IDS);
        assert!(table.is_empty());
    }

    #[test]
    fn test_bind_lookup_unbind() {
        let table = DispatchTable::new();
        assert_eq!(table.bind(2, h(10)).unwrap(), None);
        assert_eq!(table.lookup(2), Some(h(10)));
        assert_eq!(table.lookup(3), None);

        assert_eq!(table.unbind(2), Some(h(10)));
        assert_eq!(table.lookup(2), None);
        assert_eq!(table.unbind(2), None);
    }

    #[test]
    fn test_rebind_returns_previous() {
        let table = DispatchTable::new();
        table.bind(4, h(7)).unwrap();
        assert_eq!(table.bind(4, h(8)).unwrap(), Some(h(7)));
        assert_eq!(table.lookup(4), Some(h(8)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_fd_zero_is_a_valid_handle() {
        let table = DispatchTable::new();
        table.bind(0, h(0)).unwrap();
        assert_eq!(table.lookup(0), Some(h(0)));
    }

    #[test]
    fn test_capacity_boundary() {
        let table = DispatchTable::new();
        for queue in 0..DEFAULT_QUEUE_IDS {
            table.bind(queue, h(100 + queue as RawFd)).unwrap();
        }

        let err = table.bind(DEFAULT_QUEUE_IDS, h(999)).unwrap_err();
        assert!(matches!(
            err,
            XskError::CapacityExceeded { queue: 64, capacity: 64 }
        ));

        assert_eq!(table.len(), DEFAULT_QUEUE_IDS as usize);
        for queue in 0..DEFAULT_QUEUE_IDS {
            assert_eq!(table.lookup(queue), Some(h(100 + queue as RawFd)));
        }
    }

    #[test]
    fn test_check_queue() {
        let table = DispatchTable::with_capacity(4);
        assert!(table.check_queue(3).is_ok());
        assert!(matches!(
            table.check_queue(4),
            Err(XskError::CapacityExceeded { queue: 4, capacity: 4 })
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn test_bindings_in_queue_order() {
        let table = DispatchTable::with_capacity(8);
        table.bind(5, h(50)).unwrap();
        table.bind(1, h(10)).unwrap();
        assert_eq!(table.bindings(), vec![(1, h(10)), (5, h(50))]);
    }

    #[test]
    fn test_concurrent_same_key_never_torn() {
        let table = Arc::new(DispatchTable::new());
        let done = Arc::new(AtomicBool::new(false));
        let (a, b) = (h(0x1111_1111), h(0x2222_2222));
        table.bind(3, a).unwrap();

        let writer = {
            let table = Arc::clone(&table);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                for i in 0..50_000 {
                    match i % 3 {
                        0 => table.bind(3, b).unwrap(),
                        1 => table.bind(3, a).unwrap(),
                        _ => table.unbind(3),
                    };
                }
                done.store(true, Ordering::Release);
            })
        };

        while !done.load(Ordering::Acquire) {
            match table.lookup(3) {
                None => {}
                Some(seen) => assert!(seen == a || seen == b, "torn handle {seen:?}"),
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_concurrent_other_key_unaffected() {
        let table = Arc::new(DispatchTable::new());
        table.bind(0, h(42)).unwrap();

        let writer = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for i in 0..10_000 {
                    table.bind(1, h(i)).unwrap();
                    table.unbind(1);
                }
            })
        };

        for _ in 0..10_000 {
            assert_eq!(table.lookup(0), Some(h(42)));
        }
        writer.join().unwrap();
        assert_eq!(table.lookup(0), Some(h(42)));
    }
}
