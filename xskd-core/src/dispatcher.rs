//! Software rendition of the XDP entry routine.
//!
//! Runs the exact decision function compiled into the XDP program against
//! the userspace [`DispatchTable`], with the liveness sentinel held in an
//! atomic instead of the program's `.data` map. Useful wherever frames are
//! steered outside the kernel hook, and as the executable model of the
//! kernel program's behavior.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use xskd_ebpf_common::{dispatch, Verdict, REFCNT_INITIAL};

use crate::table::{DispatchTable, SocketHandle};

pub struct Dispatcher {
    table: Arc<DispatchTable>,
    sentinel: AtomicU32,
}

impl Dispatcher {
    pub fn new(table: Arc<DispatchTable>) -> Self {
        Self {
            table,
            sentinel: AtomicU32::new(REFCNT_INITIAL),
        }
    }

    #[inline]
    pub fn table(&self) -> &Arc<DispatchTable> {
        &self.table
    }

    /// Decide where a frame received on `queue` goes.
    ///
    /// O(1), allocation-free, never blocks. The sentinel is read on every
    /// call.
    #[inline]
    pub fn dispatch(&self, queue: u32) -> Verdict<SocketHandle> {
        let sentinel = self.sentinel.load(Ordering::Acquire);
        dispatch(queue, sentinel, &*self.table)
    }

    #[inline]
    pub fn sentinel(&self) -> u32 {
        self.sentinel.load(Ordering::Acquire)
    }

    /// Overwrite the sentinel. Zero forces pass-through for every queue.
    pub fn set_sentinel(&self, value: u32) {
        self.sentinel.store(value, Ordering::Release);
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(Arc::new(DispatchTable::new()))
    }
}
