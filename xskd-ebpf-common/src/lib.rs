//! xskd eBPF Common - Shared kernel/userspace definitions
//!
//! This crate holds everything the XDP dispatcher and its userspace control
//! plane must agree on: map and symbol names, the version tag, the dispatch
//! table capacity, and the per-packet decision function itself.
//!
//! # Decision Flow
//!
//! ```text
//! rx_queue_index ──► sentinel == 0 ? ──yes──► Pass
//!                          │
//!                          no
//!                          ▼
//!                   lookup(queue) ──None──► Pass
//!                          │
//!                        Some(h)
//!                          ▼
//!                     Redirect(h)
//! ```
//!
//! The same [`dispatch`] function is compiled into the XDP program (backed by
//! the kernel XSKMAP) and into the userspace `Dispatcher` (backed by an
//! in-memory table), so both make bit-for-bit identical decisions.

#![cfg_attr(not(test), no_std)]

/// Version of the dispatch logic embedded in the `xdp_metadata` section.
///
/// Bump whenever the decision logic or map layout changes so that tooling
/// can tell a stale attached program from a current one.
pub const XSK_PROG_VERSION: u32 = 1;

/// Default number of dispatch table slots.
/// Covers the largest receive-queue count expected on a single NIC.
pub const DEFAULT_QUEUE_IDS: u32 = 64;

/// Initial value of the liveness sentinel (one user: the loader).
pub const REFCNT_INITIAL: u32 = 1;

/// XDP program name - must match the function carrying `#[xdp]`.
pub const XDP_PROGRAM_NAME: &str = "xsk_def_prog";

/// ELF section carrying the version tag.
pub const METADATA_SECTION: &str = "xdp_metadata";

/// BPF object symbol names - must match exactly between kernel and userspace.
pub mod symbols {
    /// XSKMAP of bound AF_XDP sockets, keyed by queue index
    pub const XSKS_MAP: &str = "XSKS_MAP";
    /// Liveness sentinel / program reference count (lives in `.data`)
    pub const REFCNT: &str = "REFCNT";
    /// Version tag symbol inside [`super::METADATA_SECTION`]
    pub const XSK_PROG_VERSION: &str = "XSK_PROG_VERSION";
    /// Global data map aya creates for initialised mutable statics
    pub const DATA_MAP: &str = ".data";
}

/// Outcome of one dispatch decision.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(any(test, feature = "userspace"), derive(Debug))]
pub enum Verdict<H> {
    /// Deliver the frame to the bound socket.
    Redirect(H),
    /// Let the frame continue through the regular stack.
    Pass,
}

impl<H> Verdict<H> {
    #[inline(always)]
    pub fn is_redirect(&self) -> bool {
        matches!(self, Verdict::Redirect(_))
    }
}

/// Read side of a dispatch table.
///
/// Implementations must answer in constant time without blocking,
/// allocating, or recursing. A missing key is the normal "no socket bound"
/// state and is reported as `None`.
pub trait QueueLookup {
    /// Opaque token handed to the redirect primitive.
    type Handle: Copy;

    fn lookup(&self, queue: u32) -> Option<Self::Handle>;
}

/// Per-packet dispatch decision.
///
/// `sentinel` must be read by the caller on every invocation. A zero value
/// means the program is awaiting detach and forces [`Verdict::Pass`]
/// regardless of the table contents.
#[inline(always)]
pub fn dispatch<L: QueueLookup>(queue: u32, sentinel: u32, table: &L) -> Verdict<L::Handle> {
    if sentinel == 0 {
        return Verdict::Pass;
    }

    match table.lookup(queue) {
        Some(handle) => Verdict::Redirect(handle),
        None => Verdict::Pass,
    }
}
