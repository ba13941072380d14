//! xskd XDP Program - Queue-indexed AF_XDP dispatch
//!
//! Runs at the XDP hook (earliest point of the receive path) and steers each
//! frame to the AF_XDP socket bound to the hardware queue it arrived on.
//!
//! # Design Principles
//!
//! - **Fail-Open**: No bound socket, a zero sentinel, or a failed redirect all
//!   end in XDP_PASS
//! - **No Parsing**: The decision depends only on `rx_queue_index`
//! - **O(1)**: One sentinel read and one XSKMAP lookup per frame
//!
//! # Packet Flow
//!
//! ```text
//! NIC queue N → XDP Hook → REFCNT? → XSKS_MAP[N] → Action
//!                             │           │
//!                          0 → XDP_PASS   ├─ bound   → XDP_REDIRECT (AF_XDP socket)
//!                                         └─ unbound → XDP_PASS (kernel stack)
//! ```

#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::xdp_action,
    macros::{map, xdp},
    maps::XskMap,
    programs::XdpContext,
};
use core::ptr;
use xskd_ebpf_common::{dispatch, QueueLookup, Verdict, DEFAULT_QUEUE_IDS, REFCNT_INITIAL};

// ============================================================================
// BPF MAPS AND GLOBALS
// ============================================================================

/// Bound AF_XDP sockets.
///
/// Key: receive queue index
/// Value: AF_XDP socket (written by userspace as a file descriptor)
///
/// The loader resizes this to the interface's queue count before load.
#[map]
static XSKS_MAP: XskMap = XskMap::with_max_entries(DEFAULT_QUEUE_IDS, 0);

/// Program reference count, doubling as the liveness sentinel.
///
/// Must stay the only initialised mutable global so that it sits at offset
/// zero of the `.data` map, where the control plane expects it.
#[no_mangle]
static mut REFCNT: u32 = REFCNT_INITIAL;

/// Dispatch logic revision, read by tooling straight from the object file.
#[no_mangle]
#[used]
#[link_section = "xdp_metadata"]
static XSK_PROG_VERSION: u32 = xskd_ebpf_common::XSK_PROG_VERSION;

#[no_mangle]
#[link_section = "license"]
pub static LICENSE: [u8; 4] = *b"GPL\0";

/// Kernel-side view of the dispatch table.
///
/// The handle is the XSKMAP slot itself: the socket behind it is only ever
/// touched by `bpf_redirect_map`.
struct KernelTable<'a>(&'a XskMap);

impl QueueLookup for KernelTable<'_> {
    type Handle = u32;

    #[inline(always)]
    fn lookup(&self, queue: u32) -> Option<u32> {
        self.0.get(queue).map(|_| queue)
    }
}

// ============================================================================
// XDP PROGRAM ENTRY POINT
// ============================================================================

#[xdp]
pub fn xsk_def_prog(ctx: XdpContext) -> u32 {
    match try_dispatch(&ctx) {
        Ok(action) => action,
        Err(_) => xdp_action::XDP_PASS,
    }
}

#[inline(always)]
fn try_dispatch(ctx: &XdpContext) -> Result<u32, ()> {
    // SAFETY: ctx.ctx is the xdp_md the kernel handed us.
    let queue = unsafe { (*ctx.ctx).rx_queue_index };

    // Volatile so the read survives optimisation on every invocation.
    // SAFETY: aligned global, only written from userspace via the .data map.
    let sentinel = unsafe { ptr::read_volatile(ptr::addr_of!(REFCNT)) };

    match dispatch(queue, sentinel, &KernelTable(&XSKS_MAP)) {
        Verdict::Redirect(slot) => XSKS_MAP.redirect(slot, 0).map_err(|_| ()),
        Verdict::Pass => Ok(xdp_action::XDP_PASS),
    }
}

// ============================================================================
// PANIC HANDLER (Required for #![no_std])
// ============================================================================

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    // The verifier rejects any reachable panic path
    loop {}
}
