//! xskd Core - Queue-indexed AF_XDP dispatch control plane
//!
//! The XDP program in `xskd-ebpf` redirects every frame to the AF_XDP socket
//! bound to the receive queue it arrived on. This crate is everything around
//! it:
//!
//! - **Lifecycle**: load, version check, attach, detach ([`XskProgram`])
//! - **Bindings**: bind/unbind sockets per queue, mirrored in a lock-free
//!   [`DispatchTable`] so they can be enumerated
//! - **Reference counting**: the program's liveness sentinel doubles as its
//!   user count; the last release detaches
//! - **Sharing**: the link and maps are pinned per interface, so a second
//!   process joins the running program instead of replacing it
//! - **Software dispatch**: [`Dispatcher`] runs the kernel's decision
//!   function against the userspace table

pub mod config;
pub mod dispatcher;
pub mod ebpf;
pub mod error;
pub mod iface;
pub mod lock;
pub mod maps;
pub mod pin;
mod sys;
pub mod table;
pub mod version;

pub use config::{XdpMode, XskConfig};
pub use dispatcher::Dispatcher;
pub use ebpf::XskProgram;
pub use error::{Result, XskError};
pub use maps::ProgramMaps;
pub use table::{DispatchTable, SocketHandle};
pub use xskd_ebpf_common::Verdict;
