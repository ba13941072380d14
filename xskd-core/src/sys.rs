//! Raw `bpf(2)` commands that aya does not expose for XSKMAP.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd};

const BPF_MAP_DELETE_ELEM: libc::c_int = 3;

/// Leading fields of `union bpf_attr` used by the map element commands.
#[repr(C)]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

/// Delete `key` from the map behind `map`.
///
/// Deleting an empty in-range XSKMAP slot succeeds.
pub(crate) fn map_delete_elem(map: BorrowedFd<'_>, key: u32) -> io::Result<()> {
    let attr = MapElemAttr {
        map_fd: map.as_raw_fd() as u32,
        _pad: 0,
        key: &key as *const u32 as u64,
        value: 0,
        flags: 0,
    };

    // SAFETY: `attr` is a valid bpf_attr prefix for this command and both it
    // and `key` outlive the call.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            BPF_MAP_DELETE_ELEM,
            &attr as *const MapElemAttr,
            mem::size_of::<MapElemAttr>() as libc::c_uint,
        )
    };

    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
