//! Kernel maps of an attached program: XSKS_MAP and the REFCNT word.

use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;

use aya::maps::{Array, Map, MapData, XskMap};
use aya::Ebpf;
use tracing::debug;

use xskd_ebpf_common::symbols;

use crate::error::{Result, XskError};
use crate::sys;
use crate::table::SocketHandle;

/// Pin names inside a program's pin directory.
pub(crate) const XSKS_MAP_PIN: &str = symbols::XSKS_MAP;
pub(crate) const REFCNT_PIN: &str = symbols::REFCNT;

/// Writes the control plane makes to a loaded program.
pub trait ProgramMaps: Send + Sync {
    /// Number of XSKS_MAP slots.
    fn capacity(&self) -> u32;

    fn set_socket(&mut self, queue: u32, handle: SocketHandle) -> Result<()>;

    fn clear_socket(&mut self, queue: u32) -> Result<()>;

    fn read_refcount(&self) -> Result<u32>;

    fn write_refcount(&mut self, count: u32) -> Result<()>;
}

/// Apply `delta` to a reference count.
///
/// `None` means the count is already zero. A program at zero is awaiting
/// detach and no delta may bring it back.
#[inline]
pub fn next_refcount(current: u32, delta: i32) -> Option<u32> {
    if current == 0 {
        return None;
    }
    Some(current.saturating_add_signed(delta))
}

/// Read, adjust, and write back the count held in `maps`.
pub(crate) fn apply_refcount(maps: &mut dyn ProgramMaps, delta: i32) -> Result<Option<u32>> {
    let current = maps.read_refcount()?;
    let Some(next) = next_refcount(current, delta) else {
        return Ok(None);
    };
    if next != current {
        maps.write_refcount(next)?;
    }
    Ok(Some(next))
}

/// [`ProgramMaps`] backed by real BPF maps.
pub struct AyaMaps {
    xsks: XskMap<MapData>,
    /// Second descriptor on XSKS_MAP for deletes, which `XskMap` lacks
    xsks_fd: OwnedFd,
    refcnt: Array<MapData, u32>,
}

impl AyaMaps {
    /// Take both maps out of a freshly loaded object, pinning them under
    /// `pin_dir` when given.
    pub(crate) fn take_from(bpf: &mut Ebpf, pin_dir: Option<&Path>) -> Result<Self> {
        let xsks = match bpf.take_map(symbols::XSKS_MAP) {
            Some(Map::XskMap(data)) => data,
            _ => return Err(XskError::Map("XSKS_MAP map not found".into())),
        };
        let refcnt = match bpf.take_map(symbols::DATA_MAP) {
            Some(Map::Array(data)) => data,
            _ => return Err(XskError::Map(".data map not found".into())),
        };

        if let Some(dir) = pin_dir {
            pin(&xsks, &dir.join(XSKS_MAP_PIN))?;
            pin(&refcnt, &dir.join(REFCNT_PIN))?;
        }

        Self::from_data(xsks, refcnt)
    }

    /// Reopen maps pinned by another process.
    pub(crate) fn from_pins(dir: &Path) -> Result<Self> {
        let open = |name: &str| {
            MapData::from_pin(dir.join(name))
                .map_err(|e| XskError::Map(format!("Failed to open pinned {}: {}", name, e)))
        };
        Self::from_data(open(XSKS_MAP_PIN)?, open(REFCNT_PIN)?)
    }

    fn from_data(xsks: MapData, refcnt: MapData) -> Result<Self> {
        let xsks_fd = xsks.fd().as_fd().try_clone_to_owned()?;

        let xsks = XskMap::try_from(Map::XskMap(xsks))
            .map_err(|e| XskError::Map(format!("Failed to create XskMap: {}", e)))?;
        let refcnt = Array::try_from(Map::Array(refcnt))
            .map_err(|e| XskError::Map(format!("Failed to create Array: {}", e)))?;

        Ok(Self {
            xsks,
            xsks_fd,
            refcnt,
        })
    }
}

impl ProgramMaps for AyaMaps {
    fn capacity(&self) -> u32 {
        self.xsks.len()
    }

    fn set_socket(&mut self, queue: u32, handle: SocketHandle) -> Result<()> {
        self.xsks
            .set(queue, handle, 0)
            .map_err(|e| XskError::Map(format!("Failed to bind queue {}: {}", queue, e)))
    }

    fn clear_socket(&mut self, queue: u32) -> Result<()> {
        sys::map_delete_elem(self.xsks_fd.as_fd(), queue)
            .map_err(|e| XskError::Map(format!("Failed to unbind queue {}: {}", queue, e)))
    }

    fn read_refcount(&self) -> Result<u32> {
        self.refcnt
            .get(&0, 0)
            .map_err(|e| XskError::Map(format!("Failed to read refcount: {}", e)))
    }

    fn write_refcount(&mut self, count: u32) -> Result<()> {
        self.refcnt
            .set(0, count, 0)
            .map_err(|e| XskError::Map(format!("Failed to write refcount: {}", e)))
    }
}

fn pin(data: &MapData, path: &Path) -> Result<()> {
    data.pin(path)
        .map_err(|e| XskError::Map(format!("Failed to pin {}: {}", path.display(), e)))?;
    debug!(path = %path.display(), "Pinned map");
    Ok(())
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// Observable state behind [`FakeMaps`].
    #[derive(Debug, Default)]
    pub struct FakeState {
        pub sockets: BTreeMap<u32, SocketHandle>,
        pub refcount: u32,
        pub map_writes: usize,
    }

    /// In-memory [`ProgramMaps`] with XSKMAP's slot-range rules.
    pub struct FakeMaps {
        pub capacity: u32,
        pub state: Arc<Mutex<FakeState>>,
    }

    impl FakeMaps {
        pub fn new(capacity: u32, refcount: u32) -> (Self, Arc<Mutex<FakeState>>) {
            let state = Arc::new(Mutex::new(FakeState {
                refcount,
                ..Default::default()
            }));
            let maps = Self {
                capacity,
                state: Arc::clone(&state),
            };
            (maps, state)
        }

        fn check(&self, queue: u32) -> Result<()> {
            if queue >= self.capacity {
                return Err(XskError::Map(format!("queue {} out of range", queue)));
            }
            Ok(())
        }
    }

    impl ProgramMaps for FakeMaps {
        fn capacity(&self) -> u32 {
            self.capacity
        }

        fn set_socket(&mut self, queue: u32, handle: SocketHandle) -> Result<()> {
            self.check(queue)?;
            let mut state = self.state.lock();
            state.map_writes += 1;
            state.sockets.insert(queue, handle);
            Ok(())
        }

        fn clear_socket(&mut self, queue: u32) -> Result<()> {
            self.check(queue)?;
            let mut state = self.state.lock();
            state.map_writes += 1;
            state.sockets.remove(&queue);
            Ok(())
        }

        fn read_refcount(&self) -> Result<u32> {
            Ok(self.state.lock().refcount)
        }

        fn write_refcount(&mut self, count: u32) -> Result<()> {
            self.state.lock().refcount = count;
            Ok(())
        }
    }
}
