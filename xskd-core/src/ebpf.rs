//! Userspace manager for the xskd XDP program.
//!
//! Loads, attaches, joins, and tears down the dispatcher using the Aya
//! framework, and owns every write to its maps.
//!
//! # Layout
//!
//! ```text
//!   XskProgram                          bpffs: <pin root>/<iface>/v<N>/
//!   ┌─────────────────────────┐         ┌──────────────────────────────┐
//!   │ DispatchTable (shadow)  │         │ link      XDP attachment     │
//!   │ held references         │ ──────▶ │ XSKS_MAP  queue -> socket    │
//!   │ ProgramMaps             │         │ REFCNT    .data user count   │
//!   └─────────────────────────┘         └──────────────────────────────┘
//!              │
//!              └── flock(lock path) around load, join, acquire, release
//! ```
//!
//! A second loader on the same interface finds the pins, and either joins the
//! running program or replaces one that is awaiting detach. Without a pin
//! root the program is private to this process.
//!
//! # Thread Safety
//!
//! - Each XSKMAP update is a single map syscall, atomic per key
//! - The kernel XSKMAP cannot be read from userspace, so every write made
//!   through this handle is mirrored into a [`DispatchTable`]

use std::fs;
use std::path::{Path, PathBuf};

use aya::programs::links::FdLink;
use aya::programs::xdp::XdpLinkId;
use aya::programs::{ProgramError, Xdp};
use aya::{Ebpf, EbpfLoader};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use xskd_ebpf_common::{symbols, REFCNT_INITIAL, XDP_PROGRAM_NAME, XSK_PROG_VERSION};

use crate::config::XskConfig;
use crate::error::{Result, XskError};
use crate::iface::{detect_default_interface, rx_queue_count, table_capacity, SYS_CLASS_NET};
use crate::lock::ProgramLock;
use crate::maps::{apply_refcount, AyaMaps, ProgramMaps};
use crate::pin::{self, AttachPlan, PinnedProgram, LINK_PIN};
use crate::table::{DispatchTable, SocketHandle};
use crate::version;

/// Everything that exists only while this handle uses the program.
struct Attached {
    maps: Box<dyn ProgramMaps>,
    interface: String,
    /// Mirror of the XSKS_MAP writes made through this handle
    table: DispatchTable,
    /// References on REFCNT owned by this handle
    held: u32,
    pin_dir: Option<PathBuf>,
    /// Owns a private attachment; unused once the link is pinned
    _bpf: Option<Ebpf>,
}

/// XDP program manager - handles lifecycle, socket bindings, and the
/// program reference count.
///
/// # Example
///
/// ```ignore
/// let program = XskProgram::new(XskConfig::from_env()?);
/// program.load_and_attach()?;
///
/// // Steer queue 0 to an AF_XDP socket bound to that queue
/// program.bind_socket(0, SocketHandle::from_raw_fd(xsk_fd))?;
/// ```
pub struct XskProgram {
    config: XskConfig,
    state: RwLock<Option<Attached>>,
}

impl XskProgram {
    pub fn new(config: XskConfig) -> Self {
        Self {
            config,
            state: RwLock::new(None),
        }
    }

    #[inline]
    pub fn config(&self) -> &XskConfig {
        &self.config
    }

    /// Attach the dispatcher to the interface, or join the one already there.
    ///
    /// # Steps
    /// 1. Read the object and check its version tag
    /// 2. Under the program lock, look for a pinned program on the interface
    /// 3. Join it (REFCNT + 1), replace it if it is awaiting detach, or
    ///    load fresh with REFCNT = 1 and XSKS_MAP sized to the rx queues
    ///
    /// Either way this handle holds one reference afterwards.
    pub fn load_and_attach(&self) -> Result<()> {
        if self.is_attached() {
            debug!("XDP program already attached");
            return Ok(());
        }

        let path = &self.config.object_path;
        info!(path = %path.display(), "Loading XDP program");

        let bytes = fs::read(path)?;
        version::ensure_compatible(&bytes)?;

        let interface = match &self.config.interface {
            Some(iface) => iface.clone(),
            None => detect_default_interface()?,
        };

        let _lock = ProgramLock::acquire(&self.config.lock_path)?;

        let attached = match &self.config.pin_path {
            Some(root) => self.attach_shared(&bytes, interface, root)?,
            None => self.load_fresh(&bytes, interface, None)?,
        };

        info!(
            interface = %attached.interface,
            capacity = attached.table.capacity(),
            pinned = attached.pin_dir.is_some(),
            "XDP program ready"
        );

        *self.state.write() = Some(attached);
        Ok(())
    }

    /// Give up every reference this handle holds. The program itself is
    /// detached only if no other user remains.
    ///
    /// Frames already inside the program finish under the old bindings.
    pub fn detach(&self) -> Result<()> {
        while self.is_attached() {
            self.release()?;
        }
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.state.read().is_some()
    }

    pub fn attached_interface(&self) -> Option<String> {
        self.state.read().as_ref().map(|a| a.interface.clone())
    }

    /// Number of XSKS_MAP slots in the loaded program.
    pub fn capacity(&self) -> Result<u32> {
        let guard = self.state.read();
        let attached = guard.as_ref().ok_or(XskError::NotLoaded)?;
        Ok(attached.table.capacity())
    }

    // ========================================================================
    // Socket Bindings
    // ========================================================================

    /// Steer frames from `queue` to the AF_XDP socket behind `handle`.
    ///
    /// Replaces any socket previously bound to the queue.
    pub fn bind_socket(&self, queue: u32, handle: SocketHandle) -> Result<()> {
        let mut guard = self.state.write();
        let attached = guard.as_mut().ok_or(XskError::NotLoaded)?;

        attached.table.check_queue(queue)?;
        attached.maps.set_socket(queue, handle)?;
        let previous = attached.table.bind(queue, handle)?;

        debug!(
            queue = queue,
            handle = ?handle,
            replaced = ?previous,
            "Socket bound in XSKS_MAP"
        );

        Ok(())
    }

    /// Stop steering `queue`; its frames pass to the kernel stack again.
    ///
    /// The kernel slot is cleared even when this handle did not bind it.
    /// Queues outside the table are a no-op.
    pub fn unbind_socket(&self, queue: u32) -> Result<Option<SocketHandle>> {
        let mut guard = self.state.write();
        let attached = guard.as_mut().ok_or(XskError::NotLoaded)?;

        if attached.table.check_queue(queue).is_err() {
            return Ok(None);
        }

        attached.maps.clear_socket(queue)?;
        let previous = attached.table.unbind(queue);

        debug!(queue = queue, handle = ?previous, "Socket removed from XSKS_MAP");

        Ok(previous)
    }

    /// `(queue, socket)` bindings made through this handle, in queue order.
    pub fn bindings(&self) -> Result<Vec<(u32, SocketHandle)>> {
        let guard = self.state.read();
        let attached = guard.as_ref().ok_or(XskError::NotLoaded)?;
        Ok(attached.table.bindings())
    }

    // ========================================================================
    // Reference Count
    // ========================================================================

    /// Current value of REFCNT (the program's liveness sentinel).
    pub fn refcount(&self) -> Result<u32> {
        let guard = self.state.read();
        let attached = guard.as_ref().ok_or(XskError::NotLoaded)?;
        attached.maps.read_refcount()
    }

    /// Register another user of the attached program.
    ///
    /// Returns the new count, or 0 if the program is already awaiting
    /// detach and must not be reused.
    pub fn acquire(&self) -> Result<u32> {
        let mut guard = self.state.write();
        let attached = guard.as_mut().ok_or(XskError::NotLoaded)?;
        let _lock = ProgramLock::acquire(&self.config.lock_path)?;

        match apply_refcount(attached.maps.as_mut(), 1)? {
            Some(count) => {
                attached.held += 1;
                debug!(refcount = count, held = attached.held, "Acquired XDP program reference");
                Ok(count)
            }
            None => {
                debug!("XDP program awaiting detach, not acquired");
                Ok(0)
            }
        }
    }

    /// Drop one reference held by this handle.
    ///
    /// The release that brings REFCNT to zero detaches the program. When this
    /// handle holds nothing afterwards it lets go of the maps.
    pub fn release(&self) -> Result<u32> {
        let mut guard = self.state.write();
        let attached = guard.as_mut().ok_or(XskError::NotLoaded)?;
        let _lock = ProgramLock::acquire(&self.config.lock_path)?;

        let remaining = apply_refcount(attached.maps.as_mut(), -1)?;
        attached.held = attached.held.saturating_sub(1);
        let held = attached.held;

        debug!(refcount = ?remaining, held = held, "Released XDP program reference");

        match remaining {
            Some(0) => {
                if let Some(attached) = guard.take() {
                    teardown(attached)?;
                }
            }
            // Already zero: whoever brought it there is detaching
            None => {
                guard.take();
            }
            Some(count) if held == 0 => {
                if let Some(attached) = guard.take() {
                    info!(
                        interface = %attached.interface,
                        refcount = count,
                        "Leaving XDP program to remaining users"
                    );
                }
            }
            Some(_) => {}
        }

        Ok(remaining.unwrap_or(0))
    }

    // ========================================================================
    // Attach Paths
    // ========================================================================

    fn attach_shared(&self, bytes: &[u8], interface: String, root: &Path) -> Result<Attached> {
        let existing = match pin::find_pinned(root, &interface)? {
            Some((dir, version)) => match PinnedProgram::open(dir.clone(), version) {
                Ok(found) => Some(found),
                Err(e) => {
                    warn!(error = %e, path = %dir.display(), "Removing unusable pinned program");
                    pin::remove_pinned(&dir)?;
                    None
                }
            },
            None => None,
        };

        let status = match &existing {
            Some(found) => Some((found.version, found.maps.read_refcount()?)),
            None => None,
        };

        let fresh_dir = pin::version_dir(root, &interface, XSK_PROG_VERSION);

        match (pin::plan_attach(status, XSK_PROG_VERSION), existing) {
            (AttachPlan::Reuse, Some(found)) => self.join(found, interface),
            (AttachPlan::Replace, Some(found)) => {
                info!(
                    interface = %interface,
                    version = found.version,
                    "Replacing XDP program awaiting detach"
                );
                let PinnedProgram { dir, maps, .. } = found;
                drop(maps);
                pin::remove_pinned(&dir)?;
                self.load_fresh(bytes, interface, Some(fresh_dir))
            }
            (AttachPlan::Conflict { version }, _) => Err(XskError::InUse { interface, version }),
            _ => self.load_fresh(bytes, interface, Some(fresh_dir)),
        }
    }

    /// Take a reference on a program attached by someone else.
    fn join(&self, mut found: PinnedProgram, interface: String) -> Result<Attached> {
        let count = apply_refcount(&mut found.maps, 1)?.ok_or_else(|| {
            XskError::Map("pinned XDP program began detaching".into())
        })?;

        let capacity = found.maps.capacity();
        info!(
            interface = %interface,
            version = found.version,
            refcount = count,
            capacity = capacity,
            "Joined attached XDP program"
        );

        Ok(Attached {
            maps: Box::new(found.maps),
            interface,
            table: DispatchTable::with_capacity(capacity),
            held: 1,
            pin_dir: Some(found.dir),
            _bpf: None,
        })
    }

    fn load_fresh(&self, bytes: &[u8], interface: String, pin_dir: Option<PathBuf>) -> Result<Attached> {
        let rx_queues = rx_queue_count(Path::new(SYS_CLASS_NET), &interface)?;
        if rx_queues.is_none() {
            warn!(
                interface = %interface,
                max_queues = self.config.max_queues,
                "Receive queue count unavailable, using configured maximum"
            );
        }
        let capacity = table_capacity(rx_queues, self.config.max_queues);

        let mut bpf = EbpfLoader::new()
            .set_max_entries(symbols::XSKS_MAP, capacity)
            .set_global(symbols::REFCNT, &REFCNT_INITIAL, true)
            .load(bytes)
            .map_err(|e| XskError::Load(e.to_string()))?;

        info!(
            interface = %interface,
            mode = ?self.config.xdp_mode,
            capacity = capacity,
            "Attaching XDP program"
        );

        let program = xdp_program(&mut bpf)?;
        program
            .load()
            .map_err(|e| XskError::Load(e.to_string()))?;

        let link_id = program
            .attach(&interface, self.config.xdp_mode.into())
            .map_err(|e| XskError::Attach {
                interface: interface.clone(),
                reason: e.to_string(),
            })?;

        let maps = match share(&mut bpf, link_id, pin_dir.as_deref()) {
            Ok(maps) => maps,
            Err(e) => {
                if let Some(dir) = &pin_dir {
                    pin::remove_pinned_logged(dir);
                }
                return Err(e);
            }
        };

        info!(interface = %interface, "XDP program attached successfully");

        Ok(Attached {
            maps: Box::new(maps),
            interface,
            table: DispatchTable::with_capacity(capacity),
            held: 1,
            pin_dir,
            _bpf: Some(bpf),
        })
    }

    #[cfg(test)]
    fn with_maps(config: XskConfig, interface: &str, maps: Box<dyn ProgramMaps>, held: u32) -> Self {
        let capacity = maps.capacity();
        Self {
            config,
            state: RwLock::new(Some(Attached {
                maps,
                interface: interface.to_string(),
                table: DispatchTable::with_capacity(capacity),
                held,
                pin_dir: None,
                _bpf: None,
            })),
        }
    }
}

impl Drop for XskProgram {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            error!(error = %e, "Failed to detach XDP program during drop");
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn xdp_program(bpf: &mut Ebpf) -> Result<&mut Xdp> {
    bpf.program_mut(XDP_PROGRAM_NAME)
        .ok_or_else(|| XskError::Load(format!("XDP program '{}' not found", XDP_PROGRAM_NAME)))?
        .try_into()
        .map_err(|e: ProgramError| XskError::Load(e.to_string()))
}

/// Pin the link under `pin_dir` when sharing, then take the maps out.
fn share(bpf: &mut Ebpf, link_id: XdpLinkId, pin_dir: Option<&Path>) -> Result<AyaMaps> {
    if let Some(dir) = pin_dir {
        fs::create_dir_all(dir)?;

        let link = xdp_program(bpf)?
            .take_link(link_id)
            .map_err(|e| XskError::Load(e.to_string()))?;
        let link = FdLink::try_from(link)
            .map_err(|e| XskError::Map(format!("XDP link cannot be pinned: {}", e)))?;

        let path = dir.join(LINK_PIN);
        link.pin(&path)
            .map_err(|e| XskError::Map(format!("Failed to pin XDP link: {}", e)))?;
        info!(path = %path.display(), "Pinned XDP link");
    }

    AyaMaps::take_from(bpf, pin_dir)
}

/// Detach the program once nobody uses it.
fn teardown(attached: Attached) -> Result<()> {
    info!(interface = %attached.interface, "Detaching XDP program");

    if let Some(dir) = &attached.pin_dir {
        pin::remove_pinned(dir)?;
    }

    // Dropping the Ebpf struct detaches a private program
    drop(attached);
    Ok(())
}
