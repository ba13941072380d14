//! Discovery of a dispatcher already attached by another process.
//!
//! An attached program leaves its XDP link and both maps pinned under
//! `<pin root>/<interface>/v<version>/`. The version in the directory name is
//! the tag read from the object that was loaded, so a later loader can decide
//! whether to join the running program or replace it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use aya::programs::links::PinnedLink;
use tracing::{debug, info, warn};

use crate::error::{Result, XskError};
use crate::maps::{AyaMaps, REFCNT_PIN, XSKS_MAP_PIN};

/// Pin name of the XDP link.
pub(crate) const LINK_PIN: &str = "link";

const VERSION_PREFIX: &str = "v";

/// What a loader should do given what it found on the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachPlan {
    /// Nothing attached: load and attach a new program
    Fresh,
    /// Join the running program by taking a reference
    Reuse,
    /// Leftovers awaiting detach: remove them, then load fresh
    Replace,
    /// A different version is attached and still in use
    Conflict { version: u32 },
}

/// Decide how to proceed from the attached program's `(version, refcount)`.
pub fn plan_attach(existing: Option<(u32, u32)>, ours: u32) -> AttachPlan {
    match existing {
        None => AttachPlan::Fresh,
        Some((_, 0)) => AttachPlan::Replace,
        Some((version, _)) if version == ours => AttachPlan::Reuse,
        Some((version, _)) => AttachPlan::Conflict { version },
    }
}

/// `<root>/<interface>/v<version>`
pub fn version_dir(root: &Path, interface: &str, version: u32) -> PathBuf {
    root.join(interface).join(format!("{}{}", VERSION_PREFIX, version))
}

/// Parse the version out of a `v<N>` directory name.
pub fn parse_version_dir(name: &str) -> Option<u32> {
    name.strip_prefix(VERSION_PREFIX)?.parse().ok()
}

/// Find the pinned program directory for `interface`, if any.
///
/// Returns the lowest version present when several are.
pub fn find_pinned(root: &Path, interface: &str) -> Result<Option<(PathBuf, u32)>> {
    let iface_dir = root.join(interface);
    let entries = match fs::read_dir(&iface_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut found: Option<(PathBuf, u32)> = None;
    for entry in entries {
        let entry = entry?;
        let Some(version) = entry.file_name().to_str().and_then(parse_version_dir) else {
            continue;
        };
        if found.as_ref().map_or(true, |(_, v)| version < *v) {
            found = Some((entry.path(), version));
        }
    }

    Ok(found)
}

/// A program found pinned on the interface.
pub(crate) struct PinnedProgram {
    pub dir: PathBuf,
    pub version: u32,
    pub maps: AyaMaps,
}

impl PinnedProgram {
    pub fn open(dir: PathBuf, version: u32) -> Result<Self> {
        let maps = AyaMaps::from_pins(&dir)?;
        Ok(Self { dir, version, maps })
    }
}

/// Unpin the link (detaching the program) and remove every pin under `dir`.
pub fn remove_pinned(dir: &Path) -> Result<()> {
    let link_path = dir.join(LINK_PIN);
    match PinnedLink::from_pin(&link_path) {
        Ok(link) => {
            // The returned FdLink detaches on drop
            let link = link.unpin()?;
            drop(link);
            info!(path = %link_path.display(), "Detached pinned XDP link");
        }
        Err(e) if !link_path.exists() => {
            debug!(error = %e, path = %link_path.display(), "No pinned link to detach");
        }
        Err(e) => {
            return Err(XskError::Map(format!(
                "Failed to open pinned link {}: {}",
                link_path.display(),
                e
            )))
        }
    }

    remove_pins(dir)
}

/// Remove map pins and the now-empty directories above them.
fn remove_pins(dir: &Path) -> Result<()> {
    for name in [XSKS_MAP_PIN, REFCNT_PIN, LINK_PIN] {
        let path = dir.join(name);
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed pin"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    match fs::remove_dir(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    // The interface directory goes too once its last version is gone
    if let Some(parent) = dir.parent() {
        if let Err(e) = fs::remove_dir(parent) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(error = %e, path = %parent.display(), "Interface pin directory kept");
            }
        }
    }

    Ok(())
}

/// Remove a pin directory, logging instead of failing.
pub(crate) fn remove_pinned_logged(dir: &Path) {
    if let Err(e) = remove_pinned(dir) {
        warn!(error = %e, path = %dir.display(), "Failed to remove pinned program");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_attach() {
        assert_eq!(plan_attach(None, 1), AttachPlan::Fresh);
        assert_eq!(plan_attach(Some((1, 3)), 1), AttachPlan::Reuse);
        assert_eq!(plan_attach(Some((1, 0)), 1), AttachPlan::Replace);
        assert_eq!(plan_attach(Some((2, 0)), 1), AttachPlan::Replace);
        assert_eq!(
            plan_attach(Some((2, 1)), 1),
            AttachPlan::Conflict { version: 2 }
        );
    }

    #[test]
    fn test_version_dir_names() {
        let dir = version_dir(Path::new("/sys/fs/bpf/xskd"), "ens5", 3);
        assert_eq!(dir, PathBuf::from("/sys/fs/bpf/xskd/ens5/v3"));
        assert_eq!(parse_version_dir("v3"), Some(3));
        assert_eq!(parse_version_dir("v"), None);
        assert_eq!(parse_version_dir("link"), None);
        assert_eq!(parse_version_dir("v-1"), None);
    }

    #[test]
    fn test_find_pinned() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(find_pinned(root.path(), "ens5").unwrap(), None);

        fs::create_dir_all(root.path().join("ens5").join("v4")).unwrap();
        fs::create_dir_all(root.path().join("ens5").join("v2")).unwrap();
        fs::create_dir_all(root.path().join("ens5").join("scratch")).unwrap();

        let (dir, version) = find_pinned(root.path(), "ens5").unwrap().unwrap();
        assert_eq!(version, 2);
        assert_eq!(dir, version_dir(root.path(), "ens5", 2));
        assert_eq!(find_pinned(root.path(), "lo").unwrap(), None);
    }

    #[test]
    fn test_remove_pinned_clears_directories() {
        let root = tempfile::tempdir().unwrap();
        let dir = version_dir(root.path(), "ens5", 1);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(XSKS_MAP_PIN), b"").unwrap();
        fs::write(dir.join(REFCNT_PIN), b"").unwrap();

        remove_pinned(&dir).unwrap();

        assert!(!dir.exists());
        assert!(!root.path().join("ens5").exists());
        assert!(root.path().exists());
    }

    #[test]
    fn test_remove_pinned_missing_is_ok() {
        let root = tempfile::tempdir().unwrap();
        assert!(remove_pinned(&version_dir(root.path(), "ens5", 1)).is_ok());
    }
}
