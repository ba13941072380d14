//! Environment-driven configuration.
//!
//! | Variable | Default |
//! |---|---|
//! | `XSKD_INTERFACE` | auto-detect |
//! | `XSKD_XDP_MODE` | `skb` |
//! | `XSKD_OBJECT_PATH` | `target/bpfel-unknown-none/release/xskd-ebpf` |
//! | `XSKD_MAX_QUEUES` | 64 |
//! | `XSKD_PIN_PATH` | `/sys/fs/bpf/xskd` (`off` keeps the program private) |
//! | `XSKD_LOCK_PATH` | `/run/xskd.lock` |
//! | `XSKD_REPORT_SECS` | 60 |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use aya::programs::XdpFlags;
use xskd_ebpf_common::DEFAULT_QUEUE_IDS;

use crate::error::{Result, XskError};

pub const ENV_INTERFACE: &str = "XSKD_INTERFACE";
pub const ENV_XDP_MODE: &str = "XSKD_XDP_MODE";
pub const ENV_OBJECT_PATH: &str = "XSKD_OBJECT_PATH";
pub const ENV_MAX_QUEUES: &str = "XSKD_MAX_QUEUES";
pub const ENV_PIN_PATH: &str = "XSKD_PIN_PATH";
pub const ENV_LOCK_PATH: &str = "XSKD_LOCK_PATH";
pub const ENV_REPORT_SECS: &str = "XSKD_REPORT_SECS";

/// Where `cargo build` for the XDP crate leaves its object.
pub const DEFAULT_OBJECT_PATH: &str = "target/bpfel-unknown-none/release/xskd-ebpf";

/// bpffs root under which attached programs are pinned per interface.
pub const DEFAULT_PIN_PATH: &str = "/sys/fs/bpf/xskd";

/// Lock file shared by every process managing the program.
pub const DEFAULT_LOCK_PATH: &str = "/run/xskd.lock";

/// XDP attachment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XdpMode {
    /// SKB generic mode - works everywhere but slower
    Skb,
    /// Driver mode - required for zero-copy AF_XDP
    Driver,
    /// Hardware offload - requires NIC support
    Hardware,
}

impl From<XdpMode> for XdpFlags {
    fn from(mode: XdpMode) -> Self {
        match mode {
            XdpMode::Skb => XdpFlags::SKB_MODE,
            XdpMode::Driver => XdpFlags::DRV_MODE,
            XdpMode::Hardware => XdpFlags::HW_MODE,
        }
    }
}

impl FromStr for XdpMode {
    type Err = XskError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skb" | "generic" => Ok(XdpMode::Skb),
            "drv" | "driver" | "native" => Ok(XdpMode::Driver),
            "hw" | "hardware" | "offload" => Ok(XdpMode::Hardware),
            other => Err(XskError::Config(format!("unknown XDP mode '{other}'"))),
        }
    }
}

/// Configuration for the XDP program manager.
#[derive(Debug, Clone)]
pub struct XskConfig {
    /// Interface to attach to. `None` means the default-route interface.
    pub interface: Option<String>,

    pub xdp_mode: XdpMode,

    /// Compiled XDP object file.
    pub object_path: PathBuf,

    /// Upper bound on dispatch table slots. The table is shrunk to the
    /// interface's receive-queue count when that can be read.
    pub max_queues: u32,

    /// bpffs root for the link and maps, so other processes can find and
    /// join the attached program. `None` keeps the program private.
    pub pin_path: Option<PathBuf>,

    /// File locked around program setup and refcount updates.
    pub lock_path: PathBuf,

    /// Interval between binding reports in the daemon.
    pub report_interval: Duration,
}

impl Default for XskConfig {
    fn default() -> Self {
        Self {
            interface: None,
            xdp_mode: XdpMode::Skb,
            object_path: PathBuf::from(DEFAULT_OBJECT_PATH),
            max_queues: DEFAULT_QUEUE_IDS,
            pin_path: Some(PathBuf::from(DEFAULT_PIN_PATH)),
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
            report_interval: Duration::from_secs(60),
        }
    }
}

impl XskConfig {
    /// Build from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(interface) = get(ENV_INTERFACE) {
            config.interface = Some(interface.trim().to_string());
        }
        if let Some(mode) = get(ENV_XDP_MODE) {
            config.xdp_mode = mode.parse()?;
        }
        if let Some(path) = get(ENV_OBJECT_PATH) {
            config.object_path = PathBuf::from(path);
        }
        if let Some(max) = get(ENV_MAX_QUEUES) {
            config.max_queues = parse_number(ENV_MAX_QUEUES, &max)?;
            if config.max_queues == 0 {
                return Err(XskError::Config(format!("{ENV_MAX_QUEUES} must be at least 1")));
            }
        }
        if let Some(path) = get(ENV_PIN_PATH) {
            config.pin_path = match path.trim() {
                "off" | "none" => None,
                path => Some(PathBuf::from(path)),
            };
        }
        if let Some(path) = get(ENV_LOCK_PATH) {
            config.lock_path = PathBuf::from(path);
        }
        if let Some(secs) = get(ENV_REPORT_SECS) {
            let secs: u64 = parse_number(ENV_REPORT_SECS, &secs)?;
            config.report_interval = Duration::from_secs(secs.max(1));
        }

        Ok(config)
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| XskError::Config(format!("{key}: '{value}' is not a valid number")))
}
