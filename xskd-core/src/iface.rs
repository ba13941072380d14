//! Network interface discovery.

use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use tracing::{info, warn};

use crate::error::{Result, XskError};

/// sysfs root for network devices.
pub const SYS_CLASS_NET: &str = "/sys/class/net";

/// Detect the default network interface from /proc/net/route.
///
/// Parses the kernel routing table to find the interface with the default
/// route (destination 0.0.0.0).
pub fn detect_default_interface() -> Result<String> {
    let route_file = fs::File::open("/proc/net/route")?;

    // Format: Iface Destination Gateway Flags RefCnt Use Metric Mask MTU Window IRTT
    if let Some(interface) = default_route_interface(BufReader::new(route_file))? {
        info!(interface = %interface, "Detected default network interface");
        return Ok(interface);
    }

    for iface in &["eth0", "ens5", "ens3", "enp0s3", "wlan0", "lo"] {
        if Path::new(SYS_CLASS_NET).join(iface).exists() {
            warn!(
                interface = %iface,
                "No default route found, falling back to existing interface"
            );
            return Ok((*iface).to_string());
        }
    }

    Err(XskError::NoDefaultInterface)
}

fn default_route_interface<R: BufRead>(reader: R) -> io::Result<Option<String>> {
    for line in reader.lines().skip(1) {
        let line = line?;
        let mut fields = line.split_whitespace();
        if let (Some(interface), Some("00000000")) = (fields.next(), fields.next()) {
            return Ok(Some(interface.to_string()));
        }
    }
    Ok(None)
}

/// Count the receive queues `interface` exposes under `sys_class_net`.
///
/// Returns `None` when the queue directory is missing (virtual devices,
/// containers without sysfs).
pub fn rx_queue_count(sys_class_net: &Path, interface: &str) -> Result<Option<u32>> {
    let queues = sys_class_net.join(interface).join("queues");
    let entries = match fs::read_dir(&queues) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut count = 0u32;
    for entry in entries {
        if entry?.file_name().to_string_lossy().starts_with("rx-") {
            count += 1;
        }
    }
    Ok(Some(count))
}

/// Dispatch table size for an interface with `rx_queues` receive queues.
///
/// Never zero and never above `max_queues`.
pub fn table_capacity(rx_queues: Option<u32>, max_queues: u32) -> u32 {
    match rx_queues {
        Some(n) if n > 0 => n.min(max_queues),
        _ => max_queues,
    }
}
