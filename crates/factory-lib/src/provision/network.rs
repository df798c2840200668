//! Slot network identities
//!
//! NAT addresses and MACs are pure functions of the slot ordinal, so nothing
//! about them is persisted besides the DHCP reservations and hosts entries
//! regenerated from the slot list.

use crate::config::{ConfigSnapshot, NetworkMode};
use crate::error::{FactoryError, Result};
use crate::models::NetworkAddress;
use crate::store::write_atomic;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::info;

pub const HOSTS_BEGIN: &str = "# BEGIN factoryd";
pub const HOSTS_END: &str = "# END factoryd";

/// NAT address of slot `ordinal`
pub fn nat_ip(prefix: [u8; 3], ordinal: usize) -> Result<Ipv4Addr> {
    let last = u8::try_from(ordinal)
        .map_err(|_| FactoryError::resource("network", format!("ordinal {} has no NAT address", ordinal)))?;
    Ok(Ipv4Addr::new(prefix[0], prefix[1], prefix[2], last))
}

/// MAC carrying the four IP octets, `169.254.169.5` gives `56:4D:A9:FE:A9:05`
pub fn nat_mac(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("56:4D:{:02X}:{:02X}:{:02X}:{:02X}", a, b, c, d)
}

/// MAC built from the last three bytes of the bridge's MAC plus the ordinal
pub fn bridge_mac(bridge_mac: &str, ordinal: usize) -> Option<String> {
    let bytes: Vec<u8> = bridge_mac
        .trim()
        .split(':')
        .map(|b| u8::from_str_radix(b, 16))
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    if bytes.len() != 6 {
        return None;
    }
    let ordinal = u8::try_from(ordinal).ok()?;
    Some(format!(
        "56:4D:{:02X}:{:02X}:{:02X}:{:02X}",
        bytes[3], bytes[4], bytes[5], ordinal
    ))
}

/// DHCP reservations, one `MAC,IP,hostname` line per slot
pub fn dhcp_hosts_content(prefix: [u8; 3], hostnames: &[String]) -> Result<String> {
    let mut content = String::new();
    for (ordinal, hostname) in hostnames.iter().enumerate() {
        let ip = nat_ip(prefix, ordinal)?;
        content.push_str(&format!("{},{},{}\n", nat_mac(ip), ip, hostname));
    }
    Ok(content)
}

/// Replace the managed block of a hosts file, keeping every other line
pub fn merge_hosts_block(existing: &str, entries: &str) -> String {
    let mut merged = String::new();
    let mut inside = false;
    for line in existing.lines() {
        match line.trim() {
            HOSTS_BEGIN => inside = true,
            HOSTS_END => inside = false,
            _ if !inside => {
                merged.push_str(line);
                merged.push('\n');
            }
            _ => {}
        }
    }
    merged.push_str(HOSTS_BEGIN);
    merged.push('\n');
    merged.push_str(entries);
    merged.push_str(HOSTS_END);
    merged.push('\n');
    merged
}

/// Derives addresses and keeps the NAT reservations current
#[derive(Debug, Clone)]
pub struct NetworkProvisioner {
    mode: NetworkMode,
    dhcp_hosts: PathBuf,
    hosts_file: PathBuf,
    sys_class_net: PathBuf,
}

impl NetworkProvisioner {
    pub fn new(snapshot: &ConfigSnapshot) -> Self {
        Self {
            mode: snapshot.network.clone(),
            dhcp_hosts: snapshot.base_dir.join("dhcp-hosts"),
            hosts_file: snapshot.hosts_file.clone(),
            sys_class_net: PathBuf::from("/sys/class/net"),
        }
    }

    /// Read bridge MACs from somewhere other than `/sys/class/net`
    pub fn with_sys_class_net(mut self, path: impl Into<PathBuf>) -> Self {
        self.sys_class_net = path.into();
        self
    }

    pub fn address(&self, ordinal: usize) -> Result<NetworkAddress> {
        match &self.mode {
            NetworkMode::Nat { prefix } => {
                let ip = nat_ip(*prefix, ordinal)?;
                Ok(NetworkAddress {
                    ip: Some(ip),
                    mac: nat_mac(ip),
                })
            }
            NetworkMode::Bridge { device } => {
                let path = self.sys_class_net.join(device).join("address");
                let host_mac = std::fs::read_to_string(&path).map_err(|e| {
                    FactoryError::resource("network", format!("{}: {}", path.display(), e))
                })?;
                let mac = bridge_mac(&host_mac, ordinal).ok_or_else(|| {
                    FactoryError::resource("network", format!("bad MAC {:?} on {}", host_mac.trim(), device))
                })?;
                Ok(NetworkAddress { ip: None, mac })
            }
        }
    }

    /// Ensure a DHCP reservation and hosts entry exist for every slot
    ///
    /// Files are only rewritten when their content changes. Returns whether
    /// anything was written.
    pub fn ensure_reservations(&self, hostnames: &[String]) -> Result<bool> {
        let NetworkMode::Nat { prefix } = &self.mode else {
            return Ok(false);
        };

        let dhcp = dhcp_hosts_content(*prefix, hostnames)?;
        let mut changed = false;
        if std::fs::read_to_string(&self.dhcp_hosts).ok().as_deref() != Some(dhcp.as_str()) {
            write_atomic(&self.dhcp_hosts, &dhcp)?;
            changed = true;
        }

        let mut entries = String::new();
        for (ordinal, hostname) in hostnames.iter().enumerate() {
            entries.push_str(&format!("{}\t{}\n", nat_ip(*prefix, ordinal)?, hostname));
        }
        let existing = std::fs::read_to_string(&self.hosts_file).unwrap_or_default();
        let merged = merge_hosts_block(&existing, &entries);
        if merged != existing {
            write_atomic(&self.hosts_file, &merged)?;
            changed = true;
        }

        if changed {
            info!(slots = hostnames.len(), "Updated NAT reservations");
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testing::snapshot;
    use tempfile::TempDir;

    #[test]
    fn test_nat_ordinal_five() {
        let ip = nat_ip([169, 254, 169], 5).unwrap();
        assert_eq!(ip, Ipv4Addr::new(169, 254, 169, 5));
        assert_eq!(nat_mac(ip), "56:4D:A9:FE:A9:05");
        // Same answer every time, nothing persisted
        assert_eq!(nat_mac(nat_ip([169, 254, 169], 5).unwrap()), "56:4D:A9:FE:A9:05");
    }

    #[test]
    fn test_nat_ip_out_of_range() {
        assert!(matches!(
            nat_ip([10, 0, 0], 256),
            Err(FactoryError::Resource { step: "network", .. })
        ));
    }

    #[test]
    fn test_bridge_mac() {
        assert_eq!(
            bridge_mac("52:54:00:ab:cd:ef\n", 3).as_deref(),
            Some("56:4D:AB:CD:EF:03")
        );
        assert_eq!(bridge_mac("garbage", 3), None);
    }

    #[test]
    fn test_merge_hosts_block_replaces_managed_lines() {
        let existing = "127.0.0.1\tlocalhost\n# BEGIN factoryd\n169.254.169.0\told\n# END factoryd\n10.0.0.1\tother\n";
        let merged = merge_hosts_block(existing, "169.254.169.0\tnew\n");

        assert_eq!(
            merged,
            "127.0.0.1\tlocalhost\n10.0.0.1\tother\n# BEGIN factoryd\n169.254.169.0\tnew\n# END factoryd\n"
        );
        assert_eq!(merge_hosts_block(&merged, "169.254.169.0\tnew\n"), merged);
    }

    #[test]
    fn test_ensure_reservations_writes_once() {
        let dir = TempDir::new().unwrap();
        let snapshot = snapshot(dir.path(), "docker");
        let network = NetworkProvisioner::new(&snapshot);
        let hostnames = snapshot.hostnames();

        assert!(network.ensure_reservations(&hostnames).unwrap());
        assert!(!network.ensure_reservations(&hostnames).unwrap());

        let dhcp = std::fs::read_to_string(dir.path().join("dhcp-hosts")).unwrap();
        assert_eq!(dhcp.lines().count(), 4);
        assert!(dhcp.contains("56:4D:A9:FE:A9:03,169.254.169.3,host-03.example.com"));
        let hosts = std::fs::read_to_string(dir.path().join("hosts")).unwrap();
        assert!(hosts.contains("169.254.169.0\thost-00.example.com"));
    }

    #[test]
    fn test_bridge_address_reads_device_mac() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("br0")).unwrap();
        std::fs::write(dir.path().join("br0/address"), "52:54:00:12:34:56\n").unwrap();
        let mut snapshot = snapshot(dir.path(), "vm-raw");
        snapshot.network = NetworkMode::Bridge {
            device: "br0".into(),
        };
        let network = NetworkProvisioner::new(&snapshot).with_sys_class_net(dir.path());

        let address = network.address(7).unwrap();
        assert_eq!(address.ip, None);
        assert_eq!(address.mac, "56:4D:12:34:56:07");
        assert!(!network.ensure_reservations(&snapshot.hostnames()).unwrap());
    }
}
