//! Host counters reported in `factory_status`

use nix::sys::statvfs::statvfs;
use std::fs;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostInfo {
    pub mem_total_kb: u64,
    /// One-minute load average
    pub load_average: f64,
    pub kernel_version: String,
    pub boot_time: i64,
    pub base_disk_avail_kb: u64,
    pub base_disk_avail_inodes: u64,
}

impl HostInfo {
    /// Read counters from `proc_root` and the filesystem holding `base_dir`
    ///
    /// Anything unreadable is reported as zero.
    pub fn probe(proc_root: &Path, base_dir: &Path) -> Self {
        let read = |name: &str| fs::read_to_string(proc_root.join(name)).unwrap_or_default();

        let mut info = Self {
            mem_total_kb: parse_meminfo_total(&read("meminfo")).unwrap_or(0),
            load_average: parse_loadavg(&read("loadavg")).unwrap_or(0.0),
            kernel_version: kernel_version(),
            boot_time: parse_boot_time(&read("stat")).unwrap_or(0),
            ..Default::default()
        };

        match statvfs(base_dir) {
            Ok(stat) => {
                let fragment = u64::from(stat.fragment_size());
                info.base_disk_avail_kb = u64::from(stat.blocks_available()) * fragment / 1024;
                info.base_disk_avail_inodes = u64::from(stat.files_available());
            }
            Err(e) => debug!(path = %base_dir.display(), error = %e, "statvfs failed"),
        }
        info
    }
}

fn kernel_version() -> String {
    nix::sys::utsname::uname()
        .map(|u| u.release().to_string_lossy().to_string())
        .unwrap_or_default()
}

/// `MemTotal:  16318748 kB`
pub fn parse_meminfo_total(content: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

pub fn parse_loadavg(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}

/// `btime` line of `/proc/stat`
pub fn parse_boot_time(content: &str) -> Option<i64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|secs| secs.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parsers() {
        assert_eq!(
            parse_meminfo_total("MemTotal:       16318748 kB\nMemFree:  100 kB\n"),
            Some(16318748)
        );
        assert_eq!(parse_loadavg("0.52 0.58 0.59 1/467 12345\n"), Some(0.52));
        assert_eq!(
            parse_boot_time("cpu  1 2 3\nintr 5\nbtime 1699990000\nprocesses 10\n"),
            Some(1699990000)
        );
        assert_eq!(parse_meminfo_total(""), None);
        assert_eq!(parse_boot_time("cpu 1 2 3\n"), None);
    }

    #[test]
    fn test_probe_reads_fake_proc() {
        let dir = TempDir::new().unwrap();
        let proc_root = dir.path().join("proc");
        std::fs::create_dir_all(&proc_root).unwrap();
        std::fs::write(proc_root.join("meminfo"), "MemTotal: 2048 kB\n").unwrap();
        std::fs::write(proc_root.join("loadavg"), "1.50 1.00 0.50 2/100 42\n").unwrap();
        std::fs::write(proc_root.join("stat"), "btime 1700000000\n").unwrap();

        let info = HostInfo::probe(&proc_root, dir.path());

        assert_eq!(info.mem_total_kb, 2048);
        assert_eq!(info.load_average, 1.5);
        assert_eq!(info.boot_time, 1_700_000_000);
    }

    #[test]
    fn test_probe_missing_proc_reports_zero() {
        let dir = TempDir::new().unwrap();
        let info = HostInfo::probe(&dir.path().join("nope"), dir.path());
        assert_eq!(info.mem_total_kb, 0);
        assert_eq!(info.boot_time, 0);
    }
}
