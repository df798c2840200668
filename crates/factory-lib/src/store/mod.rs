//! On-disk slot bookkeeping
//!
//! The filesystem is the only state shared between the factory loops:
//!
//! ```text
//! <base>/slots/<hostname>                      "<created> <machinetype> <model>"
//! <base>/machines/<created>_<type>_<hostname>/ started, finished, heartbeat, ...
//! <base>/finishes/<machinetype>                "<created> <machinetype> <hostname>"
//! ```
//!
//! Every probe returns `Option` for an absent or unreadable marker; absence is
//! a normal outcome, not an error.

mod atomic;

pub use atomic::{write_atomic, write_once, AtomicWriter};

use crate::error::{FactoryError, Result};
use crate::models::{ShutdownMessage, SlotRecord};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

/// Marker and attribute file names inside a machine directory
pub mod files {
    pub const STARTED: &str = "started";
    pub const FINISHED: &str = "finished";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const UUID: &str = "uuid";
    pub const PID: &str = "pid";
    pub const IP: &str = "ip";
    pub const MODEL: &str = "model";
    pub const PROCESSORS: &str = "processors";
    pub const MEMORY_MB: &str = "memory_mb";
    pub const DISK_BYTES: &str = "disk_bytes";
    pub const SHUTDOWN_DEADLINE: &str = "shutdown_deadline";
    pub const SHUTDOWN_MESSAGE: &str = "shutdown_message";
    pub const SHUTDOWN_TIME: &str = "shutdown_time";
    pub const ACCOUNTING_FQAN: &str = "accounting_fqan";
    pub const JOBFEATURES: &str = "jobfeatures";
    pub const MACHINEFEATURES: &str = "machinefeatures";
    pub const JOBOUTPUTS: &str = "joboutputs";
}

/// Root of the factory's persisted state
#[derive(Debug, Clone)]
pub struct StateStore {
    base: PathBuf,
}

impl StateStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn slots_dir(&self) -> PathBuf {
        self.base.join("slots")
    }

    pub fn machines_dir(&self) -> PathBuf {
        self.base.join("machines")
    }

    pub fn finishes_dir(&self) -> PathBuf {
        self.base.join("finishes")
    }

    pub fn imagecache_dir(&self) -> PathBuf {
        self.base.join("imagecache")
    }

    pub fn factory_heartbeat_path(&self) -> PathBuf {
        self.base.join("factory-heartbeat")
    }

    /// Create the directory skeleton if missing
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.slots_dir(),
            self.machines_dir(),
            self.finishes_dir(),
            self.imagecache_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| FactoryError::io(&dir, e))?;
        }
        Ok(())
    }

    pub fn slot_file(&self, hostname: &str) -> PathBuf {
        self.slots_dir().join(hostname)
    }

    /// Read `slots/<hostname>`; missing or malformed records read as `None`
    pub fn read_slot_record(&self, hostname: &str) -> Option<SlotRecord> {
        let content = fs::read_to_string(self.slot_file(hostname)).ok()?;
        SlotRecord::parse(&content)
    }

    pub fn write_slot_record(&self, hostname: &str, record: &SlotRecord) -> Result<()> {
        write_atomic(self.slot_file(hostname), record.to_line())
    }

    /// Machine directory a slot record points to
    pub fn machine_dir(&self, hostname: &str, record: &SlotRecord) -> MachineDir {
        MachineDir::new(self.machines_dir().join(record.machine_dir_name(hostname)))
    }

    /// Machine directory of the record currently in `slots/<hostname>`,
    /// provided the directory exists
    pub fn current_machine_dir(&self, hostname: &str) -> Option<(SlotRecord, MachineDir)> {
        let record = self.read_slot_record(hostname)?;
        let dir = self.machine_dir(hostname, &record);
        if dir.exists() {
            Some((record, dir))
        } else {
            None
        }
    }

    /// Record the most recently finished instance of a machinetype
    pub fn write_finish(&self, finish: &FinishRecord) -> Result<()> {
        write_atomic(
            self.finishes_dir().join(&finish.machinetype),
            format!(
                "{} {} {}\n",
                finish.created, finish.machinetype, finish.hostname
            ),
        )
    }

    pub fn read_finish(&self, machinetype: &str) -> Option<FinishRecord> {
        let content = fs::read_to_string(self.finishes_dir().join(machinetype)).ok()?;
        FinishRecord::parse(&content)
    }

    /// Machine directory a finishes record points to
    pub fn finished_machine_dir(&self, finish: &FinishRecord) -> MachineDir {
        MachineDir::new(self.machines_dir().join(format!(
            "{}_{}_{}",
            finish.created, finish.machinetype, finish.hostname
        )))
    }

    /// All per-instance directories under `machines/`
    pub fn list_machine_dirs(&self) -> Result<Vec<MachineDirEntry>> {
        let machines_dir = self.machines_dir();
        let entries = match fs::read_dir(&machines_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FactoryError::io(&machines_dir, e)),
        };

        let mut dirs = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(parsed) = MachineDirEntry::parse(&name, entry.path()) {
                dirs.push(parsed);
            }
        }
        dirs.sort_by_key(|d| d.created);
        Ok(dirs)
    }

    pub fn touch_factory_heartbeat(&self, now: i64) -> Result<()> {
        write_atomic(self.factory_heartbeat_path(), format!("{}\n", now))
    }

    pub fn factory_heartbeat_time(&self) -> Option<i64> {
        mtime_secs(&self.factory_heartbeat_path())
    }
}

/// Contents of `finishes/<machinetype>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishRecord {
    pub created: i64,
    pub machinetype: String,
    pub hostname: String,
}

impl FinishRecord {
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        Some(Self {
            created: parts.next()?.parse().ok()?,
            machinetype: parts.next()?.to_string(),
            hostname: parts.next()?.to_string(),
        })
    }
}

/// A `machines/<created>_<type>_<hostname>` directory found on disk
#[derive(Debug, Clone)]
pub struct MachineDirEntry {
    pub created: i64,
    pub machinetype: String,
    pub hostname: String,
    pub dir: MachineDir,
}

impl MachineDirEntry {
    /// Machinetype names may contain underscores, hostnames may not
    pub fn parse(name: &str, path: PathBuf) -> Option<Self> {
        let (created, rest) = name.split_once('_')?;
        let (machinetype, hostname) = rest.rsplit_once('_')?;
        if machinetype.is_empty() || hostname.is_empty() {
            return None;
        }
        Some(Self {
            created: created.parse().ok()?,
            machinetype: machinetype.to_string(),
            hostname: hostname.to_string(),
            dir: MachineDir::new(path),
        })
    }
}

/// Last heartbeat line and the time it was written
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatRecord {
    pub time: i64,
    pub cpu_seconds: u64,
    pub cpu_percentage: f64,
}

impl HeartbeatRecord {
    pub fn parse_line(line: &str, time: i64) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let cpu_seconds = parts.next()?.parse::<f64>().ok()?;
        let cpu_percentage = parts
            .next()
            .and_then(|p| p.parse::<f64>().ok())
            .unwrap_or(0.0);
        Some(Self {
            time,
            cpu_seconds: cpu_seconds.max(0.0) as u64,
            cpu_percentage: cpu_percentage.max(0.0),
        })
    }

    pub fn to_line(&self) -> String {
        format!("{} {:.1}\n", self.cpu_seconds, self.cpu_percentage)
    }
}

/// Per-instance directory with typed accessors for its marker files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineDir {
    path: PathBuf,
}

impl MachineDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Create the directory with its feature and output subdirectories
    pub fn create(&self) -> Result<()> {
        for sub in [files::JOBFEATURES, files::MACHINEFEATURES, files::JOBOUTPUTS] {
            let dir = self.path.join(sub);
            fs::create_dir_all(&dir).map_err(|e| FactoryError::io(&dir, e))?;
        }
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FactoryError::io(&self.path, e)),
        }
    }

    pub fn read_string(&self, name: &str) -> Option<String> {
        let content = fs::read_to_string(self.file(name)).ok()?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn read_i64(&self, name: &str) -> Option<i64> {
        self.read_string(name)?.parse().ok()
    }

    pub fn read_u64(&self, name: &str) -> Option<u64> {
        self.read_string(name)?.parse().ok()
    }

    pub fn write(&self, name: &str, content: impl AsRef<[u8]>) -> Result<()> {
        write_atomic(self.file(name), content)
    }

    pub fn write_value(&self, name: &str, value: impl std::fmt::Display) -> Result<()> {
        self.write(name, format!("{}\n", value))
    }

    pub fn started(&self) -> Option<i64> {
        self.read_i64(files::STARTED)
    }

    pub fn finished(&self) -> Option<i64> {
        self.read_i64(files::FINISHED)
    }

    pub fn uuid(&self) -> Option<String> {
        self.read_string(files::UUID)
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.read_string(files::IP)?.parse().ok()
    }

    pub fn heartbeat(&self) -> Option<HeartbeatRecord> {
        let path = self.file(files::HEARTBEAT);
        let time = mtime_secs(&path)?;
        let content = fs::read_to_string(&path).ok()?;
        HeartbeatRecord::parse_line(&content, time)
    }

    /// Write the heartbeat line, stamping the file with `record.time`
    pub fn write_heartbeat(&self, record: &HeartbeatRecord) -> Result<()> {
        self.write(files::HEARTBEAT, record.to_line())?;
        self.set_mtime(files::HEARTBEAT, record.time)
    }

    /// Set a file's modification time to UNIX second `secs`
    pub fn set_mtime(&self, name: &str, secs: i64) -> Result<()> {
        let path = self.file(name);
        let when = UNIX_EPOCH + Duration::from_secs(u64::try_from(secs).unwrap_or(0));
        fs::File::options()
            .write(true)
            .open(&path)
            .and_then(|f| f.set_modified(when))
            .map_err(|e| FactoryError::io(&path, e))
    }

    pub fn shutdown_message(&self) -> Option<ShutdownMessage> {
        ShutdownMessage::parse(&self.read_string(files::SHUTDOWN_MESSAGE)?)
    }

    /// Store the shutdown message unless one is already present
    pub fn write_shutdown_message_once(&self, message: &ShutdownMessage, now: i64) -> Result<bool> {
        let written = write_once(
            self.file(files::SHUTDOWN_MESSAGE),
            format!("{}\n", message),
        )?;
        if written {
            self.write_value(files::SHUTDOWN_TIME, now)?;
        }
        Ok(written)
    }
}

/// Modification time in UNIX seconds, `None` when the file is absent
pub fn mtime_secs(path: &Path) -> Option<i64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let secs = modified.duration_since(UNIX_EPOCH).ok()?.as_secs();
    i64::try_from(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BackendModel;
    use tempfile::TempDir;

    fn record() -> SlotRecord {
        SlotRecord {
            created: 1700000000,
            machinetype: "batch".to_string(),
            model: BackendModel::Docker,
        }
    }

    #[test]
    fn test_slot_record_round_trip_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        store.ensure_layout().unwrap();

        assert!(store.read_slot_record("host-00.example.com").is_none());
        store
            .write_slot_record("host-00.example.com", &record())
            .unwrap();
        assert_eq!(
            store.read_slot_record("host-00.example.com"),
            Some(record())
        );
    }

    #[test]
    fn test_unreadable_slot_record_is_absent() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        store.ensure_layout().unwrap();
        fs::write(store.slot_file("host-01.example.com"), "garbage\n").unwrap();

        assert!(store.read_slot_record("host-01.example.com").is_none());
    }

    #[test]
    fn test_current_machine_dir_requires_directory() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        store.ensure_layout().unwrap();
        store
            .write_slot_record("host-00.example.com", &record())
            .unwrap();

        assert!(store.current_machine_dir("host-00.example.com").is_none());

        store
            .machine_dir("host-00.example.com", &record())
            .create()
            .unwrap();
        let (_, machine_dir) = store.current_machine_dir("host-00.example.com").unwrap();
        assert!(machine_dir.file(files::JOBFEATURES).is_dir());
        assert!(machine_dir.file(files::JOBOUTPUTS).is_dir());
    }

    #[test]
    fn test_markers_are_optional() {
        let dir = TempDir::new().unwrap();
        let machine_dir = MachineDir::new(dir.path().join("m"));
        machine_dir.create().unwrap();

        assert_eq!(machine_dir.started(), None);
        assert_eq!(machine_dir.finished(), None);
        assert_eq!(machine_dir.heartbeat(), None);
        assert_eq!(machine_dir.shutdown_message(), None);

        machine_dir.write_value(files::STARTED, 1700000100).unwrap();
        assert_eq!(machine_dir.started(), Some(1700000100));
    }

    #[test]
    fn test_heartbeat_round_trip() {
        let dir = TempDir::new().unwrap();
        let machine_dir = MachineDir::new(dir.path().join("m"));
        machine_dir.create().unwrap();

        machine_dir
            .write_heartbeat(&HeartbeatRecord {
                time: 1_700_000_120,
                cpu_seconds: 42,
                cpu_percentage: 87.26,
            })
            .unwrap();

        let heartbeat = machine_dir.heartbeat().unwrap();
        assert_eq!(heartbeat.cpu_seconds, 42);
        assert!((heartbeat.cpu_percentage - 87.3).abs() < 1e-9);
        assert_eq!(heartbeat.time, 1_700_000_120);
    }

    #[test]
    fn test_heartbeat_without_percentage() {
        let record = HeartbeatRecord::parse_line("120\n", 5).unwrap();
        assert_eq!(record.cpu_seconds, 120);
        assert_eq!(record.cpu_percentage, 0.0);
        assert!(HeartbeatRecord::parse_line("", 5).is_none());
    }

    #[test]
    fn test_shutdown_message_written_once() {
        let dir = TempDir::new().unwrap();
        let machine_dir = MachineDir::new(dir.path().join("m"));
        machine_dir.create().unwrap();

        let first = ShutdownMessage::new(300, "Nothing to do");
        let second = ShutdownMessage::new(700, "Destroyed");
        assert!(machine_dir.write_shutdown_message_once(&first, 10).unwrap());
        assert!(!machine_dir.write_shutdown_message_once(&second, 20).unwrap());

        assert_eq!(machine_dir.shutdown_message(), Some(first));
        assert_eq!(machine_dir.read_i64(files::SHUTDOWN_TIME), Some(10));
    }

    #[test]
    fn test_machine_dir_entry_parse() {
        let entry = MachineDirEntry::parse(
            "1700000000_big_batch_host-02.example.com",
            PathBuf::from("/x"),
        )
        .unwrap();
        assert_eq!(entry.created, 1700000000);
        assert_eq!(entry.machinetype, "big_batch");
        assert_eq!(entry.hostname, "host-02.example.com");

        assert!(MachineDirEntry::parse("junk", PathBuf::from("/x")).is_none());
        assert!(MachineDirEntry::parse("abc_batch_host", PathBuf::from("/x")).is_none());
    }

    #[test]
    fn test_finish_record() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        store.ensure_layout().unwrap();

        let finish = FinishRecord {
            created: 1700000000,
            machinetype: "batch".to_string(),
            hostname: "host-00.example.com".to_string(),
        };
        store.write_finish(&finish).unwrap();
        assert_eq!(store.read_finish("batch"), Some(finish));
        assert_eq!(store.read_finish("other"), None);
    }

    #[test]
    fn test_list_machine_dirs_sorted() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        store.ensure_layout().unwrap();
        for name in [
            "1700000200_batch_host-01.example.com",
            "1700000100_batch_host-00.example.com",
            "not-a-machine",
        ] {
            fs::create_dir_all(store.machines_dir().join(name)).unwrap();
        }

        let dirs = store.list_machine_dirs().unwrap();
        assert_eq!(dirs.len(), 2);
        assert_eq!(dirs[0].hostname, "host-00.example.com");
        assert_eq!(dirs[1].created, 1700000200);
    }
}
