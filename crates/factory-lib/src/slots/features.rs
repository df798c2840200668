//! Machine/Job Features values published to each instance
//!
//! One file per key under `machinefeatures/` and `jobfeatures/`, each holding
//! a single number followed by a newline.

use crate::error::Result;
use crate::store::{files, write_atomic, MachineDir};
use std::collections::BTreeMap;

const MIB: u64 = 1024 * 1024;

/// Numbers the feature files are computed from
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureInputs {
    pub processors: u32,
    pub mb_per_processor: u64,
    pub created: i64,
    pub shutdown_deadline: i64,
    pub max_wallclock_seconds: i64,
    pub grace_secs: u64,
    pub hs06_per_processor: Option<f64>,
    pub scratch_bytes: Option<u64>,
}

pub fn machine_features(inputs: &FeatureInputs) -> BTreeMap<&'static str, String> {
    let cores = inputs.processors.to_string();
    let mut features = BTreeMap::from([
        ("total_cpu", cores.clone()),
        ("log_cores", cores.clone()),
        ("phys_cores", cores),
        ("jobslots", "1".to_string()),
        ("shutdowntime", inputs.shutdown_deadline.to_string()),
        ("grace_secs", inputs.grace_secs.to_string()),
    ]);
    if let Some(hs06) = inputs.hs06_per_processor {
        features.insert("hs06", format_hs06(hs06 * f64::from(inputs.processors)));
    }
    features
}

pub fn job_features(inputs: &FeatureInputs) -> BTreeMap<&'static str, String> {
    let memory_bytes = inputs.mb_per_processor * u64::from(inputs.processors) * MIB;
    let wall_limit = inputs
        .max_wallclock_seconds
        .min(inputs.shutdown_deadline - inputs.created)
        .max(0);
    let mut features = BTreeMap::from([
        ("allocated_cpu", inputs.processors.to_string()),
        ("wall_limit_secs", wall_limit.to_string()),
        (
            "cpu_limit_secs",
            (wall_limit * i64::from(inputs.processors)).to_string(),
        ),
        ("max_rss_bytes", memory_bytes.to_string()),
        ("mem_limit_bytes", memory_bytes.to_string()),
        ("shutdowntime_job", inputs.shutdown_deadline.to_string()),
        ("jobstart_secs", inputs.created.to_string()),
    ]);
    if let Some(hs06) = inputs.hs06_per_processor {
        features.insert("hs06_job", format_hs06(hs06 * f64::from(inputs.processors)));
    }
    if let Some(bytes) = inputs.scratch_bytes {
        features.insert("scratch_limit_bytes", bytes.to_string());
    }
    features
}

fn format_hs06(value: f64) -> String {
    format!("{:.2}", value)
}

/// Write both feature directories of a machine directory
pub fn write_features(dir: &MachineDir, inputs: &FeatureInputs) -> Result<()> {
    for (sub, features) in [
        (files::MACHINEFEATURES, machine_features(inputs)),
        (files::JOBFEATURES, job_features(inputs)),
    ] {
        let base = dir.file(sub);
        for (key, value) in features {
            write_atomic(base.join(key), format!("{}\n", value))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn inputs() -> FeatureInputs {
        FeatureInputs {
            processors: 4,
            mb_per_processor: 2048,
            created: 1_700_000_000,
            shutdown_deadline: 1_700_086_400,
            max_wallclock_seconds: 172_800,
            grace_secs: 30,
            hs06_per_processor: Some(10.5),
            scratch_bytes: None,
        }
    }

    #[test]
    fn test_limits_scale_with_processors() {
        let job = job_features(&inputs());
        assert_eq!(job["allocated_cpu"], "4");
        // Deadline is closer than the wall clock limit
        assert_eq!(job["wall_limit_secs"], "86400");
        assert_eq!(job["cpu_limit_secs"], "345600");
        assert_eq!(job["mem_limit_bytes"], (8192u64 * 1024 * 1024).to_string());
        assert_eq!(job["hs06_job"], "42.00");
        assert!(!job.contains_key("scratch_limit_bytes"));

        let machine = machine_features(&inputs());
        assert_eq!(machine["total_cpu"], "4");
        assert_eq!(machine["phys_cores"], "4");
        assert_eq!(machine["shutdowntime"], "1700086400");
    }

    #[test]
    fn test_write_features_populates_directories() {
        let dir = TempDir::new().unwrap();
        let machine_dir = MachineDir::new(dir.path().join("m"));
        machine_dir.create().unwrap();
        let mut inputs = inputs();
        inputs.hs06_per_processor = None;
        inputs.scratch_bytes = Some(42);

        write_features(&machine_dir, &inputs).unwrap();

        let read = |path: &str| std::fs::read_to_string(machine_dir.file(path)).unwrap();
        assert_eq!(read("machinefeatures/log_cores"), "4\n");
        assert_eq!(read("jobfeatures/scratch_limit_bytes"), "42\n");
        assert!(!machine_dir.file("machinefeatures/hs06").exists());
    }
}
