//! Per-machinetype aggregates reported in `machinetype_status`
//!
//! Counts come from markers on disk, not from backend liveness, so a
//! responder and the local allocator agree on what is running.

use crate::config::InstanceType;
use crate::models::{LogicalMachine, ShutdownMessage};
use crate::store::StateStore;

/// Heartbeats older than this do not count as running
pub const RUNNING_HEARTBEAT_SECS: i64 = 900;
/// Instances created longer ago than this no longer count as starting
pub const STARTING_RECENT_SECS: i64 = 3600;

/// Outcome of the newest finished instance of a machinetype
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastShutdown {
    pub machine: String,
    pub message: Option<ShutdownMessage>,
    pub time: Option<i64>,
}

impl LastShutdown {
    /// Abnormal finishes and fizzles hold back new instances of the type
    pub fn is_abnormal(&self) -> bool {
        self.message.as_ref().is_some_and(|m| !m.is_normal())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MachinetypeAggregate {
    pub running_machines: u32,
    pub running_processors: u32,
    pub running_hs06: f64,
    pub starting_processors: u32,
    pub before_fizzle_processors: u32,
    pub last_shutdown: Option<LastShutdown>,
}

impl MachinetypeAggregate {
    /// Tally the slots currently running instances of `itype`
    pub fn collect(itype: &InstanceType, machines: &[LogicalMachine], now: i64) -> Self {
        let mut aggregate = Self::default();

        for machine in machines {
            if machine.machinetype.as_deref() != Some(itype.name.as_str()) {
                continue;
            }
            if machine.finished.is_some() {
                continue;
            }

            match machine.started {
                Some(started) => {
                    // Inside the minimum-run window whether or not it has
                    // heartbeated yet
                    if now - started < itype.fizzle_seconds {
                        aggregate.before_fizzle_processors += machine.processors;
                    }
                    let fresh = machine
                        .heartbeat
                        .is_some_and(|h| now - h <= RUNNING_HEARTBEAT_SECS);
                    if fresh {
                        aggregate.running_machines += 1;
                        aggregate.running_processors += machine.processors;
                        if let Some(hs06) = itype.hs06_per_processor {
                            aggregate.running_hs06 += hs06 * f64::from(machine.processors);
                        }
                    }
                }
                None => {
                    if machine
                        .created
                        .is_some_and(|c| now - c <= STARTING_RECENT_SECS)
                    {
                        aggregate.starting_processors += machine.processors;
                    }
                }
            }
        }

        aggregate
    }

    pub fn with_last_shutdown(mut self, last: Option<LastShutdown>) -> Self {
        self.last_shutdown = last;
        self
    }
}

/// Newest finished instance of `itype`, from its finishes record
///
/// An instance that left no shutdown message but ran for less than the
/// fizzle threshold is reported with a synthesised fizzle message.
pub fn last_shutdown(store: &StateStore, itype: &InstanceType) -> Option<LastShutdown> {
    let finish = store.read_finish(&itype.name)?;
    let dir = store.finished_machine_dir(&finish);

    let mut last = LastShutdown {
        machine: finish.hostname,
        message: None,
        time: None,
    };
    if !dir.exists() {
        return Some(last);
    }

    if let Some(message) = dir.shutdown_message() {
        last.time = dir.read_i64(crate::store::files::SHUTDOWN_TIME).or(dir.finished());
        last.message = Some(message);
        return Some(last);
    }

    if let (Some(started), Some(finished)) = (dir.started(), dir.finished()) {
        let ran = finished - started;
        if ran < itype.fizzle_seconds {
            last.message = Some(ShutdownMessage::new(
                700,
                format!("Instance fizzled after {} seconds", ran.max(0)),
            ));
            last.time = Some(finished);
        }
    }
    Some(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MachineState, ShutdownMessage};
    use crate::slots::testing::{slot_fixture, T0};

    fn running(ordinal: usize, started: i64, heartbeat: Option<i64>) -> LogicalMachine {
        let mut machine = LogicalMachine::unknown(ordinal, format!("host-{:02}.example.com", ordinal));
        machine.state = MachineState::Running;
        machine.machinetype = Some("batch".into());
        machine.created = Some(started);
        machine.started = Some(started);
        machine.heartbeat = heartbeat;
        machine.processors = 2;
        machine
    }

    fn batch() -> InstanceType {
        let dir = std::path::Path::new("/tmp");
        crate::config::testing::snapshot(dir, "docker").machinetypes["batch"].clone()
    }

    #[test]
    fn test_running_needs_fresh_heartbeat() {
        let itype = batch();
        let now = T0 + 2000;
        let machines = vec![
            running(0, T0, Some(now - 60)),
            running(1, T0, Some(now - RUNNING_HEARTBEAT_SECS - 1)),
            running(2, T0, None),
        ];

        let aggregate = MachinetypeAggregate::collect(&itype, &machines, now);

        assert_eq!(aggregate.running_machines, 1);
        assert_eq!(aggregate.running_processors, 2);
        assert!((aggregate.running_hs06 - 20.0).abs() < 1e-9);
        // Started 2000s ago, past the 600s fizzle window
        assert_eq!(aggregate.before_fizzle_processors, 0);
    }

    #[test]
    fn test_fresh_instance_is_before_fizzle_without_heartbeat() {
        let itype = batch();
        let now = T0 + 30;
        let machines = vec![running(0, T0, None), running(1, T0 - 1000, None)];

        let aggregate = MachinetypeAggregate::collect(&itype, &machines, now);

        assert_eq!(aggregate.running_machines, 0);
        assert_eq!(aggregate.starting_processors, 0);
        assert_eq!(aggregate.before_fizzle_processors, 2);
    }

    #[tokio::test]
    async fn test_just_started_instance_counts_before_fizzle() {
        let f = slot_fixture("docker");
        let itype = f.manager.config().current().await.machinetypes["batch"].clone();

        f.manager.create(0, "batch", 1, T0 + 3600).await.unwrap();
        f.clock.advance(30);

        let machines = f.manager.machines().await;
        assert_eq!(machines[0].state, MachineState::Running);
        assert_eq!(machines[0].heartbeat, None);
        let aggregate = MachinetypeAggregate::collect(&itype, &machines, T0 + 30);
        assert_eq!(aggregate.before_fizzle_processors, 1);
    }

    #[test]
    fn test_starting_only_when_recent_and_not_started() {
        let itype = batch();
        let now = T0 + 10_000;
        let mut recent = running(0, now - 100, None);
        recent.started = None;
        let mut stale = running(1, now - STARTING_RECENT_SECS - 1, None);
        stale.started = None;
        let mut finished = running(2, now - 50, Some(now - 10));
        finished.finished = Some(now - 5);
        let mut other = running(3, now - 10, Some(now - 10));
        other.machinetype = Some("other".into());

        let aggregate =
            MachinetypeAggregate::collect(&itype, &[recent, stale, finished, other], now);

        assert_eq!(aggregate.starting_processors, 2);
        assert_eq!(aggregate.running_machines, 0);
    }

    #[tokio::test]
    async fn test_short_run_reports_before_fizzle_then_fizzle_message() {
        let f = slot_fixture("docker");
        let snapshot = f.manager.config().current().await;
        let itype = snapshot.machinetypes["batch"].clone();
        assert_eq!(itype.fizzle_seconds, 600);

        f.manager.create(0, "batch", 1, T0 + 3600).await.unwrap();
        f.clock.advance(120);
        f.fakes.docker.set_cpu("host-00.example.com", 100.0);
        f.manager.heartbeat(0).await.unwrap().unwrap();

        let machines = f.manager.machines().await;
        let aggregate = MachinetypeAggregate::collect(&itype, &machines, T0 + 120);
        assert_eq!(aggregate.running_machines, 1);
        assert_eq!(aggregate.before_fizzle_processors, 1);

        f.manager.destroy(0, None).await.unwrap();

        let last = last_shutdown(f.manager.store(), &itype).unwrap();
        assert_eq!(last.machine, "host-00.example.com");
        assert_eq!(last.time, Some(T0 + 120));
        let message = last.message.clone().unwrap();
        assert_eq!(message.code, 700);
        assert!(message.text.contains("fizzle"));
        assert!(message.text.contains("120"));
        assert!(last.is_abnormal());

        let machines = f.manager.machines().await;
        let aggregate = MachinetypeAggregate::collect(&itype, &machines, T0 + 120);
        assert_eq!(aggregate.running_machines, 0);
        assert_eq!(aggregate.before_fizzle_processors, 0);
    }

    #[tokio::test]
    async fn test_recorded_message_wins_over_fizzle() {
        let f = slot_fixture("docker");
        let itype = f.manager.config().current().await.machinetypes["batch"].clone();

        f.manager.create(1, "batch", 1, T0 + 3600).await.unwrap();
        f.clock.advance(30);
        f.manager
            .destroy(1, Some(ShutdownMessage::new(300, "Nothing to do")))
            .await
            .unwrap();

        let last = last_shutdown(f.manager.store(), &itype).unwrap();
        assert_eq!(last.message, Some(ShutdownMessage::new(300, "Nothing to do")));
        assert_eq!(last.time, Some(T0 + 30));
        assert!(!last.is_abnormal());
    }

    #[tokio::test]
    async fn test_no_finishes_record() {
        let f = slot_fixture("docker");
        let itype = f.manager.config().current().await.machinetypes["batch"].clone();
        assert_eq!(last_shutdown(f.manager.store(), &itype), None);
    }
}
