//! `fquery machines`

use anyhow::Result;
use chrono::Utc;
use factory_lib::protocol::{MachineStatus, Message, Peer, QueryKind, Requester};
use factory_lib::MachineState;
use std::collections::BTreeMap;
use tabled::Tabled;

use super::query;
use crate::output::{
    color_shutdown, color_state, format_age, format_timestamp, optional, print_info, print_rows,
    OutputFormat,
};

#[derive(Tabled)]
struct MachineRow {
    #[tabled(rename = "Machine")]
    machine: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Type")]
    machinetype: String,
    #[tabled(rename = "CPUs")]
    processors: u32,
    #[tabled(rename = "CPU %")]
    cpu: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Heartbeat")]
    heartbeat: String,
    #[tabled(rename = "Shutdown")]
    shutdown: String,
}

fn row(status: &MachineStatus, now: i64) -> MachineRow {
    let busy = status.state != MachineState::Unknown;
    MachineRow {
        machine: status.machine.clone(),
        state: color_state(status.state),
        machinetype: optional(status.machinetype.as_deref()),
        processors: status.num_processors,
        cpu: if busy {
            format!("{:.1}", status.cpu_percentage)
        } else {
            "-".to_string()
        },
        created: format_timestamp(status.created_time),
        heartbeat: format_age(status.heartbeat_time, now),
        shutdown: color_shutdown(status.shutdown_message.as_deref()),
    }
}

/// Slots per state across every reply
fn count_states(statuses: &[MachineStatus]) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for status in statuses {
        *counts.entry(status.state.as_str()).or_insert(0) += 1;
    }
    counts
}

/// Query and show every slot of each factory
pub async fn show(requester: &Requester, peers: &[Peer], format: OutputFormat) -> Result<()> {
    let statuses: Vec<MachineStatus> = query(requester, QueryKind::Machines, peers)
        .await?
        .into_iter()
        .filter_map(|m| match m {
            Message::MachineStatus(s) => Some(s),
            _ => None,
        })
        .collect();

    let now = Utc::now().timestamp();
    let rows = statuses.iter().map(|s| row(s, now)).collect();
    print_rows(rows, &statuses, format);

    if matches!(format, OutputFormat::Table) && !statuses.is_empty() {
        let summary: Vec<String> = count_states(&statuses)
            .into_iter()
            .map(|(state, n)| format!("{} {}", n, state))
            .collect();
        print_info(&summary.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use factory_lib::protocol::QUERY_VERSION;

    fn status(machine: &str, state: MachineState) -> MachineStatus {
        MachineStatus {
            space: "space.example.com".into(),
            cookie: "c00k1e".into(),
            query_version: QUERY_VERSION.into(),
            factory: "vac01.example.com".into(),
            num_machines: 2,
            machine: machine.into(),
            state,
            uuid: None,
            created_time: None,
            started_time: None,
            heartbeat_time: None,
            num_processors: 0,
            cpu_seconds: 0,
            cpu_percentage: 0.0,
            machinetype: None,
            shutdown_message: None,
            shutdown_time: None,
        }
    }

    #[test]
    fn test_idle_slot_row_has_placeholders() {
        let row = row(&status("vac01-00.example.com", MachineState::Unknown), 100);

        assert_eq!(row.machinetype, "-");
        assert_eq!(row.cpu, "-");
        assert_eq!(row.created, "-");
        assert_eq!(row.heartbeat, "-");
        assert_eq!(row.shutdown, "-");
    }

    #[test]
    fn test_running_slot_row() {
        let mut running = status("vac01-01.example.com", MachineState::Running);
        running.machinetype = Some("atlas".into());
        running.num_processors = 4;
        running.cpu_percentage = 387.26;
        running.heartbeat_time = Some(1_700_000_000);

        let row = row(&running, 1_700_000_045);

        assert_eq!(row.machinetype, "atlas");
        assert_eq!(row.processors, 4);
        assert_eq!(row.cpu, "387.3");
        assert_eq!(row.heartbeat, "45s");
    }

    #[test]
    fn test_count_states() {
        let statuses = vec![
            status("a", MachineState::Running),
            status("b", MachineState::Running),
            status("c", MachineState::Unknown),
        ];

        let counts = count_states(&statuses);

        assert_eq!(counts["running"], 2);
        assert_eq!(counts["unknown"], 1);
        assert!(!counts.contains_key("zombie"));
    }
}
