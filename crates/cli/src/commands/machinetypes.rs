//! `fquery machinetypes`

use anyhow::Result;
use factory_lib::protocol::{MachinetypeStatus, Message, Peer, QueryKind, Requester};
use tabled::Tabled;

use super::query;
use crate::output::{color_shutdown, format_timestamp, optional, print_rows, OutputFormat};

#[derive(Tabled)]
struct MachinetypeRow {
    #[tabled(rename = "Factory")]
    factory: String,
    #[tabled(rename = "Type")]
    machinetype: String,
    #[tabled(rename = "Running")]
    running: u32,
    #[tabled(rename = "CPUs")]
    processors: u32,
    #[tabled(rename = "HS06")]
    hs06: String,
    #[tabled(rename = "Starting")]
    starting: u32,
    #[tabled(rename = "Before Fizzle")]
    before_fizzle: u32,
    #[tabled(rename = "Last Shutdown")]
    shutdown: String,
    #[tabled(rename = "At")]
    shutdown_time: String,
    #[tabled(rename = "By")]
    shutdown_machine: String,
}

fn row(status: &MachinetypeStatus) -> MachinetypeRow {
    MachinetypeRow {
        factory: status.factory.clone(),
        machinetype: status.machinetype.clone(),
        running: status.running_machines,
        processors: status.running_processors,
        hs06: format!("{:.1}", status.running_hs06),
        starting: status.starting_processors,
        before_fizzle: status.before_fizzle_processors,
        shutdown: color_shutdown(status.shutdown_message.as_deref()),
        shutdown_time: format_timestamp(status.shutdown_time),
        shutdown_machine: optional(status.shutdown_machine.as_deref()),
    }
}

/// Query and show each factory's per-machinetype totals
pub async fn show(requester: &Requester, peers: &[Peer], format: OutputFormat) -> Result<()> {
    let statuses: Vec<MachinetypeStatus> = query(requester, QueryKind::Machinetypes, peers)
        .await?
        .into_iter()
        .filter_map(|m| match m {
            Message::MachinetypeStatus(s) => Some(s),
            _ => None,
        })
        .collect();

    let rows = statuses.iter().map(row).collect();
    print_rows(rows, &statuses, format);
    Ok(())
}
