//! `fquery factories`

use anyhow::Result;
use chrono::Utc;
use colored::Colorize;
use factory_lib::protocol::{FactoryStatus, Message, Peer, QueryKind, Requester};
use tabled::Tabled;

use super::query;
use crate::output::{format_age, format_kb, print_info, print_rows, OutputFormat};

#[derive(Tabled)]
struct FactoryRow {
    #[tabled(rename = "Factory")]
    factory: String,
    #[tabled(rename = "Machines")]
    machines: u32,
    #[tabled(rename = "Processors")]
    processors: String,
    #[tabled(rename = "Types")]
    machinetypes: usize,
    #[tabled(rename = "Memory")]
    memory: String,
    #[tabled(rename = "Load")]
    load: String,
    #[tabled(rename = "Disk Free")]
    disk: String,
    #[tabled(rename = "Kernel")]
    kernel: String,
    #[tabled(rename = "Heartbeat")]
    heartbeat: String,
}

fn row(status: &FactoryStatus, now: i64) -> FactoryRow {
    FactoryRow {
        factory: status.factory.clone(),
        machines: status.running_machines,
        processors: format!("{}/{}", status.running_processors, status.total_processors),
        machinetypes: status.num_machinetypes,
        memory: format_kb(status.mem_total_kb),
        load: format!("{:.2}", status.load_average),
        disk: format_kb(status.base_disk_avail_kb),
        kernel: status.kernel_version.clone(),
        heartbeat: format_age(status.factory_heartbeat_time, now),
    }
}

/// Query and show the status of each factory
pub async fn show(requester: &Requester, peers: &[Peer], format: OutputFormat) -> Result<()> {
    let statuses: Vec<FactoryStatus> = query(requester, QueryKind::Factory, peers)
        .await?
        .into_iter()
        .filter_map(|m| match m {
            Message::FactoryStatus(s) => Some(s),
            _ => None,
        })
        .collect();

    let now = Utc::now().timestamp();
    let rows = statuses.iter().map(|s| row(s, now)).collect();
    print_rows(rows, &statuses, format);

    if matches!(format, OutputFormat::Table) && !statuses.is_empty() {
        let running: u32 = statuses.iter().map(|s| s.running_processors).sum();
        let total: u32 = statuses.iter().map(|s| s.total_processors).sum();
        print_info(&format!(
            "{} factories, {} of {} processors in use",
            statuses.len().to_string().bold(),
            running,
            total
        ));
    }
    Ok(())
}
