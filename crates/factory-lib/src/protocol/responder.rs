//! Answering queries about this factory
//!
//! Answers are computed from the slot manager's view and the store on every
//! query. Nothing here writes to disk or changes a slot.

use super::aggregate::{last_shutdown, MachinetypeAggregate};
use super::hostinfo::HostInfo;
use super::messages::{
    FactoryStatus, MachineStatus, MachinetypeStatus, Message, Query, QueryKind, MAX_DATAGRAM,
    QUERY_VERSION,
};
use crate::config::ConfigSnapshot;
use crate::error::{FactoryError, Result};
use crate::models::{LogicalMachine, MachineState};
use crate::observability::FactoryMetrics;
use crate::slots::SlotManager;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub struct Responder {
    manager: Arc<SlotManager>,
    metrics: FactoryMetrics,
}

impl Responder {
    pub fn new(manager: Arc<SlotManager>) -> Self {
        Self {
            manager,
            metrics: FactoryMetrics::new(),
        }
    }

    /// Bind the query port on all addresses
    pub async fn bind(port: u16) -> Result<UdpSocket> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        UdpSocket::bind(addr)
            .await
            .map_err(|e| FactoryError::io(format!("udp:{}", port), e))
    }

    /// Status messages answering one datagram
    ///
    /// Anything that is not a well-formed query for this space yields no
    /// reply at all.
    pub async fn answer(&self, datagram: &[u8]) -> Vec<Message> {
        let message = match Message::decode(datagram) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Discarding undecodable datagram");
                self.metrics.inc_protocol_datagrams_discarded();
                return Vec::new();
            }
        };
        let Some((kind, query)) = message.as_query() else {
            debug!(message_type = message.message_type(), "Discarding non-query message");
            self.metrics.inc_protocol_datagrams_discarded();
            return Vec::new();
        };

        let snapshot = self.manager.config().current().await;
        if query.space != snapshot.space {
            debug!(space = %query.space, "Discarding query for another space");
            self.metrics.inc_protocol_datagrams_discarded();
            return Vec::new();
        }

        let machines = self.manager.machines().await;
        let replies = match kind {
            QueryKind::Factory => vec![Message::FactoryStatus(
                self.factory_status(&snapshot, query, &machines),
            )],
            QueryKind::Machines => self
                .machine_statuses(&snapshot, query, &machines)
                .into_iter()
                .map(Message::MachineStatus)
                .collect(),
            QueryKind::Machinetypes => self
                .machinetype_statuses(&snapshot, query, &machines)
                .into_iter()
                .map(Message::MachinetypeStatus)
                .collect(),
        };
        self.metrics.inc_protocol_queries_answered(kind.query_type());
        replies
    }

    pub fn factory_status(
        &self,
        snapshot: &ConfigSnapshot,
        query: &Query,
        machines: &[LogicalMachine],
    ) -> FactoryStatus {
        let running: Vec<&LogicalMachine> = machines
            .iter()
            .filter(|m| m.state == MachineState::Running)
            .collect();
        let host = HostInfo::probe(&snapshot.proc_root, &snapshot.base_dir);

        FactoryStatus {
            space: snapshot.space.clone(),
            cookie: query.cookie.clone(),
            query_version: QUERY_VERSION.to_string(),
            factory: snapshot.factory_name.clone(),
            total_processors: snapshot.total_processors,
            running_processors: running.iter().map(|m| m.processors).sum(),
            running_machines: running.len() as u32,
            num_machinetypes: snapshot.machinetypes.len(),
            mem_total_kb: host.mem_total_kb,
            load_average: host.load_average,
            kernel_version: host.kernel_version,
            boot_time: host.boot_time,
            base_disk_avail_kb: host.base_disk_avail_kb,
            base_disk_avail_inodes: host.base_disk_avail_inodes,
            factory_heartbeat_time: self.manager.store().factory_heartbeat_time(),
        }
    }

    /// One status per slot, empty slots included
    pub fn machine_statuses(
        &self,
        snapshot: &ConfigSnapshot,
        query: &Query,
        machines: &[LogicalMachine],
    ) -> Vec<MachineStatus> {
        machines
            .iter()
            .map(|m| MachineStatus {
                space: snapshot.space.clone(),
                cookie: query.cookie.clone(),
                query_version: QUERY_VERSION.to_string(),
                factory: snapshot.factory_name.clone(),
                num_machines: machines.len(),
                machine: m.hostname.clone(),
                state: m.state,
                uuid: m.uuid.clone(),
                created_time: m.created,
                started_time: m.started,
                heartbeat_time: m.heartbeat,
                num_processors: m.processors,
                cpu_seconds: m.cpu_seconds,
                cpu_percentage: m.cpu_percentage,
                machinetype: m.machinetype.clone(),
                shutdown_message: m.shutdown_message.as_ref().map(ToString::to_string),
                shutdown_time: m.shutdown_time,
            })
            .collect()
    }

    pub fn machinetype_statuses(
        &self,
        snapshot: &ConfigSnapshot,
        query: &Query,
        machines: &[LogicalMachine],
    ) -> Vec<MachinetypeStatus> {
        let now = self.manager.clock().now();
        let store = self.manager.store();

        if snapshot.machinetypes.is_empty() {
            return vec![MachinetypeStatus {
                space: snapshot.space.clone(),
                cookie: query.cookie.clone(),
                query_version: QUERY_VERSION.to_string(),
                factory: snapshot.factory_name.clone(),
                num_machinetypes: 0,
                machinetype: String::new(),
                running_machines: 0,
                running_processors: 0,
                running_hs06: 0.0,
                starting_processors: 0,
                before_fizzle_processors: 0,
                shutdown_message: None,
                shutdown_time: None,
                shutdown_machine: None,
            }];
        }

        snapshot
            .machinetypes
            .values()
            .map(|itype| {
                let aggregate = MachinetypeAggregate::collect(itype, machines, now)
                    .with_last_shutdown(last_shutdown(store, itype));
                let last = aggregate.last_shutdown.as_ref();
                MachinetypeStatus {
                    space: snapshot.space.clone(),
                    cookie: query.cookie.clone(),
                    query_version: QUERY_VERSION.to_string(),
                    factory: snapshot.factory_name.clone(),
                    num_machinetypes: snapshot.machinetypes.len(),
                    machinetype: itype.name.clone(),
                    running_machines: aggregate.running_machines,
                    running_processors: aggregate.running_processors,
                    running_hs06: aggregate.running_hs06,
                    starting_processors: aggregate.starting_processors,
                    before_fizzle_processors: aggregate.before_fizzle_processors,
                    shutdown_message: last
                        .and_then(|l| l.message.as_ref())
                        .map(ToString::to_string),
                    shutdown_time: last.and_then(|l| l.time),
                    shutdown_machine: last.map(|l| l.machine.clone()),
                }
            })
            .collect()
    }

    /// Answer queries arriving on `socket` until shutdown
    pub async fn serve(&self, socket: UdpSocket, mut shutdown: broadcast::Receiver<()>) {
        if let Ok(addr) = socket.local_addr() {
            info!(addr = %addr, "Status responder listening");
        }
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, from) = tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "Failed to receive datagram");
                        continue;
                    }
                },
                _ = shutdown.recv() => {
                    info!("Shutting down status responder");
                    break;
                }
            };
            for reply in self.answer(&buf[..len]).await {
                self.send(&socket, &reply, from).await;
            }
        }
    }

    async fn send(&self, socket: &UdpSocket, reply: &Message, to: SocketAddr) {
        let bytes = match reply.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to encode reply");
                return;
            }
        };
        if bytes.len() > MAX_DATAGRAM {
            warn!(len = bytes.len(), "Reply too large, not sent");
            return;
        }
        if let Err(e) = socket.send_to(&bytes, to).await {
            warn!(to = %to, error = %e, "Failed to send reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ShutdownMessage;
    use crate::slots::testing::{slot_fixture, slot_fixture_with, T0};

    fn query(kind: QueryKind, space: &str) -> Vec<u8> {
        Message::query(kind, space, "c00k1e".into()).encode().unwrap()
    }

    #[tokio::test]
    async fn test_machines_query_reports_every_slot() {
        let f = slot_fixture("docker");
        f.manager.create(2, "batch", 1, T0 + 3600).await.unwrap();
        let responder = Responder::new(f.manager.clone());

        let replies = responder
            .answer(&query(QueryKind::Machines, "space.example.com"))
            .await;

        assert_eq!(replies.len(), 4);
        let statuses: Vec<MachineStatus> = replies
            .into_iter()
            .map(|m| match m {
                Message::MachineStatus(s) => s,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert!(statuses.iter().all(|s| s.cookie == "c00k1e" && s.num_machines == 4));
        assert_eq!(statuses[2].machine, "host-02.example.com");
        assert_eq!(statuses[2].state, MachineState::Running);
        assert_eq!(statuses[2].uuid.as_deref(), Some("id-2"));
        assert_eq!(statuses[0].state, MachineState::Unknown);
    }

    #[tokio::test]
    async fn test_factory_query_counts_running_processors() {
        let f = slot_fixture("docker");
        f.manager.create(0, "batch", 1, T0 + 3600).await.unwrap();
        f.manager.create(1, "batch", 1, T0 + 3600).await.unwrap();
        f.manager.store().touch_factory_heartbeat(T0).unwrap();
        let responder = Responder::new(f.manager.clone());

        let replies = responder
            .answer(&query(QueryKind::Factory, "space.example.com"))
            .await;

        let [Message::FactoryStatus(status)] = replies.as_slice() else {
            panic!("unexpected {:?}", replies);
        };
        assert_eq!(status.factory, "host.example.com");
        assert_eq!(status.running_machines, 2);
        assert_eq!(status.running_processors, 2);
        assert_eq!(status.total_processors, 4);
        assert_eq!(status.num_machinetypes, 1);
        assert!(status.factory_heartbeat_time.is_some());
    }

    #[tokio::test]
    async fn test_machinetypes_query_reports_last_shutdown() {
        let f = slot_fixture("docker");
        f.manager.create(0, "batch", 1, T0 + 3600).await.unwrap();
        f.clock.advance(700);
        f.manager
            .destroy(0, Some(ShutdownMessage::new(200, "Success")))
            .await
            .unwrap();
        let responder = Responder::new(f.manager.clone());

        let replies = responder
            .answer(&query(QueryKind::Machinetypes, "space.example.com"))
            .await;

        let [Message::MachinetypeStatus(status)] = replies.as_slice() else {
            panic!("unexpected {:?}", replies);
        };
        assert_eq!(status.machinetype, "batch");
        assert_eq!(status.num_machinetypes, 1);
        assert_eq!(status.running_machines, 0);
        assert_eq!(status.shutdown_message.as_deref(), Some("200 Success"));
        assert_eq!(status.shutdown_time, Some(T0 + 700));
        assert_eq!(status.shutdown_machine.as_deref(), Some("host-00.example.com"));
    }

    #[tokio::test]
    async fn test_factory_without_machinetypes_still_answers() {
        let f = slot_fixture_with("docker", |s| s.machinetypes.clear());
        let responder = Responder::new(f.manager.clone());

        let replies = responder
            .answer(&query(QueryKind::Machinetypes, "space.example.com"))
            .await;

        let [Message::MachinetypeStatus(status)] = replies.as_slice() else {
            panic!("unexpected {:?}", replies);
        };
        assert_eq!(status.num_machinetypes, 0);
        assert_eq!(status.machinetype, "");
        assert_eq!(status.cookie, "c00k1e");
    }

    #[tokio::test]
    async fn test_foreign_space_and_garbage_are_ignored() {
        let f = slot_fixture("docker");
        let responder = Responder::new(f.manager.clone());

        assert!(responder
            .answer(&query(QueryKind::Factory, "elsewhere.org"))
            .await
            .is_empty());
        assert!(responder.answer(b"{\"message_type\":").await.is_empty());

        // A status is not a query
        let status = responder
            .answer(&query(QueryKind::Factory, "space.example.com"))
            .await
            .remove(0);
        assert!(responder.answer(&status.encode().unwrap()).await.is_empty());
    }
}
