//! Querying peer factories
//!
//! One exchange uses one salt. Each round sends the query to every peer that
//! has not yet delivered all the statuses it announced, then listens for
//! `timeout / retries`. Replies that fail to decode, carry the wrong space,
//! come from a factory that was not asked or fail the cookie check are
//! dropped without counting against the peer.

use super::cookie;
use super::messages::{
    FactoryStatus, MachineStatus, MachinetypeStatus, Message, QueryKind, DEFAULT_PORT,
    MAX_DATAGRAM,
};
use crate::error::{FactoryError, Result};
use crate::observability::FactoryMetrics;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RequesterConfig {
    /// Space the peers must belong to
    pub space: String,
    pub port: u16,
    /// Total listening budget across all rounds
    pub timeout: Duration,
    pub retries: u32,
}

impl RequesterConfig {
    pub fn new(space: impl Into<String>) -> Self {
        Self {
            space: space.into(),
            port: DEFAULT_PORT,
            timeout: Duration::from_secs(5),
            retries: 5,
        }
    }
}

/// A factory to query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Name the factory declares in its replies
    pub name: String,
    /// Resolved from `name` when absent
    pub addr: Option<SocketAddr>,
}

impl Peer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: None,
        }
    }

    pub fn at(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr: Some(addr),
        }
    }
}

/// Everything an exchange collected
#[derive(Debug, Clone, Default)]
pub struct Responses {
    /// Keyed by (factory, entity) where the entity is the machine,
    /// machinetype or factory the status describes
    pub replies: BTreeMap<(String, String), Message>,
    /// Peers that did not deliver every status they announced
    pub incomplete: Vec<String>,
}

struct PeerState {
    peer: Peer,
    cookie: String,
    /// Announced by the peer in its first reply
    expected: usize,
    received: HashSet<String>,
}

impl PeerState {
    fn satisfied(&self) -> bool {
        self.received.len() >= self.expected
    }
}

/// State of one in-flight exchange
pub(crate) struct Exchange {
    kind: QueryKind,
    space: String,
    salt: String,
    peers: Vec<PeerState>,
    replies: BTreeMap<(String, String), Message>,
}

impl Exchange {
    pub(crate) fn new(kind: QueryKind, space: &str, peers: Vec<Peer>) -> Self {
        let salt = cookie::new_salt();
        let peers = peers
            .into_iter()
            .map(|peer| PeerState {
                cookie: cookie::cookie(&salt, &peer.name),
                peer,
                expected: 1,
                received: HashSet::new(),
            })
            .collect();
        Self {
            kind,
            space: space.to_string(),
            salt,
            peers,
            replies: BTreeMap::new(),
        }
    }

    pub(crate) fn complete(&self) -> bool {
        self.peers.iter().all(PeerState::satisfied)
    }

    /// Queries still owed to unsatisfied peers, with their destinations
    fn pending_queries(&self) -> Vec<(SocketAddr, Message)> {
        self.peers
            .iter()
            .filter(|p| !p.satisfied())
            .filter_map(|p| {
                let addr = p.peer.addr?;
                Some((addr, Message::query(self.kind, &self.space, p.cookie.clone())))
            })
            .collect()
    }

    /// Check one received datagram and keep it if it is an expected status
    pub(crate) fn accept(&mut self, datagram: &[u8]) -> Result<()> {
        let message = Message::decode(datagram)?;
        let (kind, factory, entity, announced) = message.status_key().ok_or_else(|| {
            FactoryError::Protocol(format!("{} is not a status", message.message_type()))
        })?;
        if kind != self.kind {
            return Err(FactoryError::Protocol(format!(
                "unexpected {}",
                message.message_type()
            )));
        }
        if message.space() != self.space {
            return Err(FactoryError::Protocol(format!(
                "status for space {}",
                message.space()
            )));
        }
        if !cookie::verify(&self.salt, factory, message.cookie()) {
            return Err(FactoryError::Protocol(format!("bad cookie from {}", factory)));
        }
        let state = self
            .peers
            .iter_mut()
            .find(|p| p.peer.name == factory)
            .ok_or_else(|| FactoryError::Protocol(format!("{} was not queried", factory)))?;

        if announced == 0 {
            // Nothing of this kind on the factory; the reply only acknowledges
            state.expected = 0;
            return Ok(());
        }
        state.expected = announced;
        state.received.insert(entity.to_string());
        let key = (factory.to_string(), entity.to_string());
        self.replies.insert(key, message);
        Ok(())
    }

    fn finish(self) -> Responses {
        Responses {
            incomplete: self
                .peers
                .iter()
                .filter(|p| !p.satisfied())
                .map(|p| p.peer.name.clone())
                .collect(),
            replies: self.replies,
        }
    }
}

pub struct Requester {
    config: RequesterConfig,
    metrics: FactoryMetrics,
}

impl Requester {
    pub fn new(config: RequesterConfig) -> Self {
        Self {
            config,
            metrics: FactoryMetrics::new(),
        }
    }

    pub fn config(&self) -> &RequesterConfig {
        &self.config
    }

    /// Run one exchange against `peers`
    ///
    /// Only local socket failures are errors. Silent or misbehaving peers
    /// show up in [`Responses::incomplete`].
    pub async fn exchange(&self, kind: QueryKind, peers: &[Peer]) -> Result<Responses> {
        let mut resolved = Vec::with_capacity(peers.len());
        for peer in peers {
            resolved.push(self.resolve(peer).await);
        }

        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))
            .await
            .map_err(|e| FactoryError::io("udp:0", e))?;
        let mut exchange = Exchange::new(kind, &self.config.space, resolved);
        let rounds = self.config.retries.max(1);
        let round_wait = self.config.timeout / rounds;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        for round in 0..rounds {
            let pending = exchange.pending_queries();
            if pending.is_empty() {
                break;
            }
            debug!(round, peers = pending.len(), query = kind.query_type(), "Sending queries");
            for (addr, query) in pending {
                let bytes = query.encode()?;
                if let Err(e) = socket.send_to(&bytes, addr).await {
                    warn!(to = %addr, error = %e, "Failed to send query");
                }
            }

            let deadline = Instant::now() + round_wait;
            while !exchange.complete() {
                let received =
                    match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                        Err(_) => break,
                        Ok(received) => received,
                    };
                match received {
                    Ok((len, from)) => {
                        if let Err(e) = exchange.accept(&buf[..len]) {
                            debug!(from = %from, error = %e, "Discarding reply");
                            self.metrics.inc_protocol_datagrams_discarded();
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to receive reply"),
                }
            }
            if exchange.complete() {
                break;
            }
        }

        Ok(exchange.finish())
    }

    async fn resolve(&self, peer: &Peer) -> Peer {
        if peer.addr.is_some() {
            return peer.clone();
        }
        let addr = match tokio::net::lookup_host((peer.name.as_str(), self.config.port)).await {
            Ok(mut addrs) => addrs.find(SocketAddr::is_ipv4),
            Err(e) => {
                warn!(peer = %peer.name, error = %e, "Failed to resolve peer");
                None
            }
        };
        Peer {
            name: peer.name.clone(),
            addr,
        }
    }

    pub async fn factories(&self, peers: &[Peer]) -> Result<Vec<FactoryStatus>> {
        let responses = self.exchange(QueryKind::Factory, peers).await?;
        Ok(responses
            .replies
            .into_values()
            .filter_map(|m| match m {
                Message::FactoryStatus(s) => Some(s),
                _ => None,
            })
            .collect())
    }

    pub async fn machines(&self, peers: &[Peer]) -> Result<Vec<MachineStatus>> {
        let responses = self.exchange(QueryKind::Machines, peers).await?;
        Ok(responses
            .replies
            .into_values()
            .filter_map(|m| match m {
                Message::MachineStatus(s) => Some(s),
                _ => None,
            })
            .collect())
    }

    pub async fn machinetypes(&self, peers: &[Peer]) -> Result<Vec<MachinetypeStatus>> {
        let responses = self.exchange(QueryKind::Machinetypes, peers).await?;
        Ok(responses
            .replies
            .into_values()
            .filter_map(|m| match m {
                Message::MachinetypeStatus(s) => Some(s),
                _ => None,
            })
            .collect())
    }
}
