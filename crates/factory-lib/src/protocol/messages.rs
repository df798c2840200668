//! Wire messages
//!
//! Every datagram is a JSON object tagged by `message_type`. Fields that are
//! not `Option` are required: a message missing one fails to decode and is
//! discarded by whichever side received it.

use crate::error::{FactoryError, Result};
use crate::models::MachineState;
use serde::{Deserialize, Serialize};

pub const QUERY_VERSION: &str = "FactoryQuery 01.02";
pub const DEFAULT_PORT: u16 = 995;

/// Largest datagram either side will send or accept
pub const MAX_DATAGRAM: usize = 9000;

/// What a query asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Factory,
    Machines,
    Machinetypes,
}

impl QueryKind {
    pub fn query_type(&self) -> &'static str {
        match self {
            Self::Factory => "factory_query",
            Self::Machines => "machines_query",
            Self::Machinetypes => "machinetypes_query",
        }
    }

    pub fn status_type(&self) -> &'static str {
        match self {
            Self::Factory => "factory_status",
            Self::Machines => "machine_status",
            Self::Machinetypes => "machinetype_status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub space: String,
    pub cookie: String,
    pub query_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactoryStatus {
    pub space: String,
    pub cookie: String,
    pub query_version: String,
    pub factory: String,
    pub total_processors: u32,
    pub running_processors: u32,
    pub running_machines: u32,
    pub num_machinetypes: usize,
    pub mem_total_kb: u64,
    pub load_average: f64,
    pub kernel_version: String,
    pub boot_time: i64,
    pub base_disk_avail_kb: u64,
    pub base_disk_avail_inodes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_heartbeat_time: Option<i64>,
}

/// One slot of the responding factory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineStatus {
    pub space: String,
    pub cookie: String,
    pub query_version: String,
    pub factory: String,
    /// How many `machine_status` messages the factory sends per query
    pub num_machines: usize,
    pub machine: String,
    pub state: MachineState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_time: Option<i64>,
    pub num_processors: u32,
    pub cpu_seconds: u64,
    pub cpu_percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machinetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_time: Option<i64>,
}

/// Aggregate for one instance type of the responding factory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachinetypeStatus {
    pub space: String,
    pub cookie: String,
    pub query_version: String,
    pub factory: String,
    /// How many `machinetype_status` messages the factory sends per query
    ///
    /// Zero from a factory without machinetypes: it sends one message with
    /// an empty `machinetype` so the query is still answered.
    pub num_machinetypes: usize,
    pub machinetype: String,
    pub running_machines: u32,
    pub running_processors: u32,
    pub running_hs06: f64,
    pub starting_processors: u32,
    pub before_fizzle_processors: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_machine: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum Message {
    FactoryQuery(Query),
    MachinesQuery(Query),
    MachinetypesQuery(Query),
    FactoryStatus(FactoryStatus),
    MachineStatus(MachineStatus),
    MachinetypeStatus(MachinetypeStatus),
}

impl Message {
    pub fn query(kind: QueryKind, space: &str, cookie: String) -> Self {
        let query = Query {
            space: space.to_string(),
            cookie,
            query_version: QUERY_VERSION.to_string(),
        };
        match kind {
            QueryKind::Factory => Self::FactoryQuery(query),
            QueryKind::Machines => Self::MachinesQuery(query),
            QueryKind::Machinetypes => Self::MachinetypesQuery(query),
        }
    }

    pub fn decode(datagram: &[u8]) -> Result<Self> {
        let message: Self = serde_json::from_slice(datagram)?;
        if message.space().is_empty() || message.cookie().is_empty() {
            return Err(FactoryError::Protocol(format!(
                "{} with empty space or cookie",
                message.message_type()
            )));
        }
        Ok(message)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            Self::FactoryQuery(_) => QueryKind::Factory.query_type(),
            Self::MachinesQuery(_) => QueryKind::Machines.query_type(),
            Self::MachinetypesQuery(_) => QueryKind::Machinetypes.query_type(),
            Self::FactoryStatus(_) => QueryKind::Factory.status_type(),
            Self::MachineStatus(_) => QueryKind::Machines.status_type(),
            Self::MachinetypeStatus(_) => QueryKind::Machinetypes.status_type(),
        }
    }

    pub fn space(&self) -> &str {
        match self {
            Self::FactoryQuery(q) | Self::MachinesQuery(q) | Self::MachinetypesQuery(q) => {
                q.space.as_str()
            }
            Self::FactoryStatus(s) => s.space.as_str(),
            Self::MachineStatus(s) => s.space.as_str(),
            Self::MachinetypeStatus(s) => s.space.as_str(),
        }
    }

    pub fn cookie(&self) -> &str {
        match self {
            Self::FactoryQuery(q) | Self::MachinesQuery(q) | Self::MachinetypesQuery(q) => {
                q.cookie.as_str()
            }
            Self::FactoryStatus(s) => s.cookie.as_str(),
            Self::MachineStatus(s) => s.cookie.as_str(),
            Self::MachinetypeStatus(s) => s.cookie.as_str(),
        }
    }

    /// Query kind of a query message
    pub fn as_query(&self) -> Option<(QueryKind, &Query)> {
        match self {
            Self::FactoryQuery(q) => Some((QueryKind::Factory, q)),
            Self::MachinesQuery(q) => Some((QueryKind::Machines, q)),
            Self::MachinetypesQuery(q) => Some((QueryKind::Machinetypes, q)),
            _ => None,
        }
    }

    /// For a status message: its kind, the declaring factory, the entity it
    /// describes and how many such messages the factory sends
    pub fn status_key(&self) -> Option<(QueryKind, &str, &str, usize)> {
        match self {
            Self::FactoryStatus(s) => Some((
                QueryKind::Factory,
                s.factory.as_str(),
                s.factory.as_str(),
                1,
            )),
            Self::MachineStatus(s) => Some((
                QueryKind::Machines,
                s.factory.as_str(),
                s.machine.as_str(),
                s.num_machines,
            )),
            Self::MachinetypeStatus(s) => Some((
                QueryKind::Machinetypes,
                s.factory.as_str(),
                s.machinetype.as_str(),
                s.num_machinetypes,
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_wire_format() {
        let query = Message::query(QueryKind::Machinetypes, "example.com", "abc".into());
        let value: serde_json::Value = serde_json::from_slice(&query.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "message_type": "machinetypes_query",
                "space": "example.com",
                "cookie": "abc",
                "query_version": "FactoryQuery 01.02",
            })
        );
    }

    #[test]
    fn test_decode_machine_status_with_optional_fields_absent() {
        let datagram = br#"{
            "message_type": "machine_status",
            "space": "example.com",
            "cookie": "abc",
            "query_version": "FactoryQuery 01.02",
            "factory": "vac01.example.com",
            "num_machines": 2,
            "machine": "vac01-00.example.com",
            "state": "running",
            "num_processors": 1,
            "cpu_seconds": 10,
            "cpu_percentage": 4.5,
            "some_future_field": true
        }"#;

        let message = Message::decode(datagram).unwrap();
        let Message::MachineStatus(status) = &message else {
            panic!("decoded {:?}", message);
        };
        assert_eq!(status.state, MachineState::Running);
        assert_eq!(status.uuid, None);
        assert_eq!(
            message.status_key(),
            Some((
                QueryKind::Machines,
                "vac01.example.com",
                "vac01-00.example.com",
                2
            ))
        );
    }

    #[test]
    fn test_decode_rejects_missing_fields_and_unknown_types() {
        // No cookie
        assert!(Message::decode(
            br#"{"message_type":"factory_query","space":"s","query_version":"FactoryQuery 01.02"}"#
        )
        .is_err());
        // Empty cookie
        assert!(Message::decode(
            br#"{"message_type":"factory_query","space":"s","cookie":"","query_version":"x"}"#
        )
        .is_err());
        assert!(Message::decode(
            br#"{"message_type":"vm_query","space":"s","cookie":"c","query_version":"x"}"#
        )
        .is_err());
        assert!(Message::decode(b"not json").is_err());
    }
}
