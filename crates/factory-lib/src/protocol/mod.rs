//! Status protocol between peer factories
//!
//! One JSON object per UDP datagram. A requester sends a query carrying a
//! cookie derived from a per-exchange salt and the peer's name; the peer
//! echoes the cookie in every status message it returns, and the requester
//! only accepts statuses whose cookie matches the declared sender.

pub mod aggregate;
pub mod cookie;
pub mod hostinfo;
pub mod messages;
pub mod requester;
pub mod responder;

pub use aggregate::{
    last_shutdown, LastShutdown, MachinetypeAggregate, RUNNING_HEARTBEAT_SECS,
    STARTING_RECENT_SECS,
};
pub use hostinfo::HostInfo;
pub use messages::{
    FactoryStatus, MachineStatus, MachinetypeStatus, Message, Query, QueryKind, DEFAULT_PORT,
    QUERY_VERSION,
};
pub use requester::{Peer, Requester, RequesterConfig, Responses};
pub use responder::Responder;
