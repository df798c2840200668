//! Status protocol subcommands

pub mod factories;
pub mod machines;
pub mod machinetypes;

use crate::output::print_warning;
use anyhow::{Context, Result};
use factory_lib::protocol::{Message, Peer, QueryKind, Requester};

/// A peer given as `name` or `name@address:port`
///
/// The name must be the factory name the peer declares in its replies.
pub fn parse_peer(spec: &str) -> Result<Peer> {
    match spec.split_once('@') {
        Some((name, addr)) => {
            let addr = addr
                .parse()
                .with_context(|| format!("Invalid address {:?} for peer {}", addr, name))?;
            Ok(Peer::at(name, addr))
        }
        None => Ok(Peer::new(spec)),
    }
}

/// All replies of one exchange, warning about peers that fell short
pub async fn query(requester: &Requester, kind: QueryKind, peers: &[Peer]) -> Result<Vec<Message>> {
    let responses = requester
        .exchange(kind, peers)
        .await
        .context("Failed to query factories")?;

    for name in &responses.incomplete {
        print_warning(&format!("Incomplete or no reply from {}", name));
    }
    Ok(responses.replies.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer() {
        let peer = parse_peer("vac01.example.com").unwrap();
        assert_eq!(peer.name, "vac01.example.com");
        assert!(peer.addr.is_none());

        let peer = parse_peer("vac01.example.com@127.0.0.1:9950").unwrap();
        assert_eq!(peer.name, "vac01.example.com");
        assert_eq!(peer.addr, Some("127.0.0.1:9950".parse().unwrap()));

        assert!(parse_peer("vac01.example.com@nowhere").is_err());
    }
}
