//! Rendezvous between output channels and the input channels that connect
//! to them.

use dashmap::DashMap;
use sl_types::Token;
use std::net::SocketAddr;
use tracing::debug;

/// Listening addresses of network output channels, keyed by token.
///
/// Output channels publish once bound; input channels look their token up
/// and retry until it appears.
#[derive(Debug, Default)]
pub struct ChannelDirectory {
    addresses: DashMap<Token, SocketAddr>,
}

impl ChannelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, token: Token, addr: SocketAddr) {
        debug!(%token, %addr, "published channel address");
        self.addresses.insert(token, addr);
    }

    pub fn resolve(&self, token: &Token) -> Option<SocketAddr> {
        self.addresses.get(token).map(|entry| *entry.value())
    }

    pub fn withdraw(&self, token: &Token) -> Option<SocketAddr> {
        self.addresses.remove(token).map(|(_, addr)| addr)
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sl_types::WorkerId;

    #[test]
    fn publish_resolve_withdraw() {
        let directory = ChannelDirectory::new();
        let token = Token::edge(WorkerId(0), WorkerId(1));
        assert!(directory.resolve(&token).is_none());
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        directory.publish(token, addr);
        assert_eq!(directory.resolve(&token), Some(addr));
        assert_eq!(directory.withdraw(&token), Some(addr));
        assert!(directory.is_empty());
    }
}
