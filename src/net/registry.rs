//! Descriptor registry: token → (pair, side).
//!
//! Every registered socket has exactly one token entry. Pairs are inserted
//! and removed as a unit, so the token map never refers to a missing pair
//! unless the registry itself is corrupted.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use mio::{Registry, Token};

use crate::net::connection::{ConnectionId, ConnectionPair, Side};
use crate::net::reactor::{ReactorError, ReactorStats};

/// First token handed to a pair; lower values are reserved by the reactor.
pub const FIRST_PAIR_TOKEN: usize = 2;

#[derive(Debug)]
pub struct ConnectionRegistry {
    tokens: HashMap<Token, (ConnectionId, Side)>,
    pairs: HashMap<ConnectionId, ConnectionPair>,
    next_token: usize,
    stats: Arc<ReactorStats>,
}

impl ConnectionRegistry {
    pub fn new(stats: Arc<ReactorStats>) -> Self {
        Self {
            tokens: HashMap::new(),
            pairs: HashMap::new(),
            next_token: FIRST_PAIR_TOKEN,
            stats,
        }
    }

    fn allocate(&mut self) -> Token {
        loop {
            let token = Token(self.next_token);
            self.next_token = self.next_token.wrapping_add(1).max(FIRST_PAIR_TOKEN);
            if !self.tokens.contains_key(&token) {
                return token;
            }
        }
    }

    /// Register both sockets of `pair` and take ownership of it.
    ///
    /// On failure nothing stays registered and the pair is dropped, closing
    /// its sockets.
    pub fn insert(&mut self, mut pair: ConnectionPair, registry: &Registry) -> io::Result<ConnectionId> {
        let id = pair.id();
        let client = self.allocate();
        let backend = self.allocate();
        if let Err(e) = pair.register(registry, client, backend) {
            let _ = pair.deregister(registry);
            return Err(e);
        }

        self.tokens.insert(client, (id, Side::Client));
        self.tokens.insert(backend, (id, Side::Backend));
        self.pairs.insert(id, pair);
        self.stats.record_registered(2);
        Ok(id)
    }

    pub fn lookup(&self, token: Token) -> Option<(ConnectionId, Side)> {
        self.tokens.get(&token).copied()
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionPair> {
        self.pairs.get_mut(&id)
    }

    pub fn pairs(&self) -> impl Iterator<Item = &ConnectionPair> {
        self.pairs.values()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.pairs.keys().copied().collect()
    }

    /// Remove a pair and both of its descriptors.
    ///
    /// Returns `Ok(None)` when the pair is already gone.
    pub fn remove(
        &mut self,
        id: ConnectionId,
        registry: &Registry,
    ) -> Result<Option<ConnectionPair>, ReactorError> {
        let Some(mut pair) = self.pairs.remove(&id) else {
            return Ok(None);
        };
        let (client, backend) = pair.tokens();
        let client_entry = self.tokens.remove(&client);
        let backend_entry = self.tokens.remove(&backend);
        self.stats.record_deregistered(2);

        if client_entry != Some((id, Side::Client)) || backend_entry != Some((id, Side::Backend)) {
            return Err(ReactorError::RegistryCorrupted(format!(
                "{id} held tokens {} and {} that did not map back to it",
                client.0, backend.0
            )));
        }

        if let Err(e) = pair.deregister(registry) {
            tracing::debug!(connection_id = %id, error = %e, "Deregister failed during close");
        }
        Ok(Some(pair))
    }

    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Number of registered descriptors.
    pub fn descriptors(&self) -> usize {
        self.tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::load_balancer::BackendPool;
    use crate::net::connection::PairSettings;
    use crate::net::listener::{admit, ListenerTransport};
    use mio::Poll;
    use std::time::Duration;

    fn pair(pool: &BackendPool) -> (ConnectionPair, std::net::TcpStream) {
        let listener = ListenerTransport::bind("127.0.0.1:0".parse().unwrap(), 16, true).unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr()).unwrap();
        let (stream, peer) = loop {
            match listener.accept() {
                Ok(accepted) => break accepted,
                Err(_) => std::thread::sleep(Duration::from_millis(5)),
            }
        };
        let settings = PairSettings {
            chunk_size: 4096,
            max_buffer: 4096,
            connect_timeout: Duration::from_secs(1),
            nodelay: true,
        };
        let factory = crate::protocol::factory(&ProxyConfig::default());
        (admit(stream, peer, pool, &factory, &settings).unwrap(), client)
    }

    #[test]
    fn insert_and_remove_keep_sizes_consistent() {
        let backend = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = BackendPool::new();
        pool.add(backend.local_addr().unwrap().into());

        let poll = Poll::new().unwrap();
        let stats = Arc::new(ReactorStats::default());
        let mut registry = ConnectionRegistry::new(stats.clone());
        assert_eq!(registry.descriptors(), 0);

        let (pair, _client) = pair(&pool);
        let id = registry.insert(pair, poll.registry()).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.descriptors(), 2);
        assert_eq!(stats.snapshot().registered_descriptors, 2);

        let (client, backend_token) = registry.get_mut(id).unwrap().tokens();
        assert_eq!(registry.lookup(client), Some((id, Side::Client)));
        assert_eq!(registry.lookup(backend_token), Some((id, Side::Backend)));

        let removed = registry.remove(id, poll.registry()).unwrap();
        assert!(removed.is_some());
        assert_eq!(registry.descriptors(), 0);
        assert!(registry.lookup(client).is_none());
        assert_eq!(stats.snapshot().registered_descriptors, 0);
        assert!(registry.remove(id, poll.registry()).unwrap().is_none());
    }

    #[test]
    fn teardown_reaches_closed_and_releases_backend() {
        use crate::net::connection::ConnectionState;
        use std::io::Read;

        let backend = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = backend.local_addr().unwrap().into();
        let pool = BackendPool::new();
        pool.add(endpoint);

        let poll = Poll::new().unwrap();
        let mut registry = ConnectionRegistry::new(Arc::new(ReactorStats::default()));
        let (pair, mut client) = pair(&pool);
        let id = registry.insert(pair, poll.registry()).unwrap();
        assert_eq!(pool.get(endpoint).unwrap().active_connections(), 1);

        let mut pair = registry.remove(id, poll.registry()).unwrap().unwrap();
        pair.begin_close();
        let summary = pair.teardown();
        assert_eq!(summary.id, id);
        assert_eq!(summary.state, ConnectionState::Closed);
        assert_eq!(summary.backend, Some(endpoint));
        assert_eq!(pool.get(endpoint).unwrap().active_connections(), 0);

        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
