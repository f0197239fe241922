use anyhow::Result;
use slab::Slab;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::QuicConfig;
use crate::connection::QuicConnection;
use crate::endpoint::ConnectionTable;
use crate::error_code::{QuicConnectionErrorCode, TransportErrorCode};

/// Pairs every intercepted connection with a connection to the real
/// server and relays messages between the two.
pub struct ForwardProxy {
    downstream: ConnectionTable,
    upstream_config: QuicConfig,
    upstreams: Slab<QuicConnection>,
    target: SocketAddr,
    // downstream key -> upstream key, both sides still in their tables
    pairs: HashMap<usize, usize>,
    // Upstream keys whose downstream is gone
    orphaned_upstreams: HashSet<usize>,
    // Downstream keys whose upstream is gone
    orphaned_downstreams: HashSet<usize>,
    served: usize,
}

impl ForwardProxy {
    pub fn new(
        downstream: ConnectionTable,
        upstream_config: QuicConfig,
        target: SocketAddr,
    ) -> Self {
        Self {
            downstream,
            upstream_config,
            upstreams: Slab::new(),
            target,
            pairs: HashMap::new(),
            orphaned_upstreams: HashSet::new(),
            orphaned_downstreams: HashSet::new(),
            served: 0,
        }
    }

    pub fn downstream(&mut self) -> &mut ConnectionTable {
        &mut self.downstream
    }

    pub fn upstream(&mut self, key: usize) -> Option<&mut QuicConnection> {
        self.upstreams.get_mut(key)
    }

    pub fn upstream_for(&self, downstream_key: usize) -> Option<usize> {
        self.pairs.get(&downstream_key).copied()
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    /// Pairs ended so far.
    pub fn served(&self) -> usize {
        self.served
    }

    /// Opens an upstream connection for each newly established downstream
    /// one, with the SNI the client asked for. Returns the new upstream keys.
    pub fn pair_accepted(&mut self, now: Instant) -> Result<Vec<usize>> {
        let mut opened = vec![];
        while let Some(key) = self.downstream.accept() {
            let Some(conn) = self.downstream.get_mut(key) else {
                continue;
            };
            let Some(server_name) = conn.server_name().map(str::to_owned) else {
                warn!("Connection {} from {} sent no SNI, refusing it", key, conn.remote());
                conn.close(TransportErrorCode::ConnectionRefused.into(), "no server name", now);
                continue;
            };

            let mut config = self.upstream_config.clone();
            config.set_server_name(server_name.as_str());
            let upstream = QuicConnection::connect(config, self.target, now)?;
            let upstream_key = self.upstreams.insert(upstream);
            self.pairs.insert(key, upstream_key);
            info!(
                "Intercepted {} for {}, upstream connection {} to {}",
                key, server_name, upstream_key, self.target
            );
            opened.push(upstream_key);
        }
        Ok(opened)
    }

    fn pair_mut(
        &mut self,
        down_key: usize,
        up_key: usize,
    ) -> Option<(&mut QuicConnection, &mut QuicConnection)> {
        let down = self.downstream.get_mut(down_key)?;
        let up = self.upstreams.get_mut(up_key)?;
        Some((down, up))
    }

    /// Moves every received message to the other side of its pair.
    pub fn relay(&mut self) {
        let pairs: Vec<(usize, usize)> = self.pairs.iter().map(|(d, u)| (*d, *u)).collect();
        for (down_key, up_key) in pairs {
            let Some((down, up)) = self.pair_mut(down_key, up_key) else {
                continue;
            };

            while let Some(message) = down.recv_message() {
                let len = message.data.len();
                debug!("Relay {} bytes on stream {} upstream", len, message.stream_id);
                if let Err(e) = up.send(message.stream_id, message.data) {
                    warn!("Failed to relay to upstream {}: {}", up_key, e);
                }
            }
            while let Some(message) = up.recv_message() {
                let len = message.data.len();
                debug!("Relay {} bytes on stream {} downstream", len, message.stream_id);
                if let Err(e) = down.send(message.stream_id, message.data) {
                    warn!("Failed to relay to downstream {}: {}", down_key, e);
                }
            }
        }
    }

    /// Closes the survivor of every pair whose other side is going away,
    /// then drops closed connections. A pair is split as soon as one side
    /// leaves its table, so a reused key never reaches the old partner.
    /// Returns the removed upstream keys.
    pub fn close_pairs(&mut self, now: Instant) -> Vec<usize> {
        let pairs: Vec<(usize, usize)> = self.pairs.iter().map(|(d, u)| (*d, *u)).collect();
        for (down_key, up_key) in pairs {
            let Some((down, up)) = self.pair_mut(down_key, up_key) else {
                continue;
            };
            if down.is_closing() && !up.is_closing() {
                up.close(propagated_error(down.error()), "client closed", now);
            } else if up.is_closing() && !down.is_closing() {
                down.close(propagated_error(up.error()), "server closed", now);
            }
        }

        for (down_key, _) in self.downstream.remove_closed() {
            if self.orphaned_downstreams.remove(&down_key) {
                self.served += 1;
                info!("Downstream {} finished after its upstream", down_key);
                continue;
            }
            let Some(up_key) = self.pairs.remove(&down_key) else {
                continue;
            };
            if let Some(up) = self.upstreams.get_mut(up_key) {
                // A silent idle close leaves the upstream open
                if !up.is_closing() {
                    up.close(TransportErrorCode::NoError.into(), "client gone", now);
                }
            }
            debug!("Downstream {} is gone, upstream {} is orphaned", down_key, up_key);
            self.orphaned_upstreams.insert(up_key);
        }

        let closed: Vec<usize> = self
            .upstreams
            .iter()
            .filter(|(_, up)| up.is_closed())
            .map(|(key, _)| key)
            .collect();
        for up_key in &closed {
            self.upstreams.remove(*up_key);
            if self.orphaned_upstreams.remove(up_key) {
                self.served += 1;
                info!("Upstream {} finished after its downstream", up_key);
                continue;
            }

            let Some(down_key) = self
                .pairs
                .iter()
                .find(|(_, up)| *up == up_key)
                .map(|(down, _)| *down)
            else {
                continue;
            };
            self.pairs.remove(&down_key);
            if let Some(down) = self.downstream.get_mut(down_key) {
                if !down.is_closing() {
                    down.close(TransportErrorCode::NoError.into(), "server gone", now);
                }
            }
            debug!("Upstream {} is gone, downstream {} is orphaned", up_key, down_key);
            self.orphaned_downstreams.insert(down_key);
        }
        closed
    }

    pub fn next_timeout(&self) -> Option<Instant> {
        let upstream = self.upstreams.iter().filter_map(|(_, up)| up.next_timeout()).min();
        [self.downstream.next_timeout(), upstream].into_iter().flatten().min()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        self.downstream.handle_timeout(now);
        for (_, up) in self.upstreams.iter_mut() {
            if up.next_timeout().is_some_and(|t| t <= now) {
                up.handle_timeout(now);
            }
        }
    }

    pub fn upstream_keys(&self) -> Vec<usize> {
        self.upstreams.iter().map(|(key, _)| key).collect()
    }
}

fn propagated_error(error: Option<QuicConnectionErrorCode>) -> QuicConnectionErrorCode {
    match error {
        Some(code @ QuicConnectionErrorCode::ApplicationErrorCode(_)) => code,
        _ => TransportErrorCode::NoError.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::QuicMessage;
    use crate::packet::ProtectedPacket;
    use crate::tls::SelfSignedIssuer;
    use anyhow::anyhow;
    use std::sync::Arc;

    const CLIENT: ([u8; 4], u16) = ([10, 0, 0, 1], 50000);
    const PROXY: ([u8; 4], u16) = ([10, 0, 0, 2], 443);
    const ORIGIN: ([u8; 4], u16) = ([10, 0, 0, 3], 443);

    fn issuer() -> Arc<SelfSignedIssuer> {
        Arc::new(SelfSignedIssuer::default())
    }

    // The proxy's upstream datagrams come from a single local address
    const PROXY_UPSTREAM: ([u8; 4], u16) = ([10, 0, 0, 2], 40000);

    struct World {
        client: QuicConnection,
        proxy: ForwardProxy,
        origin: ConnectionTable,
    }

    impl World {
        fn new(now: Instant) -> Result<Self> {
            let mut config = QuicConfig::default();
            config.set_server_name("origin.test");
            Ok(Self {
                client: QuicConnection::connect(config, PROXY.into(), now)?,
                proxy: ForwardProxy::new(
                    ConnectionTable::new(QuicConfig::default(), issuer()),
                    QuicConfig::default(),
                    ORIGIN.into(),
                ),
                origin: ConnectionTable::new(QuicConfig::default(), issuer()),
            })
        }

        fn step(&mut self, now: Instant) -> Result<bool> {
            let mut moved = false;
            while let Some((datagram, _)) = self.client.poll_transmit(now)? {
                self.proxy.downstream().provide_datagram(&datagram, CLIENT.into(), now);
                moved = true;
            }
            while let Some((datagram, _)) = self.proxy.downstream().poll_transmit(now)? {
                self.client.provide_datagram(&datagram, PROXY.into(), now);
                moved = true;
            }
            self.proxy.pair_accepted(now)?;
            for key in self.proxy.upstream_keys() {
                let Some(up) = self.proxy.upstream(key) else {
                    continue;
                };
                while let Some((datagram, _)) = up.poll_transmit(now)? {
                    self.origin.provide_datagram(&datagram, PROXY_UPSTREAM.into(), now);
                    moved = true;
                }
            }
            while let Some((datagram, _)) = self.origin.poll_transmit(now)? {
                let key = self.upstream_addressed_by(&datagram)?;
                if let Some(up) = self.proxy.upstream(key) {
                    up.provide_datagram(&datagram, ORIGIN.into(), now);
                }
                moved = true;
            }
            self.proxy.relay();
            self.proxy.close_pairs(now);
            Ok(moved)
        }

        // Every upstream shares one local address, the dcid tells them apart
        fn upstream_addressed_by(&mut self, datagram: &[u8]) -> Result<usize> {
            for key in self.proxy.upstream_keys() {
                let Some(up) = self.proxy.upstream(key) else {
                    continue;
                };
                let scid = up.scid().clone();
                if ProtectedPacket::parse(datagram, scid.len())?.dcid == scid {
                    return Ok(key);
                }
            }
            Err(anyhow!("origin answered nobody"))
        }

        fn settle(&mut self, now: Instant) -> Result<()> {
            for _ in 0..32 {
                if !self.step(now)? {
                    return Ok(());
                }
            }
            Err(anyhow!("proxy did not settle"))
        }
    }

    #[test]
    fn test_forward_relays_both_ways() -> Result<()> {
        let now = Instant::now();
        let mut world = World::new(now)?;
        world.settle(now)?;
        assert_eq!(world.proxy.pair_count(), 1);

        let origin_key = world
            .origin
            .accept()
            .ok_or_else(|| anyhow!("origin accepted nothing"))?;
        assert_eq!(
            world.origin.get(origin_key).and_then(|c| c.server_name()),
            Some("origin.test")
        );

        world.client.send(0, b"GET /".to_vec())?;
        world.settle(now)?;
        let origin_conn = world
            .origin
            .get_mut(origin_key)
            .ok_or_else(|| anyhow!("origin connection vanished"))?;
        assert_eq!(origin_conn.recv_message(), Some(QuicMessage::new(0, b"GET /".to_vec())));

        origin_conn.send(0, b"200 OK".to_vec())?;
        world.settle(now)?;
        assert_eq!(world.client.recv_message(), Some(QuicMessage::new(0, b"200 OK".to_vec())));
        Ok(())
    }

    #[test]
    fn test_client_close_tears_down_upstream() -> Result<()> {
        let now = Instant::now();
        let mut world = World::new(now)?;
        world.settle(now)?;

        world
            .client
            .close(QuicConnectionErrorCode::create_application_error_code(0x10c), "done", now);
        world.settle(now)?;

        let up_key = world
            .proxy
            .upstream_keys()
            .first()
            .copied()
            .ok_or_else(|| anyhow!("upstream already removed"))?;
        let up = world.proxy.upstream(up_key).ok_or_else(|| anyhow!("no upstream"))?;
        assert!(up.is_closing());
        assert_eq!(
            up.error(),
            Some(QuicConnectionErrorCode::create_application_error_code(0x10c))
        );

        // Run out both close periods
        let later = now + std::time::Duration::from_secs(10);
        world.proxy.handle_timeout(later);
        world.proxy.close_pairs(later);
        world.proxy.handle_timeout(later);
        world.proxy.close_pairs(later);
        assert_eq!(world.proxy.pair_count(), 0);
        assert_eq!(world.proxy.served(), 1);
        Ok(())
    }

    #[test]
    fn test_reused_downstream_key_gets_a_fresh_pair() -> Result<()> {
        let now = Instant::now();
        let mut world = World::new(now)?;
        world.settle(now)?;
        assert_eq!(world.proxy.upstream_for(0), Some(0));

        // The downstream drains and leaves while its upstream is still closing
        world
            .client
            .close(QuicConnectionErrorCode::create_application_error_code(0x10c), "done", now);
        world.settle(now)?;
        let later = now + std::time::Duration::from_secs(10);
        world.proxy.downstream().handle_timeout(later);
        world.proxy.close_pairs(later);
        assert_eq!(world.proxy.pair_count(), 0);
        assert!(world.proxy.upstream(0).is_some_and(|up| up.is_closing()));

        let mut config = QuicConfig::default();
        config.set_server_name("origin.test");
        world.client = QuicConnection::connect(config, PROXY.into(), later)?;
        world.settle(later)?;
        assert!(world.client.is_established());
        assert_eq!(world.proxy.upstream_for(0), Some(1));

        // The old upstream finishes without touching the new pair
        if let Some(old) = world.proxy.upstream(0) {
            old.handle_timeout(later);
        }
        assert_eq!(world.proxy.close_pairs(later), vec![0]);
        assert_eq!(world.proxy.served(), 1);
        assert_eq!(world.proxy.pair_count(), 1);
        assert!(!world.client.is_closing());

        world.client.send(0, b"second".to_vec())?;
        world.settle(later)?;
        let mut received = None;
        while let Some(key) = world.origin.accept() {
            if let Some(conn) = world.origin.get_mut(key) {
                received = received.or(conn.recv_message());
            }
        }
        assert_eq!(received, Some(QuicMessage::new(0, b"second".to_vec())));
        Ok(())
    }
}
