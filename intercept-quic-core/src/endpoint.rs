use anyhow::Result;
use slab::Slab;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, span, trace, warn, Level};

use crate::cid::{ConnectionId, QUIC_DEFAULT_CONNECTION_ID_LENGTH};
use crate::config::QuicConfig;
use crate::connection::QuicConnection;
use crate::packet::{ProtectedPacket, QuicPacketType};
use crate::tls::CertificateIssuer;

// https://www.rfc-editor.org/rfc/rfc9000.html#section-14.1-4
const QUIC_MIN_INITIAL_DATAGRAM_SIZE: usize = 1200;

/// Every connection served from one UDP socket, routed by destination
/// connection id.
pub struct ConnectionTable {
    config: QuicConfig,
    issuer: Arc<dyn CertificateIssuer>,
    connections: Slab<QuicConnection>,
    routes: HashMap<ConnectionId, usize>,
    // Connections whose handshake produced 1-RTT keys, not handed out yet
    pending_accept: VecDeque<usize>,
    announced: Vec<bool>,
}

impl ConnectionTable {
    pub fn new(config: QuicConfig, issuer: Arc<dyn CertificateIssuer>) -> Self {
        Self {
            config,
            issuer,
            connections: Slab::new(),
            routes: HashMap::new(),
            pending_accept: VecDeque::new(),
            announced: vec![],
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn get(&self, key: usize) -> Option<&QuicConnection> {
        self.connections.get(key)
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut QuicConnection> {
        self.connections.get_mut(key)
    }

    pub fn keys(&self) -> Vec<usize> {
        self.connections.iter().map(|(key, _)| key).collect()
    }

    /// Adds a connection created elsewhere, typically a client one.
    pub fn insert(&mut self, conn: QuicConnection) -> usize {
        let scid = conn.scid().clone();
        let key = self.connections.insert(conn);
        self.set_announced(key, false);
        self.routes.insert(scid, key);
        key
    }

    fn set_announced(&mut self, key: usize, value: bool) {
        if self.announced.len() <= key {
            self.announced.resize(key + 1, false);
        }
        self.announced[key] = value;
    }

    /// Connection established since the last call, server or client.
    pub fn accept(&mut self) -> Option<usize> {
        self.pending_accept.pop_front()
    }

    /// Routes a datagram to its connection, creating a server connection
    /// for a new client Initial. Returns the connection it went to.
    pub fn provide_datagram(
        &mut self,
        buf: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Option<usize> {
        let span = span!(
            Level::TRACE,
            "route_datagram",
            from = %from,
            size = buf.len(),
            connection = tracing::field::Empty
        );
        let _enter = span.enter();

        let header = match ProtectedPacket::parse(buf, QUIC_DEFAULT_CONNECTION_ID_LENGTH) {
            Ok(header) => header,
            Err(e) => {
                debug!("Drop datagram with unreadable header: {:#}", e);
                return None;
            }
        };

        let key = match self.routes.get(&header.dcid) {
            Some(key) => *key,
            None => match self.accept_initial(&header, buf.len(), from, now) {
                Ok(Some(key)) => key,
                Ok(None) => return None,
                Err(e) => {
                    warn!("Failed to create connection for {}: {:#}", from, e);
                    return None;
                }
            },
        };
        span.record("connection", key);

        let conn = self.connections.get_mut(key)?;
        conn.provide_datagram(buf, from, now);
        self.after_activity(key);
        Some(key)
    }

    fn accept_initial(
        &mut self,
        header: &ProtectedPacket<'_>,
        datagram_len: usize,
        from: SocketAddr,
        now: Instant,
    ) -> Result<Option<usize>> {
        if header.packet_type != QuicPacketType::Initial {
            trace!(
                "Drop {:?} packet for unknown connection id {}",
                header.packet_type,
                header.dcid
            );
            return Ok(None);
        }
        if datagram_len < QUIC_MIN_INITIAL_DATAGRAM_SIZE {
            debug!("Drop client Initial in a datagram of {} bytes", datagram_len);
            return Ok(None);
        }

        let conn = QuicConnection::accept(
            self.config.clone(),
            self.issuer.clone(),
            from,
            header.dcid.clone(),
            header.scid.clone(),
            now,
        )?;
        let key = self.insert(conn);
        // Until the client switches, it keeps addressing its own choice
        self.routes.insert(header.dcid.clone(), key);
        info!("New connection {} from {} for {}", key, from, header.dcid);
        Ok(Some(key))
    }

    fn after_activity(&mut self, key: usize) {
        let Some(conn) = self.connections.get_mut(key) else {
            return;
        };
        for cid in conn.take_issued_connection_ids() {
            trace!("Route issued connection id {} to {}", cid, key);
            self.routes.insert(cid, key);
        }
        if conn.is_established() && !self.announced.get(key).copied().unwrap_or(false) {
            self.set_announced(key, true);
            self.pending_accept.push_back(key);
        }
    }

    /// Next datagram of any connection.
    pub fn poll_transmit(&mut self, now: Instant) -> Result<Option<(Vec<u8>, SocketAddr)>> {
        for (key, conn) in self.connections.iter_mut() {
            match conn.poll_transmit(now) {
                Ok(Some(transmit)) => return Ok(Some(transmit)),
                Ok(None) => {}
                Err(e) => {
                    return Err(
                        e.context(format!("Failed to build datagram of connection {}", key))
                    );
                }
            }
        }
        Ok(None)
    }

    pub fn next_timeout(&self) -> Option<Instant> {
        self.connections
            .iter()
            .filter_map(|(_, conn)| conn.next_timeout())
            .min()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        let expired: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.next_timeout().is_some_and(|t| t <= now))
            .map(|(key, _)| key)
            .collect();
        for key in expired {
            if let Some(conn) = self.connections.get_mut(key) {
                conn.handle_timeout(now);
            }
            self.after_activity(key);
        }
    }

    /// Removes closed connections with their routes and returns them.
    pub fn remove_closed(&mut self) -> Vec<(usize, QuicConnection)> {
        let closed: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.is_closed())
            .map(|(key, _)| key)
            .collect();

        let mut removed = Vec::with_capacity(closed.len());
        for key in closed {
            self.routes.retain(|_, k| *k != key);
            self.pending_accept.retain(|k| *k != key);
            self.set_announced(key, false);
            let conn = self.connections.remove(key);
            debug!("Removed closed connection {} to {}", key, conn.remote());
            removed.push((key, conn));
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::SelfSignedIssuer;
    use anyhow::anyhow;

    fn table() -> ConnectionTable {
        ConnectionTable::new(QuicConfig::default(), Arc::new(SelfSignedIssuer::default()))
    }

    fn client_initial(now: Instant) -> Result<Vec<u8>> {
        let mut config = QuicConfig::default();
        config.set_server_name("routing.test");
        let mut client = QuicConnection::connect(config, "127.0.0.1:443".parse()?, now)?;
        let (datagram, _) = client
            .poll_transmit(now)?
            .ok_or_else(|| anyhow!("client sent nothing"))?;
        Ok(datagram)
    }

    #[test]
    fn test_repeated_initial_goes_to_same_connection() -> Result<()> {
        let now = Instant::now();
        let from: SocketAddr = "127.0.0.1:5000".parse()?;
        let mut table = table();
        let datagram = client_initial(now)?;

        let first = table.provide_datagram(&datagram, from, now);
        let second = table.provide_datagram(&datagram, from, now);
        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
        assert!(table.poll_transmit(now)?.is_some());
        Ok(())
    }

    #[test]
    fn test_unknown_short_header_is_dropped() -> Result<()> {
        let now = Instant::now();
        let mut table = table();
        let mut datagram = vec![0x41];
        datagram.extend_from_slice(&[0x11; QUIC_DEFAULT_CONNECTION_ID_LENGTH]);
        datagram.extend_from_slice(&[0x22; 40]);

        assert_eq!(table.provide_datagram(&datagram, "127.0.0.1:5000".parse()?, now), None);
        assert!(table.is_empty());
        Ok(())
    }

    #[test]
    fn test_truncated_initial_is_dropped() -> Result<()> {
        let now = Instant::now();
        let mut table = table();
        let datagram = client_initial(now)?;

        assert_eq!(table.provide_datagram(&datagram[..600], "127.0.0.1:5000".parse()?, now), None);
        assert!(table.is_empty());
        Ok(())
    }

    #[test]
    fn test_closed_connections_are_removed() -> Result<()> {
        let now = Instant::now();
        let mut table = table();
        let key = table
            .provide_datagram(&client_initial(now)?, "127.0.0.1:5000".parse()?, now)
            .ok_or_else(|| anyhow!("no connection"))?;

        let conn = table.get_mut(key).ok_or_else(|| anyhow!("missing {}", key))?;
        conn.close(crate::error_code::TransportErrorCode::NoError.into(), "", now);
        let deadline = table.next_timeout().ok_or_else(|| anyhow!("no close timer"))?;
        table.handle_timeout(deadline);

        let removed = table.remove_closed();
        assert_eq!(removed.len(), 1);
        assert!(table.is_empty());
        assert!(table.routes.is_empty());
        Ok(())
    }
}
