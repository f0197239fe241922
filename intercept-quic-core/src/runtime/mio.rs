use crate::connection::QuicConnection;
use crate::endpoint::ConnectionTable;
use crate::error_code::QuicConnectResult;
use crate::runtime::{ForwardProxy, QuicCallbacks, QuicUserContext, RuntimeConfig};
use anyhow::{anyhow, Context, Result};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

const LISTEN_SOCKET: Token = Token(0);
const CLIENT_SOCKET: Token = Token(1);
// Upstream sockets of the forward proxy are numbered from here by slab key
const UPSTREAM_SOCKET_BASE: usize = 2;

type Datagram = (Token, Vec<u8>, SocketAddr);

/// Simulated loss and reordering, applied to every datagram in and out.
struct FaultInjector {
    sent_cnt: u64,
    max_quic_packet_send_count: Option<u64>,
    tx_packet_loss_rate: Option<f32>,
    rx_packet_loss_rate: Option<f32>,
    tx_packet_reorder_rate: Option<f32>,
    rx_packet_reorder_rate: Option<f32>,
    tx_reorder_queue: VecDeque<Datagram>,
    rx_reorder_queue: VecDeque<Datagram>,
    rng: StdRng,
}

impl FaultInjector {
    fn new(config: &RuntimeConfig) -> Self {
        Self {
            sent_cnt: 0,
            max_quic_packet_send_count: config.max_quic_packet_send_count,
            tx_packet_loss_rate: config.tx_packet_loss_rate,
            rx_packet_loss_rate: config.rx_packet_loss_rate,
            tx_packet_reorder_rate: config.tx_packet_reorder_rate,
            rx_packet_reorder_rate: config.rx_packet_reorder_rate,
            tx_reorder_queue: VecDeque::new(),
            rx_reorder_queue: VecDeque::new(),
            rng: StdRng::from_entropy(),
        }
    }

    fn hit(&mut self, rate: Option<f32>) -> bool {
        rate.is_some_and(|rate| self.rng.gen::<f32>() < rate)
    }

    /// Datagrams to put on the wire now, possibly an older one first.
    fn on_tx(&mut self, datagram: Datagram) -> Vec<Datagram> {
        if let Some(limit) = self.max_quic_packet_send_count {
            if self.sent_cnt >= limit {
                trace!(
                    "Dropping {} bytes, since the number of sent packets reach the limitation {}",
                    datagram.1.len(),
                    limit
                );
                return vec![];
            }
        }
        self.sent_cnt += 1;

        if self.hit(self.tx_packet_loss_rate) {
            trace!("Simulating TX packet loss - dropping {} bytes", datagram.1.len());
            return vec![];
        }
        if self.hit(self.tx_packet_reorder_rate) {
            trace!("Queuing TX packet for reordering - {} bytes", datagram.1.len());
            self.tx_reorder_queue.push_back(datagram);
            if self.rng.gen::<f32>() < 0.5 {
                return self.tx_reorder_queue.pop_front().into_iter().collect();
            }
            return vec![];
        }
        vec![datagram]
    }

    /// Datagrams to hand to the connections now.
    fn on_rx(&mut self, datagram: Datagram) -> Vec<Datagram> {
        if self.hit(self.rx_packet_loss_rate) {
            trace!("Simulating RX packet loss - dropping {} bytes", datagram.1.len());
            return vec![];
        }
        if self.hit(self.rx_packet_reorder_rate) {
            trace!("Queuing RX packet for reordering - {} bytes", datagram.1.len());
            self.rx_reorder_queue.push_back(datagram);
            if self.rng.gen::<f32>() < 0.5 {
                return self.rx_reorder_queue.pop_front().into_iter().collect();
            }
            return vec![];
        }
        vec![datagram]
    }

    fn flush_tx(&mut self) -> Vec<Datagram> {
        self.tx_reorder_queue.drain(..).collect()
    }

    fn flush_rx(&mut self) -> Vec<Datagram> {
        self.rx_reorder_queue.drain(..).collect()
    }
}

/// Sockets of one event loop by token. A connected socket ignores the
/// destination address.
#[derive(Default)]
struct SocketSet {
    sockets: HashMap<Token, (UdpSocket, bool)>,
}

impl SocketSet {
    fn register(
        &mut self,
        poll: &Poll,
        token: Token,
        mut socket: UdpSocket,
        connected: bool,
    ) -> Result<()> {
        poll.registry()
            .register(&mut socket, token, Interest::READABLE)
            .with_context(|| format!("Failed to register socket {:?}", token))?;
        self.sockets.insert(token, (socket, connected));
        Ok(())
    }

    fn deregister(&mut self, poll: &Poll, token: Token) -> Result<()> {
        if let Some((mut socket, _)) = self.sockets.remove(&token) {
            poll.registry().deregister(&mut socket)?;
        }
        Ok(())
    }

    fn send(&self, (token, buf, to): &Datagram) -> Result<()> {
        let Some((socket, connected)) = self.sockets.get(token) else {
            debug!("Socket {:?} is gone, drop {} bytes", token, buf.len());
            return Ok(());
        };
        let result = if *connected {
            socket.send(buf)
        } else {
            socket.send_to(buf, *to)
        };
        match result {
            Ok(_) => {
                trace!("Sending {} bytes to {}", buf.len(), to);
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                warn!("Socket {:?} is full, drop {} bytes", token, buf.len());
                Ok(())
            }
            Err(err) => Err(anyhow!("Socket write failed: {}", err)
                .context(format!("Error while sending to {}", to))),
        }
    }

    /// Reads until the socket would block.
    fn recv_all(&self, token: Token, buf: &mut [u8]) -> Result<Vec<Datagram>> {
        let Some((socket, _)) = self.sockets.get(&token) else {
            return Ok(vec![]);
        };
        let mut datagrams = vec![];
        loop {
            match socket.recv_from(buf) {
                Ok((size, from)) => {
                    trace!("Received {} bytes from {}", size, from);
                    datagrams.push((token, buf[..size].to_vec(), from));
                }
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::Interrupted =>
                {
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
                    warn!("Peer of socket {:?} is unreachable", token);
                    break;
                }
                Err(err) => {
                    return Err(anyhow!("Socket read failed: {}", err)
                        .context(format!("Error while reading from {:?}", socket)));
                }
            }
        }
        Ok(datagrams)
    }
}

pub(crate) struct MioEventLoop {
    target_address: SocketAddr,
    listen_address: SocketAddr,
    buffer_size: usize,
    injector: FaultInjector,
    listener: Option<UdpSocket>,
}

impl MioEventLoop {
    pub(crate) fn new(config: RuntimeConfig) -> Self {
        Self {
            target_address: config.target_address,
            listen_address: config.listen_address,
            buffer_size: config.buffer_size,
            injector: FaultInjector::new(&config),
            listener: None,
        }
    }

    /// Binds the listen socket once and reports the bound address.
    pub(crate) fn listen(&mut self) -> Result<SocketAddr> {
        if self.listener.is_none() {
            let socket = UdpSocket::bind(self.listen_address)
                .with_context(|| format!("Failed to bind {}", self.listen_address))?;
            self.listener = Some(socket);
        }
        match &self.listener {
            Some(socket) => Ok(socket.local_addr()?),
            None => Err(anyhow!("Listen socket is not bound")),
        }
    }

    fn take_listener(&mut self) -> Result<UdpSocket> {
        self.listen()?;
        self.listener
            .take()
            .ok_or_else(|| anyhow!("Listen socket is not bound"))
    }

    fn create_client_socket(&self) -> Result<UdpSocket> {
        let bind_address: SocketAddr = if self.target_address.is_ipv6() {
            "[::]:0".parse()?
        } else {
            "0.0.0.0:0".parse()?
        };
        let client_socket = UdpSocket::bind(bind_address)
            .with_context(|| "Failed to bind random address".to_string())?;

        client_socket
            .connect(self.target_address)
            .with_context(|| format!("Failed to connect target {:?}", self.target_address))?;

        // No need to set non-blocking mode since Mio has already handled it
        Ok(client_socket)
    }

    fn poll_until(poll: &mut Poll, events: &mut Events, deadline: Option<Instant>) -> Result<()> {
        let timeout = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
        loop {
            match poll.poll(events, timeout) {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(anyhow!("Failed to poll events: {}", err)
                        .context("Error occurred during polling"));
                }
            }
        }
    }

    fn transmit(&mut self, sockets: &SocketSet, datagram: Datagram) -> Result<()> {
        for datagram in self.injector.on_tx(datagram) {
            sockets.send(&datagram)?;
        }
        Ok(())
    }

    fn flush_reordered_tx(&mut self, sockets: &SocketSet) -> Result<()> {
        for datagram in self.injector.flush_tx() {
            trace!("Flushing reordered TX packet - {} bytes", datagram.1.len());
            sockets.send(&datagram)?;
        }
        Ok(())
    }

    /// Reads every readable socket, passing datagrams through the injector.
    fn receive(
        &mut self,
        sockets: &SocketSet,
        events: &Events,
        buf: &mut [u8],
    ) -> Result<Vec<Datagram>> {
        let mut received = vec![];
        for event in events.iter() {
            for datagram in sockets.recv_all(event.token(), buf)? {
                received.extend(self.injector.on_rx(datagram));
            }
        }
        received.extend(self.injector.flush_rx());
        Ok(received)
    }

    fn dispatch<T>(
        qconn: &mut QuicConnection,
        uctx: &mut QuicUserContext<T>,
        notified: &mut bool,
    ) -> Result<()>
    where
        T: QuicCallbacks,
    {
        if !*notified {
            if let Some(result) = qconn.connect_result() {
                *notified = true;
                uctx.run_connect_done_event(qconn, result)?;
            }
        }
        while let Some(message) = qconn.recv_message() {
            uctx.run_message_event(qconn, message)?;
        }
        Ok(())
    }

    pub(crate) fn run_client<T>(
        &mut self,
        qconn: &mut QuicConnection,
        uctx: &mut QuicUserContext<T>,
    ) -> Result<()>
    where
        T: QuicCallbacks,
    {
        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(64);
        let mut sockets = SocketSet::default();

        let client_socket = self.create_client_socket()?;
        let local_addr = client_socket
            .local_addr()
            .with_context(|| {
                format!("Failed to get local address from Mio socket {:?}", client_socket)
            })?;
        sockets.register(&poll, CLIENT_SOCKET, client_socket, true)?;
        let _span = tracing::span!(
            tracing::Level::TRACE,
            "udp",
            local = %local_addr,
            peer = %self.target_address
        )
        .entered();
        info!("Initiating QUIC handshake with {}", self.target_address);

        let mut notified = false;
        let mut rcvbuf = vec![0u8; self.buffer_size];
        loop {
            Self::dispatch(qconn, uctx, &mut notified)?;
            while let Some((datagram, to)) = qconn.poll_transmit(Instant::now())? {
                self.transmit(&sockets, (CLIENT_SOCKET, datagram, to))?;
            }
            self.flush_reordered_tx(&sockets)?;

            if qconn.is_closed() {
                uctx.run_close_event(qconn)?;
                info!("Now we exit the runtime");
                return Ok(());
            }

            Self::poll_until(&mut poll, &mut events, qconn.next_timeout())?;
            let now = Instant::now();
            for (_, datagram, from) in self.receive(&sockets, &events, &mut rcvbuf)? {
                qconn.provide_datagram(&datagram, from, now);
            }
            if qconn.next_timeout().is_some_and(|deadline| deadline <= now) {
                trace!("Timer event triggered via poll timeout");
                qconn.handle_timeout(now);
            }
        }
    }

    pub(crate) fn run_server<T>(
        &mut self,
        table: &mut ConnectionTable,
        uctx: &mut QuicUserContext<T>,
        max_connections: Option<usize>,
    ) -> Result<()>
    where
        T: QuicCallbacks,
    {
        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(256);
        let mut sockets = SocketSet::default();

        let listener = self.take_listener()?;
        let local_addr = listener.local_addr()?;
        sockets.register(&poll, LISTEN_SOCKET, listener, false)?;
        let _span = tracing::span!(tracing::Level::TRACE, "udp", local = %local_addr).entered();
        info!("Serving QUIC on {}", local_addr);

        let mut served = 0;
        let mut rcvbuf = vec![0u8; self.buffer_size];
        loop {
            while let Some(key) = table.accept() {
                if let Some(conn) = table.get_mut(key) {
                    info!("Connection {} from {} established", key, conn.remote());
                    uctx.run_connect_done_event(conn, QuicConnectResult::Success)?;
                }
            }
            for key in table.keys() {
                let Some(conn) = table.get_mut(key) else {
                    continue;
                };
                while let Some(message) = conn.recv_message() {
                    uctx.run_message_event(conn, message)?;
                }
            }

            while let Some((datagram, to)) = table.poll_transmit(Instant::now())? {
                self.transmit(&sockets, (LISTEN_SOCKET, datagram, to))?;
            }
            self.flush_reordered_tx(&sockets)?;

            for (key, mut conn) in table.remove_closed() {
                debug!("Connection {} closed", key);
                uctx.run_close_event(&mut conn)?;
                served += 1;
            }
            if max_connections.is_some_and(|max| served >= max) {
                info!("Served {} connections, now we exit the runtime", served);
                return Ok(());
            }

            Self::poll_until(&mut poll, &mut events, table.next_timeout())?;
            let now = Instant::now();
            for (_, datagram, from) in self.receive(&sockets, &events, &mut rcvbuf)? {
                table.provide_datagram(&datagram, from, now);
            }
            table.handle_timeout(now);
        }
    }

    pub(crate) fn run_forward(
        &mut self,
        proxy: &mut ForwardProxy,
        max_connections: Option<usize>,
    ) -> Result<()> {
        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(256);
        let mut sockets = SocketSet::default();

        let listener = self.take_listener()?;
        let local_addr = listener.local_addr()?;
        sockets.register(&poll, LISTEN_SOCKET, listener, false)?;
        let _span = tracing::span!(
            tracing::Level::TRACE,
            "udp",
            local = %local_addr,
            upstream = %self.target_address
        )
        .entered();
        info!("Forwarding QUIC from {} to {}", local_addr, self.target_address);

        let mut rcvbuf = vec![0u8; self.buffer_size];
        loop {
            let now = Instant::now();
            for key in proxy.pair_accepted(now)? {
                let socket = self.create_client_socket()?;
                sockets.register(&poll, Token(UPSTREAM_SOCKET_BASE + key), socket, true)?;
            }
            proxy.relay();
            for key in proxy.close_pairs(now) {
                sockets.deregister(&poll, Token(UPSTREAM_SOCKET_BASE + key))?;
            }

            while let Some((datagram, to)) = proxy.downstream().poll_transmit(now)? {
                self.transmit(&sockets, (LISTEN_SOCKET, datagram, to))?;
            }
            for key in proxy.upstream_keys() {
                let Some(upstream) = proxy.upstream(key) else {
                    continue;
                };
                let mut outgoing = vec![];
                while let Some((datagram, to)) = upstream.poll_transmit(now)? {
                    outgoing.push((Token(UPSTREAM_SOCKET_BASE + key), datagram, to));
                }
                for datagram in outgoing {
                    self.transmit(&sockets, datagram)?;
                }
            }
            self.flush_reordered_tx(&sockets)?;

            if max_connections.is_some_and(|max| proxy.served() >= max) {
                info!("Forwarded {} connections, now we exit the runtime", proxy.served());
                return Ok(());
            }

            Self::poll_until(&mut poll, &mut events, proxy.next_timeout())?;
            let now = Instant::now();
            for (token, datagram, from) in self.receive(&sockets, &events, &mut rcvbuf)? {
                if token == LISTEN_SOCKET {
                    proxy.downstream().provide_datagram(&datagram, from, now);
                } else if let Some(upstream) = token
                    .0
                    .checked_sub(UPSTREAM_SOCKET_BASE)
                    .and_then(|key| proxy.upstream(key))
                {
                    upstream.provide_datagram(&datagram, from, now);
                }
            }
            proxy.handle_timeout(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(n: u8) -> Datagram {
        (CLIENT_SOCKET, vec![n], SocketAddr::from(([127, 0, 0, 1], 443)))
    }

    #[test]
    fn test_send_count_limit() {
        let mut injector = FaultInjector::new(&RuntimeConfig {
            max_quic_packet_send_count: Some(2),
            ..Default::default()
        });
        assert_eq!(injector.on_tx(datagram(1)).len(), 1);
        assert_eq!(injector.on_tx(datagram(2)).len(), 1);
        assert!(injector.on_tx(datagram(3)).is_empty());
    }

    #[test]
    fn test_full_loss_and_reorder() {
        let mut injector = FaultInjector::new(&RuntimeConfig {
            rx_packet_loss_rate: Some(1.0),
            tx_packet_reorder_rate: Some(1.0),
            ..Default::default()
        });
        assert!(injector.on_rx(datagram(1)).is_empty());

        let mut sent = vec![];
        for n in 0..10 {
            sent.extend(injector.on_tx(datagram(n)));
        }
        sent.extend(injector.flush_tx());
        // Everything still goes out exactly once
        let mut bytes: Vec<u8> = sent.iter().map(|(_, buf, _)| buf[0]).collect();
        bytes.sort();
        assert_eq!(bytes, (0..10).collect::<Vec<u8>>());
    }
}
