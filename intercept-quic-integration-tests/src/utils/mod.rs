use anyhow::{anyhow, Result};
use chrono::Local;
use intercept_quic_core::prelude::*;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Instant;
use tracing::{trace, warn, Level};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::FmtSubscriber;

pub mod echo;

static INIT: Once = Once::new();
static INIT_SUCCESS: AtomicBool = AtomicBool::new(false);

pub const CLIENT_ADDR: ([u8; 4], u16) = ([192, 0, 2, 10], 50000);
pub const SERVER_ADDR: ([u8; 4], u16) = ([192, 0, 2, 20], 443);

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S.%3f"))
    }
}

pub fn init_logging() {
    if !INIT_SUCCESS.load(Ordering::SeqCst) {
        INIT.call_once(|| {
            let subscriber = FmtSubscriber::builder()
                .with_timer(LocalTimer)
                .with_target(false)
                .with_line_number(true)
                .with_ansi(true)
                .with_max_level(Level::DEBUG)
                .with_test_writer()
                .finish();

            if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
                warn!("Failed to set tracing subscriber: {}", e);
            } else {
                INIT_SUCCESS.store(true, Ordering::SeqCst);
            }
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToServer,
    ToClient,
}

/// A client connection wired to a server `ConnectionTable` without sockets.
/// Every exchange hands the batch of datagrams in flight to a filter first,
/// which may drop, duplicate or reorder them.
pub struct Link {
    pub client: QuicConnection,
    pub server: ConnectionTable,
    pub now: Instant,
}

impl Link {
    pub fn new(client_config: QuicConfig, server_config: QuicConfig) -> Result<Self> {
        let now = Instant::now();
        Ok(Self {
            client: QuicConnection::connect(client_config, SERVER_ADDR.into(), now)?,
            server: ConnectionTable::new(server_config, Arc::new(SelfSignedIssuer::default())),
            now,
        })
    }

    pub fn with_server_name(server_name: &str) -> Result<Self> {
        let mut client_config = QuicConfig::default();
        client_config.set_server_name(server_name);
        Self::new(client_config, QuicConfig::default())
    }

    /// The connection the server accepted for our client.
    pub fn server_conn(&mut self) -> Result<&mut QuicConnection> {
        let key = self
            .server
            .keys()
            .first()
            .copied()
            .ok_or_else(|| anyhow!("server has no connection"))?;
        self.server
            .get_mut(key)
            .ok_or_else(|| anyhow!("server connection {} vanished", key))
    }

    /// Moves one batch each way. Returns whether anything was sent.
    pub fn exchange_with<F>(&mut self, filter: &mut F) -> Result<bool>
    where
        F: FnMut(Direction, &mut Vec<Vec<u8>>),
    {
        let mut batch = vec![];
        while let Some((datagram, _)) = self.client.poll_transmit(self.now)? {
            batch.push(datagram);
        }
        let mut moved = !batch.is_empty();
        filter(Direction::ToServer, &mut batch);
        for datagram in batch {
            self.server.provide_datagram(&datagram, CLIENT_ADDR.into(), self.now);
        }

        let mut batch = vec![];
        while let Some((datagram, _)) = self.server.poll_transmit(self.now)? {
            batch.push(datagram);
        }
        moved |= !batch.is_empty();
        filter(Direction::ToClient, &mut batch);
        for datagram in batch {
            self.client.provide_datagram(&datagram, SERVER_ADDR.into(), self.now);
        }
        Ok(moved)
    }

    pub fn settle_with<F>(&mut self, filter: &mut F) -> Result<()>
    where
        F: FnMut(Direction, &mut Vec<Vec<u8>>),
    {
        for _ in 0..64 {
            if !self.exchange_with(filter)? {
                return Ok(());
            }
        }
        Err(anyhow!("link did not settle"))
    }

    pub fn settle(&mut self) -> Result<()> {
        self.settle_with(&mut |_, _| {})
    }

    /// Jumps to the earliest timer of either side and fires it.
    pub fn advance(&mut self) -> Result<()> {
        let next = [self.client.next_timeout(), self.server.next_timeout()]
            .into_iter()
            .flatten()
            .min()
            .ok_or_else(|| anyhow!("no timer is armed"))?;
        self.now = self.now.max(next);
        trace!("Advancing link clock to the next timer");
        self.client.handle_timeout(self.now);
        self.server.handle_timeout(self.now);
        Ok(())
    }

    /// Alternates exchanges and timer firings until `done` holds.
    pub fn run_until<F, D>(&mut self, filter: &mut F, mut done: D, max_rounds: usize) -> Result<()>
    where
        F: FnMut(Direction, &mut Vec<Vec<u8>>),
        D: FnMut(&mut Self) -> bool,
    {
        for _ in 0..max_rounds {
            self.settle_with(filter)?;
            if done(self) {
                return Ok(());
            }
            self.advance()?;
        }
        Err(anyhow!("condition not reached after {} rounds", max_rounds))
    }
}

pub fn drain_messages(conn: &mut QuicConnection) -> Vec<QuicMessage> {
    let mut messages = vec![];
    while let Some(message) = conn.recv_message() {
        messages.push(message);
    }
    messages
}

pub fn local_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}
