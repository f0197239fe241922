use crate::connection::QuicConnection;
use crate::error_code::QuicConnectResult;
use crate::endpoint::ConnectionTable;
use crate::message::QuicMessage;

use anyhow::Result;
use std::net::SocketAddr;

mod forward;
mod mio;

pub use forward::ForwardProxy;
pub(crate) use mio::MioEventLoop;

pub struct QuicUserContext<T>
where
    T: QuicCallbacks,
{
    user_data: T,
}

impl<T> QuicUserContext<T>
where
    T: QuicCallbacks,
{
    pub fn new(user_data: T) -> Self {
        Self { user_data }
    }

    pub fn user_data(&self) -> &T {
        &self.user_data
    }

    pub fn into_inner(self) -> T {
        self.user_data
    }

    pub(crate) fn run_connect_done_event(
        &mut self,
        qconn: &mut QuicConnection,
        result: QuicConnectResult,
    ) -> Result<()> {
        self.user_data.connect_done(qconn, result)
    }

    pub(crate) fn run_message_event(
        &mut self,
        qconn: &mut QuicConnection,
        message: QuicMessage,
    ) -> Result<()> {
        self.user_data.on_message(qconn, message)
    }

    pub(crate) fn run_close_event(&mut self, qconn: &mut QuicConnection) -> Result<()> {
        self.user_data.close(qconn)
    }
}

/// Application hooks the runtime calls from its event loop. The connection
/// is handed back mutably so that replies can be sent right away.
pub trait QuicCallbacks {
    /// Called once per connection, when it is established or failed to be.
    fn connect_done(&mut self, qconn: &mut QuicConnection, result: QuicConnectResult) -> Result<()>;

    fn on_message(&mut self, qconn: &mut QuicConnection, message: QuicMessage) -> Result<()>;

    fn close(&mut self, qconn: &mut QuicConnection) -> Result<()>;
}

pub struct RuntimeConfig {
    /// Peer of a client, upstream server of a forward proxy.
    pub target_address: SocketAddr,
    pub listen_address: SocketAddr,
    pub max_quic_packet_send_count: Option<u64>,
    pub tx_packet_loss_rate: Option<f32>,
    pub rx_packet_loss_rate: Option<f32>,
    pub tx_packet_reorder_rate: Option<f32>,
    pub rx_packet_reorder_rate: Option<f32>,
    pub buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            target_address: SocketAddr::from(([127, 0, 0, 1], 443)),
            listen_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_quic_packet_send_count: None,
            tx_packet_loss_rate: None,
            rx_packet_loss_rate: None,
            tx_packet_reorder_rate: None,
            rx_packet_reorder_rate: None,
            buffer_size: 1 << 16,
        }
    }
}

pub struct QuicRuntime {
    core: MioEventLoop,
}

impl QuicRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            core: MioEventLoop::new(config),
        }
    }

    /// Drives one client connection until it is closed.
    pub fn run<T>(
        &mut self,
        qconn: &mut QuicConnection,
        uctx: &mut QuicUserContext<T>,
    ) -> Result<()>
    where
        T: QuicCallbacks,
    {
        self.core.run_client(qconn, uctx)
    }

    /// Serves every connection arriving on the listen address. Runs until
    /// `max_connections` connections were served and closed, or forever.
    pub fn serve<T>(
        &mut self,
        table: &mut ConnectionTable,
        uctx: &mut QuicUserContext<T>,
        max_connections: Option<usize>,
    ) -> Result<()>
    where
        T: QuicCallbacks,
    {
        self.core.run_server(table, uctx, max_connections)
    }

    /// Intercepts connections on the listen address and relays them to
    /// the target address.
    pub fn forward(
        &mut self,
        proxy: &mut ForwardProxy,
        max_connections: Option<usize>,
    ) -> Result<()> {
        self.core.run_forward(proxy, max_connections)
    }

    /// Binds the listen address ahead of `serve` or `forward`, which is
    /// how a caller learns the port when it asked for port 0.
    pub fn listen(&mut self) -> Result<SocketAddr> {
        self.core.listen()
    }
}
