use anyhow::{anyhow, Result};
use intercept_quic_core::prelude::*;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::local_addr;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
pub const TEST_IDLE_TIMEOUT_MS: u64 = 5000;

/// Echoes every message back on its stream.
#[derive(Default)]
pub struct EchoServer {
    pub connections: usize,
    pub echoed: usize,
}

impl QuicCallbacks for EchoServer {
    fn connect_done(
        &mut self,
        qconn: &mut QuicConnection,
        _result: QuicConnectResult,
    ) -> Result<()> {
        debug!("Echo server accepted {} for {:?}", qconn.remote(), qconn.server_name());
        self.connections += 1;
        Ok(())
    }

    fn on_message(&mut self, qconn: &mut QuicConnection, message: QuicMessage) -> Result<()> {
        self.echoed += 1;
        qconn.send(message.stream_id, message.data)?;
        Ok(())
    }

    fn close(&mut self, _qconn: &mut QuicConnection) -> Result<()> {
        Ok(())
    }
}

/// Sends all payloads at once, one per bidirectional stream, and closes
/// once every echo came back.
pub struct EchoClient {
    payloads: Vec<Vec<u8>>,
    pub echoes: BTreeMap<u64, Vec<u8>>,
    pub established: bool,
}

impl EchoClient {
    pub fn new(payloads: Vec<Vec<u8>>) -> Self {
        Self {
            payloads,
            echoes: BTreeMap::new(),
            established: false,
        }
    }

    /// Echoed payloads in the order they were sent.
    pub fn echoed(&self) -> Vec<Vec<u8>> {
        self.echoes.values().cloned().collect()
    }
}

impl QuicCallbacks for EchoClient {
    fn connect_done(
        &mut self,
        qconn: &mut QuicConnection,
        result: QuicConnectResult,
    ) -> Result<()> {
        if result != QuicConnectResult::Success {
            return Err(anyhow!("echo client could not connect: {}", result));
        }
        self.established = true;
        for (i, payload) in self.payloads.iter().enumerate() {
            qconn.send(i as u64 * 4, payload.clone())?;
        }
        Ok(())
    }

    fn on_message(&mut self, qconn: &mut QuicConnection, message: QuicMessage) -> Result<()> {
        self.echoes.insert(message.stream_id, message.data);
        if self.echoes.len() == self.payloads.len() {
            info!("All {} echoes received", self.echoes.len());
            qconn.close(TransportErrorCode::NoError.into(), "echo done", Instant::now());
        }
        Ok(())
    }

    fn close(&mut self, qconn: &mut QuicConnection) -> Result<()> {
        debug!("Echo client closed with {:?}", qconn.error());
        Ok(())
    }
}

pub fn test_config() -> QuicConfig {
    let mut config = QuicConfig::default();
    config.set_idle_timeout(TEST_IDLE_TIMEOUT_MS);
    config
}

/// Runs an echo server on a loopback port in its own thread. The thread
/// returns once `max_connections` connections were served.
pub fn spawn_echo_server(
    max_connections: usize,
) -> Result<(SocketAddr, JoinHandle<Result<EchoServer>>)> {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || -> Result<EchoServer> {
        let mut runtime = QuicRuntime::new(RuntimeConfig {
            listen_address: local_addr(0),
            ..Default::default()
        });
        tx.send(runtime.listen()?)?;

        let mut table = ConnectionTable::new(test_config(), Arc::new(SelfSignedIssuer::default()));
        let mut uctx = QuicUserContext::new(EchoServer::default());
        runtime.serve(&mut table, &mut uctx, Some(max_connections))?;
        Ok(uctx.into_inner())
    });
    let addr = rx
        .recv_timeout(STARTUP_TIMEOUT)
        .map_err(|e| anyhow!("echo server did not start: {}", e))?;
    Ok((addr, handle))
}

/// Runs a forward proxy to `upstream` on a loopback port in its own thread.
pub fn spawn_forward_proxy(
    upstream: SocketAddr,
    max_connections: usize,
) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || -> Result<()> {
        let mut runtime = QuicRuntime::new(RuntimeConfig {
            listen_address: local_addr(0),
            target_address: upstream,
            ..Default::default()
        });
        tx.send(runtime.listen()?)?;

        let downstream = ConnectionTable::new(test_config(), Arc::new(SelfSignedIssuer::default()));
        let mut proxy = ForwardProxy::new(downstream, test_config(), upstream);
        runtime.forward(&mut proxy, Some(max_connections))
    });
    let addr = rx
        .recv_timeout(STARTUP_TIMEOUT)
        .map_err(|e| anyhow!("forward proxy did not start: {}", e))?;
    Ok((addr, handle))
}

/// Connects to `target`, echoes `payloads` and returns the client state
/// after the connection closed.
pub fn run_echo_client(
    target: SocketAddr,
    server_name: &str,
    runtime_config: RuntimeConfig,
    payloads: Vec<Vec<u8>>,
) -> Result<EchoClient> {
    let mut config = test_config();
    config.set_server_name(server_name);

    let mut runtime = QuicRuntime::new(RuntimeConfig {
        target_address: target,
        ..runtime_config
    });
    let mut qconn = QuicConnection::connect(config, target, Instant::now())?;
    let mut uctx = QuicUserContext::new(EchoClient::new(payloads));
    runtime.run(&mut qconn, &mut uctx)?;

    if let Some(error) = qconn.error() {
        if error != TransportErrorCode::NoError.into() {
            return Err(anyhow!("echo client closed with {:?}", error));
        }
    }
    Ok(uctx.into_inner())
}

pub fn join<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    handle
        .join()
        .map_err(|_| anyhow!("runtime thread panicked"))?
}
