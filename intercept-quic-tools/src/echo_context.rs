use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use tracing::{error, info, trace, warn};

use intercept_quic_core::prelude::*;

// Client-initiated bidirectional streams are 0, 4, 8, ...
const CLIENT_BIDI_STREAM_STEP: u64 = 4;

/// Sends every line of a file on its own bidirectional stream and checks
/// that the same bytes come back.
pub struct EchoClientContext {
    lines: Vec<String>,
    in_flight: HashMap<u64, String>,
    next_line: usize,
    window: usize,
    verified: usize,
    failed: usize,
}

impl EchoClientContext {
    pub fn new(file_path: &str, window: usize) -> Result<Self> {
        let file = File::open(file_path)
            .with_context(|| format!("Failed to open echo file {}", file_path))?;
        let lines = BufReader::new(file)
            .lines()
            .collect::<std::io::Result<Vec<String>>>()
            .with_context(|| format!("Failed to read echo file {}", file_path))?;
        Ok(Self::from_lines(lines, window))
    }

    pub fn from_lines(lines: Vec<String>, window: usize) -> Self {
        Self {
            lines,
            in_flight: HashMap::new(),
            next_line: 0,
            window: window.max(1),
            verified: 0,
            failed: 0,
        }
    }

    pub fn verified(&self) -> usize {
        self.verified
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    fn send_more(&mut self, qconn: &mut QuicConnection) -> Result<()> {
        while self.in_flight.len() < self.window && self.next_line < self.lines.len() {
            let stream_id = self.next_line as u64 * CLIENT_BIDI_STREAM_STEP;
            let line = self.lines[self.next_line].clone();
            trace!("Sending line {} on stream {}", self.next_line, stream_id);
            qconn.send(stream_id, line.clone().into_bytes())?;
            self.in_flight.insert(stream_id, line);
            self.next_line += 1;
        }

        if self.in_flight.is_empty() && self.next_line == self.lines.len() {
            info!("Echoed {} lines, {} mismatched", self.verified, self.failed);
            qconn.close(TransportErrorCode::NoError.into(), "echo done", std::time::Instant::now());
        }
        Ok(())
    }
}

impl QuicCallbacks for EchoClientContext {
    fn connect_done(
        &mut self,
        qconn: &mut QuicConnection,
        result: QuicConnectResult,
    ) -> Result<()> {
        match result {
            QuicConnectResult::Success => {
                info!("QUIC connection established successfully");
                self.send_more(qconn)
            }
            QuicConnectResult::Timeout(duration) => {
                Err(anyhow!("QUIC connection establishment timed out after {}ms", duration))
            }
            QuicConnectResult::Failed(reason) => {
                Err(anyhow!("QUIC connection establishment failed, due to {}", reason))
            }
        }
    }

    fn on_message(&mut self, qconn: &mut QuicConnection, message: QuicMessage) -> Result<()> {
        let Some(expected) = self.in_flight.remove(&message.stream_id) else {
            warn!("Unexpected message on stream {}", message.stream_id);
            return Ok(());
        };
        if message.data == expected.as_bytes() {
            self.verified += 1;
        } else {
            error!(
                "Stream {} echoed {:?} instead of {:?}",
                message.stream_id,
                String::from_utf8_lossy(&message.data),
                expected
            );
            self.failed += 1;
        }
        self.send_more(qconn)
    }

    fn close(&mut self, qconn: &mut QuicConnection) -> Result<()> {
        info!("QUIC connection closed with {:?}", qconn.error());
        if self.failed > 0 {
            return Err(anyhow!("{} echoed lines did not match", self.failed));
        }
        Ok(())
    }
}

/// Answers every message with the same bytes on the same stream.
#[derive(Default)]
pub struct EchoServerContext {
    echoed: u64,
}

impl QuicCallbacks for EchoServerContext {
    fn connect_done(
        &mut self,
        qconn: &mut QuicConnection,
        _result: QuicConnectResult,
    ) -> Result<()> {
        info!(
            "Accepted connection from {} for {:?}",
            qconn.remote(),
            qconn.server_name()
        );
        Ok(())
    }

    fn on_message(&mut self, qconn: &mut QuicConnection, message: QuicMessage) -> Result<()> {
        trace!("Echo {} bytes on stream {}", message.data.len(), message.stream_id);
        self.echoed += 1;
        qconn.send(message.stream_id, message.data)?;
        Ok(())
    }

    fn close(&mut self, qconn: &mut QuicConnection) -> Result<()> {
        info!(
            "Connection from {} closed after {} echoes",
            qconn.remote(),
            self.echoed
        );
        Ok(())
    }
}
