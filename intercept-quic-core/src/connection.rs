use anyhow::{anyhow, Context, Result};
use rand::RngCore;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, span, trace, warn, Level};

use crate::cid::{ConnectionId, ConnectionIdPair};
use crate::config::QuicConfig;
use crate::crypto::QuicCrypto;
use crate::error_code::{
    QuicConnectResult, QuicConnectionError, QuicConnectionErrorCode, TransportErrorCode,
};
use crate::frame::{QuicFrame, QUIC_STATELESS_RESET_TOKEN_LENGTH};
use crate::handshake::{Handshake, HandshakeState};
use crate::message::QuicMessage;
use crate::packet::{ProtectedPacket, QuicPacket, QuicPacketType};
use crate::reassembly::{is_bidirectional_stream, MessagesToStreamFrames, StreamReassembler};
use crate::recovery::{LossDetection, RecoveryContext};
use crate::rtt::RttEstimator;
use crate::space::{PnSpaceType, PnSpaces};
use crate::tls::{CertificateIssuer, HandshakeOutput};
use crate::utils::format_instant;

// Room a packet needs beyond its header before it is worth building
const QUIC_MIN_PACKET_PAYLOAD: usize = 8;
// Packets held per level until its keys show up
const QUIC_MAX_AWAITING_PACKETS: usize = 16;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QuicLevel {
    Initial,
    ZeroRtt,
    Handshake,
    Application,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QuicConnectionState {
    Connecting,
    Established,
    // https://www.rfc-editor.org/rfc/rfc9000.html#section-10.2.1
    Closing,
    // https://www.rfc-editor.org/rfc/rfc9000.html#section-10.2.2
    Draining,
    Closed,
}

/// What became of one packet of a datagram.
#[derive(Debug, PartialEq, Eq)]
enum PacketOutcome {
    Decoded(usize),
    // Keys for this level are not there yet, keep the rest of the datagram
    AwaitingKeys(QuicLevel),
    // Failed authentication or arrived for a discarded level
    Dropped(usize),
    Padding,
}

struct AwaitingPacket {
    level: QuicLevel,
    bytes: Vec<u8>,
    remote: SocketAddr,
}

/// One QUIC connection, sans-IO. Datagrams go in through
/// `provide_datagram`, come out of `poll_transmit`, and time only moves
/// through the `now` arguments.
pub struct QuicConnection {
    role: Role,
    config: QuicConfig,
    state: QuicConnectionState,
    remote: SocketAddr,

    scid: ConnectionId,
    dcid: ConnectionId,
    original_dcid: ConnectionId,
    dcid_adopted: bool,
    retry_scid: Option<ConnectionId>,
    token: Vec<u8>,
    issued_cids: Vec<ConnectionId>,

    crypto: QuicCrypto,
    handshake: Handshake,
    handshake_completed: bool,
    peer_params_applied: bool,
    peer_ack_delay_exponent: u8,

    spaces: PnSpaces,
    rtt: RttEstimator,
    loss_detection: LossDetection,
    address_validated: bool,
    handshake_ack_received: bool,

    awaiting: Vec<AwaitingPacket>,
    max_datagram_size: usize,

    stream_rx: StreamReassembler,
    stream_tx: MessagesToStreamFrames,
    received: VecDeque<QuicMessage>,

    idle_timeout: Option<Duration>,
    idle_closed: bool,
    last_activity: Instant,
    close_frame: Option<QuicFrame>,
    send_close: bool,
    close_deadline: Option<Instant>,
    local_error: Option<QuicConnectionErrorCode>,
    peer_error: Option<QuicConnectionErrorCode>,
}

fn internal_error(e: anyhow::Error) -> TransportErrorCode {
    error!("Internal error while processing a packet: {:#}", e);
    TransportErrorCode::InternalError
}

impl QuicConnection {
    fn new(
        role: Role,
        config: QuicConfig,
        remote: SocketAddr,
        scid: ConnectionId,
        dcid: ConnectionId,
        original_dcid: ConnectionId,
        handshake: Handshake,
        now: Instant,
    ) -> Result<Self> {
        let mut crypto = QuicCrypto::new(role);
        crypto.compute_initial_keys(original_dcid.as_bytes())?;

        let mut spaces = PnSpaces::new(config.get_ack_delay_exponent());
        spaces.get_mut(PnSpaceType::Initial).set_keys_available();

        let mut rtt = RttEstimator::default();
        rtt.set_max_ack_delay(Duration::from_millis(config.get_max_ack_delay() as u64));

        let local_idle = config.get_idle_timeout();
        Ok(Self {
            role,
            state: QuicConnectionState::Connecting,
            remote,
            scid,
            dcid,
            original_dcid,
            dcid_adopted: role == Role::Server,
            retry_scid: None,
            token: vec![],
            issued_cids: vec![],
            crypto,
            handshake,
            handshake_completed: false,
            peer_params_applied: false,
            peer_ack_delay_exponent: 3,
            spaces,
            rtt,
            loss_detection: LossDetection::default(),
            address_validated: false,
            handshake_ack_received: false,
            awaiting: vec![],
            max_datagram_size: config.get_first_initial_packet_size() as usize,
            stream_rx: StreamReassembler::default(),
            stream_tx: MessagesToStreamFrames::default(),
            received: VecDeque::new(),
            idle_timeout: (local_idle > 0).then(|| Duration::from_millis(local_idle)),
            idle_closed: false,
            last_activity: now,
            close_frame: None,
            send_close: false,
            close_deadline: None,
            local_error: None,
            peer_error: None,
            config,
        })
    }

    /// Starts a client connection; the ClientHello is queued right away.
    pub fn connect(config: QuicConfig, remote: SocketAddr, now: Instant) -> Result<Self> {
        let ids = ConnectionIdPair {
            src: config.scid.clone().unwrap_or_else(ConnectionId::random),
            dst: config.dcid.clone().unwrap_or_else(ConnectionId::random),
        };
        let handshake = Handshake::new_client(&config, &ids.src)?;
        info!("Connecting to {} with scid {} dcid {}", remote, ids.src, ids.dst);

        let odcid = ids.dst.clone();
        let mut conn = Self::new(
            Role::Client,
            config,
            remote,
            ids.src,
            ids.dst,
            odcid,
            handshake,
            now,
        )?;
        let outputs = conn.handshake.start()?;
        conn.apply_handshake_outputs(outputs)
            .map_err(|code| anyhow!("Failed to start the handshake: {:?}", code))?;
        conn.set_loss_timer(now);
        Ok(conn)
    }

    /// Creates the server side of a connection for a client Initial that
    /// was sent to `original_dcid` from `client_scid`.
    pub fn accept(
        config: QuicConfig,
        issuer: Arc<dyn CertificateIssuer>,
        remote: SocketAddr,
        original_dcid: ConnectionId,
        client_scid: ConnectionId,
        now: Instant,
    ) -> Result<Self> {
        let scid = config.scid.clone().unwrap_or_else(ConnectionId::random);
        let handshake = Handshake::new_server(&config, issuer, &original_dcid, &scid)?;
        info!(
            "Accepting connection from {} for {}, scid {}",
            remote, original_dcid, scid
        );
        Self::new(Role::Server, config, remote, scid, client_scid, original_dcid, handshake, now)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> QuicConnectionState {
        self.state
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn scid(&self) -> &ConnectionId {
        &self.scid
    }

    /// Our current source and destination connection ids.
    pub fn connection_ids(&self) -> ConnectionIdPair {
        ConnectionIdPair {
            src: self.scid.clone(),
            dst: self.dcid.clone(),
        }
    }

    pub fn original_dcid(&self) -> &ConnectionId {
        &self.original_dcid
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn is_established(&self) -> bool {
        self.handshake.state() >= HandshakeState::HasAppKeys
            && matches!(
                self.state,
                QuicConnectionState::Connecting | QuicConnectionState::Established
            )
    }

    pub fn is_address_validated(&self) -> bool {
        self.address_validated
    }

    pub fn is_closed(&self) -> bool {
        self.state == QuicConnectionState::Closed
    }

    pub fn is_closing(&self) -> bool {
        matches!(
            self.state,
            QuicConnectionState::Closing
                | QuicConnectionState::Draining
                | QuicConnectionState::Closed
        )
    }

    /// SNI of the ClientHello, available on the server once it was read.
    pub fn server_name(&self) -> Option<&str> {
        match self.role {
            Role::Server => self.handshake.server_name(),
            Role::Client => self.config.get_server_name(),
        }
    }

    /// Why the connection closed: our own error first, then the peer's.
    pub fn error(&self) -> Option<QuicConnectionErrorCode> {
        self.local_error.or(self.peer_error)
    }

    /// How connection setup ended, once it did.
    pub fn connect_result(&self) -> Option<QuicConnectResult> {
        if self.handshake.state() >= HandshakeState::HasAppKeys {
            return Some(QuicConnectResult::Success);
        }
        if !self.is_closing() {
            return None;
        }
        if self.idle_closed {
            let idle = self.idle_timeout.map(|d| d.as_millis() as u64).unwrap_or_default();
            return Some(QuicConnectResult::Timeout(idle));
        }
        Some(QuicConnectResult::Failed(format!("{:?}", self.error())))
    }

    /// Connection ids issued to the peer since the last call, for routing.
    pub fn take_issued_connection_ids(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.issued_cids)
    }

    fn recovery_context(&self) -> RecoveryContext {
        RecoveryContext {
            handshake_state: self.handshake.state(),
            peer_completed_address_validation: self.role == Role::Server || self.address_validated,
            handshake_ack_received: self.handshake_ack_received,
            suppress_initial_pto: self.config.get_suppress_initial_pto(),
        }
    }

    fn set_loss_timer(&mut self, now: Instant) {
        let ctx = self.recovery_context();
        self.loss_detection.set_timer(&self.spaces, &self.rtt, &ctx, now);
    }

    fn idle_deadline(&self) -> Option<Instant> {
        self.idle_timeout.map(|timeout| self.last_activity + timeout)
    }

    pub fn next_timeout(&self) -> Option<Instant> {
        if self.is_closed() {
            return None;
        }
        if self.is_closing() {
            return self.close_deadline;
        }
        [self.loss_detection.deadline(), self.idle_deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        let span = span!(Level::TRACE, "quic_timer", scid = %self.scid, role = ?self.role);
        let _enter = span.enter();

        if self.is_closed() {
            return;
        }
        if self.is_closing() {
            if self.close_deadline.is_some_and(|deadline| deadline <= now) {
                info!("Close period of {:?} ended", self.state);
                self.enter_closed();
            }
            return;
        }

        if self.idle_deadline().is_some_and(|deadline| deadline <= now) {
            info!(
                "Idle timeout after last activity {}, closing silently",
                format_instant(self.last_activity, now)
            );
            self.idle_closed = true;
            self.enter_closed();
            return;
        }

        let ctx = self.recovery_context();
        if let Some(outcome) = self
            .loss_detection
            .on_timeout(&mut self.spaces, &self.rtt, &ctx, now)
        {
            debug!("Loss detection timeout {:?}", outcome);
        }
    }

    fn enter_closed(&mut self) {
        self.state = QuicConnectionState::Closed;
        self.loss_detection.cancel();
        self.close_deadline = None;
        self.awaiting.clear();
    }

    fn three_times_pto(&self) -> Duration {
        self.rtt.pto_duration(0) * 3
    }

    /// Closes with CONNECTION_CLOSE in every level that still has keys.
    pub fn close(&mut self, error_code: QuicConnectionErrorCode, reason: &str, now: Instant) {
        if self.is_closing() {
            trace!("Connection is already {:?}", self.state);
            return;
        }
        info!("Closing connection with {}, reason {}", error_code, reason);
        self.local_error = Some(error_code);
        self.close_frame = Some(QuicFrame::create_connection_close_frame(error_code, reason));
        self.send_close = true;
        self.state = QuicConnectionState::Closing;
        self.close_deadline = Some(now + self.three_times_pto());
        self.loss_detection.cancel();
    }

    fn close_with_transport_error(&mut self, code: TransportErrorCode, now: Instant) {
        self.close(code.into(), "", now);
    }

    fn enter_draining(&mut self, peer_error: QuicConnectionErrorCode, now: Instant) {
        info!("Peer closed the connection with {}, draining", peer_error);
        self.peer_error = Some(peer_error);
        self.state = QuicConnectionState::Draining;
        self.close_deadline = Some(now + self.three_times_pto());
        self.loss_detection.cancel();
    }

    /// Queues `data` on `stream_id`. A bidirectional stream carries exactly
    /// one message and is finished by it.
    pub fn send(&mut self, stream_id: u64, data: Vec<u8>) -> Result<(), QuicConnectionError> {
        if self.is_closing() {
            return Err(QuicConnectionError::ConnectionLost(self.state));
        }

        let initiated_by_server = stream_id & 0x01 == 0x01;
        let peer_initiated = initiated_by_server == (self.role == Role::Client);
        if !is_bidirectional_stream(stream_id) && peer_initiated {
            return Err(QuicConnectionError::InvalidStream(stream_id));
        }

        let frames = self.stream_tx.to_frames(&QuicMessage::new(stream_id, data));
        trace!("Queued {} stream frames on stream {}", frames.len(), stream_id);
        self.spaces
            .get_mut(PnSpaceType::ApplicationData)
            .add_send_frames(frames);
        Ok(())
    }

    pub fn recv_message(&mut self) -> Option<QuicMessage> {
        self.received.pop_front()
    }

    pub fn provide_datagram(&mut self, buf: &[u8], from: SocketAddr, now: Instant) {
        let span = span!(
            Level::TRACE,
            "provide_datagram",
            scid = %self.scid,
            role = ?self.role,
            size = buf.len(),
            packets = tracing::field::Empty
        );
        let _enter = span.enter();

        if matches!(self.state, QuicConnectionState::Closed | QuicConnectionState::Draining) {
            trace!("Connection is {:?}, ignore datagram", self.state);
            return;
        }
        if from != self.remote {
            debug!("Datagram from {} instead of {}, ignore it", from, self.remote);
            return;
        }

        let packets = self.process_datagram(buf, from, now);
        span.record("packets", packets);
        self.replay_awaiting(now);
        if !self.is_closing() {
            self.set_loss_timer(now);
        }
    }

    fn process_datagram(&mut self, buf: &[u8], from: SocketAddr, now: Instant) -> usize {
        let mut offset = 0;
        let mut packets = 0;
        while offset < buf.len() {
            match self.process_packet(&buf[offset..], now) {
                Ok(PacketOutcome::Decoded(len)) => {
                    packets += 1;
                    offset += len;
                }
                Ok(PacketOutcome::Dropped(len)) => offset += len,
                Ok(PacketOutcome::AwaitingKeys(level)) => {
                    let kept = self.awaiting.iter().filter(|p| p.level == level).count();
                    if kept >= QUIC_MAX_AWAITING_PACKETS {
                        debug!(
                            "Already holding {} {:?} packets, drop {} bytes",
                            kept,
                            level,
                            buf.len() - offset
                        );
                        break;
                    }
                    debug!("No {:?} keys yet, keep {} bytes for later", level, buf.len() - offset);
                    self.awaiting.push(AwaitingPacket {
                        level,
                        bytes: buf[offset..].to_vec(),
                        remote: from,
                    });
                    break;
                }
                Ok(PacketOutcome::Padding) => {
                    trace!("Skip {} bytes of datagram padding", buf.len() - offset);
                    break;
                }
                Err(e) => {
                    warn!("Drop the remaining {} bytes of datagram: {:#}", buf.len() - offset, e);
                    break;
                }
            }
        }
        packets
    }

    fn replay_awaiting(&mut self, now: Instant) {
        loop {
            let Some(index) = self
                .awaiting
                .iter()
                .position(|p| self.crypto.is_key_available(p.level))
            else {
                return;
            };
            let packet = self.awaiting.remove(index);
            debug!("Replaying {} bytes of {:?} packets", packet.bytes.len(), packet.level);
            self.process_datagram(&packet.bytes, packet.remote, now);
        }
    }

    fn process_packet(&mut self, bytes: &[u8], now: Instant) -> Result<PacketOutcome> {
        if bytes[0] == 0 {
            return Ok(PacketOutcome::Padding);
        }

        let parsed = ProtectedPacket::parse(bytes, self.scid.len())?;
        let len = parsed.len();
        let Some(level) = parsed.level() else {
            if parsed.packet_type == QuicPacketType::Retry {
                self.handle_retry(&parsed)?;
            } else {
                debug!("Ignore {:?} packet", parsed.packet_type);
            }
            return Ok(PacketOutcome::Dropped(len));
        };

        if level == QuicLevel::ZeroRtt || self.crypto.is_discarded(level) {
            trace!("Drop {:?} packet, keys are not used", level);
            return Ok(PacketOutcome::Dropped(len));
        }
        if !self.crypto.is_key_available(level) {
            return Ok(PacketOutcome::AwaitingKeys(level));
        }

        let space_type = PnSpaceType::from(level);
        let key = self
            .crypto
            .opening_key(level)
            .ok_or_else(|| anyhow!("{:?} keys are installed without opening key", level))?;
        let packet = match parsed.unprotect(key, self.spaces.get(space_type).largest_received()) {
            Ok(packet) => packet,
            Err(e) => {
                // https://www.rfc-editor.org/rfc/rfc9000.html#section-12.2-5
                debug!("Drop {:?} packet failing authentication: {:#}", level, e);
                return Ok(PacketOutcome::Dropped(len));
            }
        };

        if self.state == QuicConnectionState::Closing {
            // https://www.rfc-editor.org/rfc/rfc9000.html#section-10.2.1-3
            self.send_close = true;
            return Ok(PacketOutcome::Decoded(len));
        }

        if let Err(code) = self.on_packet(level, packet, now) {
            self.close_with_transport_error(code, now);
        }
        Ok(PacketOutcome::Decoded(len))
    }

    // https://www.rfc-editor.org/rfc/rfc9000.html#section-17.2.5.2
    fn handle_retry(&mut self, parsed: &ProtectedPacket<'_>) -> Result<()> {
        if self.role != Role::Client || self.retry_scid.is_some() || self.dcid_adopted {
            debug!("Ignore unexpected Retry packet");
            return Ok(());
        }
        if !parsed.validate_retry(&self.original_dcid)? {
            warn!("Retry integrity tag mismatch, ignore it");
            return Ok(());
        }

        info!("Retry from server with scid {}, token of {} bytes", parsed.scid, parsed.token.len());
        self.dcid = parsed.scid.clone();
        self.retry_scid = Some(parsed.scid.clone());
        self.token = parsed.token.clone();
        self.crypto.compute_initial_keys(self.dcid.as_bytes())?;
        self.spaces.get_mut(PnSpaceType::Initial).requeue_in_flight();
        Ok(())
    }

    fn on_packet(
        &mut self,
        level: QuicLevel,
        packet: QuicPacket,
        now: Instant,
    ) -> Result<(), TransportErrorCode> {
        let span = span!(
            Level::TRACE,
            "on_packet",
            level = ?level,
            pn = packet.pn.value(),
            frames = tracing::field::Empty
        );
        let _enter = span.enter();

        let frames = QuicFrame::decode_frames(&packet.payload).map_err(|e| {
            warn!("Malformed frames in {:?} packet {:?}: {:#}", level, packet.pn, e);
            TransportErrorCode::FrameEncodingError
        })?;
        span.record("frames", frames.len());

        let space_type = PnSpaceType::from(level);
        let ack_eliciting = frames.iter().any(|f| f.is_ack_eliciting());
        if !self.spaces
            .get_mut(space_type)
            .on_packet_received(packet.pn, ack_eliciting, now)
        {
            debug!("Duplicate {:?} packet {:?}", level, packet.pn);
            return Ok(());
        }
        self.last_activity = now;

        if level == QuicLevel::Initial && !self.dcid_adopted {
            info!("Adopting server scid {} as dcid", packet.scid);
            self.dcid = packet.scid.clone();
            self.dcid_adopted = true;
        }
        // https://www.rfc-editor.org/rfc/rfc9000.html#section-8.1-2
        if level == QuicLevel::Handshake && self.role == Role::Server && !self.address_validated {
            info!("Client address {} validated", self.remote);
            self.address_validated = true;
        }

        for frame in frames {
            if self.is_closing() {
                break;
            }
            self.handle_frame(level, frame, now)?;
        }
        Ok(())
    }

    fn handle_frame(
        &mut self,
        level: QuicLevel,
        frame: QuicFrame,
        now: Instant,
    ) -> Result<(), TransportErrorCode> {
        trace!("Handling {} frame at {:?}", frame.name(), level);

        // https://www.rfc-editor.org/rfc/rfc9000.html#section-12.4
        let allowed_in_handshake = matches!(
            frame,
            QuicFrame::Padding(_)
                | QuicFrame::Ping
                | QuicFrame::Ack(_)
                | QuicFrame::Crypto(_)
                | QuicFrame::ConnectionClose(_)
        );
        if level != QuicLevel::Application && !allowed_in_handshake {
            warn!("{} frame is not allowed at {:?}", frame.name(), level);
            return Err(TransportErrorCode::ProtocolViolation);
        }

        let space_type = PnSpaceType::from(level);
        match frame {
            QuicFrame::Padding(_) | QuicFrame::Ping => {}
            QuicFrame::Ack(ack) => {
                let confirmed = self.handshake.is_confirmed();
                let exponent = self.peer_ack_delay_exponent;
                let outcome = self
                    .spaces
                    .get_mut(space_type)
                    .on_ack_received(&ack, exponent, &mut self.rtt, confirmed, now)
                    .map_err(|e| {
                        warn!("Invalid ACK frame: {:#}", e);
                        TransportErrorCode::ProtocolViolation
                    })?;
                if !outcome.newly_acked.is_empty() {
                    if space_type == PnSpaceType::Handshake {
                        self.handshake.advance(HandshakeState::AckReceived);
                        self.handshake_ack_received = true;
                        self.address_validated = true;
                    }
                    let ctx = self.recovery_context();
                    self.loss_detection.on_ack_received(&ctx);
                }
            }
            QuicFrame::Crypto(crypto) => {
                let messages = self.spaces.get_mut(space_type).crypto_rx.push(crypto);
                if !messages.is_empty() {
                    let outputs = self.handshake.on_messages(level, messages)?;
                    self.apply_handshake_outputs(outputs)?;
                }
            }
            QuicFrame::Stream(stream) => {
                if let Some(message) = self.stream_rx.push(stream) {
                    debug!(
                        "Received message of {} bytes on stream {}",
                        message.data.len(),
                        message.stream_id
                    );
                    self.received.push_back(message);
                }
            }
            QuicFrame::ConnectionClose(close) => {
                info!("Peer closed with reason {:?}", close.reason);
                self.enter_draining(close.error_code, now);
            }
            QuicFrame::ResetStream(reset) => {
                info!("Peer reset stream {}, tearing down", reset.stream_id);
                let code = reset.application_error_code;
                self.close(
                    QuicConnectionErrorCode::create_application_error_code(code),
                    "stream reset",
                    now,
                );
            }
            QuicFrame::HandshakeDone => {
                if self.role == Role::Server {
                    return Err(TransportErrorCode::ProtocolViolation);
                }
                self.on_handshake_confirmed();
            }
            QuicFrame::PathChallenge(data) => {
                self.spaces
                    .get_mut(PnSpaceType::ApplicationData)
                    .add_send_frame(QuicFrame::PathResponse(data));
            }
            QuicFrame::NewConnectionId(new_cid) => {
                trace!(
                    "Peer offers connection id {} with sequence {}",
                    new_cid.connection_id,
                    new_cid.sequence_number
                );
            }
            QuicFrame::Unknown { frame_type, payload } => {
                warn!("Skip unknown frame {:#x} with {} bytes", frame_type, payload.len());
            }
            other => trace!("Nothing to do for {} frame", other.name()),
        }
        Ok(())
    }

    fn apply_handshake_outputs(
        &mut self,
        outputs: Vec<HandshakeOutput>,
    ) -> Result<(), TransportErrorCode> {
        for output in outputs {
            match output {
                HandshakeOutput::Data(level, data) => {
                    let space = self.spaces.get_mut(PnSpaceType::from(level));
                    let frames = space.crypto_tx.to_frames(&data);
                    space.add_send_frames(frames);
                }
                HandshakeOutput::ZeroRttKeys(secret) => {
                    // Early data is never sent, the keys only mirror the TLS schedule
                    debug!("Installing 0-RTT keys");
                    self.crypto.install_zero_rtt_keys(&secret).map_err(internal_error)?;
                }
                HandshakeOutput::HandshakeKeys(secrets) => {
                    self.crypto
                        .install_keys(QuicLevel::Handshake, &secrets.client, &secrets.server)
                        .map_err(internal_error)?;
                    self.spaces.get_mut(PnSpaceType::Handshake).set_keys_available();
                }
                HandshakeOutput::OneRttKeys(secrets) => {
                    self.crypto
                        .install_keys(QuicLevel::Application, &secrets.client, &secrets.server)
                        .map_err(internal_error)?;
                    self.spaces
                        .get_mut(PnSpaceType::ApplicationData)
                        .set_keys_available();
                    if self.state == QuicConnectionState::Connecting {
                        self.state = QuicConnectionState::Established;
                    }
                }
            }
        }

        if !self.peer_params_applied && self.handshake.peer_transport_parameters().is_some() {
            self.apply_peer_transport_parameters()?;
        }
        if !self.handshake_completed && self.handshake.is_tls_complete() {
            self.on_handshake_complete();
        }
        Ok(())
    }

    fn apply_peer_transport_parameters(&mut self) -> Result<(), TransportErrorCode> {
        let Some(params) = self.handshake.peer_transport_parameters() else {
            return Ok(());
        };

        // https://www.rfc-editor.org/rfc/rfc9000.html#section-7.3
        let authenticated = match self.role {
            Role::Client => {
                params.original_destination_connection_id.as_ref() == Some(&self.original_dcid)
                    && params.initial_source_connection_id.as_ref() == Some(&self.dcid)
                    && params.retry_source_connection_id == self.retry_scid
            }
            Role::Server => {
                params.initial_source_connection_id.as_ref() == Some(&self.dcid)
                    && params.original_destination_connection_id.is_none()
            }
        };
        if !authenticated {
            warn!("Connection ids in peer transport parameters do not match {:?}", params);
            return Err(TransportErrorCode::TransportParameterError);
        }

        self.peer_ack_delay_exponent = params.get_ack_delay_exponent();
        self.rtt.set_max_ack_delay(params.get_max_ack_delay());

        // https://www.rfc-editor.org/rfc/rfc9000.html#section-10.1-2
        let local = self.config.get_idle_timeout();
        let peer = params.get_max_idle_timeout();
        self.idle_timeout = match (local, peer) {
            (0, 0) => None,
            (0, t) | (t, 0) => Some(Duration::from_millis(t)),
            (a, b) => Some(Duration::from_millis(a.min(b))),
        };
        debug!("Idle timeout is {:?}", self.idle_timeout);
        self.peer_params_applied = true;
        Ok(())
    }

    fn on_handshake_complete(&mut self) {
        self.handshake_completed = true;
        info!("{:?} TLS handshake complete", self.role);
        if self.role != Role::Server {
            return;
        }

        // https://www.rfc-editor.org/rfc/rfc9001.html#section-4.1.2
        let new_cid = ConnectionId::random();
        let mut reset_token = [0u8; QUIC_STATELESS_RESET_TOKEN_LENGTH];
        rand::thread_rng().fill_bytes(&mut reset_token);
        let space = self.spaces.get_mut(PnSpaceType::ApplicationData);
        space.add_send_frame(QuicFrame::HandshakeDone);
        space.add_send_frame(QuicFrame::create_new_connection_id_frame(
            1,
            new_cid.clone(),
            reset_token,
        ));
        self.issued_cids.push(new_cid);

        self.on_handshake_confirmed();
    }

    fn on_handshake_confirmed(&mut self) {
        if self.handshake.is_confirmed() {
            return;
        }
        self.handshake.advance(HandshakeState::Confirmed);
        self.address_validated = true;
        self.discard_level(QuicLevel::Initial);
        // https://www.rfc-editor.org/rfc/rfc9001.html#section-4.9.2
        if self.config.get_discard_handshake_keys_on_confirm() {
            self.discard_level(QuicLevel::Handshake);
        }
    }

    fn discard_level(&mut self, level: QuicLevel) {
        self.crypto.discard(level);
        self.spaces.get_mut(PnSpaceType::from(level)).discard();
        self.awaiting.retain(|p| p.level != level);
    }

    fn can_send(&self, space_type: PnSpaceType) -> bool {
        let space = self.spaces.get(space_type);
        if !space.has_pending_send() || !self.crypto.is_key_available(space_type.level()) {
            return false;
        }
        // The client sends 1-RTT packets only once the handshake is confirmed
        !(space_type == PnSpaceType::ApplicationData
            && self.role == Role::Client
            && !self.handshake.is_confirmed())
    }

    /// Builds the next datagram, coalescing one packet per level.
    pub fn poll_transmit(&mut self, now: Instant) -> Result<Option<(Vec<u8>, SocketAddr)>> {
        match self.state {
            QuicConnectionState::Closed | QuicConnectionState::Draining => return Ok(None),
            QuicConnectionState::Closing => return self.poll_close_transmit(),
            _ => {}
        }

        let span = span!(
            Level::TRACE,
            "poll_transmit",
            scid = %self.scid,
            role = ?self.role,
            datagram_length = tracing::field::Empty
        );
        let _enter = span.enter();

        let mut datagram = vec![];
        let mut last_packet: Option<(usize, QuicPacket)> = None;
        let mut has_initial = false;
        let mut ack_eliciting = false;

        for space_type in PnSpaceType::ALL {
            if !self.can_send(space_type) {
                continue;
            }
            let level = space_type.level();
            let packet_type = QuicPacketType::from_level(level);
            let overhead = QuicPacket::max_overhead(
                packet_type,
                self.dcid.len(),
                self.scid.len(),
                self.token.len(),
            );
            let remaining = self.max_datagram_size.saturating_sub(datagram.len());
            if remaining < overhead + QUIC_MIN_PACKET_PAYLOAD {
                break;
            }

            let frames = self
                .spaces
                .get_mut(space_type)
                .build_payload(remaining - overhead, now)?;
            if frames.is_empty() {
                continue;
            }
            ack_eliciting |= frames.iter().any(|f| f.is_ack_eliciting());

            let space = self.spaces.get_mut(space_type);
            let pn = space.next_packet_number();
            let mut packet = QuicPacket::new(
                level,
                self.dcid.clone(),
                self.scid.clone(),
                pn,
                QuicFrame::encode_frames(&frames)?,
            );
            if level == QuicLevel::Initial {
                packet = packet.with_token(self.token.clone());
                has_initial = true;
            }
            let key = self
                .crypto
                .sealing_key(level)
                .ok_or_else(|| anyhow!("No sealing key for {:?}", level))?;
            let encoded = packet
                .encode(key, space.largest_acked())
                .with_context(|| format!("Failed to encode {:?} packet {:?}", level, pn))?;
            trace!(
                "Packed {:?} packet {:?} with {} frames, {} bytes",
                level,
                pn,
                frames.len(),
                encoded.len()
            );
            space.on_packet_sent(pn, frames, now);

            last_packet = Some((datagram.len(), packet));
            datagram.extend_from_slice(&encoded);

            // https://www.rfc-editor.org/rfc/rfc9001.html#section-4.9.1
            if self.role == Role::Client && level == QuicLevel::Handshake {
                self.discard_level(QuicLevel::Initial);
            }
        }

        if datagram.is_empty() {
            return Ok(None);
        }

        // https://www.rfc-editor.org/rfc/rfc9000.html#section-14.1
        if has_initial && (self.role == Role::Client || ack_eliciting) {
            if let Some((start, packet)) = last_packet {
                self.pad_last_packet(&mut datagram, start, packet)?;
            }
        }

        if ack_eliciting {
            self.last_activity = now;
        }
        self.set_loss_timer(now);
        span.record("datagram_length", datagram.len());
        Ok(Some((datagram, self.remote)))
    }

    // The Initial keys may be gone by now if the last packet is a client
    // Handshake packet, so only the last packet's own level is used
    fn pad_last_packet(
        &self,
        datagram: &mut Vec<u8>,
        start: usize,
        mut packet: QuicPacket,
    ) -> Result<()> {
        let target = self.max_datagram_size;
        let level = packet
            .packet_type
            .level()
            .ok_or_else(|| anyhow!("Cannot pad {:?} packet", packet.packet_type))?;
        let key = self
            .crypto
            .sealing_key(level)
            .ok_or_else(|| anyhow!("No sealing key to pad {:?} packet", level))?;
        let largest_acked = self.spaces.get(PnSpaceType::from(level)).largest_acked();

        // The length field may widen once the payload grows, so settle the
        // size in a few passes
        let original = packet.payload.len();
        for _ in 0..3 {
            if datagram.len() == target {
                break;
            }
            let Some(payload_len) = (packet.payload.len() + target)
                .checked_sub(datagram.len())
                .filter(|len| *len >= original)
            else {
                break;
            };
            packet.payload.resize(payload_len, 0);
            let encoded = packet.encode(key, largest_acked)?;
            datagram.truncate(start);
            datagram.extend_from_slice(&encoded);
        }
        trace!("Padded datagram to {} bytes", datagram.len());
        Ok(())
    }

    fn poll_close_transmit(&mut self) -> Result<Option<(Vec<u8>, SocketAddr)>> {
        if !self.send_close {
            return Ok(None);
        }
        self.send_close = false;
        let Some(close_frame) = self.close_frame.clone() else {
            return Ok(None);
        };

        let mut datagram = vec![];
        for space_type in PnSpaceType::ALL {
            let level = space_type.level();
            if !self.crypto.is_key_available(level) {
                continue;
            }

            // https://www.rfc-editor.org/rfc/rfc9000.html#section-10.2.3-3
            let frame = match &close_frame {
                QuicFrame::ConnectionClose(close)
                    if close.error_code.is_application() && level != QuicLevel::Application =>
                {
                    let code = TransportErrorCode::ApplicationError;
                    QuicFrame::create_connection_close_frame(code.into(), "")
                }
                _ => close_frame.clone(),
            };

            let space = self.spaces.get_mut(space_type);
            let pn = space.next_packet_number();
            let packet = QuicPacket::new(
                level,
                self.dcid.clone(),
                self.scid.clone(),
                pn,
                QuicFrame::encode_frames(&[frame])?,
            );
            let key = self
                .crypto
                .sealing_key(level)
                .ok_or_else(|| anyhow!("No sealing key for {:?}", level))?;
            datagram.extend_from_slice(&packet.encode(key, space.largest_acked())?);
            debug!("Sent CONNECTION_CLOSE in {:?} packet {:?}", level, pn);
        }

        if datagram.is_empty() {
            return Ok(None);
        }
        Ok(Some((datagram, self.remote)))
    }

    #[cfg(test)]
    pub(crate) fn application_secrets(&self) -> Option<crate::tls::TrafficSecrets> {
        self.handshake.application_secrets()
    }

    #[cfg(test)]
    pub(crate) fn pto_count(&self) -> u32 {
        self.loss_detection.pto_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::SelfSignedIssuer;

    fn init_tracing() {
        let env_filter = tracing_subscriber::EnvFilter::from_default_env();
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_test_writer()
            .try_init();
    }

    fn client_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    fn server_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 443))
    }

    fn client_config() -> QuicConfig {
        let mut config = QuicConfig::default();
        config.set_server_name("upstream.test");
        config
    }

    // Accepts the server side for the first client datagram
    fn accept_for(datagram: &[u8], now: Instant) -> Result<QuicConnection> {
        let parsed = ProtectedPacket::parse(datagram, 0)?;
        QuicConnection::accept(
            QuicConfig::default(),
            Arc::new(SelfSignedIssuer::default()),
            client_addr(),
            parsed.dcid.clone(),
            parsed.scid.clone(),
            now,
        )
    }

    // Moves every pending datagram between the two sides until both are quiet
    fn pump(client: &mut QuicConnection, server: &mut QuicConnection, now: Instant) -> Result<()> {
        for _ in 0..16 {
            let mut moved = false;
            while let Some((datagram, _)) = client.poll_transmit(now)? {
                server.provide_datagram(&datagram, client_addr(), now);
                moved = true;
            }
            while let Some((datagram, _)) = server.poll_transmit(now)? {
                client.provide_datagram(&datagram, server_addr(), now);
                moved = true;
            }
            if !moved {
                return Ok(());
            }
        }
        Err(anyhow!("connections did not settle"))
    }

    fn connected_pair(now: Instant) -> Result<(QuicConnection, QuicConnection)> {
        let mut client = QuicConnection::connect(client_config(), server_addr(), now)?;
        let (first, _) = client
            .poll_transmit(now)?
            .ok_or_else(|| anyhow!("client sent nothing"))?;
        assert_eq!(first.len(), 1200);

        let mut server = accept_for(&first, now)?;
        server.provide_datagram(&first, client_addr(), now);
        pump(&mut client, &mut server, now)?;
        Ok((client, server))
    }

    #[test]
    fn test_handshake_reaches_confirmed() -> Result<()> {
        init_tracing();
        let now = Instant::now();
        let (client, server) = connected_pair(now)?;

        assert_eq!(client.handshake_state(), HandshakeState::Confirmed);
        assert_eq!(server.handshake_state(), HandshakeState::Confirmed);
        assert!(client.is_established() && server.is_established());
        assert!(client.is_address_validated() && server.is_address_validated());
        assert_eq!(server.server_name(), Some("upstream.test"));
        assert_eq!(client.connect_result(), Some(QuicConnectResult::Success));
        assert!(client.application_secrets().is_some());
        assert_eq!(client.application_secrets(), server.application_secrets());
        Ok(())
    }

    #[test]
    fn test_stream_messages_both_ways() -> Result<()> {
        let now = Instant::now();
        let (mut client, mut server) = connected_pair(now)?;

        let request = vec![0x5a; 3000];
        client.send(0, request.clone())?;
        pump(&mut client, &mut server, now)?;
        assert_eq!(server.recv_message(), Some(QuicMessage::new(0, request)));
        assert_eq!(server.recv_message(), None);

        server.send(0, b"response".to_vec())?;
        server.send(3, b"control".to_vec())?;
        pump(&mut client, &mut server, now)?;
        let mut received = vec![];
        while let Some(message) = client.recv_message() {
            received.push(message);
        }
        assert_eq!(
            received,
            vec![
                QuicMessage::new(0, b"response".to_vec()),
                QuicMessage::new(3, b"control".to_vec())
            ]
        );

        // Stream 3 is the server's unidirectional stream
        assert!(matches!(
            client.send(3, vec![1]),
            Err(QuicConnectionError::InvalidStream(3))
        ));
        Ok(())
    }

    #[test]
    fn test_lost_datagram_is_recovered() -> Result<()> {
        init_tracing();
        let now = Instant::now();
        let (mut client, mut server) = connected_pair(now)?;

        client.send(0, b"first try".to_vec())?;
        let mut lost = 0;
        while client.poll_transmit(now)?.is_some() {
            lost += 1;
        }
        assert!(lost > 0);

        let deadline = client.next_timeout().ok_or_else(|| anyhow!("no timer armed"))?;
        client.handle_timeout(deadline);
        assert_eq!(client.pto_count(), 1);

        // The probe gets acknowledged and the gap is declared lost
        let mut at = deadline;
        for _ in 0..4 {
            pump(&mut client, &mut server, at)?;
            if let Some(message) = server.recv_message() {
                assert_eq!(message, QuicMessage::new(0, b"first try".to_vec()));
                return Ok(());
            }
            at = client.next_timeout().ok_or_else(|| anyhow!("no timer armed"))?;
            client.handle_timeout(at);
        }
        Err(anyhow!("message was not recovered by {:?}", at - now))
    }

    #[test]
    fn test_packets_awaiting_keys_are_bounded() -> Result<()> {
        let now = Instant::now();
        let mut client = QuicConnection::connect(client_config(), server_addr(), now)?;
        client.poll_transmit(now)?;

        // 1-RTT packets before any 1-RTT keys exist
        let mut early = vec![0x40];
        early.extend_from_slice(client.scid().as_bytes());
        early.extend_from_slice(&[0xcd; 40]);
        for _ in 0..QUIC_MAX_AWAITING_PACKETS * 3 {
            client.provide_datagram(&early, server_addr(), now);
        }

        assert_eq!(client.awaiting.len(), QUIC_MAX_AWAITING_PACKETS);
        assert!(client
            .awaiting
            .iter()
            .all(|p| p.level == QuicLevel::Application));
        Ok(())
    }

    #[test]
    fn test_close_drains_peer() -> Result<()> {
        let now = Instant::now();
        let (mut client, mut server) = connected_pair(now)?;

        client.close(QuicConnectionErrorCode::create_application_error_code(0x100), "bye", now);
        assert_eq!(client.state(), QuicConnectionState::Closing);
        assert!(matches!(
            client.send(0, vec![]),
            Err(QuicConnectionError::ConnectionLost(QuicConnectionState::Closing))
        ));
        pump(&mut client, &mut server, now)?;
        assert_eq!(server.state(), QuicConnectionState::Draining);
        assert_eq!(
            server.error(),
            Some(QuicConnectionErrorCode::create_application_error_code(0x100))
        );

        let deadline = server.next_timeout().ok_or_else(|| anyhow!("no close timer"))?;
        server.handle_timeout(deadline);
        assert!(server.is_closed());
        Ok(())
    }

    #[test]
    fn test_idle_timeout_closes_silently() -> Result<()> {
        let now = Instant::now();
        let mut config = client_config();
        config.set_idle_timeout(1000);
        let mut client = QuicConnection::connect(config, server_addr(), now)?;
        client.poll_transmit(now)?;

        assert_eq!(client.connect_result(), None);
        client.handle_timeout(now + Duration::from_millis(1000));
        assert!(client.is_closed());
        assert_eq!(client.connect_result(), Some(QuicConnectResult::Timeout(1000)));
        assert_eq!(client.poll_transmit(now)?, None);
        Ok(())
    }

    #[test]
    fn test_garbage_does_not_break_the_connection() -> Result<()> {
        let now = Instant::now();
        let (mut client, mut server) = connected_pair(now)?;

        // Short header for an unknown key, then padding
        let mut garbage = vec![0x40];
        garbage.extend_from_slice(client.scid().as_bytes());
        garbage.extend_from_slice(&[0xab; 40]);
        client.provide_datagram(&garbage, server_addr(), now);
        client.provide_datagram(&[0x00; 20], server_addr(), now);
        assert_eq!(client.state(), QuicConnectionState::Established);

        server.send(0, b"still fine".to_vec())?;
        pump(&mut client, &mut server, now)?;
        assert_eq!(client.recv_message(), Some(QuicMessage::new(0, b"still fine".to_vec())));
        Ok(())
    }
}
