use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{info, span, trace, Level};

use crate::ack::AckFrameGenerator;
use crate::connection::QuicLevel;
use crate::frame::{AckFrame, QuicFrame};
use crate::pn::PacketNumber;
use crate::reassembly::{CryptoFramesToMessages, MessagesToCryptoFrames};
use crate::rtt::RttEstimator;
use crate::utils::format_instant;

// https://www.rfc-editor.org/rfc/rfc9002.html#section-6.1.1
const QUIC_PACKET_THRESHOLD: u64 = 3;

// Smallest room worth starting another frame in
const QUIC_MIN_FRAME_ROOM: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum PnSpaceType {
    Initial,
    Handshake,
    ApplicationData,
}

impl PnSpaceType {
    pub(crate) const ALL: [PnSpaceType; 3] = [
        PnSpaceType::Initial,
        PnSpaceType::Handshake,
        PnSpaceType::ApplicationData,
    ];

    pub(crate) fn level(&self) -> QuicLevel {
        match self {
            PnSpaceType::Initial => QuicLevel::Initial,
            PnSpaceType::Handshake => QuicLevel::Handshake,
            PnSpaceType::ApplicationData => QuicLevel::Application,
        }
    }

    fn index(&self) -> usize {
        match self {
            PnSpaceType::Initial => 0,
            PnSpaceType::Handshake => 1,
            PnSpaceType::ApplicationData => 2,
        }
    }
}

// 0-RTT and 1-RTT packets share the application data space
impl From<QuicLevel> for PnSpaceType {
    fn from(level: QuicLevel) -> Self {
        match level {
            QuicLevel::Initial => PnSpaceType::Initial,
            QuicLevel::Handshake => PnSpaceType::Handshake,
            QuicLevel::ZeroRtt | QuicLevel::Application => PnSpaceType::ApplicationData,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SentPacket {
    pub(crate) pn: u64,
    pub(crate) time_sent: Instant,
    pub(crate) ack_eliciting: bool,
    pub(crate) frames: Vec<QuicFrame>,
}

impl SentPacket {
    pub(crate) fn new(pn: u64, time_sent: Instant, frames: Vec<QuicFrame>) -> Self {
        Self {
            pn,
            time_sent,
            ack_eliciting: frames.iter().any(|f| f.is_ack_eliciting()),
            frames,
        }
    }

    // Largest acknowledged value of the ACK frame this packet carried
    fn carried_ack(&self) -> Option<u64> {
        self.frames.iter().find_map(|frame| match frame {
            QuicFrame::Ack(ack) => Some(ack.largest_acknowledged),
            _ => None,
        })
    }
}

/// Packets sent and neither acknowledged nor declared lost, by number.
#[derive(Debug, Default)]
pub(crate) struct SentPackets(BTreeMap<u64, SentPacket>);

impl SentPackets {
    pub(crate) fn add(&mut self, packet: SentPacket) {
        self.0.insert(packet.pn, packet);
    }

    pub(crate) fn has_ack_eliciting(&self) -> bool {
        self.0.values().any(|p| p.ack_eliciting)
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.0.clear();
    }

    /// Removes and returns the packets an ACK frame covers, in ascending order.
    pub(crate) fn remove_acked(&mut self, ack: &AckFrame) -> Result<Vec<SentPacket>> {
        let mut acked = vec![];
        for (smallest, largest) in ack.acked_ranges()? {
            let pns: Vec<u64> = self.0.range(smallest..=largest).map(|(pn, _)| *pn).collect();
            acked.extend(pns.into_iter().filter_map(|pn| self.0.remove(&pn)));
        }
        acked.sort_by_key(|p| p.pn);
        Ok(acked)
    }

    fn unacked_up_to(&self, largest_acked: u64) -> impl Iterator<Item = &SentPacket> {
        self.0.range(..=largest_acked).map(|(_, p)| p)
    }

    fn remove(&mut self, pn: u64) -> Option<SentPacket> {
        self.0.remove(&pn)
    }
}

/// What processing one ACK frame changed.
#[derive(Debug, Default)]
pub(crate) struct AckOutcome {
    pub(crate) newly_acked: Vec<u64>,
    pub(crate) lost: Vec<u64>,
    pub(crate) rtt_updated: bool,
}

/// Packet number space of one encryption level.
pub(crate) struct PnSpace {
    space_type: PnSpaceType,
    next_pn: u64,
    largest_acked: Option<u64>,
    largest_received: Option<PacketNumber>,

    sent: SentPackets,
    send_queue: VecDeque<QuicFrame>,
    ack_generator: AckFrameGenerator,
    ack_pending: bool,

    loss_time: Option<Instant>,
    time_of_last_ack_eliciting: Option<Instant>,

    pub(crate) crypto_rx: CryptoFramesToMessages,
    pub(crate) crypto_tx: MessagesToCryptoFrames,

    has_keys: bool,
    discarded: bool,
}

impl fmt::Debug for PnSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PnSpace")
            .field("space_type", &self.space_type)
            .field("next_pn", &self.next_pn)
            .field("largest_acked", &self.largest_acked)
            .field("sent", &self.sent.len())
            .field("queued", &self.send_queue.len())
            .field("discarded", &self.discarded)
            .finish()
    }
}

impl PnSpace {
    pub(crate) fn new(space_type: PnSpaceType, ack_delay_exponent: u8) -> Self {
        Self {
            space_type,
            next_pn: 0,
            largest_acked: None,
            largest_received: None,
            sent: SentPackets::default(),
            send_queue: VecDeque::new(),
            ack_generator: AckFrameGenerator::new(ack_delay_exponent),
            ack_pending: false,
            loss_time: None,
            time_of_last_ack_eliciting: None,
            crypto_rx: CryptoFramesToMessages::default(),
            crypto_tx: MessagesToCryptoFrames::default(),
            has_keys: false,
            discarded: false,
        }
    }

    pub(crate) fn space_type(&self) -> PnSpaceType {
        self.space_type
    }

    pub(crate) fn set_keys_available(&mut self) {
        if !self.discarded {
            self.has_keys = true;
        }
    }

    pub(crate) fn has_keys(&self) -> bool {
        self.has_keys
    }

    pub(crate) fn is_discarded(&self) -> bool {
        self.discarded
    }

    pub(crate) fn largest_acked(&self) -> Option<PacketNumber> {
        self.largest_acked.map(PacketNumber::new)
    }

    pub(crate) fn largest_received(&self) -> Option<PacketNumber> {
        self.largest_received
    }

    pub(crate) fn loss_time(&self) -> Option<Instant> {
        self.loss_time
    }

    pub(crate) fn time_of_last_ack_eliciting(&self) -> Option<Instant> {
        self.time_of_last_ack_eliciting
    }

    pub(crate) fn has_ack_eliciting_in_flight(&self) -> bool {
        self.sent.has_ack_eliciting()
    }

    pub(crate) fn has_pending_send(&self) -> bool {
        !self.discarded && (self.ack_pending || !self.send_queue.is_empty())
    }

    pub(crate) fn add_send_frame(&mut self, frame: QuicFrame) {
        if self.discarded {
            trace!("{:?} space is discarded, drop {} frame", self.space_type, frame.name());
            return;
        }
        self.send_queue.push_back(frame);
    }

    pub(crate) fn add_send_frames<I>(&mut self, frames: I)
    where
        I: IntoIterator<Item = QuicFrame>,
    {
        for frame in frames {
            self.add_send_frame(frame);
        }
    }

    /// Records a received packet for acknowledgement. Returns false when the
    /// packet number was seen before and the packet must be ignored.
    pub(crate) fn on_packet_received(
        &mut self,
        pn: PacketNumber,
        ack_eliciting: bool,
        now: Instant,
    ) -> bool {
        if !self.ack_generator.received(pn.value(), now) {
            return false;
        }
        if self.largest_received.map_or(true, |largest| pn > largest) {
            self.largest_received = Some(pn);
        }
        if ack_eliciting {
            self.ack_pending = true;
        }
        true
    }

    // https://www.rfc-editor.org/rfc/rfc9002.html#section-a.7
    pub(crate) fn on_ack_received(
        &mut self,
        ack: &AckFrame,
        ack_delay_exponent: u8,
        rtt: &mut RttEstimator,
        handshake_confirmed: bool,
        now: Instant,
    ) -> Result<AckOutcome> {
        let span = span!(
            Level::TRACE,
            "on_ack_received",
            space = ?self.space_type,
            largest = ack.largest_acknowledged,
            newly_acked = tracing::field::Empty
        );
        let _enter = span.enter();

        if ack.largest_acknowledged >= self.next_pn {
            return Err(anyhow!(
                "ACK of {} in {:?} space, but only {} packets were sent",
                ack.largest_acknowledged,
                self.space_type,
                self.next_pn
            ));
        }

        // Malformed ranges fail here, before anything is updated
        let newly_acked = self.sent.remove_acked(ack)?;
        self.largest_acked = Some(self.largest_acked.map_or(ack.largest_acknowledged, |largest| {
            largest.max(ack.largest_acknowledged)
        }));

        let mut outcome = AckOutcome {
            newly_acked: newly_acked.iter().map(|p| p.pn).collect(),
            ..Default::default()
        };
        span.record("newly_acked", newly_acked.len());
        if newly_acked.is_empty() {
            return Ok(outcome);
        }

        if let Some(largest) = newly_acked.last() {
            let any_ack_eliciting = newly_acked.iter().any(|p| p.ack_eliciting);
            if largest.pn == ack.largest_acknowledged && any_ack_eliciting {
                let latest_rtt = now.saturating_duration_since(largest.time_sent);
                let ack_delay = Duration::from_micros(ack.ack_delay << ack_delay_exponent);
                rtt.update(latest_rtt, ack_delay, handshake_confirmed);
                outcome.rtt_updated = true;
            }
        }

        // The peer has seen these ACK frames of ours
        if let Some(confirmed) = newly_acked.iter().filter_map(|p| p.carried_ack()).max() {
            self.ack_generator.confirmed_ack_frame(confirmed);
        }

        outcome.lost = self.detect_and_remove_lost_packets(rtt.loss_delay(), now);
        Ok(outcome)
    }

    /// Declares lost every packet sent at least `loss_delay` ago or
    /// `QUIC_PACKET_THRESHOLD` numbers below the largest acknowledged, and
    /// queues their frames again.
    // https://www.rfc-editor.org/rfc/rfc9002.html#section-a.10
    pub(crate) fn detect_and_remove_lost_packets(
        &mut self,
        loss_delay: Duration,
        now: Instant,
    ) -> Vec<u64> {
        self.loss_time = None;
        let Some(largest_acked) = self.largest_acked else {
            return vec![];
        };

        let mut lost = vec![];
        for packet in self.sent.unacked_up_to(largest_acked) {
            let elapsed = now.saturating_duration_since(packet.time_sent);
            if elapsed >= loss_delay || largest_acked >= packet.pn + QUIC_PACKET_THRESHOLD {
                lost.push(packet.pn);
            } else {
                let loss_time = packet.time_sent + loss_delay;
                if self.loss_time.map_or(true, |t| loss_time < t) {
                    self.loss_time = Some(loss_time);
                }
            }
        }

        for pn in &lost {
            if let Some(packet) = self.sent.remove(*pn) {
                info!(
                    "{:?} packet {} sent {} is lost",
                    self.space_type,
                    pn,
                    format_instant(packet.time_sent, now)
                );
                let frames: Vec<QuicFrame> = packet
                    .frames
                    .into_iter()
                    .filter(|f| f.is_retransmittable())
                    .collect();
                self.add_send_frames(frames);
            }
        }

        if let Some(loss_time) = self.loss_time {
            trace!(
                "{:?} space loss time is {}",
                self.space_type,
                format_instant(loss_time, now)
            );
        }
        lost
    }

    /// Pops queued frames for one packet whose payload may take `budget`
    /// bytes. A pending ACK always goes first.
    pub(crate) fn build_payload(&mut self, budget: usize, now: Instant) -> Result<Vec<QuicFrame>> {
        let mut frames = vec![];
        if self.discarded {
            return Ok(frames);
        }

        let mut remain = budget;
        if self.ack_pending {
            if let Some(ack) = self.ack_generator.generate_ack_frame(now) {
                if let (Some(frame), _) = QuicFrame::Ack(ack).split_to_fit(remain)? {
                    remain -= frame.encoded_len()?;
                    frames.push(frame);
                    self.ack_pending = false;
                }
            } else {
                self.ack_pending = false;
            }
        }

        while remain >= QUIC_MIN_FRAME_ROOM {
            let Some(frame) = self.send_queue.pop_front() else {
                break;
            };
            match frame.split_to_fit(remain)? {
                (Some(head), tail) => {
                    remain -= head.encoded_len()?;
                    frames.push(head);
                    if let Some(tail) = tail {
                        self.send_queue.push_front(tail);
                        break;
                    }
                }
                (None, Some(rest)) => {
                    self.send_queue.push_front(rest);
                    break;
                }
                (None, None) => {}
            }
        }
        Ok(frames)
    }

    /// Hands out the next packet number in send order.
    pub(crate) fn next_packet_number(&mut self) -> PacketNumber {
        let pn = PacketNumber::new(self.next_pn);
        self.next_pn += 1;
        pn
    }

    pub(crate) fn on_packet_sent(
        &mut self,
        pn: PacketNumber,
        frames: Vec<QuicFrame>,
        now: Instant,
    ) {
        let packet = SentPacket::new(pn.value(), now, frames);
        if packet.ack_eliciting {
            self.time_of_last_ack_eliciting = Some(now);
        }
        trace!(
            "{:?} packet {} sent, ack eliciting {}",
            self.space_type,
            packet.pn,
            packet.ack_eliciting
        );
        self.sent.add(packet);
    }

    /// Forgets every packet in flight and queues their frames again, used
    /// when a Retry invalidates what was sent.
    pub(crate) fn requeue_in_flight(&mut self) {
        let packets = std::mem::take(&mut self.sent);
        let frames: Vec<QuicFrame> = packets
            .0
            .into_values()
            .flat_map(|p| p.frames)
            .filter(|f| f.is_retransmittable())
            .collect();
        for frame in frames.into_iter().rev() {
            self.send_queue.push_front(frame);
        }
        self.time_of_last_ack_eliciting = None;
        self.loss_time = None;
    }

    // https://www.rfc-editor.org/rfc/rfc9001.html#section-4.9
    pub(crate) fn discard(&mut self) {
        if self.discarded {
            return;
        }
        info!("Discarding {:?} packet number space", self.space_type);
        self.sent.clear();
        self.send_queue.clear();
        self.ack_pending = false;
        self.loss_time = None;
        self.time_of_last_ack_eliciting = None;
        self.has_keys = false;
        self.discarded = true;
    }
}

/// The Initial, Handshake and application data spaces of a connection.
#[derive(Debug)]
pub(crate) struct PnSpaces {
    spaces: [PnSpace; 3],
}

impl PnSpaces {
    pub(crate) fn new(ack_delay_exponent: u8) -> Self {
        Self {
            spaces: PnSpaceType::ALL.map(|t| PnSpace::new(t, ack_delay_exponent)),
        }
    }

    pub(crate) fn get(&self, space_type: PnSpaceType) -> &PnSpace {
        &self.spaces[space_type.index()]
    }

    pub(crate) fn get_mut(&mut self, space_type: PnSpaceType) -> &mut PnSpace {
        &mut self.spaces[space_type.index()]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &PnSpace> {
        self.spaces.iter()
    }

    pub(crate) fn has_ack_eliciting_in_flight(&self) -> bool {
        self.spaces.iter().any(|s| s.has_ack_eliciting_in_flight())
    }

    pub(crate) fn has_pending_send(&self) -> bool {
        self.spaces.iter().any(|s| s.has_pending_send())
    }

    /// Earliest time-threshold loss deadline over all spaces.
    pub(crate) fn earliest_loss_time(&self) -> Option<(Instant, PnSpaceType)> {
        self.spaces
            .iter()
            .filter_map(|s| s.loss_time().map(|t| (t, s.space_type())))
            .min_by_key(|(t, _)| *t)
    }
}
