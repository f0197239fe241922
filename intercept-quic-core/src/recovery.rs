use std::time::Instant;
use tracing::{debug, info, trace};

use crate::frame::QuicFrame;
use crate::handshake::HandshakeState;
use crate::rtt::RttEstimator;
use crate::space::{PnSpaceType, PnSpaces};
use crate::timer::LossTimer;
use crate::utils::format_instant;

/// Connection facts loss detection depends on.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecoveryContext {
    pub(crate) handshake_state: HandshakeState,
    // https://www.rfc-editor.org/rfc/rfc9002.html#section-6.2.2.1
    pub(crate) peer_completed_address_validation: bool,
    // One of our Handshake packets was acknowledged. Kept apart from the
    // handshake state since a server holds 1-RTT keys before that happens.
    pub(crate) handshake_ack_received: bool,
    pub(crate) suppress_initial_pto: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LossTimeout {
    // Time threshold loss in this space
    LossTime(PnSpaceType),
    // Nothing in flight but the peer may be blocked by the amplification limit
    AntiDeadlock(PnSpaceType),
    // Probe in this space; None when the handshake state holds it back
    Probe(Option<PnSpaceType>),
}

/// The single rearmable loss/PTO timer of a connection.
// https://www.rfc-editor.org/rfc/rfc9002.html#section-a.8
#[derive(Debug, Default)]
pub(crate) struct LossDetection {
    timer: LossTimer,
    pto_count: u32,
}

impl LossDetection {
    pub(crate) fn pto_count(&self) -> u32 {
        self.pto_count
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    pub(crate) fn cancel(&mut self) {
        self.timer.cancel();
    }

    /// Called when an ACK newly acknowledged something.
    pub(crate) fn on_ack_received(&mut self, ctx: &RecoveryContext) {
        if ctx.peer_completed_address_validation {
            self.pto_count = 0;
        }
    }

    fn earliest_keyed_space(spaces: &PnSpaces, ctx: &RecoveryContext) -> PnSpaceType {
        if ctx.handshake_state >= HandshakeState::HasHandshakeKeys
            && spaces.get(PnSpaceType::Handshake).has_keys()
        {
            PnSpaceType::Handshake
        } else {
            PnSpaceType::Initial
        }
    }

    /// Whether a PTO in `space_type` may send a probe.
    fn probe_allowed(space_type: PnSpaceType, ctx: &RecoveryContext) -> bool {
        match space_type {
            PnSpaceType::ApplicationData => ctx.handshake_state == HandshakeState::Confirmed,
            _ if ctx.handshake_state == HandshakeState::Confirmed => false,
            PnSpaceType::Handshake => ctx.handshake_state >= HandshakeState::HasHandshakeKeys,
            PnSpaceType::Initial => !ctx.handshake_ack_received && !ctx.suppress_initial_pto,
        }
    }

    fn earliest_pto(
        &self,
        spaces: &PnSpaces,
        rtt: &RttEstimator,
        ctx: &RecoveryContext,
        allowed: impl Fn(PnSpaceType) -> bool,
    ) -> Option<(Instant, PnSpaceType)> {
        let mut pto: Option<(Instant, PnSpaceType)> = None;
        for space in spaces.iter() {
            if !space.has_ack_eliciting_in_flight() || !allowed(space.space_type()) {
                continue;
            }
            let mut duration = rtt.pto_duration(self.pto_count);
            if space.space_type() == PnSpaceType::ApplicationData {
                // Skip application data until the handshake is confirmed
                if ctx.handshake_state != HandshakeState::Confirmed {
                    continue;
                }
                duration += rtt.max_ack_delay() * 2u32.saturating_pow(self.pto_count);
            }
            let Some(last) = space.time_of_last_ack_eliciting() else {
                continue;
            };
            let t = last + duration;
            if pto.map_or(true, |(current, _)| t < current) {
                pto = Some((t, space.space_type()));
            }
        }
        pto
    }

    pub(crate) fn pto_time_and_space(
        &self,
        spaces: &PnSpaces,
        rtt: &RttEstimator,
        ctx: &RecoveryContext,
        now: Instant,
    ) -> Option<(Instant, PnSpaceType)> {
        if !ctx.peer_completed_address_validation {
            // Anti-deadlock PTO starts from the current time
            let duration = rtt.pto_duration(self.pto_count);
            return Some((now + duration, Self::earliest_keyed_space(spaces, ctx)));
        }
        if !spaces.has_ack_eliciting_in_flight() {
            return None;
        }
        self.earliest_pto(spaces, rtt, ctx, |_| true)
    }

    pub(crate) fn set_timer(
        &mut self,
        spaces: &PnSpaces,
        rtt: &RttEstimator,
        ctx: &RecoveryContext,
        now: Instant,
    ) {
        if let Some((loss_time, space)) = spaces.earliest_loss_time() {
            trace!("Arming time threshold loss for {:?} space", space);
            self.timer.update(loss_time, now);
            return;
        }

        if !spaces.has_ack_eliciting_in_flight() && ctx.peer_completed_address_validation {
            self.timer.cancel();
            return;
        }

        match self.pto_time_and_space(spaces, rtt, ctx, now) {
            Some((pto, space)) => {
                trace!(
                    "Arming PTO for {:?} space at {}, pto count {}",
                    space,
                    format_instant(pto, now),
                    self.pto_count
                );
                self.timer.update(pto, now);
            }
            None => self.timer.cancel(),
        }
    }

    /// Runs the timer if it fired. Lost frames and probes are queued in
    /// their spaces, the caller only has to flush.
    pub(crate) fn on_timeout(
        &mut self,
        spaces: &mut PnSpaces,
        rtt: &RttEstimator,
        ctx: &RecoveryContext,
        now: Instant,
    ) -> Option<LossTimeout> {
        if !self.timer.take_expired(now) {
            return None;
        }

        if let Some((_, space_type)) = spaces.earliest_loss_time() {
            let lost = spaces
                .get_mut(space_type)
                .detect_and_remove_lost_packets(rtt.loss_delay(), now);
            debug!("Loss timer fired in {:?} space, lost {:?}", space_type, lost);
            self.set_timer(spaces, rtt, ctx, now);
            return Some(LossTimeout::LossTime(space_type));
        }

        let anti_deadlock =
            !spaces.has_ack_eliciting_in_flight() || !ctx.peer_completed_address_validation;
        let outcome = if anti_deadlock {
            let space_type = Self::earliest_keyed_space(spaces, ctx);
            info!("Anti-deadlock probe in {:?} space", space_type);
            spaces.get_mut(space_type).add_send_frame(QuicFrame::Ping);
            LossTimeout::AntiDeadlock(space_type)
        } else {
            let allowed = self
                .earliest_pto(spaces, rtt, ctx, |space_type| Self::probe_allowed(space_type, ctx))
                .map(|(_, space)| space);
            match allowed {
                Some(space_type) => {
                    info!(
                        "Probe timeout in {:?} space, pto count {}",
                        space_type,
                        self.pto_count + 1
                    );
                    spaces.get_mut(space_type).add_send_frame(QuicFrame::Ping);
                }
                None => debug!(
                    "Probe timeout held back in handshake state {:?}, handshake ack received {}",
                    ctx.handshake_state, ctx.handshake_ack_received
                ),
            }
            LossTimeout::Probe(allowed)
        };

        self.pto_count += 1;
        self.set_timer(spaces, rtt, ctx, now);
        Some(outcome)
    }
}
