use std::time::Duration;
use tracing::{trace, warn};

// https://www.rfc-editor.org/rfc/rfc9002.html#section-6.2.2
const QUIC_INITIAL_RTT: Duration = Duration::from_millis(333);
pub(crate) const QUIC_DEFAULT_MAX_ACK_DELAY: Duration = Duration::from_millis(25);

// https://www.rfc-editor.org/rfc/rfc9002.html#section-6.1.2-6
const QUIC_KTIME_THRESHOLD_NUMERATOR: u32 = 9;
const QUIC_KTIME_THRESHOLD_DENOMINATOR: u32 = 8;
// https://www.rfc-editor.org/rfc/rfc9002.html#section-a.2-2.6.1
pub(crate) const QUIC_KGRANULARITY: Duration = Duration::from_millis(1);

// https://www.rfc-editor.org/rfc/rfc9002.html#section-5
#[derive(Debug)]
pub(crate) struct RttEstimator {
    latest_rtt: Duration,

    // The minimum value over a period of time (min_rtt)
    min_rtt: Option<Duration>,

    // An exponentially weighted moving average
    smoothed_rtt: Duration,

    // The mean deviation
    rtt_var: Duration,

    has_sample: bool,

    // From the peer's transport parameters
    max_ack_delay: Duration,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            latest_rtt: QUIC_INITIAL_RTT,
            min_rtt: None,
            smoothed_rtt: QUIC_INITIAL_RTT,
            rtt_var: QUIC_INITIAL_RTT / 2,
            has_sample: false,
            max_ack_delay: QUIC_DEFAULT_MAX_ACK_DELAY,
        }
    }
}

impl RttEstimator {
    pub(crate) fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    pub(crate) fn min_rtt(&self) -> Option<Duration> {
        self.min_rtt
    }

    pub(crate) fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt
    }

    pub(crate) fn rtt_var(&self) -> Duration {
        self.rtt_var
    }

    pub(crate) fn max_ack_delay(&self) -> Duration {
        self.max_ack_delay
    }

    pub(crate) fn set_max_ack_delay(&mut self, max_ack_delay: Duration) {
        self.max_ack_delay = max_ack_delay;
    }

    /// Feeds one RTT sample. `ack_delay` is the already decoded delay the
    /// peer reported in its ACK frame.
    // https://www.rfc-editor.org/rfc/rfc9002.html#section-5.3
    pub(crate) fn update(
        &mut self,
        latest_rtt: Duration,
        ack_delay: Duration,
        handshake_confirmed: bool,
    ) {
        self.latest_rtt = latest_rtt;

        if !self.has_sample {
            self.has_sample = true;
            self.min_rtt = Some(latest_rtt);
            self.smoothed_rtt = latest_rtt;
            self.rtt_var = latest_rtt / 2;
            trace!("RTT metrics initialized: {:?}", self);
            return;
        }

        let min_rtt = self.min_rtt.map_or(latest_rtt, |m| m.min(latest_rtt));
        self.min_rtt = Some(min_rtt);

        let ack_delay = if handshake_confirmed && ack_delay > self.max_ack_delay {
            warn!(
                "Ack delay {:?} is larger than the peer's max_ack_delay {:?}",
                ack_delay, self.max_ack_delay
            );
            self.max_ack_delay
        } else {
            ack_delay
        };

        let adjusted_rtt = if latest_rtt >= min_rtt + ack_delay {
            latest_rtt - ack_delay
        } else {
            latest_rtt
        };

        let var_sample = self.smoothed_rtt.abs_diff(adjusted_rtt);
        self.rtt_var = (3 * self.rtt_var + var_sample) / 4;
        self.smoothed_rtt = (7 * self.smoothed_rtt + adjusted_rtt) / 8;

        trace!(
            "RTT metrics updated: adjusted_rtt={:?}, state: {:?}",
            adjusted_rtt,
            self
        );
    }

    // https://www.rfc-editor.org/rfc/rfc9002.html#section-6.1.2
    pub(crate) fn loss_delay(&self) -> Duration {
        let base_rtt = self.smoothed_rtt.max(self.latest_rtt);
        (base_rtt * QUIC_KTIME_THRESHOLD_NUMERATOR / QUIC_KTIME_THRESHOLD_DENOMINATOR)
            .max(QUIC_KGRANULARITY)
    }

    /// PTO period without max_ack_delay, backed off by `pto_count`.
    // https://www.rfc-editor.org/rfc/rfc9002.html#section-6.2.1
    pub(crate) fn pto_duration(&self, pto_count: u32) -> Duration {
        let pto = self.smoothed_rtt + (4 * self.rtt_var).max(QUIC_KGRANULARITY);
        pto * 2u32.saturating_pow(pto_count.min(16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rtt_estimator() {
        let rtt = RttEstimator::default();
        assert_eq!(rtt.smoothed_rtt(), Duration::from_millis(333));
        assert_eq!(rtt.rtt_var(), Duration::from_micros(166_500));
        assert_eq!(rtt.min_rtt(), None);
        assert_eq!(rtt.max_ack_delay(), QUIC_DEFAULT_MAX_ACK_DELAY);
    }

    #[test]
    fn test_first_sample() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(100), Duration::from_millis(10), false);
        assert_eq!(rtt.latest_rtt(), Duration::from_millis(100));
        assert_eq!(rtt.min_rtt(), Some(Duration::from_millis(100)));
        assert_eq!(rtt.smoothed_rtt(), Duration::from_millis(100));
        assert_eq!(rtt.rtt_var(), Duration::from_millis(50));
    }

    #[test]
    fn test_ewma_sequence() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(100), Duration::ZERO, false);

        // adjusted = 200 - 20 = 180, var = (3*50 + 80)/4 = 57.5, smoothed = (700 + 180)/8 = 110
        rtt.update(Duration::from_millis(200), Duration::from_millis(20), false);
        assert_eq!(rtt.min_rtt(), Some(Duration::from_millis(100)));
        assert_eq!(rtt.rtt_var(), Duration::from_micros(57_500));
        assert_eq!(rtt.smoothed_rtt(), Duration::from_millis(110));

        // latest < min + ack_delay: the delay is not subtracted
        // var = (3*57.5 + 20)/4 = 48.125, smoothed = (770 + 90)/8 = 107.5
        rtt.update(Duration::from_millis(90), Duration::from_millis(20), false);
        assert_eq!(rtt.min_rtt(), Some(Duration::from_millis(90)));
        assert_eq!(rtt.rtt_var(), Duration::from_micros(48_125));
        assert_eq!(rtt.smoothed_rtt(), Duration::from_micros(107_500));
    }

    #[test]
    fn test_ack_delay_clamped_once_confirmed() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(100), Duration::ZERO, true);

        // The 100ms delay is clamped to the 25ms max_ack_delay: adjusted = 175
        rtt.update(Duration::from_millis(200), Duration::from_millis(100), true);
        assert_eq!(rtt.smoothed_rtt(), Duration::from_micros(109_375));

        let mut unconfirmed = RttEstimator::default();
        unconfirmed.update(Duration::from_millis(100), Duration::ZERO, false);
        unconfirmed.update(Duration::from_millis(200), Duration::from_millis(100), false);
        assert_eq!(unconfirmed.smoothed_rtt(), Duration::from_micros(100_000));
    }

    #[test]
    fn test_loss_delay() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(80), Duration::ZERO, false);
        assert_eq!(rtt.loss_delay(), Duration::from_millis(90));

        let mut tiny = RttEstimator::default();
        tiny.update(Duration::from_micros(100), Duration::ZERO, false);
        assert_eq!(tiny.loss_delay(), QUIC_KGRANULARITY);
    }

    #[test]
    fn test_pto_duration_backoff() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(100), Duration::ZERO, false);

        // 100 + 4 * 50
        assert_eq!(rtt.pto_duration(0), Duration::from_millis(300));
        assert_eq!(rtt.pto_duration(2), Duration::from_millis(1200));
    }
}
