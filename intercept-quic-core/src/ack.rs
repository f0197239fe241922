use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::Instant;
use tracing::{trace, warn};

use crate::frame::{AckFrame, AckRange};
use crate::utils::format_instant;

const QUIC_DEFAULT_ACK_DELAY_EXPONENT: u8 = 3;
const QUIC_MAX_ACK_RANGES: usize = 64;

/// Builds ACK frames for one packet number space.
///
/// Instead of storing received packet numbers, the generator remembers the
/// holes below the highest number seen so far, each as an inclusive range
/// keyed by its first number. Everything at or above
/// `smallest_valid` that is not a hole and not above the high-water mark has
/// been received. Once the peer acknowledges one of our ACK frames,
/// `smallest_valid` moves past it and older holes are forgotten.
pub(crate) struct AckFrameGenerator {
    holes: BTreeMap<u64, u64>,
    smallest_valid: u64,
    high_water: Option<u64>,

    // Largest packet number still worth acknowledging
    largest: Option<u64>,
    largest_received_time: Option<Instant>,

    ack_delay_exponent: u8,
    max_ranges: usize,
}

impl Default for AckFrameGenerator {
    fn default() -> Self {
        Self {
            holes: BTreeMap::new(),
            smallest_valid: 0,
            high_water: None,
            largest: None,
            largest_received_time: None,
            ack_delay_exponent: QUIC_DEFAULT_ACK_DELAY_EXPONENT,
            max_ranges: QUIC_MAX_ACK_RANGES,
        }
    }
}

impl Display for AckFrameGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "smallest_valid {}, high_water {:?}, largest {:?}, holes {:?}",
            self.smallest_valid, self.high_water, self.largest, self.holes
        )
    }
}

impl AckFrameGenerator {
    pub(crate) fn new(ack_delay_exponent: u8) -> Self {
        Self {
            ack_delay_exponent,
            ..Default::default()
        }
    }

    pub(crate) fn largest(&self) -> Option<u64> {
        self.largest
    }

    /// Records a received packet number. Returns false for stale numbers and
    /// duplicates, which must not be processed again.
    pub(crate) fn received(&mut self, pn: u64, now: Instant) -> bool {
        if pn < self.smallest_valid {
            trace!(
                "Packet number {} is below the smallest valid {}, ignore it",
                pn,
                self.smallest_valid
            );
            return false;
        }

        match self.high_water {
            Some(mark) if pn == mark => {
                return false;
            }
            Some(mark) if pn < mark => {
                let Some((start, end)) = self
                    .holes
                    .range(..=pn)
                    .next_back()
                    .map(|(start, end)| (*start, *end))
                    .filter(|(_, end)| pn <= *end)
                else {
                    trace!("Duplicated packet number {}", pn);
                    return false;
                };
                self.holes.remove(&start);
                if start < pn {
                    self.holes.insert(start, pn - 1);
                }
                if pn < end {
                    self.holes.insert(pn + 1, end);
                }
            }
            _ => {
                let first_hole = self
                    .high_water
                    .map_or(self.smallest_valid, |mark| (mark + 1).max(self.smallest_valid));
                if first_hole < pn {
                    self.holes.insert(first_hole, pn - 1);
                }
                self.high_water = Some(pn);
            }
        }

        if self.largest.map_or(true, |largest| pn > largest) {
            self.largest = Some(pn);
            self.largest_received_time = Some(now);
        }

        trace!("Received packet number {}, {}", pn, self);
        true
    }

    pub(crate) fn generate_ack_frame(&self, now: Instant) -> Option<AckFrame> {
        let largest = self.largest?;

        let ack_delay = self
            .largest_received_time
            .map(|t| now.saturating_duration_since(t).as_micros() as u64 >> self.ack_delay_exponent)
            .unwrap_or(0);

        // Walk the holes downward starting from the largest number
        let mut holes = self.holes.range(..largest).rev().peekable();
        let first_ack_range = match holes.peek() {
            Some((_, end)) => largest - *end - 1,
            None => largest - self.smallest_valid,
        };

        let mut ack_ranges = vec![];
        while let Some((&start, &end)) = holes.next() {
            if ack_ranges.len() >= self.max_ranges {
                warn!(
                    "ACK frame reached {} ranges, older packets are left out",
                    self.max_ranges
                );
                break;
            }
            if start <= self.smallest_valid {
                break;
            }

            let range_top = start - 1;
            let range_bottom = holes.peek().map_or(self.smallest_valid, |(_, end)| *end + 1);
            ack_ranges.push(AckRange {
                gap: end - start,
                ack_range_length: range_top - range_bottom,
            });
        }

        let frame = AckFrame {
            largest_acknowledged: largest,
            ack_delay,
            first_ack_range,
            ack_ranges,
            ecn_counts: None,
        };
        trace!(
            "Generated ack frame {:?}, largest received {}",
            frame,
            self.largest_received_time
                .map(|t| format_instant(t, now))
                .unwrap_or_default()
        );
        Some(frame)
    }

    /// The peer acknowledged a packet that carried our ACK frame with the
    /// given largest acknowledged number. Nothing at or below it needs to be
    /// acknowledged again.
    // https://www.rfc-editor.org/rfc/rfc9000.html#section-13.2.4
    pub(crate) fn confirmed_ack_frame(&mut self, largest_acknowledged: u64) {
        if largest_acknowledged < self.smallest_valid {
            return;
        }

        self.smallest_valid = largest_acknowledged + 1;
        let mut kept = self.holes.split_off(&self.smallest_valid);
        if let Some((_, end)) = self.holes.iter().next_back() {
            if *end >= self.smallest_valid {
                kept.insert(self.smallest_valid, *end);
            }
        }
        self.holes = kept;
        if self.largest.is_some_and(|largest| largest <= largest_acknowledged) {
            self.largest = None;
            self.largest_received_time = None;
        }
        trace!(
            "Peer confirmed our ack up to {}, {}",
            largest_acknowledged,
            self
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn init_tracing() {
        let env_filter = tracing_subscriber::EnvFilter::from_default_env();
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_test_writer()
            .try_init();
    }

    fn receive_all(gen: &mut AckFrameGenerator, pns: &[u64], now: Instant) {
        for pn in pns {
            assert!(gen.received(*pn, now), "pn {pn}");
        }
    }

    #[test]
    fn test_contiguous_packets() {
        let mut gen = AckFrameGenerator::default();
        let now = Instant::now();
        receive_all(&mut gen, &[0, 1, 2, 3], now);

        let frame = gen.generate_ack_frame(now).unwrap();
        assert_eq!(frame.largest_acknowledged, 3);
        assert_eq!(frame.first_ack_range, 3);
        assert_eq!(frame.ack_range_count(), 0);
    }

    #[test]
    fn test_single_gap() {
        init_tracing();
        let mut gen = AckFrameGenerator::default();
        let now = Instant::now();
        receive_all(&mut gen, &[2, 3, 4, 5, 6, 7, 10], now);

        let frame = gen.generate_ack_frame(now).unwrap();
        assert_eq!(frame.largest_acknowledged, 10);
        assert_eq!(frame.first_ack_range, 0);
        assert_eq!(
            frame.ack_ranges,
            vec![AckRange {
                gap: 1,
                ack_range_length: 5
            }]
        );
        assert_eq!(
            frame.acked_packet_numbers().unwrap(),
            vec![10, 7, 6, 5, 4, 3, 2]
        );
    }

    #[test]
    fn test_out_of_order_fills_holes() {
        let mut gen = AckFrameGenerator::default();
        let now = Instant::now();
        receive_all(&mut gen, &[5, 1, 9, 0, 7], now);

        let frame = gen.generate_ack_frame(now).unwrap();
        assert_eq!(frame.acked_packet_numbers().unwrap(), vec![9, 7, 5, 1, 0]);

        receive_all(&mut gen, &[8, 6, 2, 3, 4], now);
        let frame = gen.generate_ack_frame(now).unwrap();
        assert_eq!(frame.first_ack_range, 9);
        assert!(frame.ack_ranges.is_empty());
    }

    #[test]
    fn test_duplicates_are_rejected() {
        let mut gen = AckFrameGenerator::default();
        let now = Instant::now();
        receive_all(&mut gen, &[0, 3], now);
        assert!(!gen.received(3, now));
        assert!(!gen.received(0, now));
        assert!(gen.received(2, now));
        assert!(!gen.received(2, now));
    }

    #[test]
    fn test_confirmed_ack_frame() {
        let mut gen = AckFrameGenerator::default();
        let now = Instant::now();
        receive_all(&mut gen, &[0, 1, 2, 4], now);
        let frame = gen.generate_ack_frame(now).unwrap();

        gen.confirmed_ack_frame(frame.largest_acknowledged);
        assert!(gen.generate_ack_frame(now).is_none());

        // Stale after the confirmation
        assert!(!gen.received(3, now));

        assert!(gen.received(6, now));
        let frame = gen.generate_ack_frame(now).unwrap();
        assert_eq!(frame.largest_acknowledged, 6);
        assert_eq!(frame.first_ack_range, 0);
        assert!(frame.ack_ranges.is_empty());
    }

    #[test]
    fn test_confirm_below_largest_keeps_newer_packets() {
        let mut gen = AckFrameGenerator::default();
        let now = Instant::now();
        receive_all(&mut gen, &[0, 1, 2], now);
        gen.confirmed_ack_frame(1);

        let frame = gen.generate_ack_frame(now).unwrap();
        assert_eq!(frame.largest_acknowledged, 2);
        assert_eq!(frame.first_ack_range, 0);
    }

    #[test]
    fn test_ack_delay_is_scaled() {
        let mut gen = AckFrameGenerator::new(3);
        let start = Instant::now();
        gen.received(0, start);

        let frame = gen
            .generate_ack_frame(start + Duration::from_micros(800))
            .unwrap();
        assert_eq!(frame.ack_delay, 100);
    }

    #[test]
    fn test_max_ranges_limit() {
        let mut gen = AckFrameGenerator {
            max_ranges: 4,
            ..Default::default()
        };
        let now = Instant::now();
        for pn in (0..40).step_by(2) {
            gen.received(pn, now);
        }

        let frame = gen.generate_ack_frame(now).unwrap();
        assert_eq!(frame.ack_ranges.len(), 4);
        assert_eq!(
            frame.acked_packet_numbers().unwrap(),
            vec![38, 36, 34, 32, 30]
        );
    }

    #[test]
    fn test_large_jump_is_one_hole() {
        init_tracing();
        let mut gen = AckFrameGenerator::default();
        let now = Instant::now();
        let far = 1u64 << 40;
        receive_all(&mut gen, &[0, far], now);
        assert_eq!(gen.holes.len(), 1);
        assert_eq!(gen.holes.get(&1), Some(&(far - 1)));

        let frame = gen.generate_ack_frame(now).unwrap();
        assert_eq!(frame.largest_acknowledged, far);
        assert_eq!(frame.first_ack_range, 0);
        assert_eq!(
            frame.ack_ranges,
            vec![AckRange {
                gap: far - 2,
                ack_range_length: 0
            }]
        );

        // A packet from the middle splits the hole in two
        let middle = far / 2;
        assert!(gen.received(middle, now));
        assert!(!gen.received(middle, now));
        assert_eq!(gen.holes.len(), 2);
        let frame = gen.generate_ack_frame(now).unwrap();
        assert_eq!(frame.ack_ranges.len(), 2);
        assert_eq!(frame.ack_ranges[0].gap, far - middle - 2);
        assert_eq!(frame.ack_ranges[1].gap, middle - 2);
    }
}
