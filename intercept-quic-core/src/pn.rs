use std::fmt;
use tracing::trace;

// https://www.rfc-editor.org/rfc/rfc9000.html#section-12.3
pub const QUIC_MAX_PACKET_NUMBER: u64 = (1 << 62) - 1;
pub const QUIC_MAX_PACKET_NUMBER_LENGTH: u8 = 4;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketNumber(u64);

impl PacketNumber {
    /// Sentinel used where a packet carries no packet number, e.g. Retry.
    pub const INFINITE: PacketNumber = PacketNumber(u64::MAX);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_infinite(&self) -> bool {
        self.0 == u64::MAX
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    // https://www.rfc-editor.org/rfc/rfc9000.html#section-a.2
    pub fn truncate(&self, largest_acked: Option<PacketNumber>) -> TruncatedPacketNumber {
        let num_unacked = match largest_acked {
            Some(largest) => self.0.saturating_sub(largest.0).max(1),
            None => self.0 + 1,
        };

        // The window must be at least twice the number of unacknowledged packets
        let len = (1..QUIC_MAX_PACKET_NUMBER_LENGTH)
            .find(|len| num_unacked < 1u64 << (8 * *len as u64 - 1))
            .unwrap_or(QUIC_MAX_PACKET_NUMBER_LENGTH);

        let truncated = TruncatedPacketNumber::new(self.0, len);
        trace!(
            "Truncated packet number {} with largest acked {:?} into {:?}",
            self.0,
            largest_acked,
            truncated
        );
        truncated
    }

    // https://www.rfc-editor.org/rfc/rfc9000.html#section-a.3
    pub fn expand(
        truncated: TruncatedPacketNumber,
        largest_received: Option<PacketNumber>,
    ) -> PacketNumber {
        let Some(largest) = largest_received else {
            return PacketNumber(truncated.value as u64);
        };

        let expected = largest.0 + 1;
        let pn_nbits = truncated.len as u64 * 8;
        let pn_win = 1u64 << pn_nbits;
        let pn_hwin = pn_win / 2;
        let pn_mask = pn_win - 1;

        let candidate = (expected & !pn_mask) | truncated.value as u64;
        let expanded = if expected >= pn_hwin
            && candidate <= expected - pn_hwin
            && candidate < (1u64 << 62) - pn_win
        {
            candidate + pn_win
        } else if candidate > expected + pn_hwin && candidate >= pn_win {
            candidate - pn_win
        } else {
            candidate
        };

        PacketNumber(expanded)
    }
}

impl fmt::Debug for PacketNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            write!(f, "pn(inf)")
        } else {
            write!(f, "pn({})", self.0)
        }
    }
}

impl fmt::Display for PacketNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Low-order bytes of a packet number as they travel on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TruncatedPacketNumber {
    value: u32,
    len: u8,
}

impl TruncatedPacketNumber {
    pub fn new(full: u64, len: u8) -> Self {
        let len = len.clamp(1, QUIC_MAX_PACKET_NUMBER_LENGTH);
        let mask = if len == 4 {
            u32::MAX as u64
        } else {
            (1u64 << (8 * len as u64)) - 1
        };
        Self {
            value: (full & mask) as u32,
            len,
        }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.value.to_be_bytes()[4 - self.len as usize..].to_vec()
    }

    /// Widens the encoding to `len` bytes taken from the full packet number,
    /// so the ciphertext sample for header protection is always available.
    pub fn widen(&self, full: u64, len: u8) -> Self {
        if len <= self.len {
            return *self;
        }
        TruncatedPacketNumber::new(full, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_rfc_sample() {
        // https://www.rfc-editor.org/rfc/rfc9000.html#section-a.2
        let truncated =
            PacketNumber::new(0xac5c02).truncate(Some(PacketNumber::new(0xabe8b3)));
        assert_eq!(truncated.len(), 2);
        assert_eq!(truncated.value(), 0x5c02);

        let truncated =
            PacketNumber::new(0xace8fe).truncate(Some(PacketNumber::new(0xabe8b3)));
        assert_eq!(truncated.len(), 3);
        assert_eq!(truncated.value(), 0xace8fe);
    }

    #[test]
    fn test_truncate_without_acknowledgement() {
        let test_cases = vec![(0, 1), (126, 1), (127, 2), (32766, 2), (32767, 3)];
        for (pn, len) in test_cases {
            assert_eq!(PacketNumber::new(pn).truncate(None).len(), len, "pn {pn}");
        }
    }

    #[test]
    fn test_expand_rfc_sample() {
        // https://www.rfc-editor.org/rfc/rfc9000.html#section-a.3
        let truncated = TruncatedPacketNumber::new(0x9b32, 2);
        let expanded = PacketNumber::expand(truncated, Some(PacketNumber::new(0xa82f30ea)));
        assert_eq!(expanded.value(), 0xa82f9b32);
    }

    #[test]
    fn test_expand_without_largest_received() {
        let truncated = TruncatedPacketNumber::new(7, 1);
        assert_eq!(PacketNumber::expand(truncated, None).value(), 7);
    }

    #[test]
    fn test_truncate_then_expand_near_window_edge() {
        let largest = PacketNumber::new(0x1ff);
        for pn in [0x200u64, 0x23f, 0x27e] {
            let truncated = PacketNumber::new(pn).truncate(Some(largest));
            assert_eq!(PacketNumber::expand(truncated, Some(largest)).value(), pn);
        }
    }

    #[test]
    fn test_widen_keeps_full_value() {
        let truncated = PacketNumber::new(2).truncate(None);
        assert_eq!(truncated.to_bytes(), vec![0x02]);
        let widened = truncated.widen(2, 4);
        assert_eq!(widened.to_bytes(), vec![0x00, 0x00, 0x00, 0x02]);
        assert_eq!(PacketNumber::expand(widened, None).value(), 2);
    }
}
