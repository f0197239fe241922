use anyhow::{anyhow, Error, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};
use tracing::{span, trace, Level};

use crate::cid::{ConnectionId, QUIC_MAX_CONNECTION_ID_LENGTH};
use crate::connection::QuicLevel;
use crate::crypto::{QuicCrypto, QuicKey, QUIC_SAMPLE_LENGTH, QUIC_TAG_LENGTH};
use crate::pn::{PacketNumber, TruncatedPacketNumber, QUIC_MAX_PACKET_NUMBER_LENGTH};
use crate::utils::{
    decode_variable_length, encode_variable_length_force_two_bytes, hex_dump, read_bytes,
    read_length_prefixed_bytes, remaining_bytes, write_length_prefixed_bytes,
};

// Header Form:
// The most significant bit (0x80) of byte 0 (the first byte) is set to 1 for long headers.
const LONG_HEADER_FORM: u8 = 0x80;
// Fixed Bit:
// The next bit (0x40) of byte 0 is set to 1, unless the packet is a Version Negotiation packet.
const FIXED_BIT: u8 = 0x40;
const KEY_PHASE_BIT: u8 = 0x04;
const LONG_HEADER_RESERVED_BITS: u8 = 0x0c;
const SHORT_HEADER_RESERVED_BITS: u8 = 0x18;

pub(crate) const QUIC_VERSION: u32 = 1;
const QUIC_VERSION_NEGOTIATION: u32 = 0;

// https://www.rfc-editor.org/rfc/rfc9000.html#section-14.1
pub(crate) const QUIC_MIN_INITIAL_DATAGRAM_SIZE: usize = 1200;

// https://www.rfc-editor.org/rfc/rfc9001.html#section-5.4.2
// The sample starts 4 bytes after the Packet Number field as if it were always 4 bytes long
const QUIC_MIN_PROTECTED_LENGTH: usize =
    QUIC_MAX_PACKET_NUMBER_LENGTH as usize + QUIC_SAMPLE_LENGTH;

const QUIC_RETRY_INTEGRITY_TAG_SIZE: usize = 16;

pub(crate) fn is_long_header(flag: u8) -> bool {
    flag & LONG_HEADER_FORM != 0
}

// Long Packet Type:
// The next two bits (those with a mask of 0x30) of byte 0 contain a packet type.
// Type	Name	Section
// 0x00	Initial	Section 17.2.2
// 0x01	0-RTT	Section 17.2.3
// 0x02	Handshake	Section 17.2.4
// 0x03	Retry	Section 17.2.5
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LongHeaderType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl TryFrom<u8> for LongHeaderType {
    type Error = Error;

    fn try_from(flag: u8) -> Result<Self, Self::Error> {
        match (flag & 0x30) >> 4 {
            0x00 => Ok(LongHeaderType::Initial),
            0x01 => Ok(LongHeaderType::ZeroRtt),
            0x02 => Ok(LongHeaderType::Handshake),
            0x03 => Ok(LongHeaderType::Retry),
            _ => Err(anyhow!("Invalid long header type in flag {:x}", flag)),
        }
    }
}

impl From<LongHeaderType> for u8 {
    fn from(val: LongHeaderType) -> Self {
        match val {
            LongHeaderType::Initial => 0x00,
            LongHeaderType::ZeroRtt => 0x01,
            LongHeaderType::Handshake => 0x02,
            LongHeaderType::Retry => 0x03,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuicPacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    OneRtt,
    VersionNegotiation,
}

impl QuicPacketType {
    /// Encryption level protecting packets of this type; Retry and Version
    /// Negotiation packets are not protected.
    pub fn level(&self) -> Option<QuicLevel> {
        match self {
            QuicPacketType::Initial => Some(QuicLevel::Initial),
            QuicPacketType::ZeroRtt => Some(QuicLevel::ZeroRtt),
            QuicPacketType::Handshake => Some(QuicLevel::Handshake),
            QuicPacketType::OneRtt => Some(QuicLevel::Application),
            QuicPacketType::Retry | QuicPacketType::VersionNegotiation => None,
        }
    }

    pub fn from_level(level: QuicLevel) -> Self {
        match level {
            QuicLevel::Initial => QuicPacketType::Initial,
            QuicLevel::ZeroRtt => QuicPacketType::ZeroRtt,
            QuicLevel::Handshake => QuicPacketType::Handshake,
            QuicLevel::Application => QuicPacketType::OneRtt,
        }
    }

    pub fn is_long_header(&self) -> bool {
        !matches!(self, QuicPacketType::OneRtt)
    }

    fn long_header_type(&self) -> Option<LongHeaderType> {
        match self {
            QuicPacketType::Initial => Some(LongHeaderType::Initial),
            QuicPacketType::ZeroRtt => Some(LongHeaderType::ZeroRtt),
            QuicPacketType::Handshake => Some(LongHeaderType::Handshake),
            QuicPacketType::Retry => Some(LongHeaderType::Retry),
            _ => None,
        }
    }
}

/// A packet with protection removed, or one about to be protected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuicPacket {
    pub packet_type: QuicPacketType,
    pub version: u32,
    pub dcid: ConnectionId,
    // Empty for short header packets
    pub scid: ConnectionId,
    // Initial address validation token, only meaningful for Initial packets
    pub token: Vec<u8>,
    pub pn: PacketNumber,
    pub key_phase: bool,
    pub payload: Vec<u8>,
}

impl QuicPacket {
    pub fn new(
        level: QuicLevel,
        dcid: ConnectionId,
        scid: ConnectionId,
        pn: PacketNumber,
        payload: Vec<u8>,
    ) -> Self {
        let packet_type = QuicPacketType::from_level(level);
        Self {
            packet_type,
            version: QUIC_VERSION,
            dcid,
            scid: if packet_type.is_long_header() {
                scid
            } else {
                ConnectionId::default()
            },
            token: vec![],
            pn,
            key_phase: false,
            payload,
        }
    }

    pub fn with_token(mut self, token: Vec<u8>) -> Self {
        self.token = token;
        self
    }

    /// Size of everything but the payload once protected, used to budget
    /// frames before the packet number length is known.
    pub(crate) fn max_overhead(
        packet_type: QuicPacketType,
        dcid: usize,
        scid: usize,
        token: usize,
    ) -> usize {
        let pn_and_tag = QUIC_MAX_PACKET_NUMBER_LENGTH as usize + QUIC_TAG_LENGTH;
        match packet_type {
            QuicPacketType::OneRtt => 1 + dcid + pn_and_tag,
            QuicPacketType::Initial => 1 + 4 + 1 + dcid + 1 + scid + 8 + token + 2 + pn_and_tag,
            _ => 1 + 4 + 1 + dcid + 1 + scid + 2 + pn_and_tag,
        }
    }

    pub fn encode(&self, key: &QuicKey, largest_acked: Option<PacketNumber>) -> Result<Vec<u8>> {
        let mut truncated = self.pn.truncate(largest_acked);
        let protected_len = truncated.len() as usize + self.payload.len() + QUIC_TAG_LENGTH;
        if protected_len < QUIC_MIN_PROTECTED_LENGTH {
            let needed = QUIC_MAX_PACKET_NUMBER_LENGTH as usize - self.payload.len().min(3);
            truncated = truncated.widen(self.pn.value(), needed as u8);
            trace!("Widened packet number field to {} bytes", truncated.len());
        }
        self.encode_truncated(key, truncated)
    }

    /// Protects the packet with an already chosen packet number encoding.
    pub(crate) fn encode_truncated(
        &self,
        key: &QuicKey,
        truncated: TruncatedPacketNumber,
    ) -> Result<Vec<u8>> {
        let span = span!(
            Level::TRACE,
            "encode_packet",
            packet_type = ?self.packet_type,
            pn = self.pn.value(),
            payload_length = self.payload.len(),
            packet_length = tracing::field::Empty
        );
        let _enter = span.enter();

        let pn_len = truncated.len();

        if self.packet_type.level().is_none() {
            return Err(anyhow!("{:?} packets are not encoded with keys", self.packet_type));
        }

        let mut header = vec![];
        let mut cursor = Cursor::new(&mut header);
        match self.packet_type.long_header_type() {
            Some(long_type) => {
                // Long Header Packet {
                //   Header Form (1) = 1,
                //   Fixed Bit (1) = 1,
                //   Long Packet Type (2),
                //   Reserved Bits (2),                # Protected
                //   Packet Number Length (2),         # Protected
                //   Version (32),
                //   Destination Connection ID Length (8),
                //   Destination Connection ID (0..160),
                //   Source Connection ID Length (8),
                //   Source Connection ID (0..160),
                //   [Token Length (i), Token (..),]   # Initial only
                //   Length (i),
                //   Packet Number (8..32),            # Protected
                //   Packet Payload (8..),
                // }
                let flag = LONG_HEADER_FORM | FIXED_BIT | (u8::from(long_type) << 4) | (pn_len - 1);
                cursor.write_u8(flag)?;
                cursor.write_u32::<BigEndian>(self.version)?;
                cursor.write_u8(self.dcid.len() as u8)?;
                cursor.write_all(self.dcid.as_bytes())?;
                cursor.write_u8(self.scid.len() as u8)?;
                cursor.write_all(self.scid.as_bytes())?;
                if long_type == LongHeaderType::Initial {
                    write_length_prefixed_bytes(&mut cursor, &self.token)?;
                }
                let length = pn_len as usize + self.payload.len() + QUIC_TAG_LENGTH;
                encode_variable_length_force_two_bytes(&mut cursor, length as u64)?;
            }
            None => {
                // 1-RTT Packet {
                //   Header Form (1) = 0,
                //   Fixed Bit (1) = 1,
                //   Spin Bit (1),
                //   Reserved Bits (2),                # Protected
                //   Key Phase (1),                    # Protected
                //   Packet Number Length (2),         # Protected
                //   Destination Connection ID (0..160),
                //   Packet Number (8..32),            # Protected
                //   Packet Payload (8..),
                // }
                let key_phase = if self.key_phase { KEY_PHASE_BIT } else { 0 };
                cursor.write_u8(FIXED_BIT | key_phase | (pn_len - 1))?;
                cursor.write_all(self.dcid.as_bytes())?;
            }
        }

        let pn_offset = header.len();
        header.extend_from_slice(&truncated.to_bytes());

        let ciphertext = key.seal(self.pn.value(), &header, &self.payload)?;
        let mut packet = header;
        packet.extend_from_slice(&ciphertext);

        apply_header_protection(&mut packet, pn_offset, pn_len as usize, key)?;
        span.record("packet_length", packet.len());
        trace!(
            "Encoded {:?} packet {:?}, pn length {}, size {}",
            self.packet_type,
            self.pn,
            pn_len,
            packet.len()
        );
        Ok(packet)
    }
}

// https://www.rfc-editor.org/rfc/rfc9001.html#section-5.4.1
fn header_protection_mask(packet: &[u8], pn_offset: usize, key: &QuicKey) -> Result<[u8; 5]> {
    let sample_start = pn_offset + QUIC_MAX_PACKET_NUMBER_LENGTH as usize;
    let sample = packet
        .get(sample_start..sample_start + QUIC_SAMPLE_LENGTH)
        .ok_or_else(|| anyhow!("Packet of {} bytes is too short to sample", packet.len()))?;
    key.header_protection_mask(sample)
}

fn first_byte_mask(flag: u8) -> u8 {
    if is_long_header(flag) {
        0x0f
    } else {
        0x1f
    }
}

pub(crate) fn apply_header_protection(
    packet: &mut [u8],
    pn_offset: usize,
    pn_len: usize,
    key: &QuicKey,
) -> Result<()> {
    let mask = header_protection_mask(packet, pn_offset, key)?;
    packet[0] ^= mask[0] & first_byte_mask(packet[0]);
    packet[pn_offset..pn_offset + pn_len]
        .iter_mut()
        .zip(mask[1..].iter())
        .for_each(|(p, m)| *p ^= *m);
    Ok(())
}

/// Header fields readable before any key is applied, plus the bounds of the
/// protected remainder.
#[derive(Debug)]
pub struct ProtectedPacket<'a> {
    pub packet_type: QuicPacketType,
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub token: Vec<u8>,
    pn_offset: usize,
    bytes: &'a [u8],
}

impl<'a> ProtectedPacket<'a> {
    /// Parses the first packet of `datagram`; short headers need the length
    /// of our own connection id since it is not encoded.
    pub fn parse(datagram: &'a [u8], short_dcid_len: usize) -> Result<Self> {
        let mut cursor = Cursor::new(datagram);
        let flag = cursor.read_u8()?;

        if !is_long_header(flag) {
            if flag & FIXED_BIT == 0 {
                return Err(anyhow!("Fixed bit is not set in short header {:x}", flag));
            }
            let dcid = ConnectionId::new(&read_bytes(&mut cursor, short_dcid_len)?)?;
            let pn_offset = cursor.position() as usize;
            if datagram.len() < pn_offset + QUIC_MIN_PROTECTED_LENGTH {
                return Err(anyhow!("Short header packet of {} bytes is too short", datagram.len()));
            }
            return Ok(Self {
                packet_type: QuicPacketType::OneRtt,
                version: QUIC_VERSION,
                dcid,
                scid: ConnectionId::default(),
                token: vec![],
                pn_offset,
                bytes: datagram,
            });
        }

        let version = cursor.read_u32::<BigEndian>()?;
        let dcid_len = cursor.read_u8()? as usize;
        if dcid_len > QUIC_MAX_CONNECTION_ID_LENGTH {
            return Err(anyhow!("Destination connection id length {} is too long", dcid_len));
        }
        let dcid = ConnectionId::new(&read_bytes(&mut cursor, dcid_len)?)?;
        let scid_len = cursor.read_u8()? as usize;
        if scid_len > QUIC_MAX_CONNECTION_ID_LENGTH {
            return Err(anyhow!("Source connection id length {} is too long", scid_len));
        }
        let scid = ConnectionId::new(&read_bytes(&mut cursor, scid_len)?)?;

        if version == QUIC_VERSION_NEGOTIATION {
            return Ok(Self {
                packet_type: QuicPacketType::VersionNegotiation,
                version,
                dcid,
                scid,
                token: vec![],
                pn_offset: datagram.len(),
                bytes: datagram,
            });
        }
        if version != QUIC_VERSION {
            return Err(anyhow!("Unsupported QUIC version {:#x}", version));
        }
        if flag & FIXED_BIT == 0 {
            return Err(anyhow!("Fixed bit is not set in long header {:x}", flag));
        }

        let long_type = LongHeaderType::try_from(flag)?;
        if long_type == LongHeaderType::Retry {
            // Retry Packet {
            //   ...
            //   Retry Token (..),
            //   Retry Integrity Tag (128),
            // }
            let remain = remaining_bytes(&mut cursor)? as usize;
            if remain < QUIC_RETRY_INTEGRITY_TAG_SIZE {
                return Err(anyhow!("Retry packet misses its integrity tag"));
            }
            let token = read_bytes(&mut cursor, remain - QUIC_RETRY_INTEGRITY_TAG_SIZE)?;
            return Ok(Self {
                packet_type: QuicPacketType::Retry,
                version,
                dcid,
                scid,
                token,
                pn_offset: datagram.len(),
                bytes: datagram,
            });
        }

        let (packet_type, token) = match long_type {
            LongHeaderType::Initial => {
                (QuicPacketType::Initial, read_length_prefixed_bytes(&mut cursor)?)
            }
            LongHeaderType::ZeroRtt => (QuicPacketType::ZeroRtt, vec![]),
            _ => (QuicPacketType::Handshake, vec![]),
        };

        let length = decode_variable_length(&mut cursor)? as usize;
        let pn_offset = cursor.position() as usize;
        let end = pn_offset + length;
        if end > datagram.len() {
            return Err(anyhow!(
                "{:?} packet length {} exceeds the {} bytes left in the datagram",
                packet_type,
                length,
                datagram.len() - pn_offset
            ));
        }
        if length < QUIC_MIN_PROTECTED_LENGTH {
            return Err(anyhow!("{:?} packet length {} is too short", packet_type, length));
        }

        Ok(Self {
            packet_type,
            version,
            dcid,
            scid,
            token,
            pn_offset,
            bytes: &datagram[..end],
        })
    }

    /// Number of datagram bytes this packet occupies.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn level(&self) -> Option<QuicLevel> {
        self.packet_type.level()
    }

    pub fn unprotect(
        &self,
        key: &QuicKey,
        largest_received: Option<PacketNumber>,
    ) -> Result<QuicPacket> {
        if self.packet_type.level().is_none() {
            return Err(anyhow!("{:?} packets carry no protected payload", self.packet_type));
        }

        let pn_offset = self.pn_offset;
        let mask = header_protection_mask(self.bytes, pn_offset, key)?;
        let flag = self.bytes[0] ^ (mask[0] & first_byte_mask(self.bytes[0]));
        let pn_len = ((flag & 0x03) + 1) as usize;

        let mut pn_bytes = [0u8; 4];
        for i in 0..pn_len {
            pn_bytes[4 - pn_len + i] = self.bytes[pn_offset + i] ^ mask[1 + i];
        }
        let truncated =
            TruncatedPacketNumber::new(u32::from_be_bytes(pn_bytes) as u64, pn_len as u8);
        let pn = PacketNumber::expand(truncated, largest_received);

        // The header with protection removed is the associated data
        let mut aad = self.bytes[..pn_offset + pn_len].to_vec();
        aad[0] = flag;
        aad[pn_offset..].copy_from_slice(&pn_bytes[4 - pn_len..]);

        let payload = key.open(pn.value(), &aad, &self.bytes[pn_offset + pn_len..])?;

        let reserved = if self.packet_type.is_long_header() {
            flag & LONG_HEADER_RESERVED_BITS
        } else {
            flag & SHORT_HEADER_RESERVED_BITS
        };
        if reserved != 0 {
            return Err(anyhow!("Reserved bits {:x} are set after removing protection", reserved));
        }

        trace!(
            "Unprotected {:?} packet {:?}, dcid {}, payload size {}",
            self.packet_type,
            pn,
            self.dcid,
            payload.len()
        );

        Ok(QuicPacket {
            packet_type: self.packet_type,
            version: self.version,
            dcid: self.dcid.clone(),
            scid: self.scid.clone(),
            token: self.token.clone(),
            pn,
            key_phase: !self.packet_type.is_long_header() && flag & KEY_PHASE_BIT != 0,
            payload,
        })
    }

    // https://www.rfc-editor.org/rfc/rfc9001#section-5.8
    // Retry Pseudo-Packet {
    //   ODCID Length (8),
    //   Original Destination Connection ID (0..160),
    //   Header Form (1) = 1,
    //   Fixed Bit (1) = 1,
    //   Long Packet Type (2) = 3,
    //   Unused (4),
    //   Version (32),
    //   DCID Len (8),
    //   Destination Connection ID (0..160),
    //   SCID Len (8),
    //   Source Connection ID (0..160),
    //   Retry Token (..),
    // }
    pub fn validate_retry(&self, original_dcid: &ConnectionId) -> Result<bool> {
        if self.packet_type != QuicPacketType::Retry {
            return Err(anyhow!("Not a retry packet, but {:?}", self.packet_type));
        }
        let (body, tag) = self.bytes.split_at(self.bytes.len() - QUIC_RETRY_INTEGRITY_TAG_SIZE);
        let mut pseudo = Vec::with_capacity(1 + original_dcid.len() + body.len());
        pseudo.push(original_dcid.len() as u8);
        pseudo.extend_from_slice(original_dcid.as_bytes());
        pseudo.extend_from_slice(body);
        let valid = QuicCrypto::validate_retry_packet_tag(&pseudo, tag)?;
        trace!("Retry integrity tag {} valid {}", hex_dump(tag), valid);
        Ok(valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_initial_secrets;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn initial_keys() -> Result<(QuicKey, QuicKey)> {
        let (client, server) = derive_initial_secrets(&hex("8394c8f03e515708"))?;
        Ok((QuicKey::from_secret(&client)?, QuicKey::from_secret(&server)?))
    }

    #[test]
    fn test_initial_packet_protect_and_unprotect() -> Result<()> {
        let (client_key, _) = initial_keys()?;
        let dcid = ConnectionId::new(&hex("8394c8f03e515708"))?;
        let packet = QuicPacket::new(
            QuicLevel::Initial,
            dcid.clone(),
            ConnectionId::default(),
            PacketNumber::new(2),
            vec![0x06, 0x00, 0x04, 0xde, 0xad, 0xbe, 0xef, 0x01],
        );

        let bytes = packet.encode(&client_key, None)?;
        // Long header, Initial type
        assert_eq!(bytes[0] & 0xf0, 0xc0);
        assert_eq!(&bytes[1..5], &[0, 0, 0, 1]);

        let parsed = ProtectedPacket::parse(&bytes, 0)?;
        assert_eq!(parsed.packet_type, QuicPacketType::Initial);
        assert_eq!(parsed.dcid, dcid);
        assert_eq!(parsed.len(), bytes.len());

        let decoded = parsed.unprotect(&client_key, None)?;
        assert_eq!(decoded, packet);
        Ok(())
    }

    // https://www.rfc-editor.org/rfc/rfc9001.html#section-a.2
    #[test]
    fn test_client_initial_matches_rfc9001() -> Result<()> {
        let (client_key, _) = initial_keys()?;
        let mut payload = hex(concat!(
            "060040f1010000ed0303ebf8fa56f12939b9584a3896472ec40bb863cfd3e868",
            "04fe3a47f06a2b69484c00000413011302010000c000000010000e00000b6578",
            "616d706c652e636f6dff01000100000a00080006001d00170018001000070005",
            "04616c706e000500050100000000003300260024001d00209370b2c9caa47fba",
            "baf4559fedba753de171fa71f50f1ce15d43e994ec74d748002b000302030400",
            "0d0010000e0403050306030203080408050806002d00020101001c0002400100",
            "3900320408ffffffffffffffff05048000ffff07048000ffff08011001048000",
            "75300901100f088394c8f03e51570806048000ffff",
        ));
        payload.resize(1162, 0);
        let packet = QuicPacket::new(
            QuicLevel::Initial,
            ConnectionId::new(&hex("8394c8f03e515708"))?,
            ConnectionId::default(),
            PacketNumber::new(2),
            payload,
        );

        let bytes = packet.encode_truncated(&client_key, TruncatedPacketNumber::new(2, 4))?;
        let expected = hex(concat!(
            "c000000001088394c8f03e5157080000449e7b9aec34d1b1c98dd7689fb8ec11",
            "d242b123dc9bd8bab936b47d92ec356c0bab7df5976d27cd449f63300099f399",
            "1c260ec4c60d17b31f8429157bb35a1282a643a8d2262cad67500cadb8e7378c",
            "8eb7539ec4d4905fed1bee1fc8aafba17c750e2c7ace01e6005f80fcb7df6212",
            "30c83711b39343fa028cea7f7fb5ff89eac2308249a02252155e2347b63d58c5",
            "457afd84d05dfffdb20392844ae812154682e9cf012f9021a6f0be17ddd0c208",
            "4dce25ff9b06cde535d0f920a2db1bf362c23e596d11a4f5a6cf3948838a3aec",
            "4e15daf8500a6ef69ec4e3feb6b1d98e610ac8b7ec3faf6ad760b7bad1db4ba3",
            "485e8a94dc250ae3fdb41ed15fb6a8e5eba0fc3dd60bc8e30c5c4287e53805db",
            "059ae0648db2f64264ed5e39be2e20d82df566da8dd5998ccabdae053060ae6c",
            "7b4378e846d29f37ed7b4ea9ec5d82e7961b7f25a9323851f681d582363aa5f8",
            "9937f5a67258bf63ad6f1a0b1d96dbd4faddfcefc5266ba6611722395c906556",
            "be52afe3f565636ad1b17d508b73d8743eeb524be22b3dcbc2c7468d54119c74",
            "68449a13d8e3b95811a198f3491de3e7fe942b330407abf82a4ed7c1b311663a",
            "c69890f4157015853d91e923037c227a33cdd5ec281ca3f79c44546b9d90ca00",
            "f064c99e3dd97911d39fe9c5d0b23a229a234cb36186c4819e8b9c5927726632",
            "291d6a418211cc2962e20fe47feb3edf330f2c603a9d48c0fcb5699dbfe58964",
            "25c5bac4aee82e57a85aaf4e2513e4f05796b07ba2ee47d80506f8d2c25e50fd",
            "14de71e6c418559302f939b0e1abd576f279c4b2e0feb85c1f28ff18f58891ff",
            "ef132eef2fa09346aee33c28eb130ff28f5b766953334113211996d20011a198",
            "e3fc433f9f2541010ae17c1bf202580f6047472fb36857fe843b19f5984009dd",
            "c324044e847a4f4a0ab34f719595de37252d6235365e9b84392b061085349d73",
            "203a4a13e96f5432ec0fd4a1ee65accdd5e3904df54c1da510b0ff20dcc0c77f",
            "cb2c0e0eb605cb0504db87632cf3d8b4dae6e705769d1de354270123cb11450e",
            "fc60ac47683d7b8d0f811365565fd98c4c8eb936bcab8d069fc33bd801b03ade",
            "a2e1fbc5aa463d08ca19896d2bf59a071b851e6c239052172f296bfb5e724047",
            "90a2181014f3b94a4e97d117b438130368cc39dbb2d198065ae3986547926cd2",
            "162f40a29f0c3c8745c0f50fba3852e566d44575c29d39a03f0cda721984b6f4",
            "40591f355e12d439ff150aab7613499dbd49adabc8676eef023b15b65bfc5ca0",
            "6948109f23f350db82123535eb8a7433bdabcb909271a6ecbcb58b936a88cd4e",
            "8f2e6ff5800175f113253d8fa9ca8885c2f552e657dc603f252e1a8e308f76f0",
            "be79e2fb8f5d5fbbe2e30ecadd220723c8c0aea8078cdfcb3868263ff8f09400",
            "54da48781893a7e49ad5aff4af300cd804a6b6279ab3ff3afb64491c85194aab",
            "760d58a606654f9f4400e8b38591356fbf6425aca26dc85244259ff2b19c41b9",
            "f96f3ca9ec1dde434da7d2d392b905ddf3d1f9af93d1af5950bd493f5aa731b4",
            "056df31bd267b6b90a079831aaf579be0a39013137aac6d404f518cfd4684064",
            "7e78bfe706ca4cf5e9c5453e9f7cfd2b8b4c8d169a44e55c88d4a9a7f9474241",
            "e221af44860018ab0856972e194cd934",
        ));
        assert_eq!(bytes.len(), 1200);
        assert_eq!(bytes, expected);

        let parsed = ProtectedPacket::parse(&bytes, 0)?;
        assert_eq!(parsed.unprotect(&client_key, None)?, packet);
        Ok(())
    }

    // https://www.rfc-editor.org/rfc/rfc9001.html#section-a.3
    #[test]
    fn test_server_initial_matches_rfc9001() -> Result<()> {
        let (_, server_key) = initial_keys()?;
        let packet = QuicPacket::new(
            QuicLevel::Initial,
            ConnectionId::default(),
            ConnectionId::new(&hex("f067a5502a4262b5"))?,
            PacketNumber::new(1),
            hex(concat!(
            "02000000000600405a020000560303eefce7f7b37ba1d1632e96677825ddf739",
            "88cfc79825df566dc5430b9a045a1200130100002e00330024001d00209d3c94",
            "0d89690b84d08a60993c144eca684d1081287c834d5311bcf32bb9da1a002b00",
            "020304",
        )),
        );

        let bytes = packet.encode_truncated(&server_key, TruncatedPacketNumber::new(1, 2))?;
        let expected = hex(concat!(
            "cf000000010008f067a5502a4262b5004075c0d95a482cd0991cd25b0aac406a",
            "5816b6394100f37a1c69797554780bb38cc5a99f5ede4cf73c3ec2493a1839b3",
            "dbcba3f6ea46c5b7684df3548e7ddeb9c3bf9c73cc3f3bded74b562bfb19fb84",
            "022f8ef4cdd93795d77d06edbb7aaf2f58891850abbdca3d20398c276456cbc4",
            "2158407dd074ee",
        ));
        assert_eq!(bytes, expected);

        let parsed = ProtectedPacket::parse(&bytes, 0)?;
        assert_eq!(parsed.scid, ConnectionId::new(&hex("f067a5502a4262b5"))?);
        assert_eq!(parsed.unprotect(&server_key, Some(PacketNumber::new(0)))?, packet);
        Ok(())
    }

    #[test]
    fn test_short_header_packet_number_window() -> Result<()> {
        let (_, server_key) = initial_keys()?;
        let dcid = ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8])?;
        let packet = QuicPacket::new(
            QuicLevel::Application,
            dcid.clone(),
            ConnectionId::default(),
            PacketNumber::new(0xac5c02),
            vec![0x01; 32],
        );

        let bytes = packet.encode(&server_key, Some(PacketNumber::new(0xabe8b3)))?;
        assert_eq!(bytes[0] & 0xc0, 0x40);
        // flag, dcid, two byte packet number, payload, tag
        assert_eq!(bytes.len(), 1 + 8 + 2 + 32 + QUIC_TAG_LENGTH);

        let parsed = ProtectedPacket::parse(&bytes, dcid.len())?;
        let decoded = parsed.unprotect(&server_key, Some(PacketNumber::new(0xac5c01)))?;
        assert_eq!(decoded.pn.value(), 0xac5c02);
        assert_eq!(decoded.payload, vec![0x01; 32]);
        Ok(())
    }

    #[test]
    fn test_tiny_payload_still_has_sample() -> Result<()> {
        let (client_key, _) = initial_keys()?;
        let packet = QuicPacket::new(
            QuicLevel::Handshake,
            ConnectionId::new(&[9; 8])?,
            ConnectionId::new(&[7; 8])?,
            PacketNumber::new(0),
            vec![0x01],
        );

        let bytes = packet.encode(&client_key, None)?;
        let parsed = ProtectedPacket::parse(&bytes, 0)?;
        let decoded = parsed.unprotect(&client_key, None)?;
        assert_eq!(decoded.payload, vec![0x01]);
        assert_eq!(decoded.pn.value(), 0);
        Ok(())
    }

    #[test]
    fn test_coalesced_packets_are_split_by_length() -> Result<()> {
        let (client_key, _) = initial_keys()?;
        let dcid = ConnectionId::new(&[9; 8])?;
        let scid = ConnectionId::new(&[7; 8])?;
        let pn = PacketNumber::new(0);
        let first =
            QuicPacket::new(QuicLevel::Initial, dcid.clone(), scid.clone(), pn, vec![0x01; 40])
                .encode(&client_key, None)?;
        let second = QuicPacket::new(QuicLevel::Handshake, dcid.clone(), scid, pn, vec![0x01; 40])
            .encode(&client_key, None)?;

        let mut datagram = first.clone();
        datagram.extend_from_slice(&second);

        let parsed = ProtectedPacket::parse(&datagram, 0)?;
        assert_eq!(parsed.packet_type, QuicPacketType::Initial);
        assert_eq!(parsed.len(), first.len());
        let parsed = ProtectedPacket::parse(&datagram[first.len()..], 0)?;
        assert_eq!(parsed.packet_type, QuicPacketType::Handshake);
        assert_eq!(parsed.len(), second.len());
        Ok(())
    }

    #[test]
    fn test_wrong_key_fails_authentication() -> Result<()> {
        let (client_key, server_key) = initial_keys()?;
        let bytes = QuicPacket::new(
            QuicLevel::Initial,
            ConnectionId::new(&[9; 8])?,
            ConnectionId::default(),
            PacketNumber::new(1),
            vec![0x01; 30],
        )
        .encode(&client_key, None)?;
        let parsed = ProtectedPacket::parse(&bytes, 0)?;
        assert!(parsed.unprotect(&server_key, None).is_err());
        Ok(())
    }

    #[test]
    fn test_malformed_headers() {
        // Unknown version
        let mut bytes = vec![0xc0, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00];
        bytes.extend_from_slice(&[0u8; 40]);
        assert!(ProtectedPacket::parse(&bytes, 0).is_err());

        // Connection id longer than 20 bytes
        let bytes = vec![0xc0, 0x00, 0x00, 0x00, 0x01, 21];
        assert!(ProtectedPacket::parse(&bytes, 0).is_err());

        // Length beyond the datagram
        let bytes = vec![0xc0, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x44, 0x00, 0x01];
        assert!(ProtectedPacket::parse(&bytes, 0).is_err());

        // Fixed bit cleared
        let bytes = vec![0x00; 40];
        assert!(ProtectedPacket::parse(&bytes, 8).is_err());
    }

    // https://www.rfc-editor.org/rfc/rfc9001.html#section-a.4
    #[test]
    fn test_parse_and_validate_retry() -> Result<()> {
        let bytes = hex("ff000000010008f067a5502a4262b5746f6b656e04a265ba2eff4d829058fb3f0f2496ba");
        let parsed = ProtectedPacket::parse(&bytes, 0)?;
        assert_eq!(parsed.packet_type, QuicPacketType::Retry);
        assert!(parsed.dcid.is_empty());
        assert_eq!(parsed.scid, ConnectionId::new(&hex("f067a5502a4262b5"))?);
        assert_eq!(parsed.token, b"token".to_vec());
        assert_eq!(parsed.len(), bytes.len());

        assert!(parsed.validate_retry(&ConnectionId::new(&hex("8394c8f03e515708"))?)?);
        assert!(!parsed.validate_retry(&ConnectionId::new(&hex("8394c8f03e515709"))?)?);
        Ok(())
    }

    #[test]
    fn test_version_negotiation_is_recognised() -> Result<()> {
        let bytes = vec![
            0x80, 0x00, 0x00, 0x00, 0x00, 0x01, 0xaa, 0x01, 0xbb, 0x00, 0x00, 0x00, 0x01,
        ];
        let parsed = ProtectedPacket::parse(&bytes, 0)?;
        assert_eq!(parsed.packet_type, QuicPacketType::VersionNegotiation);
        assert!(parsed.unprotect(&initial_keys()?.0, None).is_err());
        Ok(())
    }
}
