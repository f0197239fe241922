use anyhow::{anyhow, Result};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};
use tracing::{trace, trace_span, warn};

use crate::cid::ConnectionId;
use crate::error_code::QuicConnectionErrorCode;
use crate::utils::{
    decode_variable_length, encode_variable_length, get_variable_length, read_bytes,
    read_length_prefixed_bytes, remaining_bytes, write_length_prefixed_bytes,
};

pub(crate) const QUIC_STATELESS_RESET_TOKEN_LENGTH: usize = 16;
const QUIC_PATH_DATA_LENGTH: usize = 8;

// Stream frame type bits
// https://www.rfc-editor.org/rfc/rfc9000.html#section-19.8
const STREAM_FRAME_OFF_BIT: u64 = 0x04;
const STREAM_FRAME_LEN_BIT: u64 = 0x02;
const STREAM_FRAME_FIN_BIT: u64 = 0x01;

// The "Pkts" column in Table 3 lists the types of packets that each frame type could appear in,
// indicated by the following characters:
// I: Initial (Section 17.2.2)
// H: Handshake (Section 17.2.4)
// 0: 0-RTT (Section 17.2.3)
// 1: 1-RTT (Section 17.3.1)
// ih: Only a CONNECTION_CLOSE frame of type 0x1c can appear in Initial or Handshake packets.
//
// The "Spec" column in Table 3 summarizes any special rules governing the processing or
// generation of the frame type, as indicated by the following characters:
// N: Packets containing only frames with this marking are not ack-eliciting; see Section 13.2.
// C: Packets containing only frames with this marking do not count toward bytes in flight.
// P: Packets containing only frames with this marking can be used to probe new network paths.
// F: The contents of frames with this marking are flow controlled; see Section 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuicFrameType {
    /// Pkts: IH01, Spec: NP
    Padding,
    /// Pkts: IH01
    Ping,
    /// Pkts: IH_1, Spec: NC
    Ack,
    /// Pkts: IH_1, Spec: NC
    AckEcn,
    /// Pkts: __01
    ResetStream,
    /// Pkts: __01
    StopSending,
    /// Pkts: IH_1
    Crypto,
    /// Pkts: ___1
    NewToken,
    /// Pkts: __01, Spec: F
    Stream,
    /// Pkts: __01
    MaxData,
    /// Pkts: __01
    MaxStreamData,
    /// Pkts: __01
    MaxStreams,
    /// Pkts: __01
    DataBlocked,
    /// Pkts: __01
    StreamDataBlocked,
    /// Pkts: __01
    StreamsBlocked,
    /// Pkts: __01, Spec: P
    NewConnectionId,
    /// Pkts: __01
    RetireConnectionId,
    /// Pkts: __01, Spec: P
    PathChallenge,
    /// Pkts: ___1, Spec: P
    PathResponse,
    /// Pkts: ih01, Spec: N
    ConnectionClose,
    /// Pkts: ___1
    HandshakeDone,
}

impl QuicFrameType {
    fn from_wire(value: u64) -> Option<Self> {
        let frame_type = match value {
            0x00 => QuicFrameType::Padding,
            0x01 => QuicFrameType::Ping,
            0x02 => QuicFrameType::Ack,
            0x03 => QuicFrameType::AckEcn,
            0x04 => QuicFrameType::ResetStream,
            0x05 => QuicFrameType::StopSending,
            0x06 => QuicFrameType::Crypto,
            0x07 => QuicFrameType::NewToken,
            0x08..=0x0f => QuicFrameType::Stream,
            0x10 => QuicFrameType::MaxData,
            0x11 => QuicFrameType::MaxStreamData,
            0x12..=0x13 => QuicFrameType::MaxStreams,
            0x14 => QuicFrameType::DataBlocked,
            0x15 => QuicFrameType::StreamDataBlocked,
            0x16..=0x17 => QuicFrameType::StreamsBlocked,
            0x18 => QuicFrameType::NewConnectionId,
            0x19 => QuicFrameType::RetireConnectionId,
            0x1a => QuicFrameType::PathChallenge,
            0x1b => QuicFrameType::PathResponse,
            0x1c..=0x1d => QuicFrameType::ConnectionClose,
            0x1e => QuicFrameType::HandshakeDone,
            _ => return None,
        };
        Some(frame_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRange {
    pub gap: u64,
    pub ack_range_length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub largest_acknowledged: u64,
    // Already scaled down by the ack_delay_exponent
    pub ack_delay: u64,
    pub first_ack_range: u64,
    pub ack_ranges: Vec<AckRange>,
    pub ecn_counts: Option<EcnCounts>,
}

impl AckFrame {
    pub fn ack_range_count(&self) -> u64 {
        self.ack_ranges.len() as u64
    }

    /// Acknowledged intervals as inclusive `(smallest, largest)` pairs, from
    /// the highest packet numbers down.
    pub fn acked_ranges(&self) -> Result<Vec<(u64, u64)>> {
        let mut largest = self.largest_acknowledged;
        let mut smallest = largest
            .checked_sub(self.first_ack_range)
            .ok_or_else(|| {
                anyhow!("First ACK range {} underflows {}", self.first_ack_range, largest)
            })?;
        let mut ranges = vec![(smallest, largest)];

        for range in &self.ack_ranges {
            largest = smallest
                .checked_sub(range.gap + 2)
                .ok_or_else(|| anyhow!("ACK gap {} underflows {}", range.gap, smallest))?;
            smallest = largest.checked_sub(range.ack_range_length).ok_or_else(|| {
                anyhow!("ACK range length {} underflows {}", range.ack_range_length, largest)
            })?;
            ranges.push((smallest, largest));
        }

        Ok(ranges)
    }

    #[cfg(test)]
    pub(crate) fn acked_packet_numbers(&self) -> Result<Vec<u64>> {
        Ok(self
            .acked_ranges()?
            .into_iter()
            .flat_map(|(smallest, largest)| (smallest..=largest).rev())
            .collect())
    }

    pub fn contains(&self, pn: u64) -> bool {
        self.acked_ranges()
            .map(|ranges| ranges.iter().any(|(s, l)| (*s..=*l).contains(&pn)))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoFrame {
    pub offset: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: u64,
    pub offset: u64,
    pub data: Vec<u8>,
    pub fin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetStreamFrame {
    pub stream_id: u64,
    pub application_error_code: u64,
    pub final_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnectionIdFrame {
    pub sequence_number: u64,
    pub retire_prior_to: u64,
    pub connection_id: ConnectionId,
    pub stateless_reset_token: [u8; QUIC_STATELESS_RESET_TOKEN_LENGTH],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame {
    pub error_code: QuicConnectionErrorCode,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuicFrame {
    // A run of consecutive padding bytes
    Padding(usize),
    Ping,
    Ack(AckFrame),
    ResetStream(ResetStreamFrame),
    StopSending {
        stream_id: u64,
        application_error_code: u64,
    },
    Crypto(CryptoFrame),
    NewToken(Vec<u8>),
    Stream(StreamFrame),
    MaxData(u64),
    MaxStreamData {
        stream_id: u64,
        maximum_stream_data: u64,
    },
    MaxStreams {
        bidirectional: bool,
        maximum_streams: u64,
    },
    DataBlocked(u64),
    StreamDataBlocked {
        stream_id: u64,
        maximum_stream_data: u64,
    },
    StreamsBlocked {
        bidirectional: bool,
        maximum_streams: u64,
    },
    NewConnectionId(NewConnectionIdFrame),
    RetireConnectionId(u64),
    PathChallenge([u8; QUIC_PATH_DATA_LENGTH]),
    PathResponse([u8; QUIC_PATH_DATA_LENGTH]),
    ConnectionClose(ConnectionCloseFrame),
    HandshakeDone,
    // Unrecognised type, the payload is the rest of the packet
    Unknown {
        frame_type: u64,
        payload: Vec<u8>,
    },
}

impl QuicFrame {
    pub fn name(&self) -> &'static str {
        match self {
            QuicFrame::Padding(_) => "PADDING",
            QuicFrame::Ping => "PING",
            QuicFrame::Ack(_) => "ACK",
            QuicFrame::ResetStream(_) => "RESET_STREAM",
            QuicFrame::StopSending { .. } => "STOP_SENDING",
            QuicFrame::Crypto(_) => "CRYPTO",
            QuicFrame::NewToken(_) => "NEW_TOKEN",
            QuicFrame::Stream(_) => "STREAM",
            QuicFrame::MaxData(_) => "MAX_DATA",
            QuicFrame::MaxStreamData { .. } => "MAX_STREAM_DATA",
            QuicFrame::MaxStreams { .. } => "MAX_STREAMS",
            QuicFrame::DataBlocked(_) => "DATA_BLOCKED",
            QuicFrame::StreamDataBlocked { .. } => "STREAM_DATA_BLOCKED",
            QuicFrame::StreamsBlocked { .. } => "STREAMS_BLOCKED",
            QuicFrame::NewConnectionId(_) => "NEW_CONNECTION_ID",
            QuicFrame::RetireConnectionId(_) => "RETIRE_CONNECTION_ID",
            QuicFrame::PathChallenge(_) => "PATH_CHALLENGE",
            QuicFrame::PathResponse(_) => "PATH_RESPONSE",
            QuicFrame::ConnectionClose(_) => "CONNECTION_CLOSE",
            QuicFrame::HandshakeDone => "HANDSHAKE_DONE",
            QuicFrame::Unknown { .. } => "UNKNOWN",
        }
    }

    // https://www.rfc-editor.org/rfc/rfc9000.html#section-13.2
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            QuicFrame::Padding(_) | QuicFrame::Ack(_) | QuicFrame::ConnectionClose(_)
        )
    }

    /// Whether the content of a lost frame is sent again. ACKs are
    /// regenerated from fresh state and probes are not repeated.
    pub fn is_retransmittable(&self) -> bool {
        !matches!(
            self,
            QuicFrame::Padding(_)
                | QuicFrame::Ping
                | QuicFrame::Ack(_)
                | QuicFrame::ConnectionClose(_)
                | QuicFrame::PathResponse(_)
                | QuicFrame::Unknown { .. }
        )
    }

    pub fn create_crypto_frame(offset: u64, data: Vec<u8>) -> QuicFrame {
        trace!(
            "Now we are creating Crypto frame, offset {}, length {}",
            offset,
            data.len()
        );
        QuicFrame::Crypto(CryptoFrame { offset, data })
    }

    pub fn create_stream_frame(stream_id: u64, offset: u64, data: Vec<u8>, fin: bool) -> QuicFrame {
        trace!(
            "Now we are creating Stream frame, stream {}, offset {}, length {}, fin flag {}",
            stream_id,
            offset,
            data.len(),
            fin
        );
        QuicFrame::Stream(StreamFrame {
            stream_id,
            offset,
            data,
            fin,
        })
    }

    pub fn create_connection_close_frame(
        error_code: QuicConnectionErrorCode,
        reason: &str,
    ) -> QuicFrame {
        let frame = QuicFrame::ConnectionClose(ConnectionCloseFrame {
            error_code,
            reason: reason.to_string(),
        });
        trace!("Now we are creating {:?} frame", frame);
        frame
    }

    pub fn create_new_connection_id_frame(
        sequence_number: u64,
        connection_id: ConnectionId,
        stateless_reset_token: [u8; QUIC_STATELESS_RESET_TOKEN_LENGTH],
    ) -> QuicFrame {
        let frame = QuicFrame::NewConnectionId(NewConnectionIdFrame {
            sequence_number,
            retire_prior_to: 0,
            connection_id,
            stateless_reset_token,
        });
        trace!("Now we are creating {:?} frame", frame);
        frame
    }

    /// Decodes every frame of a packet payload. A payload without frames is
    /// a protocol violation.
    pub fn decode_frames(payload: &[u8]) -> Result<Vec<QuicFrame>> {
        if payload.is_empty() {
            return Err(anyhow!("Packet payload contains no frame"));
        }

        let mut cursor = Cursor::new(payload);
        let mut frames = vec![];
        while remaining_bytes(&mut cursor)? > 0 {
            frames.push(QuicFrame::decode(&mut cursor)?);
        }
        Ok(frames)
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>) -> Result<QuicFrame> {
        let frame_type = decode_variable_length(cursor)?;
        let _span = trace_span!("decode_frame", frame_type = frame_type).entered();

        let Some(known_type) = QuicFrameType::from_wire(frame_type) else {
            let len = remaining_bytes(cursor)? as usize;
            let payload = read_bytes(cursor, len)?;
            warn!(
                "Unknown frame type {:#x}, keeping the remaining {} bytes",
                frame_type,
                payload.len()
            );
            return Ok(QuicFrame::Unknown {
                frame_type,
                payload,
            });
        };

        let frame = match known_type {
            QuicFrameType::Padding => {
                let mut len = 1;
                while cursor.get_ref().get(cursor.position() as usize) == Some(&0) {
                    cursor.set_position(cursor.position() + 1);
                    len += 1;
                }
                QuicFrame::Padding(len)
            }
            QuicFrameType::Ping => QuicFrame::Ping,
            QuicFrameType::Ack | QuicFrameType::AckEcn => {
                // https://www.rfc-editor.org/rfc/rfc9000.html#section-19.3
                // ACK Frame {
                //   Type (i) = 0x02..0x03,
                //   Largest Acknowledged (i),
                //   ACK Delay (i),
                //   ACK Range Count (i),
                //   First ACK Range (i),
                //   ACK Range (..) ...,
                //   [ECN Counts (..)],
                // }
                let largest_acknowledged = decode_variable_length(cursor)?;
                let ack_delay = decode_variable_length(cursor)?;
                let ack_range_count = decode_variable_length(cursor)?;
                let first_ack_range = decode_variable_length(cursor)?;
                if ack_range_count > remaining_bytes(cursor)? {
                    return Err(anyhow!(
                        "ACK range count {} is larger than the frame",
                        ack_range_count
                    ));
                }
                let mut ack_ranges = Vec::with_capacity(ack_range_count as usize);
                for _ in 0..ack_range_count {
                    ack_ranges.push(AckRange {
                        gap: decode_variable_length(cursor)?,
                        ack_range_length: decode_variable_length(cursor)?,
                    });
                }
                let ecn_counts = if known_type == QuicFrameType::AckEcn {
                    Some(EcnCounts {
                        ect0: decode_variable_length(cursor)?,
                        ect1: decode_variable_length(cursor)?,
                        ce: decode_variable_length(cursor)?,
                    })
                } else {
                    None
                };
                QuicFrame::Ack(AckFrame {
                    largest_acknowledged,
                    ack_delay,
                    first_ack_range,
                    ack_ranges,
                    ecn_counts,
                })
            }
            QuicFrameType::ResetStream => QuicFrame::ResetStream(ResetStreamFrame {
                stream_id: decode_variable_length(cursor)?,
                application_error_code: decode_variable_length(cursor)?,
                final_size: decode_variable_length(cursor)?,
            }),
            QuicFrameType::StopSending => QuicFrame::StopSending {
                stream_id: decode_variable_length(cursor)?,
                application_error_code: decode_variable_length(cursor)?,
            },
            QuicFrameType::Crypto => {
                // CRYPTO Frame {
                //   Type (i) = 0x06,
                //   Offset (i),
                //   Length (i),
                //   Crypto Data (..),
                // }
                let offset = decode_variable_length(cursor)?;
                let data = read_length_prefixed_bytes(cursor)?;
                QuicFrame::Crypto(CryptoFrame { offset, data })
            }
            QuicFrameType::NewToken => QuicFrame::NewToken(read_length_prefixed_bytes(cursor)?),
            QuicFrameType::Stream => {
                // STREAM Frame {
                //   Type (i) = 0x08..0x0f,
                //   Stream ID (i),
                //   [Offset (i)],
                //   [Length (i)],
                //   Stream Data (..),
                // }
                let stream_id = decode_variable_length(cursor)?;
                let offset = if frame_type & STREAM_FRAME_OFF_BIT != 0 {
                    decode_variable_length(cursor)?
                } else {
                    0
                };
                let data = if frame_type & STREAM_FRAME_LEN_BIT != 0 {
                    read_length_prefixed_bytes(cursor)?
                } else {
                    let len = remaining_bytes(cursor)? as usize;
                    read_bytes(cursor, len)?
                };
                QuicFrame::Stream(StreamFrame {
                    stream_id,
                    offset,
                    data,
                    fin: frame_type & STREAM_FRAME_FIN_BIT != 0,
                })
            }
            QuicFrameType::MaxData => QuicFrame::MaxData(decode_variable_length(cursor)?),
            QuicFrameType::MaxStreamData => QuicFrame::MaxStreamData {
                stream_id: decode_variable_length(cursor)?,
                maximum_stream_data: decode_variable_length(cursor)?,
            },
            QuicFrameType::MaxStreams => QuicFrame::MaxStreams {
                bidirectional: frame_type == 0x12,
                maximum_streams: decode_variable_length(cursor)?,
            },
            QuicFrameType::DataBlocked => QuicFrame::DataBlocked(decode_variable_length(cursor)?),
            QuicFrameType::StreamDataBlocked => QuicFrame::StreamDataBlocked {
                stream_id: decode_variable_length(cursor)?,
                maximum_stream_data: decode_variable_length(cursor)?,
            },
            QuicFrameType::StreamsBlocked => QuicFrame::StreamsBlocked {
                bidirectional: frame_type == 0x16,
                maximum_streams: decode_variable_length(cursor)?,
            },
            QuicFrameType::NewConnectionId => {
                // NEW_CONNECTION_ID Frame {
                //   Type (i) = 0x18,
                //   Sequence Number (i),
                //   Retire Prior To (i),
                //   Length (8),
                //   Connection ID (8..160),
                //   Stateless Reset Token (128),
                // }
                let sequence_number = decode_variable_length(cursor)?;
                let retire_prior_to = decode_variable_length(cursor)?;
                if retire_prior_to > sequence_number {
                    return Err(anyhow!(
                        "Retire prior to {} is larger than sequence number {}",
                        retire_prior_to,
                        sequence_number
                    ));
                }
                let cid_len = cursor.read_u8()? as usize;
                if cid_len == 0 {
                    return Err(anyhow!("NEW_CONNECTION_ID carries an empty connection id"));
                }
                let connection_id = ConnectionId::new(&read_bytes(cursor, cid_len)?)?;
                let mut stateless_reset_token = [0u8; QUIC_STATELESS_RESET_TOKEN_LENGTH];
                cursor.read_exact(&mut stateless_reset_token)?;
                QuicFrame::NewConnectionId(NewConnectionIdFrame {
                    sequence_number,
                    retire_prior_to,
                    connection_id,
                    stateless_reset_token,
                })
            }
            QuicFrameType::RetireConnectionId => {
                QuicFrame::RetireConnectionId(decode_variable_length(cursor)?)
            }
            QuicFrameType::PathChallenge => {
                let mut data = [0u8; QUIC_PATH_DATA_LENGTH];
                cursor.read_exact(&mut data)?;
                QuicFrame::PathChallenge(data)
            }
            QuicFrameType::PathResponse => {
                let mut data = [0u8; QUIC_PATH_DATA_LENGTH];
                cursor.read_exact(&mut data)?;
                QuicFrame::PathResponse(data)
            }
            QuicFrameType::ConnectionClose => {
                // CONNECTION_CLOSE Frame {
                //   Type (i) = 0x1c..0x1d,
                //   Error Code (i),
                //   [Frame Type (i)],
                //   Reason Phrase Length (i),
                //   Reason Phrase (..),
                // }
                let code = decode_variable_length(cursor)?;
                let error_code = if frame_type == 0x1c {
                    let trigger = decode_variable_length(cursor)?;
                    QuicConnectionErrorCode::create_transport_error_code(
                        code,
                        (trigger != 0).then_some(trigger),
                    )
                } else {
                    QuicConnectionErrorCode::create_application_error_code(code)
                };
                let reason =
                    String::from_utf8_lossy(&read_length_prefixed_bytes(cursor)?).into_owned();
                QuicFrame::ConnectionClose(ConnectionCloseFrame { error_code, reason })
            }
            QuicFrameType::HandshakeDone => QuicFrame::HandshakeDone,
        };

        trace!("Decoded {} frame {:?}", frame.name(), frame);
        Ok(frame)
    }

    pub fn encode<W>(&self, cursor: &mut W) -> Result<()>
    where
        W: Write,
    {
        match self {
            QuicFrame::Padding(len) => {
                for _ in 0..*len {
                    cursor.write_u8(0x00)?;
                }
            }
            QuicFrame::Ping => {
                encode_variable_length(cursor, 0x01)?;
            }
            QuicFrame::Ack(ack) => {
                let frame_type = if ack.ecn_counts.is_some() { 0x03 } else { 0x02 };
                encode_variable_length(cursor, frame_type)?;
                encode_variable_length(cursor, ack.largest_acknowledged)?;
                encode_variable_length(cursor, ack.ack_delay)?;
                encode_variable_length(cursor, ack.ack_range_count())?;
                encode_variable_length(cursor, ack.first_ack_range)?;
                for range in &ack.ack_ranges {
                    encode_variable_length(cursor, range.gap)?;
                    encode_variable_length(cursor, range.ack_range_length)?;
                }
                if let Some(ecn) = ack.ecn_counts {
                    encode_variable_length(cursor, ecn.ect0)?;
                    encode_variable_length(cursor, ecn.ect1)?;
                    encode_variable_length(cursor, ecn.ce)?;
                }
            }
            QuicFrame::ResetStream(reset) => {
                encode_variable_length(cursor, 0x04)?;
                encode_variable_length(cursor, reset.stream_id)?;
                encode_variable_length(cursor, reset.application_error_code)?;
                encode_variable_length(cursor, reset.final_size)?;
            }
            QuicFrame::StopSending {
                stream_id,
                application_error_code,
            } => {
                encode_variable_length(cursor, 0x05)?;
                encode_variable_length(cursor, *stream_id)?;
                encode_variable_length(cursor, *application_error_code)?;
            }
            QuicFrame::Crypto(crypto) => {
                encode_variable_length(cursor, 0x06)?;
                encode_variable_length(cursor, crypto.offset)?;
                write_length_prefixed_bytes(cursor, &crypto.data)?;
            }
            QuicFrame::NewToken(token) => {
                encode_variable_length(cursor, 0x07)?;
                write_length_prefixed_bytes(cursor, token)?;
            }
            QuicFrame::Stream(stream) => {
                let mut frame_type = 0x08 | STREAM_FRAME_LEN_BIT;
                if stream.offset > 0 {
                    frame_type |= STREAM_FRAME_OFF_BIT;
                }
                if stream.fin {
                    frame_type |= STREAM_FRAME_FIN_BIT;
                }
                encode_variable_length(cursor, frame_type)?;
                encode_variable_length(cursor, stream.stream_id)?;
                if stream.offset > 0 {
                    encode_variable_length(cursor, stream.offset)?;
                }
                write_length_prefixed_bytes(cursor, &stream.data)?;
            }
            QuicFrame::MaxData(max) => {
                encode_variable_length(cursor, 0x10)?;
                encode_variable_length(cursor, *max)?;
            }
            QuicFrame::MaxStreamData {
                stream_id,
                maximum_stream_data,
            } => {
                encode_variable_length(cursor, 0x11)?;
                encode_variable_length(cursor, *stream_id)?;
                encode_variable_length(cursor, *maximum_stream_data)?;
            }
            QuicFrame::MaxStreams {
                bidirectional,
                maximum_streams,
            } => {
                encode_variable_length(cursor, if *bidirectional { 0x12 } else { 0x13 })?;
                encode_variable_length(cursor, *maximum_streams)?;
            }
            QuicFrame::DataBlocked(limit) => {
                encode_variable_length(cursor, 0x14)?;
                encode_variable_length(cursor, *limit)?;
            }
            QuicFrame::StreamDataBlocked {
                stream_id,
                maximum_stream_data,
            } => {
                encode_variable_length(cursor, 0x15)?;
                encode_variable_length(cursor, *stream_id)?;
                encode_variable_length(cursor, *maximum_stream_data)?;
            }
            QuicFrame::StreamsBlocked {
                bidirectional,
                maximum_streams,
            } => {
                encode_variable_length(cursor, if *bidirectional { 0x16 } else { 0x17 })?;
                encode_variable_length(cursor, *maximum_streams)?;
            }
            QuicFrame::NewConnectionId(new_cid) => {
                encode_variable_length(cursor, 0x18)?;
                encode_variable_length(cursor, new_cid.sequence_number)?;
                encode_variable_length(cursor, new_cid.retire_prior_to)?;
                cursor.write_u8(new_cid.connection_id.len() as u8)?;
                cursor.write_all(new_cid.connection_id.as_bytes())?;
                cursor.write_all(&new_cid.stateless_reset_token)?;
            }
            QuicFrame::RetireConnectionId(sequence_number) => {
                encode_variable_length(cursor, 0x19)?;
                encode_variable_length(cursor, *sequence_number)?;
            }
            QuicFrame::PathChallenge(data) => {
                encode_variable_length(cursor, 0x1a)?;
                cursor.write_all(data)?;
            }
            QuicFrame::PathResponse(data) => {
                encode_variable_length(cursor, 0x1b)?;
                cursor.write_all(data)?;
            }
            QuicFrame::ConnectionClose(close) => match close.error_code {
                QuicConnectionErrorCode::TransportErrorCode((code, trigger)) => {
                    encode_variable_length(cursor, 0x1c)?;
                    encode_variable_length(cursor, u64::from(code))?;
                    encode_variable_length(cursor, trigger.unwrap_or(0))?;
                    write_length_prefixed_bytes(cursor, close.reason.as_bytes())?;
                }
                QuicConnectionErrorCode::ApplicationErrorCode(code) => {
                    encode_variable_length(cursor, 0x1d)?;
                    encode_variable_length(cursor, code)?;
                    write_length_prefixed_bytes(cursor, close.reason.as_bytes())?;
                }
            },
            QuicFrame::HandshakeDone => {
                encode_variable_length(cursor, 0x1e)?;
            }
            QuicFrame::Unknown {
                frame_type,
                payload,
            } => {
                encode_variable_length(cursor, *frame_type)?;
                cursor.write_all(payload)?;
            }
        }

        Ok(())
    }

    pub fn encode_frames(frames: &[QuicFrame]) -> Result<Vec<u8>> {
        let mut payload = vec![];
        for frame in frames {
            frame.encode(&mut payload)?;
        }
        Ok(payload)
    }

    pub fn encoded_len(&self) -> Result<usize> {
        let mut buf = vec![];
        self.encode(&mut buf)?;
        Ok(buf.len())
    }

    /// Cuts this frame so that its encoding fits in `remain` bytes. Returns
    /// the part to send now and the remainder to queue again. Only CRYPTO
    /// and STREAM data can be split; ACK ranges are trimmed from the oldest.
    pub fn split_to_fit(self, remain: usize) -> Result<(Option<QuicFrame>, Option<QuicFrame>)> {
        if self.encoded_len()? <= remain {
            return Ok((Some(self), None));
        }

        match self {
            QuicFrame::Crypto(crypto) => {
                let header = 1 + get_variable_length(crypto.offset)? as usize;
                let Some(take) = fitting_data_len(remain, header, crypto.data.len())? else {
                    return Ok((None, Some(QuicFrame::Crypto(crypto))));
                };
                let mut head = crypto.data;
                let tail = head.split_off(take);
                trace!(
                    "Have to split the crypto frame at offset {}, sending {} bytes, {} left",
                    crypto.offset,
                    take,
                    tail.len()
                );
                Ok((
                    Some(QuicFrame::create_crypto_frame(crypto.offset, head)),
                    Some(QuicFrame::create_crypto_frame(crypto.offset + take as u64, tail)),
                ))
            }
            QuicFrame::Stream(stream) => {
                // The split-off head may gain an offset field it did not have
                let header = 1
                    + get_variable_length(stream.stream_id)? as usize
                    + get_variable_length(stream.offset.max(1))? as usize;
                let Some(take) = fitting_data_len(remain, header, stream.data.len())? else {
                    return Ok((None, Some(QuicFrame::Stream(stream))));
                };
                let mut head = stream.data;
                let tail = head.split_off(take);
                trace!(
                    "Have to split the stream {} frame at offset {}, sending {} bytes, {} left",
                    stream.stream_id,
                    stream.offset,
                    take,
                    tail.len()
                );
                Ok((
                    Some(QuicFrame::create_stream_frame(
                        stream.stream_id,
                        stream.offset,
                        head,
                        false,
                    )),
                    Some(QuicFrame::create_stream_frame(
                        stream.stream_id,
                        stream.offset + take as u64,
                        tail,
                        stream.fin,
                    )),
                ))
            }
            QuicFrame::Ack(mut ack) => {
                while !ack.ack_ranges.is_empty() {
                    ack.ack_ranges.pop();
                    if QuicFrame::Ack(ack.clone()).encoded_len()? <= remain {
                        warn!(
                            "Only {} bytes left, ACK frame keeps {} ranges",
                            remain,
                            ack.ack_ranges.len()
                        );
                        return Ok((Some(QuicFrame::Ack(ack)), None));
                    }
                }
                Ok((None, Some(QuicFrame::Ack(ack))))
            }
            other => Ok((None, Some(other))),
        }
    }
}

// Largest data length whose frame fits, or None when not even one byte does
fn fitting_data_len(remain: usize, header: usize, data_len: usize) -> Result<Option<usize>> {
    let mut take = remain.saturating_sub(header + 2).min(data_len);
    while take > 0 && header + get_variable_length(take as u64)? as usize + take > remain {
        take -= 1;
    }
    Ok((take > 0).then_some(take))
}
