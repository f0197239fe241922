use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{trace, warn};

use crate::frame::{CryptoFrame, QuicFrame, StreamFrame};
use crate::message::QuicMessage;

const QUIC_FRAME_CHUNK_SIZE: usize = 1200;

// Handshake Message {
//   Type (8),
//   Length (24),
//   Body (..),
// }
const TLS_HANDSHAKE_HEADER_LENGTH: usize = 4;

// https://www.rfc-editor.org/rfc/rfc9000.html#section-2.1
pub(crate) fn is_bidirectional_stream(stream_id: u64) -> bool {
    stream_id & 0x02 == 0
}

/// Byte ranges received at arbitrary offsets, read back in order.
#[derive(Debug, Default)]
pub(crate) struct RangeBuffer {
    fragments: BTreeMap<u64, Vec<u8>>,
    read_offset: u64,
}

impl RangeBuffer {
    pub(crate) fn insert(&mut self, offset: u64, data: Vec<u8>) {
        let end = offset + data.len() as u64;
        if data.is_empty() || end <= self.read_offset {
            trace!("Fragment [{}, {}) was already read", offset, end);
            return;
        }
        if self
            .fragments
            .get(&offset)
            .is_some_and(|existing| existing.len() >= data.len())
        {
            return;
        }
        self.fragments.insert(offset, data);
    }

    /// Takes every byte contiguous with what was read before. Overlapping
    /// fragments contribute only their new tail.
    pub(crate) fn read_contiguous(&mut self) -> Vec<u8> {
        let mut out = vec![];
        while let Some(entry) = self.fragments.first_entry() {
            let offset = *entry.key();
            if offset > self.read_offset {
                break;
            }
            let data = entry.remove();
            let end = offset + data.len() as u64;
            if end > self.read_offset {
                let skip = (self.read_offset - offset) as usize;
                out.extend_from_slice(&data[skip..]);
                self.read_offset = end;
            }
        }
        out
    }

    pub(crate) fn read_offset(&self) -> u64 {
        self.read_offset
    }
}

/// Turns CRYPTO frames of one level into complete TLS handshake messages.
#[derive(Debug, Default)]
pub(crate) struct CryptoFramesToMessages {
    buffer: RangeBuffer,
    pending: Vec<u8>,
}

impl CryptoFramesToMessages {
    pub(crate) fn push(&mut self, frame: CryptoFrame) -> Vec<Vec<u8>> {
        self.buffer.insert(frame.offset, frame.data);
        self.pending.extend(self.buffer.read_contiguous());

        let mut messages = vec![];
        while self.pending.len() >= TLS_HANDSHAKE_HEADER_LENGTH {
            let body_len =
                u32::from_be_bytes([0, self.pending[1], self.pending[2], self.pending[3]]) as usize;
            let total = TLS_HANDSHAKE_HEADER_LENGTH + body_len;
            if self.pending.len() < total {
                break;
            }
            let rest = self.pending.split_off(total);
            let message = std::mem::replace(&mut self.pending, rest);
            trace!("Handshake message type {} of {} bytes is complete", message[0], total);
            messages.push(message);
        }
        messages
    }
}

/// Cuts outgoing handshake bytes of one level into CRYPTO frames.
#[derive(Debug, Default)]
pub(crate) struct MessagesToCryptoFrames {
    offset: u64,
}

impl MessagesToCryptoFrames {
    pub(crate) fn to_frames(&mut self, data: &[u8]) -> Vec<QuicFrame> {
        data.chunks(QUIC_FRAME_CHUNK_SIZE)
            .map(|chunk| {
                let frame = QuicFrame::create_crypto_frame(self.offset, chunk.to_vec());
                self.offset += chunk.len() as u64;
                frame
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct ReceiveStream {
    buffer: RangeBuffer,
    pending: Vec<u8>,
    fin_offset: Option<u64>,
}

impl ReceiveStream {
    fn is_finished(&self) -> bool {
        self.fin_offset == Some(self.buffer.read_offset())
    }
}

/// Streams that are done. Per stream type, every index below the floor is
/// finished; ids finished out of order wait in `above` until the floor
/// catches up with them.
#[derive(Debug, Default)]
struct FinishedStreams {
    floors: [u64; 4],
    above: BTreeSet<u64>,
}

impl FinishedStreams {
    fn contains(&self, stream_id: u64) -> bool {
        stream_id >> 2 < self.floors[(stream_id & 0x03) as usize] || self.above.contains(&stream_id)
    }

    fn insert(&mut self, stream_id: u64) {
        let kind = (stream_id & 0x03) as usize;
        if stream_id >> 2 < self.floors[kind] {
            return;
        }
        self.above.insert(stream_id);
        while self.above.remove(&((self.floors[kind] << 2) | kind as u64)) {
            self.floors[kind] += 1;
        }
    }
}

/// Reassembles STREAM frames into messages. A bidirectional stream is
/// delivered once, when everything up to FIN is there. A unidirectional
/// stream delivers every newly contiguous chunk. Finished streams are
/// forgotten and late frames for them are dropped.
#[derive(Debug, Default)]
pub(crate) struct StreamReassembler {
    streams: HashMap<u64, ReceiveStream>,
    finished: FinishedStreams,
}

impl StreamReassembler {
    pub(crate) fn push(&mut self, frame: StreamFrame) -> Option<QuicMessage> {
        let stream_id = frame.stream_id;
        if self.finished.contains(stream_id) {
            trace!("Stream {} is finished, drop frame at {}", stream_id, frame.offset);
            return None;
        }
        let stream = self.streams.entry(stream_id).or_default();

        if frame.fin {
            let fin_offset = frame.offset + frame.data.len() as u64;
            match stream.fin_offset {
                Some(known) if known != fin_offset => {
                    warn!(
                        "Stream {} final size changed from {} to {}",
                        stream_id, known, fin_offset
                    );
                }
                _ => stream.fin_offset = Some(fin_offset),
            }
        }
        stream.buffer.insert(frame.offset, frame.data);
        let chunk = stream.buffer.read_contiguous();

        let message = if is_bidirectional_stream(stream_id) {
            stream.pending.extend(chunk);
            if !stream.is_finished() {
                return None;
            }
            let data = std::mem::take(&mut stream.pending);
            trace!("Stream {} is complete with {} bytes", stream_id, data.len());
            Some(QuicMessage::new(stream_id, data))
        } else if chunk.is_empty() {
            None
        } else {
            Some(QuicMessage::new(stream_id, chunk))
        };

        if stream.is_finished() {
            self.streams.remove(&stream_id);
            self.finished.insert(stream_id);
        }
        message
    }
}

/// Cuts outgoing messages into STREAM frames.
#[derive(Debug, Default)]
pub(crate) struct MessagesToStreamFrames {
    uni_offsets: HashMap<u64, u64>,
}

impl MessagesToStreamFrames {
    pub(crate) fn to_frames(&mut self, message: &QuicMessage) -> Vec<QuicFrame> {
        let stream_id = message.stream_id;
        if is_bidirectional_stream(stream_id) {
            if message.data.is_empty() {
                return vec![QuicFrame::create_stream_frame(stream_id, 0, vec![], true)];
            }
            let count = message.data.len().div_ceil(QUIC_FRAME_CHUNK_SIZE);
            return message
                .data
                .chunks(QUIC_FRAME_CHUNK_SIZE)
                .enumerate()
                .map(|(i, chunk)| {
                    QuicFrame::create_stream_frame(
                        stream_id,
                        (i * QUIC_FRAME_CHUNK_SIZE) as u64,
                        chunk.to_vec(),
                        i + 1 == count,
                    )
                })
                .collect();
        }

        let offset = self.uni_offsets.entry(stream_id).or_default();
        message
            .data
            .chunks(QUIC_FRAME_CHUNK_SIZE)
            .map(|chunk| {
                let frame =
                    QuicFrame::create_stream_frame(stream_id, *offset, chunk.to_vec(), false);
                *offset += chunk.len() as u64;
                frame
            })
            .collect()
    }
}
