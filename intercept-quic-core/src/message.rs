use anyhow::Result;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};
use tracing::trace;

use crate::utils::{read_bytes, remaining_bytes};

// Stream ID (u64) followed by the data length (u64)
const QUIC_MESSAGE_HEADER_LENGTH: u64 = 16;

/// The unit the proxy relays between the two halves of a forwarded
/// connection: one delivery of stream data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuicMessage {
    pub stream_id: u64,
    pub data: Vec<u8>,
}

impl QuicMessage {
    pub fn new(stream_id: u64, data: Vec<u8>) -> Self {
        Self { stream_id, data }
    }

    // QuicMessage {
    //   Stream ID (64),
    //   Length (64),
    //   Data (..),
    // }
    pub fn encode<W>(&self, cursor: &mut W) -> Result<()>
    where
        W: Write,
    {
        cursor.write_u64::<BigEndian>(self.stream_id)?;
        cursor.write_u64::<BigEndian>(self.data.len() as u64)?;
        cursor.write_all(&self.data)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(QUIC_MESSAGE_HEADER_LENGTH as usize + self.data.len());
        self.encode(&mut buf)?;
        Ok(buf)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuicMessages(Vec<QuicMessage>);

impl QuicMessages {
    /// Parses back-to-back messages. A trailing partial message is left
    /// unparsed; the returned count tells how many bytes were consumed.
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = Cursor::new(bytes);
        let mut messages = vec![];
        let mut consumed = 0;

        while remaining_bytes(&mut cursor)? > QUIC_MESSAGE_HEADER_LENGTH {
            let stream_id = cursor.read_u64::<BigEndian>()?;
            let length = cursor.read_u64::<BigEndian>()?;
            if remaining_bytes(&mut cursor)? < length {
                trace!(
                    "Partial message for stream {}, need {} bytes, have {}",
                    stream_id,
                    length,
                    remaining_bytes(&mut cursor)?
                );
                break;
            }
            messages.push(QuicMessage::new(stream_id, read_bytes(&mut cursor, length as usize)?));
            consumed = cursor.position() as usize;
        }

        Ok((Self(messages), consumed))
    }

    pub fn push(&mut self, message: QuicMessage) {
        self.0.push(message);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QuicMessage> {
        self.0.iter()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![];
        for message in &self.0 {
            message.encode(&mut buf)?;
        }
        Ok(buf)
    }
}

impl IntoIterator for QuicMessages {
    type Item = QuicMessage;
    type IntoIter = std::vec::IntoIter<QuicMessage>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<Vec<QuicMessage>> for QuicMessages {
    fn from(messages: Vec<QuicMessage>) -> Self {
        Self(messages)
    }
}
