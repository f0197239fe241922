use anyhow::{anyhow, Result};
use std::io::{Cursor, Write};
use tracing::{trace, warn};

use crate::utils::{
    decode_variable_length, encode_variable_length, read_bytes, remaining_bytes,
    write_length_prefixed_bytes,
};

// https://www.rfc-editor.org/rfc/rfc9114.html#section-7.2
const HTTP3_FRAME_DATA: u64 = 0x00;
const HTTP3_FRAME_HEADERS: u64 = 0x01;
const HTTP3_FRAME_SETTINGS: u64 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Http3SettingParam {
    // https://www.rfc-editor.org/rfc/rfc9204.html#section-5
    QpackMaxTableCapacity,
    MaxFieldSectionSize,
    QpackBlockedStreams,
    // https://www.rfc-editor.org/rfc/rfc9220.html#section-5
    EnableConnectProtocol,
    // https://www.rfc-editor.org/rfc/rfc9297.html#section-2.1.1
    H3Datagram,
    H3DatagramDraft,
    EnableMetadata,
}

impl Http3SettingParam {
    // Serialization order
    const ALL: [Http3SettingParam; 7] = [
        Http3SettingParam::QpackMaxTableCapacity,
        Http3SettingParam::QpackBlockedStreams,
        Http3SettingParam::MaxFieldSectionSize,
        Http3SettingParam::EnableConnectProtocol,
        Http3SettingParam::H3Datagram,
        Http3SettingParam::H3DatagramDraft,
        Http3SettingParam::EnableMetadata,
    ];

    pub fn id(&self) -> u64 {
        match self {
            Http3SettingParam::QpackMaxTableCapacity => 0x01,
            Http3SettingParam::MaxFieldSectionSize => 0x06,
            Http3SettingParam::QpackBlockedStreams => 0x07,
            Http3SettingParam::EnableConnectProtocol => 0x08,
            Http3SettingParam::H3Datagram => 0x33,
            Http3SettingParam::H3DatagramDraft => 0x276,
            Http3SettingParam::EnableMetadata => 0x4d44,
        }
    }

    pub fn default_value(&self) -> u64 {
        match self {
            // Unlimited
            Http3SettingParam::MaxFieldSectionSize => u64::MAX,
            _ => 0,
        }
    }

    fn from_id(id: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|param| param.id() == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http3Settings {
    pub qpack_max_table_capacity: u64,
    pub max_field_section_size: u64,
    pub qpack_blocked_streams: u64,
    pub enable_connect_protocol: u64,
    pub h3_datagram: u64,
    pub h3_datagram_draft: u64,
    pub enable_metadata: u64,
}

impl Default for Http3Settings {
    fn default() -> Self {
        let mut settings = Self {
            qpack_max_table_capacity: 0,
            max_field_section_size: 0,
            qpack_blocked_streams: 0,
            enable_connect_protocol: 0,
            h3_datagram: 0,
            h3_datagram_draft: 0,
            enable_metadata: 0,
        };
        for param in Http3SettingParam::ALL {
            settings.set(param, param.default_value());
        }
        settings
    }
}

impl Http3Settings {
    pub fn get(&self, param: Http3SettingParam) -> u64 {
        match param {
            Http3SettingParam::QpackMaxTableCapacity => self.qpack_max_table_capacity,
            Http3SettingParam::MaxFieldSectionSize => self.max_field_section_size,
            Http3SettingParam::QpackBlockedStreams => self.qpack_blocked_streams,
            Http3SettingParam::EnableConnectProtocol => self.enable_connect_protocol,
            Http3SettingParam::H3Datagram => self.h3_datagram,
            Http3SettingParam::H3DatagramDraft => self.h3_datagram_draft,
            Http3SettingParam::EnableMetadata => self.enable_metadata,
        }
    }

    pub fn set(&mut self, param: Http3SettingParam, value: u64) {
        let field = match param {
            Http3SettingParam::QpackMaxTableCapacity => &mut self.qpack_max_table_capacity,
            Http3SettingParam::MaxFieldSectionSize => &mut self.max_field_section_size,
            Http3SettingParam::QpackBlockedStreams => &mut self.qpack_blocked_streams,
            Http3SettingParam::EnableConnectProtocol => &mut self.enable_connect_protocol,
            Http3SettingParam::H3Datagram => &mut self.h3_datagram,
            Http3SettingParam::H3DatagramDraft => &mut self.h3_datagram_draft,
            Http3SettingParam::EnableMetadata => &mut self.enable_metadata,
        };
        *field = value;
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);
        let mut settings = Http3Settings::default();
        while remaining_bytes(&mut cursor)? > 0 {
            let id = decode_variable_length(&mut cursor)?;
            let value = decode_variable_length(&mut cursor)?;
            match Http3SettingParam::from_id(id) {
                Some(param) => settings.set(param, value),
                None => trace!("Ignore unknown HTTP/3 setting {:#x} = {}", id, value),
            }
        }
        Ok(settings)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut payload = vec![];
        for param in Http3SettingParam::ALL {
            let value = self.get(param);
            if value != param.default_value() {
                encode_variable_length(&mut payload, param.id())?;
                encode_variable_length(&mut payload, value)?;
            }
        }
        Ok(payload)
    }
}

// HTTP/3 Frame Format {
//   Type (i),
//   Length (i),
//   Frame Payload (..),
// }
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Http3Frame {
    Data(Vec<u8>),
    // QPACK encoded field section, kept opaque
    Headers(Vec<u8>),
    Settings(Http3Settings),
    Grease {
        frame_type: u64,
        payload: Vec<u8>,
        // The declared length overran the buffer, `payload` holds everything after the type
        truncated: bool,
    },
}

impl Http3Frame {
    pub fn decode_frames(bytes: &[u8]) -> Result<Vec<Http3Frame>> {
        let mut cursor = Cursor::new(bytes);
        let mut frames = vec![];
        while remaining_bytes(&mut cursor)? > 0 {
            frames.push(Http3Frame::decode(&mut cursor)?);
        }
        Ok(frames)
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>) -> Result<Http3Frame> {
        let frame_type = decode_variable_length(cursor)?;
        let length_start = cursor.position();
        let length = decode_variable_length(cursor)?;
        let remain = remaining_bytes(cursor)?;

        let frame = match frame_type {
            HTTP3_FRAME_DATA | HTTP3_FRAME_HEADERS | HTTP3_FRAME_SETTINGS if length > remain => {
                return Err(anyhow!(
                    "HTTP/3 frame {:#x} declares {} bytes, only {} left",
                    frame_type,
                    length,
                    remain
                ));
            }
            HTTP3_FRAME_DATA => Http3Frame::Data(read_bytes(cursor, length as usize)?),
            HTTP3_FRAME_HEADERS => Http3Frame::Headers(read_bytes(cursor, length as usize)?),
            HTTP3_FRAME_SETTINGS => {
                Http3Frame::Settings(Http3Settings::decode(&read_bytes(cursor, length as usize)?)?)
            }
            _ if length > remain => {
                cursor.set_position(length_start);
                let rest = remaining_bytes(cursor)? as usize;
                warn!(
                    "Grease frame {:#x} declares {} bytes, taking the remaining {}",
                    frame_type, length, rest
                );
                Http3Frame::Grease {
                    frame_type,
                    payload: read_bytes(cursor, rest)?,
                    truncated: true,
                }
            }
            _ => Http3Frame::Grease {
                frame_type,
                payload: read_bytes(cursor, length as usize)?,
                truncated: false,
            },
        };

        trace!("Decoded HTTP/3 frame {:?}", frame);
        Ok(frame)
    }

    pub fn encode<W>(&self, cursor: &mut W) -> Result<()>
    where
        W: Write,
    {
        match self {
            Http3Frame::Data(data) => {
                encode_variable_length(cursor, HTTP3_FRAME_DATA)?;
                write_length_prefixed_bytes(cursor, data)?;
            }
            Http3Frame::Headers(field_section) => {
                encode_variable_length(cursor, HTTP3_FRAME_HEADERS)?;
                write_length_prefixed_bytes(cursor, field_section)?;
            }
            Http3Frame::Settings(settings) => {
                encode_variable_length(cursor, HTTP3_FRAME_SETTINGS)?;
                write_length_prefixed_bytes(cursor, &settings.encode()?)?;
            }
            Http3Frame::Grease {
                frame_type,
                payload,
                truncated,
            } => {
                encode_variable_length(cursor, *frame_type)?;
                if *truncated {
                    cursor.write_all(payload)?;
                } else {
                    write_length_prefixed_bytes(cursor, payload)?;
                }
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![];
        self.encode(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn test_settings_omit_default_values() -> Result<()> {
        let test_cases = vec![
            // Explicit defaults disappear
            ("040401000700", "0400"),
            ("0402010a", "0402010a"),
            // A curl SETTINGS frame with a grease setting at the end
            ("040f06ffffffffffffffff010007003300", "040906ffffffffffffffff"),
        ];

        for (input, expected) in test_cases {
            let frames = Http3Frame::decode_frames(&hex(input))?;
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].to_bytes()?, hex(expected), "{input}");
        }

        assert_eq!(Http3Frame::Settings(Http3Settings::default()).to_bytes()?, hex("0400"));
        Ok(())
    }

    #[test]
    fn test_settings_fields() -> Result<()> {
        let frames = Http3Frame::decode_frames(&hex("04090108330180004d4401"))?;
        let Http3Frame::Settings(settings) = &frames[0] else {
            return Err(anyhow!("expected SETTINGS"));
        };
        assert_eq!(settings.get(Http3SettingParam::QpackMaxTableCapacity), 8);
        assert_eq!(settings.h3_datagram, 1);
        assert_eq!(settings.enable_metadata, 1);
        assert_eq!(settings.max_field_section_size, u64::MAX);
        Ok(())
    }

    #[test]
    fn test_data_and_headers() -> Result<()> {
        let bytes = hex("0003616263010200ff");
        let frames = Http3Frame::decode_frames(&bytes)?;
        assert_eq!(
            frames,
            vec![Http3Frame::Data(b"abc".to_vec()), Http3Frame::Headers(vec![0x00, 0xff])]
        );

        let mut encoded = vec![];
        for frame in &frames {
            frame.encode(&mut encoded)?;
        }
        assert_eq!(encoded, bytes);

        assert!(Http3Frame::decode_frames(&hex("000561")).is_err());
        Ok(())
    }

    #[test]
    fn test_unknown_type_is_grease() -> Result<()> {
        // Reserved type 0x21
        let frames = Http3Frame::decode_frames(&hex("2102aabb"))?;
        assert_eq!(
            frames,
            vec![Http3Frame::Grease {
                frame_type: 0x21,
                payload: vec![0xaa, 0xbb],
                truncated: false
            }]
        );

        // Declared length beyond the buffer
        let bytes = hex("2110aabb");
        let frames = Http3Frame::decode_frames(&bytes)?;
        assert_eq!(
            frames,
            vec![Http3Frame::Grease {
                frame_type: 0x21,
                payload: vec![0x10, 0xaa, 0xbb],
                truncated: true
            }]
        );
        assert_eq!(frames[0].to_bytes()?, bytes);
        Ok(())
    }
}
