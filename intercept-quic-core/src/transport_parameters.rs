use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use tracing::{trace, warn};

use crate::cid::ConnectionId;
use crate::config::QuicConfig;
use crate::utils::{
    decode_variable_length, encode_variable_length, get_variable_length, read_bytes,
    remaining_bytes,
};

pub const MAX_UDP_PAYLOAD_SIZE: u16 = 65527;
pub const MIN_UDP_PAYLOAD_SIZE: u16 = 1200;

// https://www.rfc-editor.org/rfc/rfc9000.html#section-18.2-4.30.1
pub const MIN_ACTIVE_CONNECTION_ID_LIMIT: u64 = 2;
const MAX_ACK_DELAY_EXPONENT: u64 = 20;
const MAX_ACK_DELAY_LIMIT: u64 = 1 << 14;
const DEFAULT_ACK_DELAY_EXPONENT: u8 = 3;
const DEFAULT_MAX_ACK_DELAY: u16 = 25;

const QUIC_STATELESS_RESET_TOKEN_SIZE: usize = 16;

// Transport Parameter Type IDs as defined in RFC 9000 Section 18.2
pub(crate) mod transport_param_type {
    pub const ORIGINAL_DESTINATION_CONNECTION_ID: u64 = 0x00;
    pub const MAX_IDLE_TIMEOUT: u64 = 0x01;
    pub const STATELESS_RESET_TOKEN: u64 = 0x02;
    pub const MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
    pub const INITIAL_MAX_DATA: u64 = 0x04;
    pub const INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
    pub const INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
    pub const INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
    pub const INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
    pub const INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
    pub const ACK_DELAY_EXPONENT: u64 = 0x0A;
    pub const MAX_ACK_DELAY: u64 = 0x0B;
    pub const DISABLE_ACTIVE_MIGRATION: u64 = 0x0C;
    pub const PREFERRED_ADDRESS: u64 = 0x0D;
    pub const ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0E;
    pub const INITIAL_SOURCE_CONNECTION_ID: u64 = 0x0F;
    pub const RETRY_SOURCE_CONNECTION_ID: u64 = 0x10;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferredAddress {
    pub ipv4_address: Ipv4Addr,
    pub ipv4_port: u16,
    pub ipv6_address: Ipv6Addr,
    pub ipv6_port: u16,
    pub connection_id: ConnectionId,
    pub stateless_reset_token: [u8; QUIC_STATELESS_RESET_TOKEN_SIZE],
}

impl PreferredAddress {
    // Preferred Address {
    //   IPv4 Address (32),
    //   IPv4 Port (16),
    //   IPv6 Address (128),
    //   IPv6 Port (16),
    //   Connection ID Length (8),
    //   Connection ID (..),
    //   Stateless Reset Token (128),
    // }
    fn decode(value: &[u8]) -> Result<Self> {
        // 4 + 2 + 16 + 2 + 1 + 0 + 16
        if value.len() < 41 {
            return Err(anyhow!(
                "Invalid preferred address length: expected at least 41 bytes, got {}",
                value.len()
            ));
        }

        let mut cursor = Cursor::new(value);
        let mut ipv4_bytes = [0u8; 4];
        cursor.read_exact(&mut ipv4_bytes)?;
        let ipv4_port = cursor.read_u16::<BigEndian>()?;
        let mut ipv6_bytes = [0u8; 16];
        cursor.read_exact(&mut ipv6_bytes)?;
        let ipv6_port = cursor.read_u16::<BigEndian>()?;
        let cid_len = cursor.read_u8()? as usize;
        let connection_id = ConnectionId::new(&read_bytes(&mut cursor, cid_len)?)?;
        let mut stateless_reset_token = [0u8; QUIC_STATELESS_RESET_TOKEN_SIZE];
        cursor.read_exact(&mut stateless_reset_token)?;

        Ok(Self {
            ipv4_address: Ipv4Addr::from(ipv4_bytes),
            ipv4_port,
            ipv6_address: Ipv6Addr::from(ipv6_bytes),
            ipv6_port,
            connection_id,
            stateless_reset_token,
        })
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = vec![];
        buf.write_all(&self.ipv4_address.octets())?;
        buf.write_u16::<BigEndian>(self.ipv4_port)?;
        buf.write_all(&self.ipv6_address.octets())?;
        buf.write_u16::<BigEndian>(self.ipv6_port)?;
        buf.write_u8(self.connection_id.len() as u8)?;
        buf.write_all(self.connection_id.as_bytes())?;
        buf.write_all(&self.stateless_reset_token)?;
        Ok(buf)
    }
}

/// The quic_transport_parameters TLS extension body. Absent parameters are
/// `None` and read back through accessors that apply the RFC defaults.
// https://www.rfc-editor.org/rfc/rfc9000.html#section-18
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportParameters {
    pub original_destination_connection_id: Option<ConnectionId>,
    // Milliseconds, 0 disables the idle timeout
    pub max_idle_timeout: Option<u64>,
    pub stateless_reset_token: Option<[u8; QUIC_STATELESS_RESET_TOKEN_SIZE]>,
    pub max_udp_payload_size: Option<u64>,
    pub initial_max_data: Option<u64>,
    pub initial_max_stream_data_bidi_local: Option<u64>,
    pub initial_max_stream_data_bidi_remote: Option<u64>,
    pub initial_max_stream_data_uni: Option<u64>,
    pub initial_max_streams_bidi: Option<u64>,
    pub initial_max_streams_uni: Option<u64>,
    pub ack_delay_exponent: Option<u8>,
    pub max_ack_delay: Option<u16>,
    pub disable_active_migration: bool,
    pub preferred_address: Option<PreferredAddress>,
    pub active_connection_id_limit: Option<u64>,
    pub initial_source_connection_id: Option<ConnectionId>,
    pub retry_source_connection_id: Option<ConnectionId>,
}

impl TransportParameters {
    fn with_config(config: &QuicConfig, scid: &ConnectionId) -> Self {
        Self {
            max_idle_timeout: Some(config.get_idle_timeout()),
            max_udp_payload_size: Some(config.get_max_udp_payload_size() as u64),
            initial_max_data: Some(config.get_initial_max_data()),
            initial_max_stream_data_bidi_local: Some(
                config.get_initial_max_stream_data_bidi_local(),
            ),
            initial_max_stream_data_bidi_remote: Some(
                config.get_initial_max_stream_data_bidi_remote(),
            ),
            initial_max_stream_data_uni: Some(config.get_initial_max_stream_data_uni()),
            initial_max_streams_bidi: Some(config.get_initial_max_streams_bidi()),
            initial_max_streams_uni: Some(config.get_initial_max_streams_uni()),
            ack_delay_exponent: Some(config.get_ack_delay_exponent()),
            max_ack_delay: Some(config.get_max_ack_delay()),
            active_connection_id_limit: Some(config.get_active_connection_id_limit() as u64),
            initial_source_connection_id: Some(scid.clone()),
            ..Default::default()
        }
    }

    pub(crate) fn for_client(config: &QuicConfig, scid: &ConnectionId) -> Self {
        Self::with_config(config, scid)
    }

    pub(crate) fn for_server(
        config: &QuicConfig,
        original_dcid: &ConnectionId,
        scid: &ConnectionId,
    ) -> Self {
        Self {
            original_destination_connection_id: Some(original_dcid.clone()),
            active_connection_id_limit: Some(MIN_ACTIVE_CONNECTION_ID_LIMIT),
            disable_active_migration: true,
            ..Self::with_config(config, scid)
        }
    }

    pub fn get_ack_delay_exponent(&self) -> u8 {
        self.ack_delay_exponent.unwrap_or(DEFAULT_ACK_DELAY_EXPONENT)
    }

    pub fn get_max_ack_delay(&self) -> Duration {
        Duration::from_millis(self.max_ack_delay.unwrap_or(DEFAULT_MAX_ACK_DELAY) as u64)
    }

    pub fn get_max_udp_payload_size(&self) -> u64 {
        self.max_udp_payload_size.unwrap_or(MAX_UDP_PAYLOAD_SIZE as u64)
    }

    pub fn get_active_connection_id_limit(&self) -> u64 {
        self.active_connection_id_limit
            .unwrap_or(MIN_ACTIVE_CONNECTION_ID_LIMIT)
    }

    pub fn get_max_idle_timeout(&self) -> u64 {
        self.max_idle_timeout.unwrap_or(0)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let mut tp = TransportParameters::default();

        while remaining_bytes(&mut cursor)? > 0 {
            let type_id = decode_variable_length(&mut cursor)?;
            let len = decode_variable_length(&mut cursor)?;
            if len > remaining_bytes(&mut cursor)? {
                return Err(anyhow!(
                    "Transport parameter 0x{:x} declares {} bytes, only {} left",
                    type_id,
                    len,
                    remaining_bytes(&mut cursor)?
                ));
            }
            let value = read_bytes(&mut cursor, len as usize)?;
            trace!(
                "Decoding transport parameter type 0x{:x}, length {}",
                type_id,
                len
            );
            tp.decode_one(type_id, &value)?;
        }

        tp.validate()?;
        trace!("Completed decoding transport parameters {:?}", tp);
        Ok(tp)
    }

    fn decode_one(&mut self, type_id: u64, value: &[u8]) -> Result<()> {
        let integer = || -> Result<u64> {
            let mut cursor = Cursor::new(value);
            let v = decode_variable_length(&mut cursor)?;
            if remaining_bytes(&mut cursor)? != 0 {
                return Err(anyhow!(
                    "Transport parameter 0x{:x} has trailing bytes",
                    type_id
                ));
            }
            Ok(v)
        };

        match type_id {
            transport_param_type::ORIGINAL_DESTINATION_CONNECTION_ID => {
                self.original_destination_connection_id = Some(ConnectionId::new(value)?);
            }
            transport_param_type::MAX_IDLE_TIMEOUT => {
                self.max_idle_timeout = Some(integer()?);
            }
            transport_param_type::STATELESS_RESET_TOKEN => {
                let token: [u8; QUIC_STATELESS_RESET_TOKEN_SIZE] = value
                    .try_into()
                    .map_err(|_| anyhow!("Stateless reset token has {} bytes", value.len()))?;
                self.stateless_reset_token = Some(token);
            }
            transport_param_type::MAX_UDP_PAYLOAD_SIZE => {
                self.max_udp_payload_size = Some(integer()?);
            }
            transport_param_type::INITIAL_MAX_DATA => {
                self.initial_max_data = Some(integer()?);
            }
            transport_param_type::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                self.initial_max_stream_data_bidi_local = Some(integer()?);
            }
            transport_param_type::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                self.initial_max_stream_data_bidi_remote = Some(integer()?);
            }
            transport_param_type::INITIAL_MAX_STREAM_DATA_UNI => {
                self.initial_max_stream_data_uni = Some(integer()?);
            }
            transport_param_type::INITIAL_MAX_STREAMS_BIDI => {
                self.initial_max_streams_bidi = Some(integer()?);
            }
            transport_param_type::INITIAL_MAX_STREAMS_UNI => {
                self.initial_max_streams_uni = Some(integer()?);
            }
            transport_param_type::ACK_DELAY_EXPONENT => {
                let exponent = integer()?;
                if exponent > MAX_ACK_DELAY_EXPONENT {
                    return Err(anyhow!(
                        "ack_delay_exponent value {} is not valid, must be 20 or below",
                        exponent
                    ));
                }
                self.ack_delay_exponent = Some(exponent as u8);
            }
            transport_param_type::MAX_ACK_DELAY => {
                let delay = integer()?;
                if delay >= MAX_ACK_DELAY_LIMIT {
                    return Err(anyhow!(
                        "max_ack_delay value {} is not valid, must be less than 2^14",
                        delay
                    ));
                }
                self.max_ack_delay = Some(delay as u16);
            }
            transport_param_type::DISABLE_ACTIVE_MIGRATION => {
                if !value.is_empty() {
                    return Err(anyhow!("disable_active_migration must be empty"));
                }
                self.disable_active_migration = true;
            }
            transport_param_type::PREFERRED_ADDRESS => {
                self.preferred_address = Some(PreferredAddress::decode(value)?);
            }
            transport_param_type::ACTIVE_CONNECTION_ID_LIMIT => {
                self.active_connection_id_limit = Some(integer()?);
            }
            transport_param_type::INITIAL_SOURCE_CONNECTION_ID => {
                self.initial_source_connection_id = Some(ConnectionId::new(value)?);
            }
            transport_param_type::RETRY_SOURCE_CONNECTION_ID => {
                self.retry_source_connection_id = Some(ConnectionId::new(value)?);
            }
            _ => {
                // Grease (31 * N + 27), version_information, ack frequency...
                warn!(
                    "Ignore unsupported transport parameter type id: 0x{:x}, len {}",
                    type_id,
                    value.len()
                );
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if let Some(size) = self.max_udp_payload_size {
            if size < MIN_UDP_PAYLOAD_SIZE as u64 {
                return Err(anyhow!(
                    "Invalid max_udp_payload_size {}, must be at least {}",
                    size,
                    MIN_UDP_PAYLOAD_SIZE
                ));
            }
        }
        if let Some(limit) = self.active_connection_id_limit {
            if limit < MIN_ACTIVE_CONNECTION_ID_LIMIT {
                return Err(anyhow!(
                    "active_connection_id_limit must be at least {}, got {}",
                    MIN_ACTIVE_CONNECTION_ID_LIMIT,
                    limit
                ));
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = vec![];

        if let Some(cid) = &self.original_destination_connection_id {
            write_bytes_param(
                &mut buf,
                transport_param_type::ORIGINAL_DESTINATION_CONNECTION_ID,
                cid.as_bytes(),
            )?;
        }
        if let Some(v) = self.max_idle_timeout {
            write_integer_param(&mut buf, transport_param_type::MAX_IDLE_TIMEOUT, v)?;
        }
        if let Some(token) = &self.stateless_reset_token {
            write_bytes_param(&mut buf, transport_param_type::STATELESS_RESET_TOKEN, token)?;
        }
        if let Some(v) = self.max_udp_payload_size {
            write_integer_param(&mut buf, transport_param_type::MAX_UDP_PAYLOAD_SIZE, v)?;
        }
        let integers = [
            (transport_param_type::INITIAL_MAX_DATA, self.initial_max_data),
            (
                transport_param_type::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
                self.initial_max_stream_data_bidi_local,
            ),
            (
                transport_param_type::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
                self.initial_max_stream_data_bidi_remote,
            ),
            (transport_param_type::INITIAL_MAX_STREAM_DATA_UNI, self.initial_max_stream_data_uni),
            (transport_param_type::INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi),
            (transport_param_type::INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni),
            (transport_param_type::ACK_DELAY_EXPONENT, self.ack_delay_exponent.map(u64::from)),
            (transport_param_type::MAX_ACK_DELAY, self.max_ack_delay.map(u64::from)),
        ];
        for (type_id, value) in integers {
            if let Some(v) = value {
                write_integer_param(&mut buf, type_id, v)?;
            }
        }
        if self.disable_active_migration {
            write_bytes_param(&mut buf, transport_param_type::DISABLE_ACTIVE_MIGRATION, &[])?;
        }
        if let Some(address) = &self.preferred_address {
            write_bytes_param(
                &mut buf,
                transport_param_type::PREFERRED_ADDRESS,
                &address.encode()?,
            )?;
        }
        if let Some(v) = self.active_connection_id_limit {
            write_integer_param(&mut buf, transport_param_type::ACTIVE_CONNECTION_ID_LIMIT, v)?;
        }
        if let Some(cid) = &self.initial_source_connection_id {
            write_bytes_param(
                &mut buf,
                transport_param_type::INITIAL_SOURCE_CONNECTION_ID,
                cid.as_bytes(),
            )?;
        }
        if let Some(cid) = &self.retry_source_connection_id {
            write_bytes_param(
                &mut buf,
                transport_param_type::RETRY_SOURCE_CONNECTION_ID,
                cid.as_bytes(),
            )?;
        }

        Ok(buf)
    }
}

fn write_integer_param<W: Write>(cursor: &mut W, type_id: u64, value: u64) -> Result<()> {
    encode_variable_length(cursor, type_id)?;
    encode_variable_length(cursor, get_variable_length(value)? as u64)?;
    encode_variable_length(cursor, value)?;
    Ok(())
}

fn write_bytes_param<W: Write>(cursor: &mut W, type_id: u64, value: &[u8]) -> Result<()> {
    encode_variable_length(cursor, type_id)?;
    encode_variable_length(cursor, value.len() as u64)?;
    cursor.write_all(value)?;
    Ok(())
}
