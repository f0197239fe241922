use std::borrow::Cow;
use std::path::{Path, PathBuf};

use crate::cid::ConnectionId;

pub const DEFAULT_INITIAL_PACKET_SIZE: u16 = 1200;
pub const DEFAULT_ALPN: &str = "h3";
const DEFAULT_MAX_IDLE_TIMEOUT: u64 = 30_000;
const DEFAULT_MAX_UDP_PAYLOAD_SIZE: u16 = 1472;
const DEFAULT_MAX_DATA: u64 = 10 * 1024 * 1024 * 1024;
const DEFAULT_MAX_STREAM_DATA: u64 = 10 * 1024 * 1024 * 1024;
const DEFAULT_MAX_STREAMS: u64 = 10 * 1024;
const DEFAULT_ACK_DELAY_EXPONENT: u8 = 3;
const DEFAULT_MAX_ACK_DELAY: u16 = 25;
const DEFAULT_ACTIVE_CONNECTION_ID_LIMIT: u8 = 2;
const DEFAULT_DISCARD_HANDSHAKE_KEYS_ON_CONFIRM: bool = true;
const DEFAULT_SUPPRESS_INITIAL_PTO: bool = true;

#[derive(Clone, Debug, Default)]
pub struct QuicConfig {
    idle_timeout: Option<u64>,
    first_initial_packet_size: Option<u16>,
    pub(crate) dcid: Option<ConnectionId>,
    pub(crate) scid: Option<ConnectionId>,

    key_log_file: Option<PathBuf>,
    server_name: Option<String>,
    alpn: Option<String>,

    initial_max_data: Option<u64>,
    initial_max_stream_data_bidi_local: Option<u64>,
    initial_max_stream_data_bidi_remote: Option<u64>,
    initial_max_stream_data_uni: Option<u64>,
    initial_max_streams_bidi: Option<u64>,
    initial_max_streams_uni: Option<u64>,
    ack_delay_exponent: Option<u8>,
    max_ack_delay: Option<u16>,
    active_connection_id_limit: Option<u8>,
    max_udp_payload_size: Option<u16>,

    discard_handshake_keys_on_confirm: Option<bool>,
    suppress_initial_pto: Option<bool>,
}

impl QuicConfig {
    pub fn set_first_initial_packet_size(&mut self, first_initial_packet_size: u16) {
        self.first_initial_packet_size = Some(first_initial_packet_size);
    }

    pub(crate) fn get_first_initial_packet_size(&self) -> u16 {
        self.first_initial_packet_size
            .unwrap_or(DEFAULT_INITIAL_PACKET_SIZE)
            .max(DEFAULT_INITIAL_PACKET_SIZE)
    }

    pub fn set_idle_timeout(&mut self, idle_timeout: u64) {
        self.idle_timeout = Some(idle_timeout);
    }

    pub(crate) fn get_idle_timeout(&self) -> u64 {
        self.idle_timeout.unwrap_or(DEFAULT_MAX_IDLE_TIMEOUT)
    }

    pub fn set_dcid(&mut self, dcid: ConnectionId) {
        self.dcid = Some(dcid);
    }

    pub fn set_scid(&mut self, scid: ConnectionId) {
        self.scid = Some(scid);
    }

    pub fn set_initial_max_data(&mut self, initial_max_data: u64) {
        self.initial_max_data = Some(initial_max_data);
    }

    pub(crate) fn get_initial_max_data(&self) -> u64 {
        self.initial_max_data.unwrap_or(DEFAULT_MAX_DATA)
    }

    pub fn set_initial_max_stream_data_bidi_local(&mut self, value: u64) {
        self.initial_max_stream_data_bidi_local = Some(value);
    }

    pub(crate) fn get_initial_max_stream_data_bidi_local(&self) -> u64 {
        self.initial_max_stream_data_bidi_local
            .unwrap_or(DEFAULT_MAX_STREAM_DATA)
    }

    pub fn set_initial_max_stream_data_bidi_remote(&mut self, value: u64) {
        self.initial_max_stream_data_bidi_remote = Some(value);
    }

    pub(crate) fn get_initial_max_stream_data_bidi_remote(&self) -> u64 {
        self.initial_max_stream_data_bidi_remote
            .unwrap_or(DEFAULT_MAX_STREAM_DATA)
    }

    pub fn set_initial_max_stream_data_uni(&mut self, value: u64) {
        self.initial_max_stream_data_uni = Some(value);
    }

    pub(crate) fn get_initial_max_stream_data_uni(&self) -> u64 {
        self.initial_max_stream_data_uni
            .unwrap_or(DEFAULT_MAX_STREAM_DATA)
    }

    pub fn set_initial_max_streams_bidi(&mut self, value: u64) {
        self.initial_max_streams_bidi = Some(value);
    }

    pub(crate) fn get_initial_max_streams_bidi(&self) -> u64 {
        self.initial_max_streams_bidi.unwrap_or(DEFAULT_MAX_STREAMS)
    }

    pub fn set_initial_max_streams_uni(&mut self, value: u64) {
        self.initial_max_streams_uni = Some(value);
    }

    pub(crate) fn get_initial_max_streams_uni(&self) -> u64 {
        self.initial_max_streams_uni.unwrap_or(DEFAULT_MAX_STREAMS)
    }

    pub fn set_ack_delay_exponent(&mut self, value: u8) {
        self.ack_delay_exponent = Some(value);
    }

    pub(crate) fn get_ack_delay_exponent(&self) -> u8 {
        self.ack_delay_exponent
            .unwrap_or(DEFAULT_ACK_DELAY_EXPONENT)
    }

    pub fn set_max_ack_delay(&mut self, value: u16) {
        self.max_ack_delay = Some(value);
    }

    pub(crate) fn get_max_ack_delay(&self) -> u16 {
        self.max_ack_delay.unwrap_or(DEFAULT_MAX_ACK_DELAY)
    }

    pub fn set_active_connection_id_limit(&mut self, value: u8) {
        self.active_connection_id_limit = Some(value);
    }

    pub(crate) fn get_active_connection_id_limit(&self) -> u8 {
        self.active_connection_id_limit
            .unwrap_or(DEFAULT_ACTIVE_CONNECTION_ID_LIMIT)
    }

    pub fn set_max_udp_payload_size(&mut self, value: u16) {
        self.max_udp_payload_size = Some(value);
    }

    pub(crate) fn get_max_udp_payload_size(&self) -> u16 {
        self.max_udp_payload_size
            .unwrap_or(DEFAULT_MAX_UDP_PAYLOAD_SIZE)
    }

    pub fn set_server_name<'a, S>(&mut self, server_name: S)
    where
        S: Into<Cow<'a, str>>,
    {
        self.server_name = Some(server_name.into().into_owned());
    }

    pub(crate) fn get_server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn set_alpn<'a, S>(&mut self, alpn: S)
    where
        S: Into<Cow<'a, str>>,
    {
        self.alpn = Some(alpn.into().into_owned());
    }

    pub(crate) fn get_alpn(&self) -> &str {
        self.alpn.as_deref().unwrap_or(DEFAULT_ALPN)
    }

    pub fn set_key_log_file<P: AsRef<Path>>(&mut self, log_file: P) {
        self.key_log_file = Some(log_file.as_ref().to_path_buf());
    }

    pub(crate) fn get_key_log_file(&self) -> Option<&Path> {
        self.key_log_file.as_deref()
    }

    /// Whether Handshake keys are dropped once the handshake is confirmed.
    // https://www.rfc-editor.org/rfc/rfc9001.html#section-4.9.2
    pub fn set_discard_handshake_keys_on_confirm(&mut self, value: bool) {
        self.discard_handshake_keys_on_confirm = Some(value);
    }

    pub(crate) fn get_discard_handshake_keys_on_confirm(&self) -> bool {
        self.discard_handshake_keys_on_confirm
            .unwrap_or(DEFAULT_DISCARD_HANDSHAKE_KEYS_ON_CONFIRM)
    }

    /// Whether a probe timeout is skipped while only Initial keys exist.
    pub fn set_suppress_initial_pto(&mut self, value: bool) {
        self.suppress_initial_pto = Some(value);
    }

    pub(crate) fn get_suppress_initial_pto(&self) -> bool {
        self.suppress_initial_pto
            .unwrap_or(DEFAULT_SUPPRESS_INITIAL_PTO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QuicConfig::default();
        assert_eq!(config.get_first_initial_packet_size(), 1200);
        assert_eq!(config.get_alpn(), "h3");
        assert_eq!(config.get_server_name(), None);
        assert_eq!(config.get_max_ack_delay(), 25);
        assert_eq!(config.get_ack_delay_exponent(), 3);
        assert_eq!(config.get_initial_max_streams_uni(), 10240);
        assert!(config.get_discard_handshake_keys_on_confirm());
        assert!(config.get_suppress_initial_pto());
    }

    #[test]
    fn test_first_initial_packet_size_floor() {
        let mut config = QuicConfig::default();
        config.set_first_initial_packet_size(1000);
        assert_eq!(config.get_first_initial_packet_size(), 1200);
        config.set_first_initial_packet_size(1350);
        assert_eq!(config.get_first_initial_packet_size(), 1350);
    }
}
