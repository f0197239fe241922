use std::fmt;
use thiserror::Error;

use crate::connection::QuicConnectionState;

// Frame type carried inside a transport CONNECTION_CLOSE, see QuicFrameType
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuicConnectionErrorCode {
    ApplicationErrorCode(u64),
    TransportErrorCode((TransportErrorCode, Option<u64>)),
}

impl QuicConnectionErrorCode {
    pub fn create_application_error_code(error_code: u64) -> Self {
        QuicConnectionErrorCode::ApplicationErrorCode(error_code)
    }

    pub fn create_transport_error_code(error_code: u64, frame_type: Option<u64>) -> Self {
        QuicConnectionErrorCode::TransportErrorCode((
            TransportErrorCode::from(error_code),
            frame_type,
        ))
    }

    pub fn get_error_code(&self) -> u64 {
        match self {
            QuicConnectionErrorCode::TransportErrorCode((te, _)) => u64::from(*te),
            QuicConnectionErrorCode::ApplicationErrorCode(e) => *e,
        }
    }

    pub fn is_application(&self) -> bool {
        matches!(self, QuicConnectionErrorCode::ApplicationErrorCode(_))
    }
}

impl fmt::Display for QuicConnectionErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuicConnectionErrorCode::ApplicationErrorCode(e) => write!(f, "application({e:#x})"),
            QuicConnectionErrorCode::TransportErrorCode((te, Some(frame_type))) => {
                write!(f, "{te:?} triggered by frame {frame_type:#x}")
            }
            QuicConnectionErrorCode::TransportErrorCode((te, None)) => write!(f, "{te:?}"),
        }
    }
}

impl From<TransportErrorCode> for QuicConnectionErrorCode {
    fn from(code: TransportErrorCode) -> Self {
        QuicConnectionErrorCode::TransportErrorCode((code, None))
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QuicConnectResult {
    #[error("Connection established successfully")]
    Success,

    #[error("Connection establishment timed out {0}ms")]
    Timeout(u64),

    #[error("Connection establishment failed, due to {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum QuicConnectionError {
    #[error("Unidirectional stream {0} was opened by the peer")]
    InvalidStream(u64),

    #[error("TLS handshake failed, {0}")]
    HandshakeFailed(String),

    #[error("Internal implementation error {0}")]
    InternalError(String),

    #[error("QUIC Connection was closed {0:?}")]
    ConnectionLost(QuicConnectionState),
}

// https://www.rfc-editor.org/rfc/rfc9000.html#section-20.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorCode {
    NoError,
    InternalError,
    ConnectionRefused,
    FlowControlError,
    StreamLimitError,
    StreamStateError,
    FinalSizeError,
    FrameEncodingError,
    TransportParameterError,
    ConnectionIdLimitError,
    ProtocolViolation,
    InvalidToken,
    ApplicationError,
    CryptoBufferExceeded,
    KeyUpdateError,
    AeadLimitReached,
    NoViablePath,
    // 0x0100-0x01ff, the low byte is the TLS alert description
    CryptoError(u8),
    Unknown(u64),
}

impl TransportErrorCode {
    // https://www.rfc-editor.org/rfc/rfc9001.html#section-4.8
    pub fn from_tls_alert(alert: u8) -> Self {
        TransportErrorCode::CryptoError(alert)
    }

    pub fn is_crypto_error(&self) -> bool {
        matches!(self, TransportErrorCode::CryptoError(_))
    }
}

impl From<TransportErrorCode> for u64 {
    fn from(code: TransportErrorCode) -> Self {
        match code {
            TransportErrorCode::NoError => 0x00,
            TransportErrorCode::InternalError => 0x01,
            TransportErrorCode::ConnectionRefused => 0x02,
            TransportErrorCode::FlowControlError => 0x03,
            TransportErrorCode::StreamLimitError => 0x04,
            TransportErrorCode::StreamStateError => 0x05,
            TransportErrorCode::FinalSizeError => 0x06,
            TransportErrorCode::FrameEncodingError => 0x07,
            TransportErrorCode::TransportParameterError => 0x08,
            TransportErrorCode::ConnectionIdLimitError => 0x09,
            TransportErrorCode::ProtocolViolation => 0x0a,
            TransportErrorCode::InvalidToken => 0x0b,
            TransportErrorCode::ApplicationError => 0x0c,
            TransportErrorCode::CryptoBufferExceeded => 0x0d,
            TransportErrorCode::KeyUpdateError => 0x0e,
            TransportErrorCode::AeadLimitReached => 0x0f,
            TransportErrorCode::NoViablePath => 0x10,
            TransportErrorCode::CryptoError(alert) => 0x0100 + alert as u64,
            TransportErrorCode::Unknown(x) => x,
        }
    }
}

impl From<u64> for TransportErrorCode {
    fn from(value: u64) -> Self {
        match value {
            0x00 => TransportErrorCode::NoError,
            0x01 => TransportErrorCode::InternalError,
            0x02 => TransportErrorCode::ConnectionRefused,
            0x03 => TransportErrorCode::FlowControlError,
            0x04 => TransportErrorCode::StreamLimitError,
            0x05 => TransportErrorCode::StreamStateError,
            0x06 => TransportErrorCode::FinalSizeError,
            0x07 => TransportErrorCode::FrameEncodingError,
            0x08 => TransportErrorCode::TransportParameterError,
            0x09 => TransportErrorCode::ConnectionIdLimitError,
            0x0a => TransportErrorCode::ProtocolViolation,
            0x0b => TransportErrorCode::InvalidToken,
            0x0c => TransportErrorCode::ApplicationError,
            0x0d => TransportErrorCode::CryptoBufferExceeded,
            0x0e => TransportErrorCode::KeyUpdateError,
            0x0f => TransportErrorCode::AeadLimitReached,
            0x10 => TransportErrorCode::NoViablePath,
            0x0100..=0x01ff => TransportErrorCode::CryptoError((value - 0x0100) as u8),
            x => TransportErrorCode::Unknown(x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_code_mapping() {
        let test_cases = vec![
            (0x00, TransportErrorCode::NoError),
            (0x07, TransportErrorCode::FrameEncodingError),
            (0x0a, TransportErrorCode::ProtocolViolation),
            (0x10, TransportErrorCode::NoViablePath),
            (0x0128, TransportErrorCode::CryptoError(40)),
            (0x0178, TransportErrorCode::CryptoError(120)),
            (0x4242, TransportErrorCode::Unknown(0x4242)),
        ];

        for (raw, code) in test_cases {
            assert_eq!(TransportErrorCode::from(raw), code);
            assert_eq!(u64::from(code), raw);
        }
    }

    #[test]
    fn test_tls_alert_maps_into_crypto_range() {
        // handshake_failure
        let code = TransportErrorCode::from_tls_alert(40);
        assert!(code.is_crypto_error());
        assert_eq!(u64::from(code), 0x0128);
    }

    #[test]
    fn test_connection_error_code() {
        let code = QuicConnectionErrorCode::create_transport_error_code(0x0a, Some(0x06));
        assert_eq!(code.get_error_code(), 0x0a);
        assert!(!code.is_application());
        assert_eq!(
            code.to_string(),
            "ProtocolViolation triggered by frame 0x6"
        );

        let code = QuicConnectionErrorCode::create_application_error_code(0x100);
        assert!(code.is_application());
        assert_eq!(code.get_error_code(), 0x100);
    }
}
