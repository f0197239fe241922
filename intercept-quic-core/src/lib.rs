// Re-export commonly used types and functions
pub mod prelude {
    pub use crate::cid::{ConnectionId, ConnectionIdPair};
    pub use crate::config::{QuicConfig, DEFAULT_ALPN, DEFAULT_INITIAL_PACKET_SIZE};
    pub use crate::connection::{QuicConnection, QuicConnectionState, QuicLevel, Role};
    pub use crate::endpoint::ConnectionTable;
    pub use crate::error_code::{
        QuicConnectResult, QuicConnectionError, QuicConnectionErrorCode, TransportErrorCode,
    };
    pub use crate::handshake::HandshakeState;
    pub use crate::http3::{Http3Frame, Http3SettingParam, Http3Settings};
    pub use crate::message::{QuicMessage, QuicMessages};
    pub use crate::runtime::{
        ForwardProxy, QuicCallbacks, QuicRuntime, QuicUserContext, RuntimeConfig,
    };
    pub use crate::tls::{CertificateIssuer, SelfSignedIssuer, TrafficSecrets};
    pub use crate::transport_parameters::{MAX_UDP_PAYLOAD_SIZE, MIN_UDP_PAYLOAD_SIZE};
}

// Internal modules
mod ack;
pub mod cid;
pub mod config;
pub mod connection;
mod crypto;
pub mod endpoint;
pub mod error_code;
mod frame;
mod handshake;
pub mod http3;
pub mod message;
mod packet;
mod pn;
mod reassembly;
mod recovery;
mod rtt;
pub mod runtime;
mod space;
mod timer;
pub mod tls;
mod transport_parameters;
mod utils;

// Re-export prelude for convenience
pub use prelude::*;
