use anyhow::{anyhow, Result};
use rand::RngCore;
use std::fmt;

use crate::utils::hex_dump;

// https://www.rfc-editor.org/rfc/rfc9000.html#section-17.2
pub const QUIC_MAX_CONNECTION_ID_LENGTH: usize = 20;
pub const QUIC_DEFAULT_CONNECTION_ID_LENGTH: usize = 8;

/// Opaque 0..=20 byte connection identifier.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Vec<u8>);

impl ConnectionId {
    pub fn new(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > QUIC_MAX_CONNECTION_ID_LENGTH {
            return Err(anyhow!(
                "Connection id length {} exceeds {}",
                bytes.len(),
                QUIC_MAX_CONNECTION_ID_LENGTH
            ));
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn random() -> Self {
        Self::random_with_len(QUIC_DEFAULT_CONNECTION_ID_LENGTH)
    }

    pub fn random_with_len(len: usize) -> Self {
        let mut bytes = vec![0u8; len.min(QUIC_MAX_CONNECTION_ID_LENGTH)];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex_dump(&self.0))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex_dump(&self.0))
    }
}

/// The two identifiers a connection is addressed by: the one we chose and
/// the one the peer chose.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionIdPair {
    pub src: ConnectionId,
    pub dst: ConnectionId,
}

impl ConnectionIdPair {
    pub fn random() -> Self {
        Self {
            src: ConnectionId::random(),
            dst: ConnectionId::random(),
        }
    }
}
