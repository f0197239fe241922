use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::{info, trace, warn};

use crate::cid::ConnectionId;
use crate::config::QuicConfig;
use crate::connection::{QuicLevel, Role};
use crate::error_code::TransportErrorCode;
use crate::tls::{CertificateIssuer, HandshakeOutput, TlsSession};
use crate::transport_parameters::TransportParameters;

// TLS handshake message types
const TLS_CLIENT_HELLO: u8 = 1;
const TLS_SERVER_HELLO: u8 = 2;
const TLS_NEW_SESSION_TICKET: u8 = 4;
const TLS_ENCRYPTED_EXTENSIONS: u8 = 8;
const TLS_CERTIFICATE: u8 = 11;
const TLS_CERTIFICATE_REQUEST: u8 = 13;
const TLS_CERTIFICATE_VERIFY: u8 = 15;
const TLS_FINISHED: u8 = 20;

// https://www.rfc-editor.org/rfc/rfc9001.html#section-4-8
fn expected_level(message_type: u8) -> Option<QuicLevel> {
    match message_type {
        TLS_CLIENT_HELLO | TLS_SERVER_HELLO => Some(QuicLevel::Initial),
        TLS_ENCRYPTED_EXTENSIONS
        | TLS_CERTIFICATE
        | TLS_CERTIFICATE_REQUEST
        | TLS_CERTIFICATE_VERIFY
        | TLS_FINISHED => Some(QuicLevel::Handshake),
        TLS_NEW_SESSION_TICKET => Some(QuicLevel::Application),
        _ => None,
    }
}

/// Progress of the handshake. It only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeState {
    Initial,
    HasHandshakeKeys,
    // A Handshake packet of ours was acknowledged
    AckReceived,
    HasAppKeys,
    // https://www.rfc-editor.org/rfc/rfc9001.html#section-4.1.2
    Confirmed,
}

pub(crate) struct Handshake {
    role: Role,
    tls: TlsSession,
    state: HandshakeState,
    peer_params: Option<TransportParameters>,
}

impl Handshake {
    pub(crate) fn new_client(config: &QuicConfig, scid: &ConnectionId) -> Result<Self> {
        let server_name = config
            .get_server_name()
            .ok_or_else(|| anyhow!("A client connection needs a server name"))?;
        let params = TransportParameters::for_client(config, scid).encode()?;
        let tls = TlsSession::new_client(
            server_name,
            config.get_alpn(),
            params,
            config.get_key_log_file(),
        )?;

        Ok(Self {
            role: Role::Client,
            tls,
            state: HandshakeState::Initial,
            peer_params: None,
        })
    }

    pub(crate) fn new_server(
        config: &QuicConfig,
        issuer: Arc<dyn CertificateIssuer>,
        odcid: &ConnectionId,
        scid: &ConnectionId,
    ) -> Result<Self> {
        let params = TransportParameters::for_server(config, odcid, scid).encode()?;
        let tls =
            TlsSession::new_server(issuer, config.get_alpn(), params, config.get_key_log_file())?;

        Ok(Self {
            role: Role::Server,
            tls,
            state: HandshakeState::Initial,
            peer_params: None,
        })
    }

    pub(crate) fn state(&self) -> HandshakeState {
        self.state
    }

    pub(crate) fn advance(&mut self, state: HandshakeState) {
        if state > self.state {
            info!("{:?} handshake state {:?} -> {:?}", self.role, self.state, state);
            self.state = state;
        }
    }

    pub(crate) fn is_confirmed(&self) -> bool {
        self.state == HandshakeState::Confirmed
    }

    pub(crate) fn is_tls_complete(&self) -> bool {
        !self.tls.is_handshaking()
    }

    /// The client speaks first, this yields its ClientHello.
    pub(crate) fn start(&mut self) -> Result<Vec<HandshakeOutput>> {
        self.drain()
    }

    /// Feeds complete handshake messages received at `level` and collects
    /// what TLS answers with.
    pub(crate) fn on_messages(
        &mut self,
        level: QuicLevel,
        messages: Vec<Vec<u8>>,
    ) -> Result<Vec<HandshakeOutput>, TransportErrorCode> {
        for message in messages {
            let message_type = message.first().copied().unwrap_or_default();
            match expected_level(message_type) {
                Some(expected) if expected != level => {
                    warn!(
                        "TLS message type {} arrived at {:?} instead of {:?}",
                        message_type, level, expected
                    );
                    return Err(TransportErrorCode::ProtocolViolation);
                }
                // Anything unknown is left for TLS to refuse
                _ => self.tls.read_handshake(level, &message)?,
            }
        }

        if self.peer_params.is_none() {
            if let Some(bytes) = self.tls.peer_transport_parameters() {
                let params = TransportParameters::decode(bytes).map_err(|e| {
                    warn!("Invalid peer transport parameters: {:#}", e);
                    TransportErrorCode::TransportParameterError
                })?;
                trace!("Peer transport parameters {:?}", params);
                self.peer_params = Some(params);
            }
        }

        self.drain().map_err(|e| {
            warn!("Failed to collect TLS output: {:#}", e);
            TransportErrorCode::InternalError
        })
    }

    fn drain(&mut self) -> Result<Vec<HandshakeOutput>> {
        let outputs = self.tls.write_handshake()?;
        for output in &outputs {
            match output {
                HandshakeOutput::HandshakeKeys(_) => self.advance(HandshakeState::HasHandshakeKeys),
                HandshakeOutput::OneRttKeys(_) => self.advance(HandshakeState::HasAppKeys),
                HandshakeOutput::Data(..) | HandshakeOutput::ZeroRttKeys(_) => {}
            }
        }
        Ok(outputs)
    }

    pub(crate) fn peer_transport_parameters(&self) -> Option<&TransportParameters> {
        self.peer_params.as_ref()
    }

    pub(crate) fn server_name(&self) -> Option<&str> {
        self.tls.server_name()
    }

    #[cfg(test)]
    pub(crate) fn application_secrets(&self) -> Option<crate::tls::TrafficSecrets> {
        self.tls.application_secrets()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::SelfSignedIssuer;

    fn client_and_server() -> Result<(Handshake, Handshake)> {
        let mut client_config = QuicConfig::default();
        client_config.set_server_name("levels.test");
        let client = Handshake::new_client(&client_config, &ConnectionId::random())?;
        let server = Handshake::new_server(
            &QuicConfig::default(),
            Arc::new(SelfSignedIssuer::default()),
            &ConnectionId::random(),
            &ConnectionId::random(),
        )?;
        Ok((client, server))
    }

    #[test]
    fn test_state_never_regresses() -> Result<()> {
        let (mut client, _) = client_and_server()?;
        client.advance(HandshakeState::HasAppKeys);
        assert_eq!(client.state(), HandshakeState::HasAppKeys);

        client.advance(HandshakeState::AckReceived);
        client.advance(HandshakeState::Initial);
        assert_eq!(client.state(), HandshakeState::HasAppKeys);

        client.advance(HandshakeState::Confirmed);
        assert!(client.is_confirmed());
        Ok(())
    }

    #[test]
    fn test_message_at_wrong_level_is_rejected() -> Result<()> {
        let (mut client, mut server) = client_and_server()?;
        let hello = client
            .start()?
            .into_iter()
            .find_map(|output| match output {
                HandshakeOutput::Data(QuicLevel::Initial, data) => Some(data),
                _ => None,
            })
            .ok_or_else(|| anyhow!("client produced no ClientHello"))?;
        assert_eq!(hello[0], TLS_CLIENT_HELLO);

        assert_eq!(
            server.on_messages(QuicLevel::Handshake, vec![hello.clone()]).err(),
            Some(TransportErrorCode::ProtocolViolation)
        );
        assert_eq!(expected_level(TLS_FINISHED), Some(QuicLevel::Handshake));
        assert_eq!(expected_level(TLS_NEW_SESSION_TICKET), Some(QuicLevel::Application));

        // The same bytes at the right level are fine
        assert!(server.on_messages(QuicLevel::Initial, vec![hello]).is_ok());
        assert_eq!(server.state(), HandshakeState::HasAppKeys);
        Ok(())
    }

    #[test]
    fn test_handshake_exchanges_transport_parameters() -> Result<()> {
        let client_scid = ConnectionId::random();
        let server_scid = ConnectionId::random();
        let odcid = ConnectionId::random();

        let mut client_config = QuicConfig::default();
        client_config.set_server_name("proxy.test");
        client_config.set_max_ack_delay(40);
        let mut client = Handshake::new_client(&client_config, &client_scid)?;
        let mut server = Handshake::new_server(
            &QuicConfig::default(),
            Arc::new(SelfSignedIssuer::default()),
            &odcid,
            &server_scid,
        )?;

        let mut to_server = client.start()?;
        let mut rounds = 0;
        while !(client.is_tls_complete() && server.is_tls_complete()) {
            rounds += 1;
            assert!(rounds < 5, "handshake did not finish");

            let mut to_client = vec![];
            for output in to_server.drain(..) {
                if let HandshakeOutput::Data(level, data) = output {
                    to_client.extend(
                        server
                            .on_messages(level, vec![data])
                            .map_err(|code| anyhow!("{:?}", code))?,
                    );
                }
            }
            for output in to_client {
                if let HandshakeOutput::Data(level, data) = output {
                    to_server.extend(
                        client
                            .on_messages(level, vec![data])
                            .map_err(|code| anyhow!("{:?}", code))?,
                    );
                }
            }
        }

        assert_eq!(client.state(), HandshakeState::HasAppKeys);
        assert_eq!(server.state(), HandshakeState::HasAppKeys);
        assert_eq!(server.server_name(), Some("proxy.test"));

        let seen_by_server = server
            .peer_transport_parameters()
            .ok_or_else(|| anyhow!("server has no client parameters"))?;
        assert_eq!(seen_by_server.initial_source_connection_id, Some(client_scid));
        assert_eq!(seen_by_server.max_ack_delay, Some(40));

        let seen_by_client = client
            .peer_transport_parameters()
            .ok_or_else(|| anyhow!("client has no server parameters"))?;
        assert_eq!(seen_by_client.original_destination_connection_id, Some(odcid));
        assert_eq!(seen_by_client.initial_source_connection_id, Some(server_scid));
        assert_eq!(client.application_secrets(), server.application_secrets());
        Ok(())
    }

    #[test]
    fn test_client_requires_server_name() {
        assert!(Handshake::new_client(&QuicConfig::default(), &ConnectionId::random()).is_err());
    }
}
