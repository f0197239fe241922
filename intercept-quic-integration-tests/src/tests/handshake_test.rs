#[cfg(test)]
mod tests {
    use crate::utils::{init_logging, Link};
    use anyhow::{anyhow, Result};
    use intercept_quic_core::prelude::*;
    use std::collections::BTreeSet;
    use std::fs;
    use tempfile::NamedTempFile;
    use test_log::test;
    use tracing::info;

    const TRAFFIC_SECRET_LABELS: [&str; 4] = [
        "CLIENT_HANDSHAKE_TRAFFIC_SECRET",
        "SERVER_HANDSHAKE_TRAFFIC_SECRET",
        "CLIENT_TRAFFIC_SECRET_0",
        "SERVER_TRAFFIC_SECRET_0",
    ];

    fn traffic_secret_lines(path: &std::path::Path) -> Result<BTreeSet<String>> {
        Ok(fs::read_to_string(path)?
            .lines()
            .filter(|line| {
                TRAFFIC_SECRET_LABELS
                    .iter()
                    .any(|label| line.starts_with(&format!("{} ", label)))
            })
            .map(str::to_string)
            .collect())
    }

    #[test]
    fn test_handshake_confirms_both_sides() -> Result<()> {
        init_logging();
        let mut link = Link::with_server_name("www.example.com")?;
        link.settle()?;

        assert_eq!(link.client.handshake_state(), HandshakeState::Confirmed);
        assert!(link.client.is_established());
        assert!(link.client.is_address_validated());
        assert_eq!(link.client.role(), Role::Client);

        let server = link.server_conn()?;
        assert_eq!(server.handshake_state(), HandshakeState::Confirmed);
        assert!(server.is_established());
        assert_eq!(server.role(), Role::Server);
        assert_eq!(server.server_name(), Some("www.example.com"));
        info!("Handshake confirmed for {:?}", server.server_name());

        assert_eq!(link.server.accept(), link.server.keys().first().copied());
        assert_eq!(link.server.accept(), None);
        Ok(())
    }

    #[test]
    fn test_both_sides_log_the_same_secrets() -> Result<()> {
        init_logging();
        let client_log = NamedTempFile::new()?;
        let server_log = NamedTempFile::new()?;

        let mut client_config = QuicConfig::default();
        client_config.set_server_name("keylog.test");
        client_config.set_key_log_file(client_log.path());
        let mut server_config = QuicConfig::default();
        server_config.set_key_log_file(server_log.path());

        let mut link = Link::new(client_config, server_config)?;
        link.settle()?;
        assert!(link.client.is_established());

        let client_lines = traffic_secret_lines(client_log.path())?;
        let server_lines = traffic_secret_lines(server_log.path())?;
        assert_eq!(client_lines.len(), TRAFFIC_SECRET_LABELS.len());
        assert_eq!(client_lines, server_lines);
        Ok(())
    }

    #[test]
    fn test_custom_alpn_and_source_connection_id() -> Result<()> {
        let scid = ConnectionId::new(&[0xdd, 0xdd, 0x1b, 0xaa, 0x12])?;
        let mut client_config = QuicConfig::default();
        client_config.set_server_name("echo.test");
        client_config.set_alpn("echo");
        client_config.set_scid(scid.clone());
        let mut server_config = QuicConfig::default();
        server_config.set_alpn("echo");

        let mut link = Link::new(client_config, server_config)?;
        link.settle()?;

        assert_eq!(link.client.scid(), &scid);
        assert!(link.client.is_established());

        // Each side now addresses the other by the id the other chose
        let client_ids = link.client.connection_ids();
        let server = link.server_conn()?;
        assert!(server.is_established());
        assert_eq!(server.connection_ids().dst, scid);
        assert_eq!(client_ids.dst, server.connection_ids().src);
        Ok(())
    }

    #[test]
    fn test_alpn_mismatch_closes_the_connection() -> Result<()> {
        init_logging();
        let mut client_config = QuicConfig::default();
        client_config.set_server_name("alpn.test");
        let mut server_config = QuicConfig::default();
        server_config.set_alpn("echo");

        let mut link = Link::new(client_config, server_config)?;
        link.settle()?;

        assert!(!link.client.is_established());
        assert!(link.client.is_closing());
        let error = link
            .client
            .error()
            .ok_or_else(|| anyhow!("client saw no close"))?;
        assert!(!error.is_application());
        assert!(link.server.accept().is_none());
        Ok(())
    }

    #[test]
    fn test_application_close_reaches_the_server() -> Result<()> {
        let mut link = Link::with_server_name("close.test")?;
        link.settle()?;

        let code = QuicConnectionErrorCode::create_application_error_code(0x100);
        link.client.close(code, "bye", link.now);
        link.settle()?;

        assert_eq!(link.client.state(), QuicConnectionState::Closing);
        let server = link.server_conn()?;
        assert_eq!(server.state(), QuicConnectionState::Draining);
        assert_eq!(server.error(), Some(code));
        assert!(matches!(
            server.send(1, b"late".to_vec()),
            Err(QuicConnectionError::ConnectionLost(QuicConnectionState::Draining))
        ));
        Ok(())
    }
}
