#[cfg(test)]
mod tests {
    use crate::utils::echo::{join, run_echo_client, spawn_echo_server};
    use crate::utils::init_logging;
    use anyhow::Result;
    use intercept_quic_core::prelude::*;
    use test_log::test;
    use tracing::info;

    fn lines() -> Vec<Vec<u8>> {
        [
            "GET / HTTP/1.1",
            "Host: www.example.com",
            "a longer line that still fits in a single packet without trouble",
        ]
        .iter()
        .map(|line| line.as_bytes().to_vec())
        .chain(std::iter::once(vec![0x42; 6000]))
        .collect()
    }

    #[test]
    fn test_echo_over_loopback() -> Result<()> {
        init_logging();
        let (server_addr, server) = spawn_echo_server(1)?;
        info!("Echo server listening on {}", server_addr);

        let client = run_echo_client(server_addr, "localhost", RuntimeConfig::default(), lines())?;
        assert!(client.established);
        assert_eq!(client.echoed(), lines());

        let server = join(server)?;
        assert_eq!(server.connections, 1);
        assert_eq!(server.echoed, lines().len());
        Ok(())
    }

    #[test]
    fn test_echo_with_reordering() -> Result<()> {
        init_logging();
        let (server_addr, server) = spawn_echo_server(1)?;

        let runtime_config = RuntimeConfig {
            tx_packet_reorder_rate: Some(0.3),
            rx_packet_reorder_rate: Some(0.3),
            ..Default::default()
        };
        let client = run_echo_client(server_addr, "localhost", runtime_config, lines())?;
        assert_eq!(client.echoed(), lines());

        join(server)?;
        Ok(())
    }

    #[test]
    fn test_echo_of_http3_frames() -> Result<()> {
        let (server_addr, server) = spawn_echo_server(1)?;

        let mut settings = Http3Settings::default();
        settings.set(Http3SettingParam::MaxFieldSectionSize, 16384);
        let frames = vec![
            Http3Frame::Settings(settings),
            Http3Frame::Headers(vec![0x00, 0x00, 0xd1, 0xd7]),
            Http3Frame::Data(b"hello".to_vec()),
        ];
        let mut request = vec![];
        for frame in &frames {
            request.extend(frame.to_bytes()?);
        }

        let client =
            run_echo_client(server_addr, "h3.test", RuntimeConfig::default(), vec![request])?;
        let echoed = client.echoed();
        assert_eq!(echoed.len(), 1);
        assert_eq!(Http3Frame::decode_frames(&echoed[0])?, frames);

        join(server)?;
        Ok(())
    }
}
