#[cfg(test)]
mod tests {
    use crate::utils::echo::{join, run_echo_client, spawn_echo_server, spawn_forward_proxy};
    use crate::utils::init_logging;
    use anyhow::Result;
    use intercept_quic_core::prelude::*;
    use test_log::test;
    use tracing::info;

    #[test]
    fn test_forward_proxy_relays_echo() -> Result<()> {
        init_logging();
        let (origin_addr, origin) = spawn_echo_server(1)?;
        let (proxy_addr, proxy) = spawn_forward_proxy(origin_addr, 1)?;
        info!("Proxy {} in front of origin {}", proxy_addr, origin_addr);

        let payloads = vec![b"first request".to_vec(), vec![0x7e; 3000], b"last".to_vec()];
        let client = run_echo_client(
            proxy_addr,
            "origin.test",
            RuntimeConfig::default(),
            payloads.clone(),
        )?;
        assert!(client.established);
        assert_eq!(client.echoed(), payloads);

        join(proxy)?;
        let origin = join(origin)?;
        assert_eq!(origin.connections, 1);
        assert_eq!(origin.echoed, payloads.len());
        Ok(())
    }

    #[test]
    fn test_forward_proxy_serves_consecutive_clients() -> Result<()> {
        let (origin_addr, origin) = spawn_echo_server(2)?;
        let (proxy_addr, proxy) = spawn_forward_proxy(origin_addr, 2)?;

        for server_name in ["one.test", "two.test"] {
            let payloads = vec![format!("hello {}", server_name).into_bytes()];
            let client = run_echo_client(
                proxy_addr,
                server_name,
                RuntimeConfig::default(),
                payloads.clone(),
            )?;
            assert_eq!(client.echoed(), payloads);
        }

        join(proxy)?;
        assert_eq!(join(origin)?.connections, 2);
        Ok(())
    }
}
