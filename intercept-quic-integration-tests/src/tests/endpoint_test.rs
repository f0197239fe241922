#[cfg(test)]
mod tests {
    use crate::utils::{drain_messages, init_logging, SERVER_ADDR};
    use anyhow::{anyhow, Result};
    use intercept_quic_core::prelude::*;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use test_log::test;

    struct Client {
        conn: QuicConnection,
        addr: SocketAddr,
    }

    fn client(server_name: &str, port: u16, now: Instant) -> Result<Client> {
        let mut config = QuicConfig::default();
        config.set_server_name(server_name);
        Ok(Client {
            conn: QuicConnection::connect(config, SERVER_ADDR.into(), now)?,
            addr: SocketAddr::from(([198, 51, 100, 1], port)),
        })
    }

    // Server datagrams go to whichever client owns the destination address
    fn settle(table: &mut ConnectionTable, clients: &mut [Client], now: Instant) -> Result<()> {
        for _ in 0..64 {
            let mut moved = false;
            for client in clients.iter_mut() {
                while let Some((datagram, _)) = client.conn.poll_transmit(now)? {
                    table.provide_datagram(&datagram, client.addr, now);
                    moved = true;
                }
            }
            while let Some((datagram, to)) = table.poll_transmit(now)? {
                let client = clients
                    .iter_mut()
                    .find(|client| client.addr == to)
                    .ok_or_else(|| anyhow!("datagram for unknown client {}", to))?;
                client.conn.provide_datagram(&datagram, SERVER_ADDR.into(), now);
                moved = true;
            }
            if !moved {
                return Ok(());
            }
        }
        Err(anyhow!("table did not settle"))
    }

    fn table() -> ConnectionTable {
        ConnectionTable::new(QuicConfig::default(), Arc::new(SelfSignedIssuer::default()))
    }

    fn accept_all(table: &mut ConnectionTable) -> Vec<usize> {
        let mut accepted = vec![];
        while let Some(key) = table.accept() {
            accepted.push(key);
        }
        accepted
    }

    #[test]
    fn test_clients_get_separate_connections() -> Result<()> {
        init_logging();
        let now = Instant::now();
        let mut table = table();
        let mut clients = vec![client("a.test", 40001, now)?, client("b.test", 40002, now)?];
        settle(&mut table, &mut clients, now)?;

        assert_eq!(table.len(), 2);
        let accepted = accept_all(&mut table);
        assert_eq!(accepted.len(), 2);

        clients[0].conn.send(0, b"from a".to_vec())?;
        clients[1].conn.send(0, b"from b".to_vec())?;
        settle(&mut table, &mut clients, now)?;

        for key in accepted {
            let conn = table.get_mut(key).ok_or_else(|| anyhow!("missing {}", key))?;
            let expected = match conn.server_name() {
                Some("a.test") => b"from a".to_vec(),
                Some("b.test") => b"from b".to_vec(),
                other => return Err(anyhow!("unexpected SNI {:?}", other)),
            };
            assert_eq!(drain_messages(conn), vec![QuicMessage::new(0, expected)]);
        }
        Ok(())
    }

    #[test]
    fn test_server_replies_on_the_accepted_connection() -> Result<()> {
        let now = Instant::now();
        let mut table = table();
        let mut clients = vec![client("reply.test", 40003, now)?];
        settle(&mut table, &mut clients, now)?;

        let key = table.accept().ok_or_else(|| anyhow!("nothing accepted"))?;
        let conn = table.get_mut(key).ok_or_else(|| anyhow!("missing {}", key))?;
        conn.send(1, b"pushed by server".to_vec())?;
        conn.send(3, b"server uni".to_vec())?;
        settle(&mut table, &mut clients, now)?;

        assert_eq!(
            drain_messages(&mut clients[0].conn),
            vec![
                QuicMessage::new(1, b"pushed by server".to_vec()),
                QuicMessage::new(3, b"server uni".to_vec()),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_closed_connections_leave_the_table() -> Result<()> {
        let now = Instant::now();
        let mut table = table();
        let mut clients = vec![client("close.test", 40004, now)?, client("stay.test", 40005, now)?];
        settle(&mut table, &mut clients, now)?;
        assert_eq!(accept_all(&mut table).len(), 2);

        clients[0]
            .conn
            .close(TransportErrorCode::NoError.into(), "leaving", now);
        settle(&mut table, &mut clients, now)?;

        // Past the draining period, before the idle timeout
        let later = now + Duration::from_secs(5);
        table.handle_timeout(later);
        let removed = table.remove_closed();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].1.server_name(), Some("close.test"));
        assert_eq!(table.len(), 1);

        // Datagrams of the removed connection no longer match a route
        clients[0].conn.handle_timeout(later);
        assert!(clients[0].conn.is_closed());
        clients[1].conn.send(0, b"still here".to_vec())?;
        settle(&mut table, &mut clients[1..], later)?;
        let key = table.keys()[0];
        let conn = table.get_mut(key).ok_or_else(|| anyhow!("missing {}", key))?;
        assert_eq!(drain_messages(conn), vec![QuicMessage::new(0, b"still here".to_vec())]);
        Ok(())
    }
}
