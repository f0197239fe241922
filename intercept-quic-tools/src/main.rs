use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgMatches, Command};
use clap_num::number_range;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

use intercept_quic_core::prelude::*;
mod echo_context;
use echo_context::{EchoClientContext, EchoServerContext};

fn limitation_initial_packet_size(s: &str) -> Result<u16, String> {
    number_range(s, DEFAULT_INITIAL_PACKET_SIZE, u16::MAX)
}

fn limitation_udp_payload_size(s: &str) -> Result<u16, String> {
    number_range(s, MIN_UDP_PAYLOAD_SIZE, MAX_UDP_PAYLOAD_SIZE)
}

fn more_then_zero(s: &str) -> Result<usize, String> {
    number_range(s, 1, usize::MAX)
}

fn parse_hex_to_bytes(hex: &str) -> Result<Vec<u8>, String> {
    if hex.len() % 2 != 0 {
        return Err(format!(
            "Hex string '{}' must have an even number of characters.",
            hex
        ));
    }

    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| format!("Invalid hex character in '{}'.", &hex[i..i + 2]))
        })
        .collect()
}

fn validate_rate(s: &str) -> Result<f32, String> {
    let rate: f32 = s
        .parse()
        .map_err(|_| format!("Invalid float value: {}", s))?;
    if !(0.0..=1.0).contains(&rate) {
        return Err(format!("Rate must be between 0.0 and 1.0, got {}", rate));
    }
    Ok(rate)
}

fn resolve(address: &str) -> Result<SocketAddr> {
    address
        .to_socket_addrs()?
        .next()
        .with_context(|| format!("Invalid address: {}", address))
}

// Options shared by every subcommand
fn transport_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("idle_timeout")
                .short('i')
                .long("idle-timeout")
                .help("QUIC protocol idle timeout in milliseconds (default: 30000, 0 disables it)")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("first_initial_packet_size")
                .long("first-initial-packet-size")
                .help("Size of datagrams carrying Initial packets in bytes (default: 1200, range [1200, 65535])")
                .value_parser(limitation_initial_packet_size),
        )
        .arg(
            Arg::new("scid")
                .long("scid")
                .help("Custom your own QUIC `Source Connection ID` (hex string, optional)")
                .value_parser(parse_hex_to_bytes),
        )
        .arg(
            Arg::new("alpn")
                .long("alpn")
                .help("Alpn of QUIC, default value is `h3`")
                .num_args(1),
        )
        .arg(
            Arg::new("ssl_key_log")
                .long("ssl-key-log")
                .help("File to append TLS secrets to, in SSLKEYLOGFILE format")
                .num_args(1),
        )
        .arg(
            Arg::new("ack_delay_exponent")
                .long("ack-delay-exponent")
                .help("Transport Parameter: Exponent used to decode ACK Delay field (default: 3)")
                .value_parser(clap::value_parser!(u8)),
        )
        .arg(
            Arg::new("max_ack_delay")
                .long("max-ack-delay")
                .help("Transport Parameter: Maximum amount of time in milliseconds to delay sending acknowledgments (default: 25)")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("max_udp_payload_size")
                .long("max-udp-payload-size")
                .help("Transport Parameter: Maximum size of UDP payloads in bytes (default: 65527, range [1200, 65527])")
                .value_parser(limitation_udp_payload_size),
        )
        .arg(
            Arg::new("keep_handshake_keys")
                .long("keep-handshake-keys")
                .help("Keep Handshake keys after the handshake is confirmed")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("initial_pto")
                .long("initial-pto")
                .help("Let the probe timeout fire while only Initial keys exist")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("max_quic_packet_send_count")
                .long("max-quic-packet-send-count")
                .help("Maximum number of UDP datagrams sent by this process. \
                    This is a testing parameter that artificially limits packet transmission. \
                    By default, there is no limit.")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("packet_loss_rate")
                .long("loss-rate")
                .help("Packet loss rate (0.0 - 1.0) for both sending and receiving. \
                    Will be overridden by --send-loss-rate or --recv-loss-rate if specified")
                .value_parser(validate_rate),
        )
        .arg(
            Arg::new("send_packet_loss_rate")
                .long("send-loss-rate")
                .help("Packet loss rate (0.0 - 1.0) for sending packets. Takes precedence over --loss-rate")
                .value_parser(validate_rate),
        )
        .arg(
            Arg::new("recv_packet_loss_rate")
                .long("recv-loss-rate")
                .help("Packet loss rate (0.0 - 1.0) for receiving packets. Takes precedence over --loss-rate")
                .value_parser(validate_rate),
        )
        .arg(
            Arg::new("packet_reorder_rate")
                .long("reorder-rate")
                .help("Packet reorder rate (0.0 - 1.0) for both sending and receiving. \
                    Will be overridden by --send-reorder-rate or --recv-reorder-rate if specified")
                .value_parser(validate_rate),
        )
        .arg(
            Arg::new("send_packet_reorder_rate")
                .long("send-reorder-rate")
                .help("Packet reorder rate (0.0 - 1.0) for sending packets. Takes precedence over --reorder-rate")
                .value_parser(validate_rate),
        )
        .arg(
            Arg::new("recv_packet_reorder_rate")
                .long("recv-reorder-rate")
                .help("Packet reorder rate (0.0 - 1.0) for receiving packets. Takes precedence over --reorder-rate")
                .value_parser(validate_rate),
        )
}

fn quic_config(matches: &ArgMatches) -> QuicConfig {
    let mut config = QuicConfig::default();

    if let Some(idle_timeout) = matches.get_one::<u64>("idle_timeout") {
        config.set_idle_timeout(*idle_timeout);
    }
    if let Some(size) = matches.get_one::<u16>("first_initial_packet_size") {
        config.set_first_initial_packet_size(*size);
    }
    if let Some(scid) = matches.get_one::<Vec<u8>>("scid") {
        if let Ok(scid) = ConnectionId::new(scid) {
            config.set_scid(scid);
        }
    }
    if let Some(alpn) = matches.get_one::<String>("alpn") {
        config.set_alpn(alpn);
    }
    if let Some(log_file) = matches.get_one::<String>("ssl_key_log") {
        config.set_key_log_file(log_file);
    }
    if let Some(value) = matches.get_one::<u8>("ack_delay_exponent") {
        config.set_ack_delay_exponent(*value);
    }
    if let Some(value) = matches.get_one::<u16>("max_ack_delay") {
        config.set_max_ack_delay(*value);
    }
    if let Some(value) = matches.get_one::<u16>("max_udp_payload_size") {
        config.set_max_udp_payload_size(*value);
    }
    if matches.get_flag("keep_handshake_keys") {
        config.set_discard_handshake_keys_on_confirm(false);
    }
    if matches.get_flag("initial_pto") {
        config.set_suppress_initial_pto(false);
    }
    config
}

fn runtime_config(matches: &ArgMatches) -> RuntimeConfig {
    let loss = matches.get_one::<f32>("packet_loss_rate").copied();
    let reorder = matches.get_one::<f32>("packet_reorder_rate").copied();

    RuntimeConfig {
        max_quic_packet_send_count: matches.get_one::<u64>("max_quic_packet_send_count").copied(),
        tx_packet_loss_rate: matches.get_one::<f32>("send_packet_loss_rate").copied().or(loss),
        rx_packet_loss_rate: matches.get_one::<f32>("recv_packet_loss_rate").copied().or(loss),
        tx_packet_reorder_rate: matches
            .get_one::<f32>("send_packet_reorder_rate")
            .copied()
            .or(reorder),
        rx_packet_reorder_rate: matches
            .get_one::<f32>("recv_packet_reorder_rate")
            .copied()
            .or(reorder),
        ..Default::default()
    }
}

fn max_connections(matches: &ArgMatches) -> Option<usize> {
    matches.get_one::<usize>("max_connections").copied()
}

fn run_client(matches: &ArgMatches) -> Result<()> {
    let target_address = matches
        .get_one::<String>("target_address")
        .ok_or_else(|| anyhow!("--target-address is required"))?;
    let target_addr = resolve(target_address)?;

    let mut config = quic_config(matches);
    match matches.get_one::<String>("server_name") {
        Some(sn) => config.set_server_name(sn),
        None => config.set_server_name(target_address.split(':').next().unwrap_or(target_address)),
    }
    if let Some(dcid) = matches.get_one::<Vec<u8>>("original_dcid") {
        config.set_dcid(ConnectionId::new(dcid)?);
    }

    let echo_file = matches
        .get_one::<String>("echo_file")
        .ok_or_else(|| anyhow!("--echo is required"))?;
    let window = matches.get_one::<usize>("echo_stream_number").copied().unwrap_or(1);
    let mut uctx = QuicUserContext::new(EchoClientContext::new(echo_file, window)?);

    let mut runtime = QuicRuntime::new(RuntimeConfig {
        target_address: target_addr,
        ..runtime_config(matches)
    });
    let mut qconn = QuicConnection::connect(config, target_addr, Instant::now())?;
    runtime.run(&mut qconn, &mut uctx)?;

    let echo = uctx.user_data();
    info!("All streams finished, exiting: {} verified", echo.verified());
    Ok(())
}

fn run_server(matches: &ArgMatches) -> Result<()> {
    let listen = matches
        .get_one::<String>("listen")
        .ok_or_else(|| anyhow!("--listen is required"))?;
    let mut runtime = QuicRuntime::new(RuntimeConfig {
        listen_address: resolve(listen)?,
        ..runtime_config(matches)
    });
    let local_addr = runtime.listen()?;
    info!("Echo server listening on {}", local_addr);

    let mut table =
        ConnectionTable::new(quic_config(matches), Arc::new(SelfSignedIssuer::default()));
    let mut uctx = QuicUserContext::new(EchoServerContext::default());
    runtime.serve(&mut table, &mut uctx, max_connections(matches))
}

fn run_forward(matches: &ArgMatches) -> Result<()> {
    let listen = matches
        .get_one::<String>("listen")
        .ok_or_else(|| anyhow!("--listen is required"))?;
    let upstream = matches
        .get_one::<String>("upstream")
        .ok_or_else(|| anyhow!("--upstream is required"))?;
    let upstream_addr = resolve(upstream)?;

    let mut runtime = QuicRuntime::new(RuntimeConfig {
        listen_address: resolve(listen)?,
        target_address: upstream_addr,
        ..runtime_config(matches)
    });
    let local_addr = runtime.listen()?;
    info!("Forward proxy listening on {}, upstream {}", local_addr, upstream_addr);

    let config = quic_config(matches);
    let downstream = ConnectionTable::new(config.clone(), Arc::new(SelfSignedIssuer::default()));
    let mut proxy = ForwardProxy::new(downstream, config, upstream_addr);
    runtime.forward(&mut proxy, max_connections(matches))
}

fn init_logging(matches: &ArgMatches) -> Result<()> {
    let env_filter = EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()));
    let is_debug = matches.get_flag("debug");

    if let Some(log_file) = matches.get_one::<String>("log_file") {
        let file = std::fs::File::create(log_file)
            .with_context(|| format!("Failed to create log file: {}", log_file))?;
        let subscriber = tracing_subscriber::fmt::SubscriberBuilder::default()
            .with_env_filter(env_filter)
            .with_writer(file)
            .with_ansi(false)
            .with_line_number(is_debug)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = tracing_subscriber::fmt::SubscriberBuilder::default()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_line_number(is_debug)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    // rustls logs through the `log` facade
    tracing_log::LogTracer::init()?;
    Ok(())
}

fn main() -> Result<()> {
    let client = transport_args(
        Command::new("client").about("Echo the lines of a file through a QUIC server"),
    )
        .arg(
            Arg::new("target_address")
                .short('t')
                .long("target-address")
                .help("Target address to establish QUIC connection with")
                .required(true)
                .num_args(1),
        )
        .arg(
            Arg::new("echo_file")
                .short('e')
                .long("echo")
                .help("File path to read lines from for echo testing")
                .required(true)
                .num_args(1),
        )
        .arg(
            Arg::new("echo_stream_number")
                .long("echo-stream-number")
                .help("Number of QUIC streams in flight in echo mode (default: 1)")
                .default_value("1")
                .value_parser(more_then_zero),
        )
        .arg(
            Arg::new("server_name")
                .long("sni")
                .help("TLS Server Name Identification of QUIC, default value is target_address")
                .num_args(1),
        )
        .arg(
            Arg::new("original_dcid")
                .long("odcid")
                .help("Custom your own QUIC original `Destination Connection ID` (hex string, optional)")
                .value_parser(parse_hex_to_bytes),
        );

    let max_connections_arg = Arg::new("max_connections")
        .long("max-connections")
        .help("Exit after this many connections have closed (default: run forever)")
        .value_parser(more_then_zero);

    let server = transport_args(
        Command::new("server").about("QUIC echo server with certificates issued per SNI"),
    )
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .help("Address to listen on")
                .default_value("127.0.0.1:4433")
                .num_args(1),
        )
        .arg(max_connections_arg.clone());

    let forward = transport_args(
        Command::new("forward").about("Intercept QUIC connections and relay them upstream"),
    )
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .help("Address to intercept connections on")
                .default_value("127.0.0.1:4433")
                .num_args(1),
        )
        .arg(
            Arg::new("upstream")
                .short('u')
                .long("upstream")
                .help("Address of the real server")
                .required(true)
                .num_args(1),
        )
        .arg(max_connections_arg);

    let matches = Command::new("intercept-quic")
        .version("0.1.0")
        .about("QUIC client, echo server and intercepting forward proxy")
        .subcommand_required(true)
        .arg(
            Arg::new("log_file")
                .long("log-file")
                .help("Path to write all logs to (default: stderr)")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .help("Enable debug mode to include source code line numbers in logs")
                .global(true)
                .action(clap::ArgAction::SetTrue),
        )
        .subcommand(client)
        .subcommand(server)
        .subcommand(forward)
        .get_matches();

    init_logging(&matches)?;

    match matches.subcommand() {
        Some(("client", sub)) => run_client(sub),
        Some(("server", sub)) => run_server(sub),
        Some(("forward", sub)) => run_forward(sub),
        _ => Err(anyhow!("Unknown subcommand")),
    }
}
