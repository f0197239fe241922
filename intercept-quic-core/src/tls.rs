use anyhow::{anyhow, Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::quic::{self, KeyChange};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{DigitallySignedStruct, KeyLog, SignatureScheme};
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{error, info, trace, warn};

use crate::connection::QuicLevel;
use crate::error_code::TransportErrorCode;
use crate::utils::hex_dump;

const DEFAULT_CERTIFICATE_NAME: &str = "localhost";

// https://www.rfc-editor.org/rfc/rfc8446.html#section-7.1
const CLIENT_EARLY_TRAFFIC_SECRET: &str = "CLIENT_EARLY_TRAFFIC_SECRET";
const CLIENT_HANDSHAKE_TRAFFIC_SECRET: &str = "CLIENT_HANDSHAKE_TRAFFIC_SECRET";
const SERVER_HANDSHAKE_TRAFFIC_SECRET: &str = "SERVER_HANDSHAKE_TRAFFIC_SECRET";
const CLIENT_TRAFFIC_SECRET_0: &str = "CLIENT_TRAFFIC_SECRET_0";
const SERVER_TRAFFIC_SECRET_0: &str = "SERVER_TRAFFIC_SECRET_0";

/// ring provider restricted to the one suite our key schedule implements.
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    let mut provider = rustls::crypto::ring::default_provider();
    provider.cipher_suites = vec![rustls::crypto::ring::cipher_suite::TLS13_AES_128_GCM_SHA256];
    Arc::new(provider)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficSecrets {
    pub client: Vec<u8>,
    pub server: Vec<u8>,
}

#[derive(Default)]
struct CapturedSecrets {
    client_early: Option<Vec<u8>>,
    client_handshake: Option<Vec<u8>>,
    server_handshake: Option<Vec<u8>>,
    client_application: Option<Vec<u8>>,
    server_application: Option<Vec<u8>>,
}

/// Receives the traffic secrets of one TLS session through the key-log hook
/// and optionally appends them to an SSLKEYLOGFILE.
pub(crate) struct SecretCapture {
    secrets: Mutex<CapturedSecrets>,
    key_log_file: Option<Mutex<File>>,
}

impl fmt::Debug for SecretCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCapture")
            .field("key_log_file", &self.key_log_file.is_some())
            .finish()
    }
}

impl SecretCapture {
    fn new(key_log_path: Option<&Path>) -> Result<Self> {
        let key_log_file = match key_log_path {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("Failed to open key log file {:?}", path))?;
                info!("TLS secrets are logged into {:?}", path);
                Some(Mutex::new(file))
            }
            None => None,
        };

        Ok(Self {
            secrets: Mutex::new(CapturedSecrets::default()),
            key_log_file,
        })
    }

    fn take_pair(&self, level: QuicLevel) -> Result<TrafficSecrets> {
        let mut secrets = self
            .secrets
            .lock()
            .map_err(|_| anyhow!("Secret capture lock is poisoned"))?;
        let (client, server) = match level {
            QuicLevel::Handshake => (
                secrets.client_handshake.clone(),
                secrets.server_handshake.clone(),
            ),
            QuicLevel::Application => (
                secrets.client_application.clone(),
                secrets.server_application.clone(),
            ),
            _ => return Err(anyhow!("TLS does not provide secrets for {:?}", level)),
        };

        if level == QuicLevel::Handshake {
            secrets.client_handshake = None;
            secrets.server_handshake = None;
        }

        match (client, server) {
            (Some(client), Some(server)) => Ok(TrafficSecrets { client, server }),
            _ => Err(anyhow!("Traffic secrets for {:?} were not captured", level)),
        }
    }

    // Only present on a resumed session offering early data
    fn take_early(&self) -> Option<Vec<u8>> {
        self.secrets.lock().ok()?.client_early.take()
    }

    fn application_secrets(&self) -> Option<TrafficSecrets> {
        let secrets = self.secrets.lock().ok()?;
        Some(TrafficSecrets {
            client: secrets.client_application.clone()?,
            server: secrets.server_application.clone()?,
        })
    }
}

impl KeyLog for SecretCapture {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        trace!("Captured TLS secret {}", label);
        if let Ok(mut secrets) = self.secrets.lock() {
            let slot = match label {
                CLIENT_EARLY_TRAFFIC_SECRET => Some(&mut secrets.client_early),
                CLIENT_HANDSHAKE_TRAFFIC_SECRET => Some(&mut secrets.client_handshake),
                SERVER_HANDSHAKE_TRAFFIC_SECRET => Some(&mut secrets.server_handshake),
                CLIENT_TRAFFIC_SECRET_0 => Some(&mut secrets.client_application),
                SERVER_TRAFFIC_SECRET_0 => Some(&mut secrets.server_application),
                _ => None,
            };
            if let Some(slot) = slot {
                *slot = Some(secret.to_vec());
            }
        }

        if let Some(file) = &self.key_log_file {
            let line = format!("{} {} {}\n", label, hex_dump(client_random), hex_dump(secret));
            match file.lock() {
                Ok(mut file) => {
                    if let Err(e) = file.write_all(line.as_bytes()) {
                        warn!("Failed to write key log: {}", e);
                    }
                }
                Err(_) => warn!("Key log file lock is poisoned"),
            }
        }
    }
}

/// Produces the certificate presented to a client for a given SNI.
pub trait CertificateIssuer: fmt::Debug + Send + Sync {
    fn issue(&self, server_name: &str) -> Result<Arc<CertifiedKey>>;
}

/// Issues self-signed certificates and keeps one per server name.
#[derive(Debug)]
pub struct SelfSignedIssuer {
    provider: Arc<CryptoProvider>,
    cache: Mutex<HashMap<String, Arc<CertifiedKey>>>,
}

impl Default for SelfSignedIssuer {
    fn default() -> Self {
        Self {
            provider: crypto_provider(),
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl CertificateIssuer for SelfSignedIssuer {
    fn issue(&self, server_name: &str) -> Result<Arc<CertifiedKey>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow!("Certificate cache lock is poisoned"))?;
        if let Some(key) = cache.get(server_name) {
            return Ok(key.clone());
        }

        info!("Generating self-signed certificate for {}", server_name);
        let cert = rcgen::generate_simple_self_signed(vec![server_name.to_string()])
            .map_err(|e| anyhow!("Failed to generate certificate for {}: {}", server_name, e))?;
        let cert_der = CertificateDer::from(
            cert.serialize_der()
                .map_err(|e| anyhow!("Failed to serialize certificate: {}", e))?,
        );
        let key_der =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));
        let signing_key = self
            .provider
            .key_provider
            .load_private_key(key_der)
            .map_err(|e| anyhow!("Unusable private key: {}", e))?;

        let key = Arc::new(CertifiedKey::new(vec![cert_der], signing_key));
        cache.insert(server_name.to_string(), key.clone());
        Ok(key)
    }
}

#[derive(Debug)]
struct SniCertResolver {
    issuer: Arc<dyn CertificateIssuer>,
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name().unwrap_or(DEFAULT_CERTIFICATE_NAME);
        trace!("Resolving certificate for SNI {}", server_name);
        match self.issuer.issue(server_name) {
            Ok(key) => Some(key),
            Err(e) => {
                error!("Certificate issuance for {} failed: {:#}", server_name, e);
                None
            }
        }
    }
}

/// Accepts whatever certificate the upstream presents, the proxy inspects
/// traffic rather than authenticating peers. Handshake signatures are still
/// checked against the presented key.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        trace!("Accepting the certificate of {:?} without verification", server_name);
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum HandshakeOutput {
    // Handshake bytes to carry in CRYPTO frames at this level
    Data(QuicLevel, Vec<u8>),
    ZeroRttKeys(Vec<u8>),
    HandshakeKeys(TrafficSecrets),
    OneRttKeys(TrafficSecrets),
}

/// One rustls QUIC session plus the capture of its secrets.
pub(crate) struct TlsSession {
    conn: quic::Connection,
    capture: Arc<SecretCapture>,
    write_level: QuicLevel,
}

impl TlsSession {
    pub(crate) fn new_client(
        server_name: &str,
        alpn: &str,
        transport_parameters: Vec<u8>,
        key_log_path: Option<&Path>,
    ) -> Result<Self> {
        let provider = crypto_provider();
        let capture = Arc::new(SecretCapture::new(key_log_path)?);

        let mut config = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
            .with_no_client_auth();
        config.alpn_protocols = vec![alpn.as_bytes().to_vec()];
        config.enable_early_data = false;
        config.key_log = capture.clone();

        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| anyhow!("Invalid server name {}: {}", server_name, e))?;
        let conn = quic::ClientConnection::new(
            Arc::new(config),
            quic::Version::V1,
            name,
            transport_parameters,
        )?;

        Ok(Self {
            conn: quic::Connection::Client(conn),
            capture,
            write_level: QuicLevel::Initial,
        })
    }

    pub(crate) fn new_server(
        issuer: Arc<dyn CertificateIssuer>,
        alpn: &str,
        transport_parameters: Vec<u8>,
        key_log_path: Option<&Path>,
    ) -> Result<Self> {
        let provider = crypto_provider();
        let capture = Arc::new(SecretCapture::new(key_log_path)?);

        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SniCertResolver { issuer }));
        config.alpn_protocols = vec![alpn.as_bytes().to_vec()];
        config.max_early_data_size = 0;
        config.key_log = capture.clone();

        let conn =
            quic::ServerConnection::new(Arc::new(config), quic::Version::V1, transport_parameters)?;

        Ok(Self {
            conn: quic::Connection::Server(conn),
            capture,
            write_level: QuicLevel::Initial,
        })
    }

    /// Feeds complete handshake messages received at `level`.
    pub(crate) fn read_handshake(
        &mut self,
        level: QuicLevel,
        data: &[u8],
    ) -> Result<(), TransportErrorCode> {
        trace!("Feeding {} bytes of {:?} handshake data into TLS", data.len(), level);
        self.conn.read_hs(data).map_err(|e| {
            let code = match self.conn.alert() {
                Some(alert) => TransportErrorCode::from_tls_alert(u8::from(alert)),
                None => TransportErrorCode::ProtocolViolation,
            };
            error!("TLS handshake failed at {:?}: {}, closing with {:?}", level, e, code);
            code
        })
    }

    /// Drains everything TLS wants to send. Bytes written before a key
    /// change belong to the level that was current until then, except for
    /// the client: it has nothing left to say in Initial once the Handshake
    /// keys arrive, so whatever comes with them is already Handshake data.
    pub(crate) fn write_handshake(&mut self) -> Result<Vec<HandshakeOutput>> {
        let mut outputs = vec![];
        loop {
            let mut buf = vec![];
            let change = self.conn.write_hs(&mut buf);
            let level = match (&change, &self.conn) {
                (Some(KeyChange::Handshake { .. }), quic::Connection::Client(_)) => {
                    QuicLevel::Handshake
                }
                _ => self.write_level,
            };
            if !buf.is_empty() {
                trace!("TLS produced {} bytes at {:?}", buf.len(), level);
                outputs.push(HandshakeOutput::Data(level, buf));
            }

            match change {
                None => break,
                Some(KeyChange::Handshake { .. }) => {
                    outputs.push(HandshakeOutput::HandshakeKeys(
                        self.capture.take_pair(QuicLevel::Handshake)?,
                    ));
                    self.write_level = QuicLevel::Handshake;
                }
                Some(KeyChange::OneRtt { .. }) => {
                    outputs.push(HandshakeOutput::OneRttKeys(
                        self.capture.take_pair(QuicLevel::Application)?,
                    ));
                    self.write_level = QuicLevel::Application;
                }
            }
        }
        if let Some(secret) = self.capture.take_early() {
            outputs.push(HandshakeOutput::ZeroRttKeys(secret));
        }
        Ok(outputs)
    }

    pub(crate) fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    pub(crate) fn peer_transport_parameters(&self) -> Option<&[u8]> {
        self.conn.quic_transport_parameters()
    }

    pub(crate) fn server_name(&self) -> Option<&str> {
        match &self.conn {
            quic::Connection::Server(conn) => conn.server_name(),
            quic::Connection::Client(_) => None,
        }
    }

    pub(crate) fn alpn(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }

    pub(crate) fn application_secrets(&self) -> Option<TrafficSecrets> {
        self.capture.application_secrets()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pump(from: &mut TlsSession, to: &mut TlsSession) -> Result<Vec<HandshakeOutput>> {
        let outputs = from.write_handshake()?;
        for output in &outputs {
            if let HandshakeOutput::Data(level, data) = output {
                to.read_handshake(*level, data)
                    .map_err(|code| anyhow!("handshake failed {:?}", code))?;
            }
        }
        Ok(outputs)
    }

    #[test]
    fn test_handshake_levels_and_secrets() -> Result<()> {
        let mut client = TlsSession::new_client("example.com", "h3", vec![0x01, 0x01, 0x0a], None)?;
        let mut server = TlsSession::new_server(
            Arc::new(SelfSignedIssuer::default()),
            "h3",
            vec![0x01, 0x01, 0x14],
            None,
        )?;

        // ClientHello
        let outputs = pump(&mut client, &mut server)?;
        assert!(matches!(outputs.as_slice(), [HandshakeOutput::Data(QuicLevel::Initial, _)]));
        assert_eq!(server.server_name(), Some("example.com"));

        // ServerHello, then the encrypted flight and 0.5-RTT keys
        let outputs = pump(&mut server, &mut client)?;
        assert!(matches!(outputs[0], HandshakeOutput::Data(QuicLevel::Initial, _)));
        assert!(matches!(outputs[1], HandshakeOutput::HandshakeKeys(_)));
        assert!(matches!(outputs[2], HandshakeOutput::Data(QuicLevel::Handshake, _)));
        assert!(matches!(outputs[3], HandshakeOutput::OneRttKeys(_)));

        // Client Finished, which must never be labelled Initial
        let outputs = pump(&mut client, &mut server)?;
        assert!(outputs
            .iter()
            .any(|o| matches!(o, HandshakeOutput::Data(QuicLevel::Handshake, _))));
        assert!(!outputs
            .iter()
            .any(|o| matches!(o, HandshakeOutput::Data(QuicLevel::Initial, _))));

        assert!(!client.is_handshaking());
        assert!(!server.is_handshaking());
        assert_eq!(client.application_secrets(), server.application_secrets());
        assert_eq!(client.peer_transport_parameters(), Some(&[0x01, 0x01, 0x14][..]));
        assert_eq!(server.peer_transport_parameters(), Some(&[0x01, 0x01, 0x0a][..]));
        assert_eq!(client.alpn(), Some(&b"h3"[..]));
        Ok(())
    }

    #[test]
    fn test_self_signed_issuer_caches_per_name() -> Result<()> {
        let issuer = SelfSignedIssuer::default();
        let first = issuer.issue("a.example")?;
        let again = issuer.issue("a.example")?;
        let other = issuer.issue("b.example")?;
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        Ok(())
    }

    #[test]
    fn test_early_secret_is_taken_once() -> Result<()> {
        let capture = SecretCapture::new(None)?;
        assert_eq!(capture.take_early(), None);
        capture.log(CLIENT_EARLY_TRAFFIC_SECRET, &[0x01], &[0x0e; 32]);
        assert_eq!(capture.take_early(), Some(vec![0x0e; 32]));
        assert_eq!(capture.take_early(), None);
        Ok(())
    }

    #[test]
    fn test_key_log_file_lines() -> Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        let capture = SecretCapture::new(Some(file.path()))?;
        capture.log(CLIENT_TRAFFIC_SECRET_0, &[0xaa, 0xbb], &[0x01, 0x02]);
        capture.log(SERVER_TRAFFIC_SECRET_0, &[0xaa, 0xbb], &[0x03]);

        let content = std::fs::read_to_string(file.path())?;
        assert_eq!(
            content,
            "CLIENT_TRAFFIC_SECRET_0 aabb 0102\nSERVER_TRAFFIC_SECRET_0 aabb 03\n"
        );
        assert_eq!(
            capture.application_secrets(),
            Some(TrafficSecrets {
                client: vec![0x01, 0x02],
                server: vec![0x03]
            })
        );
        Ok(())
    }
}
