use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use anyhow::{anyhow, Result};
use ring::aead;
use ring::hkdf::{KeyType, Prk, Salt, HKDF_SHA256};
use tracing::{info, trace};

use crate::connection::{QuicLevel, Role};

pub(crate) const QUIC_SHA256_SECRET_LENGTH: usize = 32;

// Only TLS_AES_128_GCM_SHA256 is negotiated, so every key below is AES-128 sized
const QUIC_AES128_KEY_LENGTH: usize = 16;
const QUIC_AES128_HP_LENGTH: usize = 16;
const QUIC_IV_LENGTH: usize = 12;

pub(crate) const QUIC_SAMPLE_LENGTH: usize = 16;
pub(crate) const QUIC_HP_MASK_LENGTH: usize = 5;
pub(crate) const QUIC_TAG_LENGTH: usize = 16;

// https://www.rfc-editor.org/rfc/rfc9001.html#section-5.2
const CLIENT_SECRET_LABEL: &[u8] = b"tls13 client in";
const SERVER_SECRET_LABEL: &[u8] = b"tls13 server in";

// https://www.rfc-editor.org/rfc/rfc9001.html#section-5.1
const QUIC_KEY_LABEL: &[u8] = b"tls13 quic key";
const QUIC_IV_LABEL: &[u8] = b"tls13 quic iv";
const QUIC_HP_LABEL: &[u8] = b"tls13 quic hp";

const QUIC_V1_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c, 0xad,
    0xcc, 0xbb, 0x7f, 0x0a,
];

// https://www.rfc-editor.org/rfc/rfc9001.html#section-5.8
const QUIC_RETRY_SECRET_KEY: [u8; 16] = [
    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68, 0xc8, 0x4e,
];
const QUIC_RETRY_NONCE: [u8; 12] = [
    0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb,
];

struct KeyTypeForOutput {
    length: usize,
}

impl KeyType for KeyTypeForOutput {
    fn len(&self) -> usize {
        self.length
    }
}

// HKDF-Expand-Label from TLS 1.3, the info is
// struct { uint16 length; opaque label<7..255>; opaque context<0..255>; }
pub(crate) fn hkdf_expand(
    prk: &Prk,
    output: &mut [u8],
    label: &[u8],
    context: &[u8],
) -> Result<()> {
    let output_len = u16::to_be_bytes(output.len() as u16);
    let label_len = [label.len() as u8];
    let context_len = [context.len() as u8];
    let info = [
        &output_len[..],
        &label_len[..],
        label,
        &context_len[..],
        context,
    ];

    trace!(
        "HKDF expand, output size {}, label {:?}, context size {}",
        output.len(),
        std::str::from_utf8(label),
        context.len()
    );

    prk.expand(
        &info,
        KeyTypeForOutput {
            length: output.len(),
        },
    )
    .map_err(|e| anyhow!("Failed to expand hkdf due to {e}"))?
    .fill(output)
    .map_err(|e| anyhow!("Failed to fill hkdf output due to {e}"))?;

    Ok(())
}

/// Derives the client and server Initial secrets from the client's first
/// Destination Connection ID.
pub(crate) fn derive_initial_secrets(dcid: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let initial_prk = Salt::new(HKDF_SHA256, &QUIC_V1_SALT).extract(dcid);

    let mut client_secret = vec![0u8; QUIC_SHA256_SECRET_LENGTH];
    hkdf_expand(&initial_prk, &mut client_secret, CLIENT_SECRET_LABEL, &[])?;

    let mut server_secret = vec![0u8; QUIC_SHA256_SECRET_LENGTH];
    hkdf_expand(&initial_prk, &mut server_secret, SERVER_SECRET_LABEL, &[])?;

    trace!(
        "Derived initial secrets from dcid {:x?}: client {:x?}, server {:x?}",
        dcid,
        client_secret,
        server_secret
    );
    Ok((client_secret, server_secret))
}

/// Packet protection material for one direction at one encryption level.
#[derive(Clone, Debug)]
pub struct QuicKey {
    key: [u8; QUIC_AES128_KEY_LENGTH],
    iv: [u8; QUIC_IV_LENGTH],
    hp: [u8; QUIC_AES128_HP_LENGTH],
}

impl QuicKey {
    pub fn from_secret(secret: &[u8]) -> Result<Self> {
        if secret.len() != QUIC_SHA256_SECRET_LENGTH {
            return Err(anyhow!(
                "Traffic secret must be {} bytes, got {}",
                QUIC_SHA256_SECRET_LENGTH,
                secret.len()
            ));
        }

        let prk = Prk::new_less_safe(HKDF_SHA256, secret);
        let mut quic_key = QuicKey {
            key: [0u8; QUIC_AES128_KEY_LENGTH],
            iv: [0u8; QUIC_IV_LENGTH],
            hp: [0u8; QUIC_AES128_HP_LENGTH],
        };
        hkdf_expand(&prk, &mut quic_key.key, QUIC_KEY_LABEL, &[])?;
        hkdf_expand(&prk, &mut quic_key.iv, QUIC_IV_LABEL, &[])?;
        hkdf_expand(&prk, &mut quic_key.hp, QUIC_HP_LABEL, &[])?;

        Ok(quic_key)
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn hp(&self) -> &[u8] {
        &self.hp
    }

    // https://www.rfc-editor.org/rfc/rfc9001.html#section-5.4.3
    // AES-ECB on a single block, used only as the header protection PRF
    pub fn header_protection_mask(&self, sample: &[u8]) -> Result<[u8; QUIC_HP_MASK_LENGTH]> {
        if sample.len() < QUIC_SAMPLE_LENGTH {
            return Err(anyhow!(
                "Header protection sample needs {} bytes, got {}",
                QUIC_SAMPLE_LENGTH,
                sample.len()
            ));
        }

        let mut block = [0u8; QUIC_SAMPLE_LENGTH];
        block.copy_from_slice(&sample[..QUIC_SAMPLE_LENGTH]);
        let hp: &[u8] = &self.hp;
        let block_slice: &mut [u8] = &mut block;
        Aes128::new(hp.into()).encrypt_block(block_slice.into());

        let mut mask = [0u8; QUIC_HP_MASK_LENGTH];
        mask.copy_from_slice(&block[..QUIC_HP_MASK_LENGTH]);
        trace!("Generated header protection mask {:x?}", mask);
        Ok(mask)
    }

    // https://www.rfc-editor.org/rfc/rfc9001.html#section-5.3
    // The 62 bits of the reconstructed packet number in network byte order are
    // left-padded with zeros to the size of the IV, then XORed with the IV
    fn nonce(&self, packet_number: u64) -> [u8; QUIC_IV_LENGTH] {
        let mut nonce = [0u8; QUIC_IV_LENGTH];
        nonce[QUIC_IV_LENGTH - 8..].copy_from_slice(&packet_number.to_be_bytes());
        nonce
            .iter_mut()
            .zip(self.iv.iter())
            .for_each(|(n, iv)| *n ^= *iv);
        nonce
    }

    fn aead_key(&self) -> Result<aead::LessSafeKey> {
        Ok(aead::LessSafeKey::new(
            aead::UnboundKey::new(&aead::AES_128_GCM, &self.key)
                .map_err(|e| anyhow!("Failed to create AEAD key, due to {e}"))?,
        ))
    }

    /// Encrypts `plaintext`, authenticating `header`; the tag is appended.
    pub fn seal(&self, packet_number: u64, header: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut in_out = plaintext.to_vec();
        self.aead_key()?
            .seal_in_place_append_tag(
                aead::Nonce::assume_unique_for_key(self.nonce(packet_number)),
                aead::Aad::from(header),
                &mut in_out,
            )
            .map_err(|e| anyhow!("Failed to seal packet {}, due to {e}", packet_number))?;

        trace!(
            "Sealed packet {}, plaintext size {}, ciphertext size {}",
            packet_number,
            plaintext.len(),
            in_out.len()
        );
        Ok(in_out)
    }

    pub fn open(&self, packet_number: u64, header: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < QUIC_TAG_LENGTH {
            return Err(anyhow!(
                "Ciphertext of {} bytes is shorter than the AEAD tag",
                ciphertext.len()
            ));
        }

        let mut in_out = ciphertext.to_vec();
        let plaintext_len = self
            .aead_key()?
            .open_in_place(
                aead::Nonce::assume_unique_for_key(self.nonce(packet_number)),
                aead::Aad::from(header),
                &mut in_out,
            )
            .map_err(|e| anyhow!("Failed to open packet {}, due to {e}", packet_number))?
            .len();
        in_out.truncate(plaintext_len);

        trace!(
            "Opened packet {}, ciphertext size {}, plaintext size {}",
            packet_number,
            ciphertext.len(),
            plaintext_len
        );
        Ok(in_out)
    }
}

#[derive(Clone, Debug)]
struct QuicKeyPair {
    client: QuicKey,
    server: QuicKey,
}

impl QuicKeyPair {
    fn from_secrets(client_secret: &[u8], server_secret: &[u8]) -> Result<Self> {
        Ok(Self {
            client: QuicKey::from_secret(client_secret)?,
            server: QuicKey::from_secret(server_secret)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    Pending,
    Installed,
    Discarded,
}

/// Per-level packet protection keys, seen from one endpoint's role.
#[derive(Debug)]
pub(crate) struct QuicCrypto {
    role: Role,
    initial: Option<QuicKeyPair>,
    zero_rtt: Option<QuicKey>,
    handshake: Option<QuicKeyPair>,
    application: Option<QuicKeyPair>,
    states: [KeyState; 4],
}

fn level_index(level: QuicLevel) -> usize {
    match level {
        QuicLevel::Initial => 0,
        QuicLevel::ZeroRtt => 1,
        QuicLevel::Handshake => 2,
        QuicLevel::Application => 3,
    }
}

impl QuicCrypto {
    pub(crate) fn new(role: Role) -> Self {
        Self {
            role,
            initial: None,
            zero_rtt: None,
            handshake: None,
            application: None,
            states: [KeyState::Pending; 4],
        }
    }

    // https://www.rfc-editor.org/rfc/rfc9001#section-5.2-9
    // Recomputed after a Retry, so the Initial state goes back to installed
    pub(crate) fn compute_initial_keys(&mut self, dcid: &[u8]) -> Result<()> {
        let (client_secret, server_secret) = derive_initial_secrets(dcid)?;
        self.initial = Some(QuicKeyPair::from_secrets(&client_secret, &server_secret)?);
        self.states[level_index(QuicLevel::Initial)] = KeyState::Installed;
        info!("Generated Initial keys for {:?}", self.role);
        Ok(())
    }

    pub(crate) fn install_zero_rtt_keys(&mut self, client_secret: &[u8]) -> Result<()> {
        self.zero_rtt = Some(QuicKey::from_secret(client_secret)?);
        self.states[level_index(QuicLevel::ZeroRtt)] = KeyState::Installed;
        info!("Generated 0-RTT keys for {:?}", self.role);
        Ok(())
    }

    pub(crate) fn install_keys(
        &mut self,
        level: QuicLevel,
        client_secret: &[u8],
        server_secret: &[u8],
    ) -> Result<()> {
        let pair = QuicKeyPair::from_secrets(client_secret, server_secret)?;
        match level {
            QuicLevel::Handshake => self.handshake = Some(pair),
            QuicLevel::Application => self.application = Some(pair),
            _ => return Err(anyhow!("Keys for {:?} are not derived from TLS secrets", level)),
        }
        self.states[level_index(level)] = KeyState::Installed;
        info!("Generated {:?} keys for {:?}", level, self.role);
        Ok(())
    }

    pub(crate) fn discard(&mut self, level: QuicLevel) {
        if self.is_discarded(level) {
            return;
        }
        match level {
            QuicLevel::Initial => self.initial = None,
            QuicLevel::ZeroRtt => self.zero_rtt = None,
            QuicLevel::Handshake => self.handshake = None,
            QuicLevel::Application => self.application = None,
        }
        self.states[level_index(level)] = KeyState::Discarded;
        info!("Discarded {:?} keys for {:?}", level, self.role);
    }

    pub(crate) fn is_key_available(&self, level: QuicLevel) -> bool {
        self.states[level_index(level)] == KeyState::Installed
    }

    pub(crate) fn is_discarded(&self, level: QuicLevel) -> bool {
        self.states[level_index(level)] == KeyState::Discarded
    }

    fn pair(&self, level: QuicLevel) -> Option<&QuicKeyPair> {
        match level {
            QuicLevel::Initial => self.initial.as_ref(),
            QuicLevel::Handshake => self.handshake.as_ref(),
            QuicLevel::Application => self.application.as_ref(),
            QuicLevel::ZeroRtt => None,
        }
    }

    /// Key protecting packets this endpoint sends.
    pub(crate) fn sealing_key(&self, level: QuicLevel) -> Option<&QuicKey> {
        match (level, self.role) {
            (QuicLevel::ZeroRtt, Role::Client) => self.zero_rtt.as_ref(),
            (QuicLevel::ZeroRtt, Role::Server) => None,
            (_, Role::Client) => self.pair(level).map(|p| &p.client),
            (_, Role::Server) => self.pair(level).map(|p| &p.server),
        }
    }

    /// Key removing protection from packets the peer sent.
    pub(crate) fn opening_key(&self, level: QuicLevel) -> Option<&QuicKey> {
        match (level, self.role) {
            (QuicLevel::ZeroRtt, Role::Server) => self.zero_rtt.as_ref(),
            (QuicLevel::ZeroRtt, Role::Client) => None,
            (_, Role::Client) => self.pair(level).map(|p| &p.server),
            (_, Role::Server) => self.pair(level).map(|p| &p.client),
        }
    }

    fn retry_key() -> Result<aead::LessSafeKey> {
        Ok(aead::LessSafeKey::new(
            aead::UnboundKey::new(&aead::AES_128_GCM, &QUIC_RETRY_SECRET_KEY)
                .map_err(|e| anyhow!("Failed to create retry sealing key: {e}"))?,
        ))
    }

    // The tag is the AEAD output over an empty plaintext with the Retry
    // pseudo-packet as associated data
    pub(crate) fn create_retry_packet_tag(pseudo_packet: &[u8]) -> Result<Vec<u8>> {
        let mut tag = vec![];
        Self::retry_key()?
            .seal_in_place_append_tag(
                aead::Nonce::assume_unique_for_key(QUIC_RETRY_NONCE),
                aead::Aad::from(pseudo_packet),
                &mut tag,
            )
            .map_err(|e| anyhow!("Failed to append retry tag: {e}"))?;
        Ok(tag)
    }

    pub(crate) fn validate_retry_packet_tag(
        pseudo_packet: &[u8],
        received_tag: &[u8],
    ) -> Result<bool> {
        Ok(Self::create_retry_packet_tag(pseudo_packet)? == received_tag)
    }
}
