//! Optional compression + encryption layer around serialized packets.
//!
//! ```text
//! +-----------+------------------------------------------+
//! | meta (u8) | payload                                  |
//! +-----------+------------------------------------------+
//! ```
//!
//! The meta byte is a bit set: [`META_COMPRESSED`] and [`META_ENCRYPTED`].
//! [`Envelope::wrap`] encrypts first, then compresses. [`Envelope::unwrap`]
//! reverses it: decompress first, then decrypt. Any other meta bit is
//! rejected.
//!
//! Compression is size-prepended LZ4 block compression. Encryption is an
//! X25519 sealed box: the sender only knows the recipient's public key, the
//! recipient opens with its secret key.

use crypto_box::aead::OsRng;
use crypto_box::{PublicKey, SecretKey};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};

/// Meta bit: payload is LZ4-compressed.
pub const META_COMPRESSED: u8 = 0b0000_0001;

/// Meta bit: payload is sealed to the recipient's public key.
pub const META_ENCRYPTED: u8 = 0b0000_0010;

const KNOWN_META_BITS: u8 = META_COMPRESSED | META_ENCRYPTED;

/// Default ceiling on the size a compressed payload may claim to inflate to.
pub const DEFAULT_MAX_DECOMPRESSED: usize = 16 * 1024 * 1024;

/// Errors produced by [`Envelope::wrap`] and [`Envelope::unwrap`].
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The envelope was empty (no meta byte).
    #[error("empty envelope, no meta byte")]
    Empty,
    /// The meta byte carries bits this implementation does not know.
    #[error("unknown meta bits: 0x{0:02X}")]
    UnknownMetaBits(u8),
    /// The key needed for this direction was not configured.
    #[error("no key material for {0}")]
    CryptoUnavailable(&'static str),
    /// Sealing the payload failed.
    #[error("encryption failed")]
    EncryptFailed,
    /// The sealed payload could not be opened (wrong key or tampered).
    #[error("decryption failed")]
    DecryptFailed,
    /// The compressed payload claims an inflated size above the limit.
    #[error("decompressed size {size} exceeds maximum {max}")]
    DecompressedTooLarge {
        /// Size claimed by the payload.
        size: usize,
        /// Configured limit.
        max: usize,
    },
    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    DecompressFailed(String),
}

/// Keys an endpoint holds. Either side may be absent.
#[derive(Clone, Default)]
pub struct KeyMaterial {
    seal_to: Option<PublicKey>,
    open_with: Option<SecretKey>,
}

impl KeyMaterial {
    /// No keys; encrypted envelopes fail in both directions.
    pub fn none() -> Self {
        Self::default()
    }

    /// Keys for a sender that encrypts to `recipient`.
    pub fn sender(recipient: PublicKey) -> Self {
        Self {
            seal_to: Some(recipient),
            open_with: None,
        }
    }

    /// Keys for a receiver that decrypts with `secret`.
    pub fn receiver(secret: SecretKey) -> Self {
        Self {
            seal_to: None,
            open_with: Some(secret),
        }
    }

    /// Both directions.
    pub fn new(seal_to: Option<PublicKey>, open_with: Option<SecretKey>) -> Self {
        Self { seal_to, open_with }
    }

    /// Generate a fresh keypair from the OS random source.
    pub fn generate_keypair() -> (SecretKey, PublicKey) {
        let secret = SecretKey::generate(&mut OsRng);
        let public = secret.public_key();
        (secret, public)
    }

    /// Whether outgoing encryption is possible.
    pub fn can_seal(&self) -> bool {
        self.seal_to.is_some()
    }

    /// Whether incoming decryption is possible.
    pub fn can_open(&self) -> bool {
        self.open_with.is_some()
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("can_seal", &self.can_seal())
            .field("can_open", &self.can_open())
            .finish()
    }
}

/// Envelope framing with the keys of one endpoint.
#[derive(Debug, Clone)]
pub struct Envelope {
    keys: KeyMaterial,
    max_decompressed: usize,
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new(KeyMaterial::none())
    }
}

impl Envelope {
    /// Create an envelope layer using `keys`.
    pub fn new(keys: KeyMaterial) -> Self {
        Self {
            keys,
            max_decompressed: DEFAULT_MAX_DECOMPRESSED,
        }
    }

    /// Override the inflate ceiling.
    pub fn with_max_decompressed(mut self, max: usize) -> Self {
        self.max_decompressed = max;
        self
    }

    /// The configured keys.
    pub fn keys(&self) -> &KeyMaterial {
        &self.keys
    }

    /// Build an envelope: encrypt (if asked), then compress (if asked), then
    /// prepend the meta byte.
    pub fn wrap(&self, bytes: &[u8], compress: bool, encrypt: bool) -> Result<Vec<u8>, EnvelopeError> {
        let mut meta = 0u8;
        let mut payload = bytes.to_vec();

        if encrypt {
            let recipient = self
                .keys
                .seal_to
                .as_ref()
                .ok_or(EnvelopeError::CryptoUnavailable("encryption"))?;
            payload = recipient
                .seal(&mut OsRng, &payload)
                .map_err(|_| EnvelopeError::EncryptFailed)?;
            meta |= META_ENCRYPTED;
        }

        if compress {
            payload = compress_prepend_size(&payload);
            meta |= META_COMPRESSED;
        }

        let mut out = Vec::with_capacity(1 + payload.len());
        out.push(meta);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Open an envelope: read the meta byte, decompress (if flagged), then
    /// decrypt (if flagged).
    pub fn unwrap(&self, envelope: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        let (&meta, rest) = envelope.split_first().ok_or(EnvelopeError::Empty)?;
        if meta & !KNOWN_META_BITS != 0 {
            return Err(EnvelopeError::UnknownMetaBits(meta));
        }

        let mut payload = rest.to_vec();

        if meta & META_COMPRESSED != 0 {
            let claimed = claimed_size(&payload)?;
            if claimed > self.max_decompressed {
                return Err(EnvelopeError::DecompressedTooLarge {
                    size: claimed,
                    max: self.max_decompressed,
                });
            }
            payload = decompress_size_prepended(&payload)
                .map_err(|e| EnvelopeError::DecompressFailed(e.to_string()))?;
        }

        if meta & META_ENCRYPTED != 0 {
            let secret = self
                .keys
                .open_with
                .as_ref()
                .ok_or(EnvelopeError::CryptoUnavailable("decryption"))?;
            payload = secret
                .unseal(&payload)
                .map_err(|_| EnvelopeError::DecryptFailed)?;
        }

        Ok(payload)
    }
}

/// Inflated size stored in the first four bytes of a size-prepended block.
fn claimed_size(compressed: &[u8]) -> Result<usize, EnvelopeError> {
    let prefix: [u8; 4] = compressed
        .get(..4)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| EnvelopeError::DecompressFailed("missing size prefix".to_string()))?;
    Ok(u32::from_le_bytes(prefix) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_envelope() -> Envelope {
        let (secret, public) = KeyMaterial::generate_keypair();
        Envelope::new(KeyMaterial::new(Some(public), Some(secret)))
    }

    fn sample_payload() -> Vec<u8> {
        let mut data = b"header:".to_vec();
        data.extend(std::iter::repeat_n(0x2Au8, 600));
        data.extend((0..=255u8).collect::<Vec<_>>());
        data
    }

    #[test]
    fn test_all_flag_combinations_roundtrip() {
        let envelope = full_envelope();
        let data = sample_payload();
        for (compress, encrypt) in [(false, false), (true, false), (false, true), (true, true)] {
            let wrapped = envelope.wrap(&data, compress, encrypt).unwrap();
            let opened = envelope.unwrap(&wrapped).unwrap();
            assert_eq!(opened, data, "compress={compress} encrypt={encrypt}");
        }
    }

    #[test]
    fn test_meta_bits_match_requested_layers() {
        let envelope = full_envelope();
        let data = sample_payload();

        assert_eq!(envelope.wrap(&data, false, false).unwrap()[0], 0);
        assert_eq!(envelope.wrap(&data, true, false).unwrap()[0], META_COMPRESSED);
        assert_eq!(envelope.wrap(&data, false, true).unwrap()[0], META_ENCRYPTED);
        assert_eq!(
            envelope.wrap(&data, true, true).unwrap()[0],
            META_COMPRESSED | META_ENCRYPTED
        );
        assert_eq!(META_COMPRESSED, 0x01);
        assert_eq!(META_ENCRYPTED, 0x02);
    }

    #[test]
    fn test_plain_envelope_is_meta_plus_payload() {
        let envelope = Envelope::default();
        let wrapped = envelope.wrap(b"abc", false, false).unwrap();
        assert_eq!(wrapped, vec![0, b'a', b'b', b'c']);
    }

    #[test]
    fn test_compression_shrinks_repetitive_payload() {
        let envelope = Envelope::default();
        let data = vec![0u8; 4096];
        let wrapped = envelope.wrap(&data, true, false).unwrap();
        assert!(wrapped.len() < data.len() / 4);
    }

    #[test]
    fn test_decoder_reads_compression_bit_as_compression() {
        // Hand-built envelope: only the compression bit, LZ4 body.
        let mut hand_built = vec![META_COMPRESSED];
        hand_built.extend(compress_prepend_size(b"hand built"));
        let opened = Envelope::default().unwrap(&hand_built).unwrap();
        assert_eq!(opened, b"hand built");
    }

    #[test]
    fn test_missing_public_key_fails_encrypt() {
        let envelope = Envelope::default();
        let result = envelope.wrap(b"secret", false, true);
        assert!(matches!(result, Err(EnvelopeError::CryptoUnavailable(_))));
    }

    #[test]
    fn test_missing_secret_key_fails_decrypt() {
        let (_secret, public) = KeyMaterial::generate_keypair();
        let sender = Envelope::new(KeyMaterial::sender(public));
        let wrapped = sender.wrap(b"secret", true, true).unwrap();

        let result = sender.unwrap(&wrapped);
        assert!(matches!(result, Err(EnvelopeError::CryptoUnavailable(_))));
    }

    #[test]
    fn test_sender_and_receiver_split_keys() {
        let (secret, public) = KeyMaterial::generate_keypair();
        let sender = Envelope::new(KeyMaterial::sender(public));
        let receiver = Envelope::new(KeyMaterial::receiver(secret));

        let wrapped = sender.wrap(b"for your eyes only", false, true).unwrap();
        assert_eq!(receiver.unwrap(&wrapped).unwrap(), b"for your eyes only");
    }

    #[test]
    fn test_wrong_secret_key_fails_decrypt() {
        let (_secret, public) = KeyMaterial::generate_keypair();
        let (other_secret, _) = KeyMaterial::generate_keypair();
        let sender = Envelope::new(KeyMaterial::sender(public));
        let intruder = Envelope::new(KeyMaterial::receiver(other_secret));

        let wrapped = sender.wrap(b"payload", false, true).unwrap();
        assert!(matches!(
            intruder.unwrap(&wrapped),
            Err(EnvelopeError::DecryptFailed)
        ));
    }

    #[test]
    fn test_unknown_meta_bits_rejected() {
        let result = Envelope::default().unwrap(&[0b1000_0000, 1, 2, 3]);
        assert!(matches!(result, Err(EnvelopeError::UnknownMetaBits(0x80))));
    }

    #[test]
    fn test_empty_envelope_rejected() {
        assert!(matches!(
            Envelope::default().unwrap(&[]),
            Err(EnvelopeError::Empty)
        ));
    }

    #[test]
    fn test_inflate_ceiling_enforced() {
        let envelope = Envelope::default().with_max_decompressed(64);
        let wrapped = envelope.wrap(&[7u8; 1024], true, false).unwrap();
        assert!(matches!(
            envelope.unwrap(&wrapped),
            Err(EnvelopeError::DecompressedTooLarge { size: 1024, max: 64 })
        ));
    }

    #[test]
    fn test_truncated_compressed_payload_rejected() {
        let result = Envelope::default().unwrap(&[META_COMPRESSED, 0x10]);
        assert!(matches!(result, Err(EnvelopeError::DecompressFailed(_))));
    }
}
