//! HPKE envelope encryption for secrets at rest.
//!
//! Uses X25519-HKDF-SHA256 with ChaCha20Poly1305. Every seal encapsulates
//! to the managed public key with a fresh ephemeral key, so two
//! encryptions of the same secret never share ciphertext.
//!
//! Guardian private keys and OTP secrets are sealed independently before
//! a user record is persisted.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hpke::{
    Deserializable, Kem, OpModeR, OpModeS, Serializable, aead::ChaCha20Poly1305, kdf::HkdfSha256,
    kem::X25519HkdfSha256, single_shot_open, single_shot_seal,
};
// Use hpke's re-exported rand_core for HPKE operations
use hpke::rand_core::OsRng;
use zeroize::Zeroize;

use crate::error::{GuardianError, GuardianResult};

/// HPKE public key (X25519).
pub type HpkePublicKey = <X25519HkdfSha256 as Kem>::PublicKey;

/// HPKE secret key (X25519).
pub type HpkeSecretKey = <X25519HkdfSha256 as Kem>::PrivateKey;

/// HPKE encapsulated key.
pub type HpkeEncappedKey = <X25519HkdfSha256 as Kem>::EncappedKey;

/// Context string bound into every envelope.
const ENVELOPE_INFO: &[u8] = b"guardian-secret-envelope-v1";

/// Length prefix size in the marshalled envelope.
const LEN_PREFIX: usize = 4;

/// Sealed payload: encapsulated ephemeral key plus ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub encapped_key: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// `u32 BE len(encapped_key) || encapped_key || ciphertext`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes =
            Vec::with_capacity(LEN_PREFIX + self.encapped_key.len() + self.ciphertext.len());
        // encapped_key is 32 bytes for X25519
        #[allow(clippy::cast_possible_truncation)]
        let len_bytes = (self.encapped_key.len() as u32).to_be_bytes();
        bytes.extend_from_slice(&len_bytes);
        bytes.extend_from_slice(&self.encapped_key);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> GuardianResult<Self> {
        let (prefix, rest) = bytes
            .split_first_chunk::<LEN_PREFIX>()
            .ok_or_else(|| GuardianError::Decryption("Envelope too short".to_string()))?;
        let encapped_len = u32::from_be_bytes(*prefix) as usize;

        if rest.len() < encapped_len {
            return Err(GuardianError::Decryption("Envelope truncated".to_string()));
        }
        let (encapped_key, ciphertext) = rest.split_at(encapped_len);

        Ok(Self {
            encapped_key: encapped_key.to_vec(),
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// Seals and opens secrets with the service's managed key pair.
pub struct KeyEncryptor {
    public_key: HpkePublicKey,
    secret_key: HpkeSecretKey,
}

impl KeyEncryptor {
    /// Generate a fresh managed key pair.
    pub fn generate() -> Self {
        let (secret_key, public_key) = X25519HkdfSha256::gen_keypair(&mut OsRng);
        Self {
            public_key,
            secret_key,
        }
    }

    pub fn from_secret_key(secret_key: HpkeSecretKey) -> Self {
        let public_key = X25519HkdfSha256::sk_to_pk(&secret_key);
        Self {
            public_key,
            secret_key,
        }
    }

    /// Load the managed key from its base64 encoding.
    pub fn from_secret_key_base64(encoded: &str) -> GuardianResult<Self> {
        let mut bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| GuardianError::InvalidValue(format!("Invalid managed key base64: {e}")))?;

        let secret_key = HpkeSecretKey::from_bytes(&bytes)
            .map_err(|e| GuardianError::InvalidValue(format!("Invalid managed key: {e}")));
        bytes.zeroize();

        Ok(Self::from_secret_key(secret_key?))
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public_key.to_bytes())
    }

    pub fn secret_key_base64(&self) -> String {
        BASE64.encode(self.secret_key.to_bytes())
    }

    /// Seal `data`. Empty input is returned unchanged.
    pub fn encrypt_data(&self, data: &[u8]) -> GuardianResult<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let (encapped_key, ciphertext) =
            single_shot_seal::<ChaCha20Poly1305, HkdfSha256, X25519HkdfSha256, _>(
                &OpModeS::Base,
                &self.public_key,
                ENVELOPE_INFO,
                data,
                &[],
                &mut OsRng,
            )
            .map_err(|e| GuardianError::Encryption(format!("Seal failed: {e:?}")))?;

        Ok(Envelope {
            encapped_key: encapped_key.to_bytes().to_vec(),
            ciphertext,
        }
        .to_bytes())
    }

    /// Open a sealed payload. Empty input is returned unchanged.
    pub fn decrypt_data(&self, cipher: &[u8]) -> GuardianResult<Vec<u8>> {
        if cipher.is_empty() {
            return Ok(Vec::new());
        }

        let envelope = Envelope::from_bytes(cipher)?;
        let encapped_key = HpkeEncappedKey::from_bytes(&envelope.encapped_key)
            .map_err(|e| GuardianError::Decryption(format!("Invalid encapped key: {e}")))?;

        single_shot_open::<ChaCha20Poly1305, HkdfSha256, X25519HkdfSha256>(
            &OpModeR::Base,
            &self.secret_key,
            &encapped_key,
            ENVELOPE_INFO,
            &envelope.ciphertext,
            &[],
        )
        .map_err(|e| GuardianError::Decryption(format!("Open failed: {e:?}")))
    }
}

impl Drop for KeyEncryptor {
    #[allow(clippy::collection_is_never_read)]
    fn drop(&mut self) {
        // Best-effort: only the exported copy is wiped, not hpke's own storage.
        let mut sk_bytes = self.secret_key.to_bytes().to_vec();
        sk_bytes.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let encryptor = KeyEncryptor::generate();
        let secret = b"guardian private key bytes";

        let sealed = encryptor.encrypt_data(secret).unwrap();
        assert_ne!(sealed.as_slice(), secret.as_slice());
        assert_eq!(encryptor.decrypt_data(&sealed).unwrap(), secret);
    }

    #[test]
    fn test_empty_passes_through() {
        let encryptor = KeyEncryptor::generate();
        assert!(encryptor.encrypt_data(&[]).unwrap().is_empty());
        assert!(encryptor.decrypt_data(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_fresh_ephemeral_key_per_call() {
        let encryptor = KeyEncryptor::generate();
        let first = encryptor.encrypt_data(b"same").unwrap();
        let second = encryptor.encrypt_data(b"same").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = KeyEncryptor::generate().encrypt_data(b"secret").unwrap();
        let result = KeyEncryptor::generate().decrypt_data(&sealed);
        assert!(matches!(result, Err(GuardianError::Decryption(_))));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let encryptor = KeyEncryptor::generate();
        let mut sealed = encryptor.encrypt_data(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(encryptor.decrypt_data(&sealed).is_err());
    }

    #[test]
    fn test_malformed_envelopes_rejected() {
        assert!(Envelope::from_bytes(&[0, 0]).is_err());
        assert!(Envelope::from_bytes(&[0, 0, 0, 40, 1, 2]).is_err());

        let encryptor = KeyEncryptor::generate();
        assert!(encryptor.decrypt_data(&[0, 0, 0, 1, 9, 9, 9]).is_err());
    }

    #[test]
    fn test_envelope_layout() {
        let envelope = Envelope {
            encapped_key: vec![1, 2, 3],
            ciphertext: vec![4, 5],
        };
        let bytes = envelope.to_bytes();
        assert_eq!(bytes, vec![0, 0, 0, 3, 1, 2, 3, 4, 5]);
        assert_eq!(Envelope::from_bytes(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_managed_key_from_base64() {
        let original = KeyEncryptor::generate();
        let restored = KeyEncryptor::from_secret_key_base64(&original.secret_key_base64()).unwrap();
        assert_eq!(restored.public_key_base64(), original.public_key_base64());

        let sealed = original.encrypt_data(b"secret").unwrap();
        assert_eq!(restored.decrypt_data(&sealed).unwrap(), b"secret");

        assert!(matches!(
            KeyEncryptor::from_secret_key_base64("not base64!"),
            Err(GuardianError::InvalidValue(_))
        ));
    }
}
