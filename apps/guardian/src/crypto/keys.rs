//! Deterministic guardian key derivation.

use ed25519_dalek::{SigningKey, VerifyingKey};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::{GuardianError, GuardianResult};

const DERIVATION_SALT: &[u8] = b"guardian-key-derivation";

/// Hex-encoded ed25519 public key.
pub fn address_from_public_key(public_key: &VerifyingKey) -> String {
    hex::encode(public_key.as_bytes())
}

/// Parse a hex address into a public key.
pub fn public_key_from_address(address: &str) -> GuardianResult<VerifyingKey> {
    let bytes = address_bytes(address)?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| GuardianError::InvalidAddress(format!("{address}: {e}")))
}

/// Decode a hex address to its 32 raw bytes.
pub fn address_bytes(address: &str) -> GuardianResult<[u8; 32]> {
    let decoded = hex::decode(address.trim())
        .map_err(|e| GuardianError::InvalidAddress(format!("{address}: {e}")))?;
    decoded.try_into().map_err(|v: Vec<u8>| {
        GuardianError::InvalidAddress(format!("{address}: expected 32 bytes, got {}", v.len()))
    })
}

/// Derives guardian signing keys from the service mnemonic.
///
/// Key `i` is `HKDF-SHA256(ikm = mnemonic, salt, info = "m/44'/508'/0'/0'/i'")`.
pub struct GuardianKeyGenerator {
    mnemonic: Vec<u8>,
}

impl GuardianKeyGenerator {
    pub fn new(mnemonic: &str) -> GuardianResult<Self> {
        let mnemonic = mnemonic.trim();
        if mnemonic.is_empty() {
            return Err(GuardianError::InvalidValue(
                "mnemonic must not be empty".to_string(),
            ));
        }

        Ok(Self {
            mnemonic: mnemonic.as_bytes().to_vec(),
        })
    }

    /// Keys for `index` and `index + 1`.
    pub fn generate_keys(&self, index: u32) -> GuardianResult<[SigningKey; 2]> {
        let next = index
            .checked_add(1)
            .ok_or_else(|| GuardianError::IndexOverflow(format!("guardian index {index}")))?;

        Ok([self.derive(index)?, self.derive(next)?])
    }

    fn derive(&self, index: u32) -> GuardianResult<SigningKey> {
        let hk = Hkdf::<Sha256>::new(Some(DERIVATION_SALT), &self.mnemonic);
        let info = format!("m/44'/508'/0'/0'/{index}'");

        let mut seed = [0u8; 32];
        hk.expand(info.as_bytes(), &mut seed)
            .map_err(|e| GuardianError::Internal(format!("HKDF expand failed: {e}")))?;

        let key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Ok(key)
    }
}

impl Drop for GuardianKeyGenerator {
    fn drop(&mut self) {
        self.mnemonic.zeroize();
    }
}
