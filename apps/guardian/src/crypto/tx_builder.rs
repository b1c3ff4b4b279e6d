//! Guarded transactions and guardian co-signatures.
//!
//! A transaction is signed over its canonical JSON with both signature
//! fields cleared, so the user and the guardian sign identical bytes.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::{GuardianError, GuardianResult};

/// Prefix for messages signed outside a transaction.
const MESSAGE_PREFIX: &str = "\x17Guardian Signed Message:\n";

/// Transaction as submitted by the wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub nonce: u64,
    pub value: String,
    pub receiver: String,
    pub sender: String,
    pub gas_price: u64,
    pub gas_limit: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(rename = "chainID")]
    pub chain_id: String,
    pub version: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub options: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub guardian: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub guardian_signature: String,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl Transaction {
    /// Bytes covered by both the user and the guardian signature.
    pub fn signable_bytes(&self) -> GuardianResult<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        unsigned.guardian_signature.clear();
        serde_json::to_vec(&unsigned).map_err(|e| GuardianError::Serialization(e.to_string()))
    }

    /// Check the sender's signature against `user_key`.
    pub fn verify_user_signature(&self, user_key: &VerifyingKey) -> GuardianResult<()> {
        let signature = decode_signature(&self.signature)?;
        user_key
            .verify(&self.signable_bytes()?, &signature)
            .map_err(|e| GuardianError::InvalidUserSignature(e.to_string()))
    }
}

/// Co-sign `tx` with the guardian key.
pub fn apply_guardian_signature(guardian: &SigningKey, tx: &mut Transaction) -> GuardianResult<()> {
    let signature = guardian.sign(&tx.signable_bytes()?);
    tx.guardian_signature = hex::encode(signature.to_bytes());
    Ok(())
}

/// Sign an arbitrary message under the guardian prefix.
pub fn sign_message(guardian: &SigningKey, message: &[u8]) -> Vec<u8> {
    guardian.sign(&prefixed_message(message)).to_bytes().to_vec()
}

fn prefixed_message(message: &[u8]) -> Vec<u8> {
    let mut buf = MESSAGE_PREFIX.as_bytes().to_vec();
    buf.extend_from_slice(message.len().to_string().as_bytes());
    buf.extend_from_slice(message);
    buf
}

fn decode_signature(encoded: &str) -> GuardianResult<Signature> {
    let bytes = hex::decode(encoded)
        .map_err(|e| GuardianError::InvalidUserSignature(format!("not hex: {e}")))?;
    Signature::from_slice(&bytes).map_err(|e| GuardianError::InvalidUserSignature(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn transaction(user: &SigningKey, guardian: &SigningKey) -> Transaction {
        let mut tx = Transaction {
            nonce: 7,
            value: "1000000000000000000".to_string(),
            receiver: hex::encode([9u8; 32]),
            sender: hex::encode(user.verifying_key().as_bytes()),
            gas_price: 1_000_000_000,
            gas_limit: 50_000,
            data: Some("aGVsbG8=".to_string()),
            chain_id: "T".to_string(),
            version: 2,
            options: 2,
            guardian: hex::encode(guardian.verifying_key().as_bytes()),
            signature: String::new(),
            guardian_signature: String::new(),
        };
        let signature = user.sign(&tx.signable_bytes().unwrap());
        tx.signature = hex::encode(signature.to_bytes());
        tx
    }

    #[test]
    fn test_signable_bytes_ignore_signatures() {
        let tx = transaction(&key(1), &key(2));
        let mut stripped = tx.clone();
        stripped.signature.clear();
        assert_eq!(
            tx.signable_bytes().unwrap(),
            stripped.signable_bytes().unwrap()
        );

        let json = String::from_utf8(tx.signable_bytes().unwrap()).unwrap();
        assert!(json.contains("\"chainID\":\"T\""));
        assert!(json.contains("\"gasLimit\":50000"));
        assert!(!json.contains("signature"));
    }

    #[test]
    fn test_user_signature_verification() {
        let user = key(1);
        let tx = transaction(&user, &key(2));
        tx.verify_user_signature(&user.verifying_key()).unwrap();

        assert!(matches!(
            tx.verify_user_signature(&key(3).verifying_key()),
            Err(GuardianError::InvalidUserSignature(_))
        ));

        let mut tampered = tx.clone();
        tampered.value = "1".to_string();
        assert!(tampered.verify_user_signature(&user.verifying_key()).is_err());

        let mut garbled = tx;
        garbled.signature = "xyz".to_string();
        assert!(garbled.verify_user_signature(&user.verifying_key()).is_err());
    }

    #[test]
    fn test_guardian_signature_applied() {
        let user = key(1);
        let guardian = key(2);
        let mut tx = transaction(&user, &guardian);

        apply_guardian_signature(&guardian, &mut tx).unwrap();
        assert_eq!(tx.guardian_signature.len(), 128);

        let signature =
            Signature::from_slice(&hex::decode(&tx.guardian_signature).unwrap()).unwrap();
        guardian
            .verifying_key()
            .verify(&tx.signable_bytes().unwrap(), &signature)
            .unwrap();

        // user signature still valid after co-signing
        tx.verify_user_signature(&user.verifying_key()).unwrap();
    }

    #[test]
    fn test_json_field_names() {
        let tx = transaction(&key(1), &key(2));
        let value = serde_json::to_value(&tx).unwrap();
        for field in ["gasPrice", "gasLimit", "chainID", "guardian", "signature"] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        assert!(value.get("guardianSignature").is_none());
    }

    #[test]
    fn test_sign_message_uses_prefix() {
        let guardian = key(4);
        let signature = sign_message(&guardian, b"hello");

        let expected = b"\x17Guardian Signed Message:\n5hello";
        let signature = Signature::from_slice(&signature).unwrap();
        guardian
            .verifying_key()
            .verify(expected, &signature)
            .unwrap();
    }
}
