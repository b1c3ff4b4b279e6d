//! Persisted user records and the registry's request/response types.

use serde::{Deserialize, Serialize};

use crate::crypto::{KeyEncryptor, Transaction};
use crate::error::GuardianResult;
use crate::otp::OtpEnrollment;

/// Local lifecycle of a guardian key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuardianState {
    /// Issued but not yet confirmed by a valid code.
    #[default]
    NotUsableYet,
    Usable,
}

/// Where the chain currently lists a guardian. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnChainGuardianState {
    Missing,
    Pending,
    Active,
}

/// Which of the user's two guardians.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardianSlot {
    First,
    Second,
}

/// Serialized TOTP handler plus the time it was last replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtpInfo {
    #[serde(with = "base64_bytes")]
    pub otp: Vec<u8>,
    pub last_totp_change_timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianInfo {
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    /// Sealed with the managed key while at rest.
    #[serde(with = "base64_bytes")]
    pub private_key: Vec<u8>,
    pub state: GuardianState,
    pub otp_data: OtpInfo,
}

impl GuardianInfo {
    pub fn address(&self) -> String {
        hex::encode(&self.public_key)
    }

    pub fn is_usable(&self) -> bool {
        self.state == GuardianState::Usable
    }
}

/// Everything the service keeps for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub index: u32,
    pub first_guardian: GuardianInfo,
    pub second_guardian: GuardianInfo,
    #[serde(default)]
    pub provider: String,
}

impl UserInfo {
    pub fn guardian(&self, slot: GuardianSlot) -> &GuardianInfo {
        match slot {
            GuardianSlot::First => &self.first_guardian,
            GuardianSlot::Second => &self.second_guardian,
        }
    }

    pub fn guardian_mut(&mut self, slot: GuardianSlot) -> &mut GuardianInfo {
        match slot {
            GuardianSlot::First => &mut self.first_guardian,
            GuardianSlot::Second => &mut self.second_guardian,
        }
    }

    /// Slot holding `public_key`, if either guardian matches.
    pub fn slot_of(&self, public_key: &[u8]) -> Option<GuardianSlot> {
        if self.first_guardian.public_key == public_key {
            Some(GuardianSlot::First)
        } else if self.second_guardian.public_key == public_key {
            Some(GuardianSlot::Second)
        } else {
            None
        }
    }

    /// Copy with private keys and OTP secrets sealed.
    pub fn encrypted(&self, encryptor: &KeyEncryptor) -> GuardianResult<Self> {
        self.map_secrets(|data| encryptor.encrypt_data(data))
    }

    /// Copy with private keys and OTP secrets opened.
    pub fn decrypted(&self, encryptor: &KeyEncryptor) -> GuardianResult<Self> {
        self.map_secrets(|data| encryptor.decrypt_data(data))
    }

    fn map_secrets(&self, f: impl Fn(&[u8]) -> GuardianResult<Vec<u8>>) -> GuardianResult<Self> {
        let mut out = self.clone();
        for guardian in [&mut out.first_guardian, &mut out.second_guardian] {
            guardian.private_key = f(&guardian.private_key)?;
            guardian.otp_data.otp = f(&guardian.otp_data.otp)?;
        }
        Ok(out)
    }
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(D::Error::custom)
    }
}

// Requests

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    /// User address.
    pub user: String,
    /// Label shown in the authenticator app.
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRequest {
    pub user: String,
    pub guardian: String,
    pub code: String,
    #[serde(default)]
    pub second_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignTransactionRequest {
    pub code: String,
    #[serde(default)]
    pub second_code: Option<String>,
    pub tx: Transaction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignMultipleTransactionsRequest {
    pub code: String,
    #[serde(default)]
    pub second_code: Option<String>,
    pub txs: Vec<Transaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignMessageRequest {
    pub user: String,
    pub guardian: String,
    pub code: String,
    #[serde(default)]
    pub second_code: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityModeRequest {
    pub user: String,
    pub code: String,
    #[serde(default)]
    pub second_code: Option<String>,
}

// Responses

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub otp: OtpEnrollment,
    pub guardian_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignTransactionResponse {
    pub tx: Transaction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignMultipleTransactionsResponse {
    pub txs: Vec<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignMessageResponse {
    pub message: String,
    pub signature: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredUsersResponse {
    pub count: u32,
}

/// Client-facing timing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcsConfig {
    pub otp_delay: u64,
    pub backoff_wrong_code: u64,
}
