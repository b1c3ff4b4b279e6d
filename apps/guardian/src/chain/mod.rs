//! Read-only access to on-chain account and guardian data.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GuardianResult;

pub use http::HttpChainClient;

/// Account state relevant to registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub address: String,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default)]
    pub balance: String,
}

impl Account {
    /// Empty and `"0"` balances both count as unfunded.
    pub fn has_balance(&self) -> bool {
        !self.balance.is_empty() && self.balance != "0"
    }
}

/// One guardian as reported by the chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainGuardian {
    pub address: String,
    #[serde(default)]
    pub activation_epoch: u32,
    #[serde(default)]
    pub service_uid: String,
}

/// Active and pending guardians of an account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianData {
    #[serde(default)]
    pub active_guardian: Option<ChainGuardian>,
    #[serde(default)]
    pub pending_guardian: Option<ChainGuardian>,
    #[serde(default)]
    pub guarded: bool,
}

/// Chain proxy queried by the registry.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn get_account(&self, address: &str) -> GuardianResult<Account>;

    async fn get_guardian_data(&self, address: &str) -> GuardianResult<GuardianData>;
}
