//! Chain client over the proxy's REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{Account, ChainClient, GuardianData};
use crate::error::{GuardianError, GuardianResult};

#[derive(Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    error: String,
}

#[derive(Deserialize)]
struct AccountPayload {
    account: Option<Account>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GuardianDataPayload {
    guardian_data: Option<GuardianData>,
}

/// Proxy client for `GET address/{addr}` and `GET address/{addr}/guardian-data`.
pub struct HttpChainClient {
    http_client: Client,
    base_url: String,
}

impl HttpChainClient {
    pub fn new(base_url: &str, timeout: Duration) -> GuardianResult<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GuardianError::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_data<T: DeserializeOwned>(&self, endpoint: &str) -> GuardianResult<T> {
        let url = format!("{}/{endpoint}", self.base_url);
        let response = self.http_client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(GuardianError::Chain(format!(
                "{endpoint} returned {status}: {error_text}"
            )));
        }

        let envelope: Envelope<T> = response.json().await?;
        envelope.data.ok_or_else(|| {
            GuardianError::Chain(format!("empty data from {endpoint}: {}", envelope.error))
        })
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    #[tracing::instrument(skip(self))]
    async fn get_account(&self, address: &str) -> GuardianResult<Account> {
        let payload: AccountPayload = self.get_data(&format!("address/{address}")).await?;
        payload.account.ok_or_else(|| {
            GuardianError::Chain(format!("empty account data for {address}"))
        })
    }

    #[tracing::instrument(skip(self))]
    async fn get_guardian_data(&self, address: &str) -> GuardianResult<GuardianData> {
        let payload: GuardianDataPayload = self
            .get_data(&format!("address/{address}/guardian-data"))
            .await?;
        payload.guardian_data.ok_or_else(|| {
            GuardianError::Chain(format!("empty guardian data for {address}"))
        })
    }
}
