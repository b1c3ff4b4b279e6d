//! Guardian issuance, code verification, and co-signing.
//!
//! Every read-then-write of a `UserInfo` runs under the user's write
//! lock; signing paths only hold the read lock while loading the record.
//! The final `put` is the only mutation of persisted user state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;

use super::types::{
    GuardianInfo, GuardianSlot, GuardianState, OnChainGuardianState, OtpInfo,
    RegisterResponse, RegistrationRequest, SecurityModeRequest, SignMessageRequest,
    SignMultipleTransactionsRequest, SignTransactionRequest, TcsConfig, UserInfo,
    VerificationRequest,
};
use crate::chain::{ChainClient, GuardianData};
use crate::crypto::{
    GuardianKeyGenerator, KeyEncryptor, Transaction, address_bytes, apply_guardian_signature,
    public_key_from_address, sign_message,
};
use crate::error::{AttemptError, AttemptResult, GuardianError, GuardianResult};
use crate::locking::KeyedLock;
use crate::otp::{NO_EXPIRY_VALUE, OtpCodeVerifyData, OtpProvider, OtpSecurityEngine, Totp};
use crate::otp::totp::unix_now;
use crate::sharding::ShardedIndexStore;

/// Tunables for the registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub request_timeout: Duration,
    pub otp_write_delay_secs: u64,
    pub max_transactions: usize,
    pub skip_tx_user_sig_verify: bool,
}

impl RegistryConfig {
    pub fn validate(&self) -> GuardianResult<()> {
        if self.request_timeout.is_zero() {
            return Err(GuardianError::InvalidValue(
                "request timeout must be positive".to_string(),
            ));
        }
        if self.otp_write_delay_secs == 0 {
            return Err(GuardianError::InvalidValue(
                "OTP write delay must be at least one second".to_string(),
            ));
        }
        if self.max_transactions == 0 {
            return Err(GuardianError::InvalidValue(
                "max transactions must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Collaborators the registry is built from.
pub struct RegistryDeps {
    pub store: ShardedIndexStore,
    pub encryptor: KeyEncryptor,
    pub keys: GuardianKeyGenerator,
    pub otp_provider: Arc<dyn OtpProvider>,
    pub security: OtpSecurityEngine,
    pub chain: Arc<dyn ChainClient>,
    pub locks: KeyedLock,
}

/// Orchestrates guardian lifecycles for all users.
pub struct GuardianRegistry {
    store: ShardedIndexStore,
    encryptor: KeyEncryptor,
    keys: GuardianKeyGenerator,
    otp_provider: Arc<dyn OtpProvider>,
    security: OtpSecurityEngine,
    chain: Arc<dyn ChainClient>,
    locks: KeyedLock,
    config: RegistryConfig,
}

impl GuardianRegistry {
    pub fn new(deps: RegistryDeps, config: RegistryConfig) -> GuardianResult<Self> {
        config.validate()?;

        Ok(Self {
            store: deps.store,
            encryptor: deps.encryptor,
            keys: deps.keys,
            otp_provider: deps.otp_provider,
            security: deps.security,
            chain: deps.chain,
            locks: deps.locks,
            config,
        })
    }

    /// Issue (or re-issue) a guardian for `request.user` with a fresh OTP.
    #[tracing::instrument(skip(self, request), fields(user = %request.user))]
    pub async fn register_user(
        &self,
        request: &RegistrationRequest,
    ) -> GuardianResult<RegisterResponse> {
        let user_key = address_bytes(&request.user)?;
        let account = match request.tag.as_deref().map(str::trim) {
            Some(tag) if !tag.is_empty() => tag,
            _ => request.user.as_str(),
        };
        let otp = self.otp_provider.generate(account)?;

        let guard = self.locks.lock(&request.user).await?;
        let result = self.register_locked(&request.user, &user_key, &otp).await;
        guard.unlock().await;

        let guardian = result?;
        Ok(RegisterResponse {
            otp: otp.enrollment(0),
            guardian_address: hex::encode(guardian),
        })
    }

    /// Confirm a pending guardian with a valid code.
    #[tracing::instrument(skip(self, request), fields(user = %request.user, guardian = %request.guardian))]
    pub async fn verify_code(
        &self,
        ip: &str,
        request: &VerificationRequest,
    ) -> Result<OtpCodeVerifyData, AttemptError> {
        let guardian_key = address_bytes(&request.guardian)?;
        let user_key = address_bytes(&request.user)?;

        let guard = self.locks.lock(&request.user).await?;
        let result = self
            .verify_code_locked(ip, request, &user_key, &guardian_key)
            .await;
        guard.unlock().await;

        if result.is_ok() {
            tracing::debug!("Code ok");
        }
        result
    }

    #[tracing::instrument(skip(self, request))]
    pub async fn sign_transaction(
        &self,
        ip: &str,
        request: &SignTransactionRequest,
    ) -> AttemptResult<Transaction> {
        let txs = std::slice::from_ref(&request.tx);
        let (guardian, data) = self
            .validate_tx_request_returning_guardian(
                ip,
                &request.code,
                request.second_code.as_deref(),
                txs,
            )
            .await?;

        let with_data = |e: GuardianError| AttemptError::new(e, Some(data.clone()));
        let signing_key = signing_key(&guardian).map_err(with_data)?;

        let mut tx = request.tx.clone();
        apply_guardian_signature(&signing_key, &mut tx).map_err(with_data)?;
        Ok((tx, data))
    }

    #[tracing::instrument(skip(self, request), fields(count = request.txs.len()))]
    pub async fn sign_multiple_transactions(
        &self,
        ip: &str,
        request: &SignMultipleTransactionsRequest,
    ) -> AttemptResult<Vec<Transaction>> {
        let (guardian, data) = self
            .validate_tx_request_returning_guardian(
                ip,
                &request.code,
                request.second_code.as_deref(),
                &request.txs,
            )
            .await?;

        let with_data = |e: GuardianError| AttemptError::new(e, Some(data.clone()));
        let signing_key = signing_key(&guardian).map_err(with_data)?;

        let mut signed = Vec::with_capacity(request.txs.len());
        for (index, tx) in request.txs.iter().enumerate() {
            let mut tx = tx.clone();
            apply_guardian_signature(&signing_key, &mut tx).map_err(|e| {
                with_data(GuardianError::Internal(format!("transaction #{index}: {e}")))
            })?;
            signed.push(tx);
        }

        Ok((signed, data))
    }

    /// Returns the hex guardian signature over the prefixed message.
    #[tracing::instrument(skip(self, request), fields(user = %request.user))]
    pub async fn sign_message(&self, ip: &str, request: &SignMessageRequest) -> AttemptResult<String> {
        public_key_from_address(&request.user)?;
        let (guardian, data) = self
            .verify_codes_returning_guardian(
                &request.user,
                &request.guardian,
                ip,
                &request.code,
                request.second_code.as_deref(),
            )
            .await?;

        let signing_key =
            signing_key(&guardian).map_err(|e| AttemptError::new(e, Some(data.clone())))?;
        let signature = sign_message(&signing_key, request.message.as_bytes());
        Ok((hex::encode(signature), data))
    }

    #[tracing::instrument(skip(self, request), fields(user = %request.user))]
    pub async fn set_security_mode_no_expire(
        &self,
        ip: &str,
        request: &SecurityModeRequest,
    ) -> Result<OtpCodeVerifyData, AttemptError> {
        let data = self.check_guardian_and_verify_code(ip, request).await?;
        self.security
            .set_security_mode_no_expire(&request.user)
            .await
            .map_err(|e| AttemptError::new(e, Some(data.clone())))?;
        Ok(data)
    }

    #[tracing::instrument(skip(self, request), fields(user = %request.user))]
    pub async fn unset_security_mode_no_expire(
        &self,
        ip: &str,
        request: &SecurityModeRequest,
    ) -> Result<OtpCodeVerifyData, AttemptError> {
        let data = self.check_guardian_and_verify_code(ip, request).await?;
        self.security
            .unset_security_mode_no_expire(&request.user)
            .await
            .map_err(|e| AttemptError::new(e, Some(data.clone())))?;
        Ok(data)
    }

    pub fn registered_users(&self) -> GuardianResult<u32> {
        self.store.count()
    }

    pub fn tcs_config(&self) -> TcsConfig {
        TcsConfig {
            otp_delay: self.config.otp_write_delay_secs,
            backoff_wrong_code: self.security.backoff_time(),
        }
    }

    /// Close every bucket of the backing store.
    pub fn close(&self) -> GuardianResult<()> {
        self.store.close()
    }

    // Registration

    async fn register_locked(
        &self,
        user: &str,
        user_key: &[u8],
        otp: &Totp,
    ) -> GuardianResult<Vec<u8>> {
        match self.load_user_info(user_key) {
            Err(GuardianError::KeyNotFound) => self.handle_new_account(user, user_key, otp).await,
            Err(e) => Err(e),
            Ok(info) => self.handle_registered_account(user, user_key, info, otp).await,
        }
    }

    async fn handle_new_account(
        &self,
        user: &str,
        user_key: &[u8],
        otp: &Totp,
    ) -> GuardianResult<Vec<u8>> {
        let account = self
            .with_chain_timeout(self.chain.get_account(user))
            .await?;
        if !account.has_balance() {
            return Err(GuardianError::NoBalance(user.to_string()));
        }

        let index = self.store.allocate_index(user_key)?;
        let [first, second] = self.keys.generate_keys(index)?;

        let mut first_guardian = guardian_info(&first);
        first_guardian.otp_data = OtpInfo {
            otp: otp.to_bytes()?,
            last_totp_change_timestamp: unix_secs()?,
        };

        let info = UserInfo {
            index,
            first_guardian,
            second_guardian: guardian_info(&second),
            provider: "totp".to_string(),
        };
        self.save_user_info(user_key, &info)?;

        tracing::info!(
            index,
            guardian = %info.first_guardian.address(),
            "Registered new user"
        );
        Ok(info.first_guardian.public_key)
    }

    async fn handle_registered_account(
        &self,
        user: &str,
        user_key: &[u8],
        mut info: UserInfo,
        otp: &Totp,
    ) -> GuardianResult<Vec<u8>> {
        let slot = self.next_guardian(user, &mut info).await?;
        self.replace_otp(&mut info, slot, otp)?;
        self.save_user_info(user_key, &info)?;

        tracing::debug!(
            guardian = %info.guardian(slot).address(),
            "Issued guardian to registered user"
        );
        Ok(info.guardian(slot).public_key.clone())
    }

    async fn next_guardian(&self, user: &str, info: &mut UserInfo) -> GuardianResult<GuardianSlot> {
        if !info.first_guardian.is_usable() {
            return Ok(GuardianSlot::First);
        }
        if !info.second_guardian.is_usable() {
            return Ok(GuardianSlot::Second);
        }

        let data = self
            .with_chain_timeout(self.chain.get_guardian_data(user))
            .await?;
        let slot = prepare_next_guardian(&data, info);

        tracing::debug!(
            active = ?data.active_guardian.as_ref().map(|g| &g.address),
            pending = ?data.pending_guardian.as_ref().map(|g| &g.address),
            next = ?slot,
            "Reconciled guardians with chain"
        );
        Ok(slot)
    }

    fn replace_otp(&self, info: &mut UserInfo, slot: GuardianSlot, otp: &Totp) -> GuardianResult<()> {
        let now = unix_secs()?;
        let delay = i64::try_from(self.config.otp_write_delay_secs).unwrap_or(i64::MAX);

        let otp_data = &mut info.guardian_mut(slot).otp_data;
        let last_change = otp_data.last_totp_change_timestamp;
        let next_allowed = last_change.saturating_add(delay);
        if next_allowed >= now {
            return Err(GuardianError::RegistrationFailed {
                otp_age_secs: now - last_change,
                retry_after_secs: next_allowed - now,
            });
        }

        otp_data.otp = otp.to_bytes()?;
        otp_data.last_totp_change_timestamp = now;
        Ok(())
    }

    // Verification

    async fn verify_code_locked(
        &self,
        ip: &str,
        request: &VerificationRequest,
        user_key: &[u8],
        guardian_key: &[u8],
    ) -> Result<OtpCodeVerifyData, AttemptError> {
        let mut info = self.load_user_info(user_key)?;
        let slot = info
            .slot_of(guardian_key)
            .ok_or_else(|| GuardianError::InvalidGuardian(request.guardian.clone()))?;
        if info.guardian(slot).is_usable() {
            return Err(GuardianError::InvalidGuardianState(request.guardian.clone()).into());
        }

        let data = self
            .check_allowance_and_verify_code(
                &info,
                &request.user,
                ip,
                &request.code,
                request.second_code.as_deref(),
                guardian_key,
                false,
            )
            .await?;

        info.guardian_mut(slot).state = GuardianState::Usable;
        self.save_user_info(user_key, &info)
            .map_err(|e| AttemptError::new(e, Some(data.clone())))?;

        Ok(data)
    }

    async fn validate_tx_request_returning_guardian(
        &self,
        ip: &str,
        code: &str,
        second_code: Option<&str>,
        txs: &[Transaction],
    ) -> AttemptResult<GuardianInfo> {
        if txs.len() > self.config.max_transactions {
            return Err(GuardianError::TooManyTransactionsToSign {
                got: txs.len(),
                max: self.config.max_transactions,
            }
            .into());
        }
        let Some(first) = txs.first() else {
            return Err(GuardianError::NoTransactionToSign.into());
        };

        self.validate_transactions(txs)?;
        self.verify_codes_returning_guardian(&first.sender, &first.guardian, ip, code, second_code)
            .await
    }

    fn validate_transactions(&self, txs: &[Transaction]) -> GuardianResult<()> {
        let Some(first) = txs.first() else {
            return Err(GuardianError::NoTransactionToSign);
        };
        let user_key = public_key_from_address(&first.sender)?;

        for tx in txs {
            if tx.guardian != first.guardian {
                return Err(GuardianError::GuardianMismatch);
            }
            if tx.sender != first.sender {
                return Err(GuardianError::InvalidSender {
                    expected: first.sender.clone(),
                    actual: tx.sender.clone(),
                });
            }
            if !self.config.skip_tx_user_sig_verify {
                tx.verify_user_signature(&user_key)?;
            }
        }
        Ok(())
    }

    async fn verify_codes_returning_guardian(
        &self,
        user: &str,
        guardian: &str,
        ip: &str,
        code: &str,
        second_code: Option<&str>,
    ) -> AttemptResult<GuardianInfo> {
        let guardian_key = address_bytes(guardian)?;
        let user_key = address_bytes(user)?;
        let info = self.load_user_info_shared(user, &user_key).await?;

        let data = self
            .check_allowance_and_verify_code(
                &info,
                user,
                ip,
                code,
                second_code,
                &guardian_key,
                false,
            )
            .await?;

        let with_data = |e: GuardianError| AttemptError::new(e, Some(data.clone()));
        let slot = info
            .slot_of(&guardian_key)
            .ok_or_else(|| with_data(GuardianError::InvalidGuardian(guardian.to_string())))?;
        let guardian_info = info.guardian(slot);
        if !guardian_info.is_usable() {
            return Err(with_data(GuardianError::GuardianNotUsable(
                guardian.to_string(),
            )));
        }

        Ok((guardian_info.clone(), data))
    }

    async fn check_guardian_and_verify_code(
        &self,
        ip: &str,
        request: &SecurityModeRequest,
    ) -> Result<OtpCodeVerifyData, AttemptError> {
        let user_key = address_bytes(&request.user)?;

        let data = self
            .with_chain_timeout(self.chain.get_guardian_data(&request.user))
            .await?;
        let active = data
            .active_guardian
            .ok_or(GuardianError::AccountHasNoActiveGuardian)?;
        let guardian_key = address_bytes(&active.address)?;

        let info = self.load_user_info_shared(&request.user, &user_key).await?;
        self.check_allowance_and_verify_code(
            &info,
            &request.user,
            ip,
            &request.code,
            request.second_code.as_deref(),
            &guardian_key,
            true,
        )
        .await
    }

    /// Throttle, check `code`, then apply the security-mode second-code rule.
    #[allow(clippy::too_many_arguments)]
    async fn check_allowance_and_verify_code(
        &self,
        info: &UserInfo,
        account: &str,
        ip: &str,
        code: &str,
        second_code: Option<&str>,
        guardian_key: &[u8],
        require_second_code: bool,
    ) -> Result<OtpCodeVerifyData, AttemptError> {
        let mut data = match self
            .security
            .is_verification_allowed_and_increase_trials(account, ip)
            .await
        {
            Ok(data) => data,
            Err(mut err) => {
                let extended = self.security.extend_security_mode(account).await.is_ok();
                if extended && let Some(data) = err.verify_data.as_mut() {
                    self.report_security_extension(data);
                }
                return Err(err);
            }
        };

        if let Err(e) = self.validate_otp(info, code, guardian_key) {
            if self.security.extend_security_mode(account).await.is_ok() {
                self.report_security_extension(&mut data);
            }
            return Err(AttemptError::new(e, Some(data)));
        }
        self.security.reset(account, ip).await;

        let needs_second_code = require_second_code || data.security_mode_remaining_trials <= 0;
        let (extended, second_result) = if needs_second_code {
            self.verify_second_code(info, account, code, second_code, guardian_key)
                .await
        } else {
            (false, Ok(()))
        };

        if second_result.is_ok()
            && let Err(e) = self.security.decrement_security_mode_failed_trials(account).await
        {
            tracing::warn!(account, error = %e, "Failed to decrement security mode failed trials");
        }

        let mut remaining = data.security_mode_remaining_trials;
        if second_result.is_err() {
            remaining -= 1;
        }
        let mut out = OtpCodeVerifyData {
            remaining_trials: i64::from(self.security.max_failures()),
            reset_after: 0,
            security_mode_remaining_trials: remaining.max(0),
            security_mode_reset_after: data.security_mode_reset_after,
        };
        if extended {
            self.report_security_extension(&mut out);
        }

        match second_result {
            Ok(()) => Ok(out),
            Err(e) => Err(AttemptError::new(e, Some(out))),
        }
    }

    /// Returns whether the security window was extended.
    async fn verify_second_code(
        &self,
        info: &UserInfo,
        account: &str,
        code: &str,
        second_code: Option<&str>,
        guardian_key: &[u8],
    ) -> (bool, GuardianResult<()>) {
        let second_code = second_code.unwrap_or_default();
        if second_code == code {
            if let Err(e) = self.security.extend_security_mode(account).await {
                tracing::error!(account, error = %e, "Failed to extend security mode");
            }
            return (
                false,
                Err(GuardianError::SecondCodeInvalidInSecurityMode(
                    "same code".to_string(),
                )),
            );
        }

        match self.validate_otp(info, second_code, guardian_key) {
            Ok(()) => (false, Ok(())),
            Err(e) => {
                let extended = self.security.extend_security_mode(account).await.is_ok();
                let state = if extended { "extended" } else { "not extended" };
                (
                    extended,
                    Err(GuardianError::SecondCodeInvalidInSecurityMode(format!(
                        "{e}, security mode {state}"
                    ))),
                )
            }
        }
    }

    fn report_security_extension(&self, data: &mut OtpCodeVerifyData) {
        if data.security_mode_reset_after != NO_EXPIRY_VALUE {
            data.security_mode_reset_after =
                i64::try_from(self.security.security_mode_backoff_time()).unwrap_or(i64::MAX);
        }
    }

    fn validate_otp(&self, info: &UserInfo, code: &str, guardian_key: &[u8]) -> GuardianResult<()> {
        let slot = info
            .slot_of(guardian_key)
            .ok_or_else(|| GuardianError::InvalidGuardian(hex::encode(guardian_key)))?;
        let otp = self
            .otp_provider
            .from_bytes(&info.guardian(slot).otp_data.otp)?;
        otp.validate(code)
    }

    // Persistence

    async fn load_user_info_shared(&self, user: &str, user_key: &[u8]) -> GuardianResult<UserInfo> {
        let guard = self.locks.rlock(user).await?;
        let result = self.load_user_info(user_key);
        guard.unlock().await;
        result
    }

    fn load_user_info(&self, user_key: &[u8]) -> GuardianResult<UserInfo> {
        let bytes = self.store.get(user_key)?;
        let sealed: UserInfo = serde_json::from_slice(&bytes)?;
        sealed.decrypted(&self.encryptor)
    }

    fn save_user_info(&self, user_key: &[u8], info: &UserInfo) -> GuardianResult<()> {
        let sealed = info.encrypted(&self.encryptor)?;
        let bytes = serde_json::to_vec(&sealed)?;
        self.store.put(user_key, &bytes)
    }

    async fn with_chain_timeout<T>(
        &self,
        request: impl Future<Output = GuardianResult<T>>,
    ) -> GuardianResult<T> {
        tokio::time::timeout(self.config.request_timeout, request)
            .await
            .map_err(|_| GuardianError::ChainTimeout)?
    }
}

/// Pick the guardian to (re)activate when both are locally usable.
///
/// Flips the chosen guardian (both, when neither is on chain) back to
/// `NotUsableYet`. Ties favor activating the first guardian.
fn prepare_next_guardian(data: &GuardianData, info: &mut UserInfo) -> GuardianSlot {
    use OnChainGuardianState::{Active, Missing, Pending};

    let first = on_chain_state(data, &info.first_guardian);
    let second = on_chain_state(data, &info.second_guardian);

    let slot = match (first, second) {
        (Missing, Missing) => {
            info.second_guardian.state = GuardianState::NotUsableYet;
            GuardianSlot::First
        }
        (Pending, Pending | Active) | (Missing, Pending | Active) => GuardianSlot::First,
        (Active, Pending | Active) | (Pending | Active, Missing) => GuardianSlot::Second,
    };

    info.guardian_mut(slot).state = GuardianState::NotUsableYet;
    slot
}

fn on_chain_state(data: &GuardianData, guardian: &GuardianInfo) -> OnChainGuardianState {
    let address = guardian.address();
    if data
        .active_guardian
        .as_ref()
        .is_some_and(|g| g.address == address)
    {
        OnChainGuardianState::Active
    } else if data
        .pending_guardian
        .as_ref()
        .is_some_and(|g| g.address == address)
    {
        OnChainGuardianState::Pending
    } else {
        OnChainGuardianState::Missing
    }
}

fn guardian_info(key: &SigningKey) -> GuardianInfo {
    GuardianInfo {
        public_key: key.verifying_key().as_bytes().to_vec(),
        private_key: key.to_bytes().to_vec(),
        state: GuardianState::NotUsableYet,
        otp_data: OtpInfo::default(),
    }
}

fn signing_key(guardian: &GuardianInfo) -> GuardianResult<SigningKey> {
    let bytes: [u8; 32] = guardian
        .private_key
        .as_slice()
        .try_into()
        .map_err(|_| GuardianError::Internal("stored guardian key has wrong length".to_string()))?;
    Ok(SigningKey::from_bytes(&bytes))
}

fn unix_secs() -> GuardianResult<i64> {
    i64::try_from(unix_now()?).map_err(|_| GuardianError::Internal("clock out of range".to_string()))
}
