//! Integration tests for the guardian lifecycle.
//!
//! These tests drive `GuardianRegistry` against a file-backed redb
//! database, a scripted chain client, and real TOTP codes.
//!
//! Run with: cargo test --test `guardian_flow`

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey, Verifier};
use tempfile::TempDir;

use guardian_service::chain::{Account, ChainClient, ChainGuardian, GuardianData};
use guardian_service::crypto::{GuardianKeyGenerator, KeyEncryptor, Transaction, public_key_from_address};
use guardian_service::error::{GuardianError, GuardianResult};
use guardian_service::locking::{KeyedLock, LockBackend, MemoryLeaseStore};
use guardian_service::otp::{LimitConfig, OtpSecurityEngine, RedbRateLimiter, Totp, TotpProvider};
use guardian_service::registry::{
    GuardianRegistry, RegisterResponse, RegistrationRequest, RegistryConfig, RegistryDeps,
    SignMultipleTransactionsRequest, SignTransactionRequest, VerificationRequest,
};
use guardian_service::sharding::open_sharded_store;
use guardian_service::storage::Storage;

const MNEMONIC: &str = "pilot kidney lunar velvet orbit fabric ancient chalk render tiny wisdom echo";
const IP: &str = "192.0.2.10";

/// Chain stub with a funded account and scriptable guardian data.
#[derive(Default)]
struct ScriptedChain {
    guardian_data: Mutex<GuardianData>,
}

#[async_trait]
impl ChainClient for ScriptedChain {
    async fn get_account(&self, address: &str) -> GuardianResult<Account> {
        Ok(Account {
            address: address.to_string(),
            nonce: 7,
            balance: "5000000000000000000".to_string(),
        })
    }

    async fn get_guardian_data(&self, _address: &str) -> GuardianResult<GuardianData> {
        Ok(self.guardian_data.lock().unwrap().clone())
    }
}

struct Fixture {
    registry: GuardianRegistry,
    encryptor_secret: String,
    chain: Arc<ScriptedChain>,
}

/// Build a registry over `dir`, reusing `encryptor_secret` when reopening.
fn open_registry(
    dir: &TempDir,
    encryptor_secret: Option<&str>,
    max_failures: u32,
    locks: LockBackend,
) -> Fixture {
    let storage = Arc::new(Storage::open(&dir.path().join("guardian.redb")).unwrap());
    let encryptor = match encryptor_secret {
        Some(secret) => KeyEncryptor::from_secret_key_base64(secret).unwrap(),
        None => KeyEncryptor::generate(),
    };
    let encryptor_secret = encryptor.secret_key_base64();
    let chain = Arc::new(ScriptedChain::default());

    let limiter = RedbRateLimiter::new(
        Arc::clone(&storage),
        LimitConfig::new(max_failures, Duration::from_secs(300)).unwrap(),
        LimitConfig::new(50, Duration::from_secs(3_600)).unwrap(),
    );
    let deps = RegistryDeps {
        store: open_sharded_store(&storage, 3).unwrap(),
        encryptor,
        keys: GuardianKeyGenerator::new(MNEMONIC).unwrap(),
        otp_provider: Arc::new(TotpProvider::new("Guardian", 6, 30).unwrap()),
        security: OtpSecurityEngine::new(Arc::new(limiter)),
        chain: chain.clone(),
        locks: KeyedLock::new(locks),
    };
    let config = RegistryConfig {
        request_timeout: Duration::from_secs(2),
        otp_write_delay_secs: 1,
        max_transactions: 5,
        skip_tx_user_sig_verify: false,
    };

    Fixture {
        registry: GuardianRegistry::new(deps, config).unwrap(),
        encryptor_secret,
        chain,
    }
}

fn user_key(seed: u8) -> (SigningKey, String) {
    let key = SigningKey::from_bytes(&[seed; 32]);
    let address = hex::encode(key.verifying_key().as_bytes());
    (key, address)
}

fn code_for(response: &RegisterResponse) -> String {
    let totp: Totp = serde_json::from_value(serde_json::json!({
        "secret": response.otp.secret,
        "issuer": response.otp.issuer,
        "account": response.otp.account,
        "digits": response.otp.digits,
        "period": response.otp.period,
    }))
    .unwrap();
    let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap();
    totp.code_at(now).unwrap()
}

fn wrong_code(code: &str) -> String {
    format!("{:06}", (code.parse::<u32>().unwrap() + 500_000) % 1_000_000)
}

fn signed_tx(user: &SigningKey, sender: &str, guardian: &str, nonce: u64) -> Transaction {
    let mut tx = Transaction {
        nonce,
        value: "1000000000000000000".to_string(),
        receiver: hex::encode([0xAB; 32]),
        sender: sender.to_string(),
        gas_price: 1_000_000_000,
        gas_limit: 150_000,
        data: Some("transfer".to_string()),
        chain_id: "D".to_string(),
        version: 2,
        options: 2,
        guardian: guardian.to_string(),
        signature: String::new(),
        guardian_signature: String::new(),
    };
    tx.signature = hex::encode(user.sign(&tx.signable_bytes().unwrap()).to_bytes());
    tx
}

async fn register(registry: &GuardianRegistry, user: &str) -> RegisterResponse {
    registry
        .register_user(&RegistrationRequest {
            user: user.to_string(),
            tag: None,
        })
        .await
        .unwrap()
}

async fn verify(registry: &GuardianRegistry, user: &str, guardian: &str, code: &str) -> Result<(), GuardianError> {
    registry
        .verify_code(
            IP,
            &VerificationRequest {
                user: user.to_string(),
                guardian: guardian.to_string(),
                code: code.to_string(),
                second_code: None,
            },
        )
        .await
        .map(|_| ())
        .map_err(|e| e.error)
}

#[tokio::test]
async fn test_register_verify_sign() {
    let dir = TempDir::new().unwrap();
    let fx = open_registry(&dir, None, 3, LockBackend::Local);
    let (user, address) = user_key(1);

    let response = register(&fx.registry, &address).await;
    let guardian = response.guardian_address.clone();
    verify(&fx.registry, &address, &guardian, &code_for(&response))
        .await
        .unwrap();

    let tx = signed_tx(&user, &address, &guardian, 1);
    let (signed, data) = fx
        .registry
        .sign_transaction(
            IP,
            &SignTransactionRequest {
                code: code_for(&response),
                second_code: None,
                tx: tx.clone(),
            },
        )
        .await
        .unwrap();

    assert_eq!(data.remaining_trials, 3);
    let signature = ed25519_dalek::Signature::from_slice(&hex::decode(&signed.guardian_signature).unwrap()).unwrap();
    public_key_from_address(&guardian)
        .unwrap()
        .verify(&tx.signable_bytes().unwrap(), &signature)
        .unwrap();
}

#[tokio::test]
async fn test_second_verify_is_rejected() {
    let dir = TempDir::new().unwrap();
    let fx = open_registry(&dir, None, 3, LockBackend::Local);
    let (_, address) = user_key(2);

    let response = register(&fx.registry, &address).await;
    let code = code_for(&response);
    verify(&fx.registry, &address, &response.guardian_address, &code)
        .await
        .unwrap();

    let err = verify(&fx.registry, &address, &response.guardian_address, &code)
        .await
        .unwrap_err();
    assert!(matches!(err, GuardianError::InvalidGuardianState(_)));
}

#[tokio::test]
async fn test_exhausted_limiter_blocks_signing() {
    let dir = TempDir::new().unwrap();
    let fx = open_registry(&dir, None, 2, LockBackend::Local);
    let (user, address) = user_key(3);

    let response = register(&fx.registry, &address).await;
    let guardian = response.guardian_address.clone();
    verify(&fx.registry, &address, &guardian, &code_for(&response))
        .await
        .unwrap();

    let request = |code: String| SignTransactionRequest {
        code,
        second_code: None,
        tx: signed_tx(&user, &address, &guardian, 2),
    };

    for expected_remaining in [1, 0] {
        let err = fx
            .registry
            .sign_transaction(IP, &request(wrong_code(&code_for(&response))))
            .await
            .unwrap_err();
        assert_eq!(err.error, GuardianError::InvalidCode);
        assert_eq!(err.verify_data.unwrap().remaining_trials, expected_remaining);
    }

    // even the right code is refused once the window is exhausted
    let err = fx
        .registry
        .sign_transaction(IP, &request(code_for(&response)))
        .await
        .unwrap_err();
    assert_eq!(err.error, GuardianError::TooManyFailedAttempts);
    let data = err.verify_data.unwrap();
    assert_eq!(data.remaining_trials, 0);
    assert!(data.reset_after > 0);
}

#[tokio::test]
async fn test_batch_rejects_foreign_sender() {
    let dir = TempDir::new().unwrap();
    let fx = open_registry(&dir, None, 3, LockBackend::Local);
    let (user, address) = user_key(4);
    let (other, other_address) = user_key(5);

    let response = register(&fx.registry, &address).await;
    let guardian = response.guardian_address.clone();

    let err = fx
        .registry
        .sign_multiple_transactions(
            IP,
            &SignMultipleTransactionsRequest {
                code: code_for(&response),
                second_code: None,
                txs: vec![
                    signed_tx(&user, &address, &guardian, 1),
                    signed_tx(&other, &other_address, &guardian, 1),
                ],
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err.error, GuardianError::InvalidSender { .. }));
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let (_, address) = user_key(6);
    let (_, second_address) = user_key(7);

    let fx = open_registry(&dir, None, 3, LockBackend::Local);
    let first = register(&fx.registry, &address).await;
    let secret = fx.encryptor_secret.clone();
    fx.registry.close().unwrap();
    drop(fx);

    let fx = open_registry(&dir, Some(&secret), 3, LockBackend::Local);
    assert_eq!(fx.registry.registered_users().unwrap(), 1);

    // the stored OTP still decrypts and validates after reopening
    verify(&fx.registry, &address, &first.guardian_address, &code_for(&first))
        .await
        .unwrap();

    // a second user gets a fresh, non-overlapping guardian
    let second = register(&fx.registry, &second_address).await;
    assert_ne!(second.guardian_address, first.guardian_address);
    assert_eq!(fx.registry.registered_users().unwrap(), 2);
}

#[tokio::test]
async fn test_guardian_rotation_after_activation() {
    let dir = TempDir::new().unwrap();
    let fx = open_registry(&dir, None, 3, LockBackend::Local);
    let (_, address) = user_key(8);

    let first = register(&fx.registry, &address).await;
    verify(&fx.registry, &address, &first.guardian_address, &code_for(&first))
        .await
        .unwrap();

    // the first guardian is confirmed, so the next issuance is the second one
    tokio::time::sleep(Duration::from_millis(2_100)).await;
    let second = register(&fx.registry, &address).await;
    assert_ne!(second.guardian_address, first.guardian_address);
    verify(&fx.registry, &address, &second.guardian_address, &code_for(&second))
        .await
        .unwrap();

    // with the first guardian active on chain, the second is reissued
    *fx.chain.guardian_data.lock().unwrap() = GuardianData {
        active_guardian: Some(ChainGuardian {
            address: first.guardian_address.clone(),
            ..Default::default()
        }),
        pending_guardian: None,
        guarded: true,
    };
    tokio::time::sleep(Duration::from_millis(2_100)).await;
    let third = register(&fx.registry, &address).await;
    assert_eq!(third.guardian_address, second.guardian_address);
}

#[tokio::test]
async fn test_concurrent_registrations_get_distinct_indexes() {
    let dir = TempDir::new().unwrap();
    let fx = Arc::new(open_registry(
        &dir,
        None,
        3,
        LockBackend::Distributed {
            store: Arc::new(MemoryLeaseStore::new()),
            expiry: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
        },
    ));

    let mut handles = Vec::new();
    for seed in 10..30u8 {
        let fx = Arc::clone(&fx);
        handles.push(tokio::spawn(async move {
            let (_, address) = user_key(seed);
            register(&fx.registry, &address).await.guardian_address
        }));
    }

    let mut guardians = Vec::new();
    for handle in handles {
        guardians.push(handle.await.unwrap());
    }
    guardians.sort();
    guardians.dedup();

    assert_eq!(guardians.len(), 20);
    assert_eq!(fx.registry.registered_users().unwrap(), 20);
}
