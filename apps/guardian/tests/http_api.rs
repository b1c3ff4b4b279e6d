//! End-to-end HTTP tests against a running test server.
//!
//! Run with: cargo test --test `http_api`

use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, web};
use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;

use guardian_service::Settings;
use guardian_service::chain::{Account, ChainClient, GuardianData};
use guardian_service::crypto::{GuardianKeyGenerator, KeyEncryptor};
use guardian_service::error::GuardianResult;
use guardian_service::locking::{KeyedLock, LockBackend};
use guardian_service::otp::{LimitConfig, OtpSecurityEngine, RedbRateLimiter, TotpProvider};
use guardian_service::registry::{GuardianRegistry, RegistryDeps};
use guardian_service::routes;
use guardian_service::sharding::open_sharded_store;
use guardian_service::storage::Storage;

const USER: &str = "8049d639e5a6980d1cd2392abcce41029cda74a1563523a202f09641cc2618f8";

struct UnfundedChain;

#[async_trait]
impl ChainClient for UnfundedChain {
    async fn get_account(&self, address: &str) -> GuardianResult<Account> {
        Ok(Account {
            address: address.to_string(),
            ..Default::default()
        })
    }

    async fn get_guardian_data(&self, _address: &str) -> GuardianResult<GuardianData> {
        Ok(GuardianData::default())
    }
}

struct FundedChain;

#[async_trait]
impl ChainClient for FundedChain {
    async fn get_account(&self, address: &str) -> GuardianResult<Account> {
        Ok(Account {
            address: address.to_string(),
            nonce: 1,
            balance: "1".to_string(),
        })
    }

    async fn get_guardian_data(&self, _address: &str) -> GuardianResult<GuardianData> {
        Ok(GuardianData::default())
    }
}

fn registry(dir: &TempDir, chain: Arc<dyn ChainClient>) -> web::Data<GuardianRegistry> {
    let settings = Settings::for_tests();
    let storage = Arc::new(Storage::open(&dir.path().join("http.redb")).unwrap());
    let limiter = RedbRateLimiter::new(
        Arc::clone(&storage),
        LimitConfig::new(3, Duration::from_secs(300)).unwrap(),
        LimitConfig::new(100, Duration::from_secs(86_400)).unwrap(),
    );
    let deps = RegistryDeps {
        store: open_sharded_store(&storage, settings.num_buckets()).unwrap(),
        encryptor: KeyEncryptor::generate(),
        keys: GuardianKeyGenerator::new(settings.mnemonic().unwrap()).unwrap(),
        otp_provider: Arc::new(TotpProvider::new("Guardian", 6, 30).unwrap()),
        security: OtpSecurityEngine::new(Arc::new(limiter)),
        chain,
        locks: KeyedLock::new(LockBackend::Local),
    };
    web::Data::new(GuardianRegistry::new(deps, settings.registry_config()).unwrap())
}

fn start(registry: web::Data<GuardianRegistry>) -> actix_test::TestServer {
    let settings = web::Data::new(Settings::for_tests());
    actix_test::start(move || {
        App::new()
            .app_data(settings.clone())
            .app_data(registry.clone())
            .app_data(routes::guardian::json_config(1 << 20))
            .configure(routes::health::configure)
            .configure(routes::guardian::configure)
    })
}

#[actix_rt::test]
async fn test_health_and_config() {
    let dir = TempDir::new().unwrap();
    let srv = start(registry(&dir, Arc::new(FundedChain)));

    let mut resp = srv.get("/health").send().await.unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let mut resp = srv.get("/guardian/config").send().await.unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "successful");
    assert_eq!(body["data"]["otpDelay"], 60);
    assert_eq!(body["data"]["backoffWrongCode"], 300);
}

#[actix_rt::test]
async fn test_register_over_http() {
    let dir = TempDir::new().unwrap();
    let srv = start(registry(&dir, Arc::new(FundedChain)));

    let mut resp = srv
        .post("/guardian/register")
        .send_json(&json!({ "user": USER, "tag": "bob" }))
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["otp"]["scheme"], "otpauth");
    assert_eq!(body["data"]["otp"]["account"], "bob");
    assert_eq!(body["data"]["otp"]["algorithm"], "SHA1");
    assert_eq!(body["data"]["guardianAddress"].as_str().unwrap().len(), 64);

    // an immediate repeat is throttled by the OTP rewrite delay
    let mut resp = srv
        .post("/guardian/register")
        .send_json(&json!({ "user": USER }))
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 429);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "REGISTRATION_FAILED");
}

#[actix_rt::test]
async fn test_unfunded_account_rejected() {
    let dir = TempDir::new().unwrap();
    let srv = start(registry(&dir, Arc::new(UnfundedChain)));

    let mut resp = srv
        .post("/guardian/register")
        .send_json(&json!({ "user": USER }))
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "NO_BALANCE");

    let mut resp = srv.get("/guardian/registered-users").send().await.unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["count"], 0);
}
