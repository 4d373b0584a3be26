#![allow(dead_code)]

use async_trait::async_trait;
use consent_core::{
    AccessPolicy, Actor, ConsentService, CoreConfig, CryptoService, DevKeyring, ExternalError,
    FsBlobStore, HealthRecord, Identity, IdentityCache, IdentityRegistry, NonEmptyText, Principal,
    Role, Sealed, StaticDirectory, UploadRecord, WrappedKey,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Crypto double over [`DevKeyring`] whose reseal hangs for selected wrapped keys.
pub struct FlakyCrypto {
    pub keyring: DevKeyring,
    stalled: Mutex<HashSet<WrappedKey>>,
}

impl FlakyCrypto {
    pub fn new() -> Self {
        Self {
            keyring: DevKeyring::random(),
            stalled: Mutex::new(HashSet::new()),
        }
    }

    /// Make every reseal of this key hang past any deadline.
    pub fn stall(&self, key: &WrappedKey) {
        self.stalled.lock().unwrap().insert(key.clone());
    }

    pub fn recover(&self) {
        self.stalled.lock().unwrap().clear();
    }
}

#[async_trait]
impl CryptoService for FlakyCrypto {
    async fn seal(&self, plaintext: &[u8], policy: &AccessPolicy) -> Result<Sealed, ExternalError> {
        self.keyring.seal(plaintext, policy).await
    }

    async fn reseal(
        &self,
        wrapped_key: &WrappedKey,
        old_policy: &AccessPolicy,
        new_policy: &AccessPolicy,
    ) -> Result<WrappedKey, ExternalError> {
        let stalled = self.stalled.lock().unwrap().contains(wrapped_key);
        if stalled {
            tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
        }
        self.keyring.reseal(wrapped_key, old_policy, new_policy).await
    }
}

pub struct TestContext {
    pub service: ConsentService,
    pub crypto: Arc<FlakyCrypto>,
    _temp: TempDir,
}

pub const DOCTORS: [&str; 5] = ["0xD1", "0xD2", "0xD3", "0xDA", "0xDB"];

pub fn p(s: &str) -> Principal {
    Principal::parse(s).unwrap()
}

pub fn patient() -> Actor {
    Actor::patient(p("0xP"))
}

pub fn doctor(s: &str) -> Actor {
    Actor::doctor(p(s))
}

/// Service over a temp data dir, the flaky crypto double and a directory holding patient
/// `0xP` plus the doctors in [`DOCTORS`].
pub fn setup_test_service() -> TestContext {
    let temp = TempDir::new().unwrap();
    let cfg = CoreConfig::new(temp.path().to_path_buf()).with_reseal_timeout(Duration::from_secs(5));

    let mut identities = vec![Identity {
        principal: p("0xP"),
        role: Role::Patient,
        display_name: NonEmptyText::new("Pat Example").unwrap(),
        organization: None,
    }];
    identities.extend(DOCTORS.iter().map(|d| Identity {
        principal: p(d),
        role: Role::Doctor,
        display_name: NonEmptyText::new(format!("Dr {d}")).unwrap(),
        organization: Some(NonEmptyText::new("Example Health").unwrap()),
    }));
    let registry = IdentityRegistry::new(Arc::new(StaticDirectory::new(identities)), IdentityCache::disabled());

    let crypto = Arc::new(FlakyCrypto::new());
    let blobs = Arc::new(FsBlobStore::open(&cfg.blobs_dir()).unwrap());
    let service = ConsentService::new(&cfg, Arc::new(registry), blobs, crypto.clone())
        .unwrap()
        .with_snapshot(cfg.snapshot_path());

    TestContext {
        service,
        crypto,
        _temp: temp,
    }
}

/// Upload a record for `0xP`, performed by `uploader`.
pub async fn upload_test_record(ctx: &TestContext, uploader: &Actor, title: &str) -> HealthRecord {
    ctx.service
        .upload_record(
            uploader,
            UploadRecord {
                patient: p("0xP"),
                title: title.to_string(),
                record_type: "report".to_string(),
                content: format!("contents of {title}").into_bytes(),
                mime_type: Some("text/plain".to_string()),
                co_authorized: vec![],
            },
        )
        .await
        .unwrap()
}

pub fn members(record: &HealthRecord) -> Vec<String> {
    record.policy.members().map(|m| m.to_string()).collect()
}
