use chrono::Utc;
use consent_core::{
    AccessPolicy, BlobLocator, CoreConfig, CryptoService, DevKeyring, GrantExecutor,
    HealthRecord, NonEmptyText, Principal, RecordId, RecordStore,
};
use std::path::PathBuf;
use std::sync::Arc;

pub fn p(s: &str) -> Principal {
    Principal::parse(s).unwrap()
}

pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

pub struct Harness {
    pub store: Arc<RecordStore>,
    pub keyring: DevKeyring,
    pub executor: GrantExecutor,
    pub cfg: CoreConfig,
}

pub fn harness() -> Harness {
    let store = Arc::new(RecordStore::new());
    let keyring = DevKeyring::random();
    let cfg = CoreConfig::new(PathBuf::from("unused"));
    let executor = GrantExecutor::new(store.clone(), Arc::new(keyring.clone()), &cfg);
    Harness {
        store,
        keyring,
        executor,
        cfg,
    }
}

impl Harness {
    /// Sealed record owned by `patient`, shared with `shared_with`.
    pub async fn record(&self, patient: &str, shared_with: &[&str]) -> RecordId {
        let policy = AccessPolicy::for_owner(p(patient), shared_with.iter().map(|s| p(s)));
        let sealed = self.keyring.seal(b"payload", &policy).await.unwrap();
        let record = HealthRecord {
            id: RecordId::new(),
            patient: p(patient),
            uploaded_by: p(patient),
            title: NonEmptyText::new("Report").unwrap(),
            record_type: NonEmptyText::new("report").unwrap(),
            locator: BlobLocator::new("unused"),
            wrapped_key: sealed.wrapped_key,
            policy,
            size_bytes: 7,
            mime_type: None,
            created_at: Utc::now(),
            policy_version: 0,
        };
        let id = record.id;
        self.store.create(record).unwrap();
        id
    }
}
