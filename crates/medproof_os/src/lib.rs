#![forbid(unsafe_code)]

pub mod audit_check;
pub mod consent;
pub mod error;
pub mod id_locks;
pub mod ingestion;
pub mod notify;

use std::sync::{Arc, Mutex, MutexGuard};

use medproof_engines::content_store::ContentStore;
use medproof_engines::crypto_vault::CryptoVault;
use medproof_engines::ledger_client::LedgerClient;
use medproof_kernel_contracts::ids::UserId;
use medproof_kernel_contracts::ContractViolation;
use medproof_storage::MedStore;

pub use error::PipelineError;
pub use id_locks::IdLocks;
pub use notify::NotificationSink;

/// Actor recorded on audit entries written by the service itself (verification).
pub const SYSTEM_ACTOR_ID: &str = "medproof_system";

/// Collaborators built once at start and shared by both pipelines.
#[derive(Debug, Clone)]
pub struct SharedServices {
    pub vault: Arc<CryptoVault>,
    pub content: Arc<ContentStore>,
    pub ledger: Arc<LedgerClient>,
    pub store: Arc<Mutex<MedStore>>,
    pub notifier: Arc<dyn NotificationSink>,
    pub locks: Arc<IdLocks>,
}

impl SharedServices {
    pub fn new(
        vault: Arc<CryptoVault>,
        content: Arc<ContentStore>,
        ledger: Arc<LedgerClient>,
        store: MedStore,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            vault,
            content,
            ledger,
            store: Arc::new(Mutex::new(store)),
            notifier,
            locks: Arc::new(IdLocks::new()),
        }
    }

    /// Short local critical section. Never hold the guard across a network call.
    pub fn store(&self) -> MutexGuard<'_, MedStore> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) fn system_actor() -> Result<UserId, ContractViolation> {
    UserId::new(SYSTEM_ACTOR_ID)
}
