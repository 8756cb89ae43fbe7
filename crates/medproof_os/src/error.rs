#![forbid(unsafe_code)]

use medproof_engines::content_store::StoreError;
use medproof_engines::crypto_vault::VaultError;
use medproof_engines::ledger_client::LedgerError;
use medproof_kernel_contracts::ledger::TxRef;
use medproof_kernel_contracts::ContractViolation;
use medproof_storage::StorageError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("integrity check failed for {subject}")]
    Integrity { subject: String },
    #[error("content store unavailable: {message}")]
    StoreUnavailable { message: String },
    #[error(transparent)]
    Ledger(LedgerError),
    #[error("expected {event} event not found in receipt of {tx_ref}")]
    EventNotFound { event: &'static str, tx_ref: String },
    #[error("consent {consent_id} was already processed (status {status})")]
    AlreadyProcessed {
        consent_id: String,
        status: &'static str,
    },
    #[error("consent {consent_id} has expired")]
    Expired { consent_id: String },
    #[error("ledger transaction {tx_ref} was not confirmed in time")]
    ConfirmationTimeout { tx_ref: TxRef },
    #[error("{actor_id} is not the owner of {subject}")]
    NotOwner { subject: String, actor_id: String },
    #[error("{requester_id} has no active grant for record {record_id}")]
    AccessDenied {
        record_id: String,
        requester_id: String,
    },
    #[error("consent {consent_id} cannot be revoked from status {status}")]
    NotRevocable {
        consent_id: String,
        status: &'static str,
    },
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("record {record_id} only has a degraded placeholder address {address}")]
    DegradedContent { record_id: String, address: String },
    #[error("record {record_id} is {status}, not verified")]
    RecordNotVerified {
        record_id: String,
        status: &'static str,
    },
    #[error("vault error: {0}")]
    Vault(VaultError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

impl From<LedgerError> for PipelineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::EventNotFound { event, tx_ref } => {
                PipelineError::EventNotFound { event, tx_ref }
            }
            LedgerError::ConfirmationTimeout { tx_ref } => {
                PipelineError::ConfirmationTimeout { tx_ref }
            }
            other => PipelineError::Ledger(other),
        }
    }
}

impl PipelineError {
    pub(crate) fn from_store(err: StoreError, subject: &str) -> Self {
        match err {
            StoreError::NotFound { address } => PipelineError::NotFound {
                kind: "blob",
                id: if address.is_empty() {
                    subject.to_string()
                } else {
                    address
                },
            },
            StoreError::Unavailable { message } | StoreError::Rejected { message } => {
                PipelineError::StoreUnavailable { message }
            }
            StoreError::InvalidAddress(v) => PipelineError::Contract(v),
        }
    }

    pub(crate) fn from_vault(err: VaultError, subject: &str) -> Self {
        match err {
            VaultError::Integrity => PipelineError::Integrity {
                subject: subject.to_string(),
            },
            other => PipelineError::Vault(other),
        }
    }
}
