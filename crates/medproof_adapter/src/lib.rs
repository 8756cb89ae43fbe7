#![forbid(unsafe_code)]

pub mod http;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use medproof_engines::content_store::{ContentStore, ContentStoreConfig};
use medproof_engines::crypto_vault::{CryptoVault, CryptoVaultConfig, VaultError};
use medproof_engines::ledger_client::{LedgerClient, LedgerClientConfig, LedgerError};
use medproof_kernel_contracts::consent::ConsentGrant;
use medproof_kernel_contracts::ids::{ConsentId, RecordId, UserId};
use medproof_kernel_contracts::ledger::LedgerAddress;
use medproof_kernel_contracts::record::{DescriptiveMetadata, RecordMetadata};
use medproof_kernel_contracts::{ContractViolation, UnixTimeMs};
use medproof_os::audit_check::{cross_check, CrossCheckIssue};
use medproof_os::consent::{ConsentGrantPipeline, ConsentRequest};
use medproof_os::ingestion::{
    IngestRequest, IngestionConfig, RecordIngestionPipeline, VerificationReport,
};
use medproof_os::notify::TracingNotifier;
use medproof_os::{PipelineError, SharedServices};
use medproof_storage::{AuditTrail, MedStore, StorageError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum AdapterStartupError {
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A request that could not be served: HTTP status plus the reason returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterFailure {
    pub http_status: u16,
    pub outcome: &'static str,
    pub reason: String,
}

impl AdapterFailure {
    fn bad_request(reason: impl Into<String>) -> Self {
        Self {
            http_status: 400,
            outcome: "REJECTED",
            reason: reason.into(),
        }
    }
}

impl From<ContractViolation> for AdapterFailure {
    fn from(v: ContractViolation) -> Self {
        Self::bad_request(v.to_string())
    }
}

impl From<PipelineError> for AdapterFailure {
    fn from(err: PipelineError) -> Self {
        let (http_status, outcome) = match &err {
            PipelineError::Contract(_) => (400, "REJECTED"),
            PipelineError::NotOwner { .. } | PipelineError::AccessDenied { .. } => (403, "DENIED"),
            PipelineError::NotFound { .. } => (404, "NOT_FOUND"),
            PipelineError::AlreadyProcessed { .. }
            | PipelineError::NotRevocable { .. }
            | PipelineError::RecordNotVerified { .. }
            | PipelineError::Storage(StorageError::DuplicateKey { .. })
            | PipelineError::Storage(StorageError::InvalidTransition { .. }) => (409, "CONFLICT"),
            PipelineError::Expired { .. } => (410, "EXPIRED"),
            PipelineError::Ledger(_) | PipelineError::EventNotFound { .. } => (502, "LEDGER_FAILED"),
            PipelineError::StoreUnavailable { .. } | PipelineError::DegradedContent { .. } => {
                (503, "STORE_UNAVAILABLE")
            }
            PipelineError::ConfirmationTimeout { .. } => (504, "PENDING_CONFIRMATION"),
            PipelineError::Integrity { .. } => (500, "INTEGRITY_FAILED"),
            PipelineError::Vault(_) | PipelineError::Storage(_) => (500, "INTERNAL"),
        };
        Self {
            http_status,
            outcome,
            reason: err.to_string(),
        }
    }
}

/// Source of `now` for every pipeline call the adapter makes. Wire requests never carry a
/// time; consent expiry and audit timestamps are taken from this clock only.
pub trait AdapterClock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> UnixTimeMs;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl AdapterClock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(1);
        UnixTimeMs(ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordIngestAdapterRequest {
    pub record_id: String,
    pub owner_id: String,
    pub submitted_by: String,
    pub payload_b64: String,
    pub title: Option<String>,
    pub category: Option<String>,
    pub media_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordAdapterView {
    pub record_id: String,
    pub owner_id: String,
    pub content_address: String,
    pub integrity_hash: String,
    pub encryption_hash: String,
    pub plaintext_len: u64,
    pub ledger_tx_ref: String,
    pub record_status: String,
    pub created_at_ms: u64,
    pub title: Option<String>,
    pub category: Option<String>,
    pub media_type: Option<String>,
}

impl From<&RecordMetadata> for RecordAdapterView {
    fn from(row: &RecordMetadata) -> Self {
        Self {
            record_id: row.record_id.to_string(),
            owner_id: row.owner_id.to_string(),
            content_address: row.content_address.to_string(),
            integrity_hash: row.integrity_hash.to_hex(),
            encryption_hash: row.encryption_hash.to_hex(),
            plaintext_len: row.plaintext_len,
            ledger_tx_ref: row.ledger_tx_ref.to_string(),
            record_status: row.status.as_str().to_string(),
            created_at_ms: row.created_at.0,
            title: row.descriptive.title.clone(),
            category: row.descriptive.category.clone(),
            media_type: row.descriptive.media_type.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordAdapterResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub record: Option<RecordAdapterView>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordContentQuery {
    pub requester_id: Option<String>,
    pub requester_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordContentAdapterResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub record_id: String,
    pub payload_b64: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyAdapterResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub record_id: String,
    pub status_before: Option<String>,
    pub status_after: Option<String>,
    pub on_ledger: bool,
    pub consistent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentRequestAdapterRequest {
    pub consent_id: String,
    pub owner_id: String,
    pub grantee_id: String,
    pub grantee_address: String,
    pub purpose: String,
    pub scope: Vec<String>,
    pub duration_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentActionAdapterRequest {
    pub actor_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentAction {
    Approve,
    Reject,
    Revoke,
}

impl ConsentAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            "revoke" => Some(Self::Revoke),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentAdapterView {
    pub consent_id: String,
    pub owner_id: String,
    pub grantee_id: String,
    pub grantee_address: String,
    pub purpose: String,
    pub scope: Vec<String>,
    pub consent_status: String,
    pub effective_status: String,
    pub requested_at_ms: u64,
    pub expires_at_ms: u64,
    pub ledger_token_ref: Option<u64>,
    pub ledger_tx_ref: Option<String>,
}

impl ConsentAdapterView {
    fn from_grant(grant: &ConsentGrant, now: UnixTimeMs) -> Self {
        Self {
            consent_id: grant.consent_id.to_string(),
            owner_id: grant.owner_id.to_string(),
            grantee_id: grant.grantee_id.to_string(),
            grantee_address: grant.grantee_address.to_string(),
            purpose: grant.purpose.clone(),
            scope: grant.scope.iter().map(|r| r.to_string()).collect(),
            consent_status: grant.status.as_str().to_string(),
            effective_status: grant.effective_status(now).as_str().to_string(),
            requested_at_ms: grant.requested_at.0,
            expires_at_ms: grant.expires_at.0,
            ledger_token_ref: grant.ledger_token_ref.map(|t| t.0),
            ledger_tx_ref: grant.ledger_tx_ref.as_ref().map(|t| t.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentAdapterResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub consent: Option<ConsentAdapterView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossCheckAdapterResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub checked: usize,
    pub confirmed: usize,
    pub missing_seqs: Vec<u64>,
    pub reverted_seqs: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub vault_durable: bool,
    pub content_degraded_mode: bool,
    pub ledger_operator: String,
    pub records: usize,
    pub consents: usize,
    pub audit_entries: usize,
}

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub vault: CryptoVaultConfig,
    pub content: ContentStoreConfig,
    pub ledger: LedgerClientConfig,
    pub ingestion: IngestionConfig,
    pub audit_journal: Option<PathBuf>,
    pub metadata_journal: Option<PathBuf>,
}

impl AdapterConfig {
    pub fn from_env() -> Self {
        Self {
            vault: CryptoVaultConfig::from_env(),
            content: ContentStoreConfig::from_env(),
            ledger: LedgerClientConfig::from_env(),
            ingestion: IngestionConfig::from_env(),
            audit_journal: env_path("MEDPROOF_AUDIT_JOURNAL"),
            metadata_journal: env_path("MEDPROOF_METADATA_JOURNAL"),
        }
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Wires the pipelines from configuration and maps wire requests onto them.
///
/// Every method blocks on network I/O; async callers must run them off the reactor.
#[derive(Debug, Clone)]
pub struct AdapterRuntime {
    services: SharedServices,
    ingest: RecordIngestionPipeline,
    consent: ConsentGrantPipeline,
    clock: Arc<dyn AdapterClock>,
}

impl AdapterRuntime {
    pub fn from_env() -> Result<Self, AdapterStartupError> {
        Self::from_config(&AdapterConfig::from_env())
    }

    pub fn from_config(config: &AdapterConfig) -> Result<Self, AdapterStartupError> {
        let vault = CryptoVault::from_config(&config.vault)?;
        let content = ContentStore::from_config(&config.content);
        let ledger = LedgerClient::from_config(&config.ledger)?;
        let audit = match config.audit_journal.as_ref() {
            Some(path) => AuditTrail::open_jsonl(path)?,
            None => AuditTrail::new_in_memory(),
        };
        let store = match config.metadata_journal.as_ref() {
            Some(path) => MedStore::open_jsonl(path, audit)?,
            None => {
                warn!("MEDPROOF_METADATA_JOURNAL unset; record and consent rows are kept in memory only");
                MedStore::with_audit_trail(audit)
            }
        };
        let services = SharedServices::new(
            Arc::new(vault),
            Arc::new(content),
            Arc::new(ledger),
            store,
            Arc::new(TracingNotifier),
        );
        info!(
            audit_journal = ?config.audit_journal,
            metadata_journal = ?config.metadata_journal,
            accept_degraded_storage = config.ingestion.accept_degraded_storage,
            "adapter runtime ready"
        );
        Ok(Self::new(services, config.ingestion))
    }

    pub fn new(services: SharedServices, ingestion: IngestionConfig) -> Self {
        Self {
            ingest: RecordIngestionPipeline::new(services.clone(), ingestion),
            consent: ConsentGrantPipeline::new(services.clone()),
            services,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn AdapterClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn health_report(&self) -> AdapterHealthResponse {
        let store = self.services.store();
        AdapterHealthResponse {
            status: "ok".to_string(),
            outcome: "HEALTHY".to_string(),
            reason: None,
            vault_durable: self.services.vault.is_durable(),
            content_degraded_mode: self.services.content.degraded_mode_enabled(),
            ledger_operator: self.services.ledger.operator_address().to_string(),
            records: store.records_rows().len(),
            consents: store.consents_rows().len(),
            audit_entries: store.audit_entries().len(),
        }
    }

    pub fn ingest_record(
        &self,
        request: RecordIngestAdapterRequest,
    ) -> Result<RecordAdapterResponse, AdapterFailure> {
        let raw = BASE64
            .decode(request.payload_b64.trim().as_bytes())
            .map_err(|_| AdapterFailure::bad_request("payload_b64 is not valid base64"))?;
        let ingest = IngestRequest::v1(
            RecordId::new(request.record_id)?,
            UserId::new(request.owner_id)?,
            UserId::new(request.submitted_by)?,
            raw,
            DescriptiveMetadata {
                title: request.title,
                category: request.category,
                media_type: request.media_type,
            },
        )?;
        let row = self.ingest.ingest(self.clock.now(), ingest)?;
        Ok(RecordAdapterResponse {
            status: "ok".to_string(),
            outcome: "REGISTERED".to_string(),
            reason: None,
            record: Some(RecordAdapterView::from(&row)),
        })
    }

    pub fn get_record(&self, record_id: &str) -> Result<RecordAdapterResponse, AdapterFailure> {
        let record_id = RecordId::new(record_id)?;
        let row = self
            .ingest
            .record(&record_id)
            .ok_or_else(|| PipelineError::NotFound {
                kind: "record",
                id: record_id.to_string(),
            })?;
        Ok(RecordAdapterResponse {
            status: "ok".to_string(),
            outcome: "FOUND".to_string(),
            reason: None,
            record: Some(RecordAdapterView::from(&row)),
        })
    }

    /// Without a requester the owner-side retrieval path is used; with one, the read goes
    /// through the consent and ledger access checks.
    pub fn record_content(
        &self,
        record_id: &str,
        query: RecordContentQuery,
    ) -> Result<RecordContentAdapterResponse, AdapterFailure> {
        let record_id = RecordId::new(record_id)?;
        let bytes = match (query.requester_id, query.requester_address) {
            (None, None) => self.ingest.retrieve(&record_id)?,
            (Some(requester_id), Some(address)) => self.ingest.access_record(
                self.clock.now(),
                &record_id,
                &UserId::new(requester_id)?,
                &LedgerAddress::new(address)?,
            )?,
            _ => {
                return Err(AdapterFailure::bad_request(
                    "requester_id and requester_address must be given together",
                ))
            }
        };
        Ok(RecordContentAdapterResponse {
            status: "ok".to_string(),
            outcome: "RETRIEVED".to_string(),
            reason: None,
            record_id: record_id.to_string(),
            payload_b64: Some(BASE64.encode(bytes)),
        })
    }

    pub fn verify_record(
        &self,
        record_id: &str,
    ) -> Result<VerifyAdapterResponse, AdapterFailure> {
        let record_id = RecordId::new(record_id)?;
        let report: VerificationReport = self.ingest.verify_record(self.clock.now(), &record_id)?;
        Ok(VerifyAdapterResponse {
            status: "ok".to_string(),
            outcome: if report.consistent() {
                "CONSISTENT".to_string()
            } else {
                "INCONSISTENT".to_string()
            },
            reason: None,
            record_id: record_id.to_string(),
            status_before: Some(report.status_before.as_str().to_string()),
            status_after: Some(report.status_after.as_str().to_string()),
            on_ledger: report.on_ledger.is_some(),
            consistent: report.consistent(),
        })
    }

    pub fn request_consent(
        &self,
        request: ConsentRequestAdapterRequest,
    ) -> Result<ConsentAdapterResponse, AdapterFailure> {
        let now = self.clock.now();
        let scope = request
            .scope
            .into_iter()
            .map(RecordId::new)
            .collect::<Result<BTreeSet<_>, _>>()?;
        let grant = self.consent.request(
            now,
            ConsentRequest {
                consent_id: ConsentId::new(request.consent_id)?,
                owner_id: UserId::new(request.owner_id)?,
                grantee_id: UserId::new(request.grantee_id)?,
                grantee_address: LedgerAddress::new(request.grantee_address)?,
                purpose: request.purpose,
                scope,
                duration_days: request.duration_days,
            },
        )?;
        Ok(consent_response("REQUESTED", &grant, now))
    }

    pub fn consent_action(
        &self,
        consent_id: &str,
        action: ConsentAction,
        request: ConsentActionAdapterRequest,
    ) -> Result<ConsentAdapterResponse, AdapterFailure> {
        let now = self.clock.now();
        let consent_id = ConsentId::new(consent_id)?;
        let actor_id = UserId::new(request.actor_id)?;
        let (outcome, grant) = match action {
            ConsentAction::Approve => ("APPROVED", self.consent.approve(now, &consent_id, &actor_id)?),
            ConsentAction::Reject => ("REJECTED", self.consent.reject(now, &consent_id, &actor_id)?),
            ConsentAction::Revoke => ("REVOKED", self.consent.revoke(now, &consent_id, &actor_id)?),
        };
        Ok(consent_response(outcome, &grant, now))
    }

    pub fn get_consent(
        &self,
        consent_id: &str,
    ) -> Result<ConsentAdapterResponse, AdapterFailure> {
        let consent_id = ConsentId::new(consent_id)?;
        let grant = self
            .consent
            .consent(&consent_id)
            .ok_or_else(|| PipelineError::NotFound {
                kind: "consent",
                id: consent_id.to_string(),
            })?;
        Ok(consent_response("FOUND", &grant, self.clock.now()))
    }

    pub fn audit_cross_check(&self) -> Result<CrossCheckAdapterResponse, AdapterFailure> {
        let entries = self.services.store().audit_entries().to_vec();
        let report = cross_check(&entries, &self.services.ledger).map_err(PipelineError::from)?;
        let seqs = |issue: CrossCheckIssue| {
            report
                .findings
                .iter()
                .filter(|f| f.issue == issue)
                .map(|f| f.seq.0)
                .collect::<Vec<_>>()
        };
        Ok(CrossCheckAdapterResponse {
            status: "ok".to_string(),
            outcome: if report.is_clean() {
                "CLEAN".to_string()
            } else {
                "FINDINGS".to_string()
            },
            reason: None,
            checked: report.checked,
            confirmed: report.confirmed,
            missing_seqs: seqs(CrossCheckIssue::Missing),
            reverted_seqs: seqs(CrossCheckIssue::Reverted),
        })
    }
}

fn consent_response(outcome: &str, grant: &ConsentGrant, now: UnixTimeMs) -> ConsentAdapterResponse {
    ConsentAdapterResponse {
        status: "ok".to_string(),
        outcome: outcome.to_string(),
        reason: None,
        consent: Some(ConsentAdapterView::from_grant(grant, now)),
    }
}
