#![forbid(unsafe_code)]

use medproof_engines::content_store::FetchedBlob;
use medproof_engines::ledger_client::LedgerError;
use medproof_kernel_contracts::audit::{AuditAction, AuditEntryInput};
use medproof_kernel_contracts::ids::{RecordId, UserId};
use medproof_kernel_contracts::ledger::{LedgerAddress, OnLedgerArtifact};
use medproof_kernel_contracts::record::{
    ContentAddress, DescriptiveMetadata, RecordMetadata, RecordStatus,
};
use medproof_kernel_contracts::{ContractViolation, UnixTimeMs, Validate};
use tracing::{error, info, warn};

use crate::{system_actor, PipelineError, SharedServices};

pub const MAX_ARTIFACT_BYTES: usize = 32 * 1024 * 1024;
pub const VIEW_ACTION: &str = "view";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestionConfig {
    /// Register records whose blob only has a degraded placeholder address.
    pub accept_degraded_storage: bool,
}

impl IngestionConfig {
    pub fn from_env() -> Self {
        let accept = std::env::var("MEDPROOF_ACCEPT_DEGRADED_STORAGE")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "on" | "yes"))
            .unwrap_or(false);
        Self {
            accept_degraded_storage: accept,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct IngestRequest {
    pub record_id: RecordId,
    pub owner_id: UserId,
    /// Provider account submitting the artifact; recorded as the audit actor.
    pub submitted_by: UserId,
    pub raw_bytes: Vec<u8>,
    pub descriptive: DescriptiveMetadata,
}

impl std::fmt::Debug for IngestRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestRequest")
            .field("record_id", &self.record_id)
            .field("owner_id", &self.owner_id)
            .field("submitted_by", &self.submitted_by)
            .field("raw_len", &self.raw_bytes.len())
            .field("descriptive", &self.descriptive)
            .finish()
    }
}

impl IngestRequest {
    pub fn v1(
        record_id: RecordId,
        owner_id: UserId,
        submitted_by: UserId,
        raw_bytes: Vec<u8>,
        descriptive: DescriptiveMetadata,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            record_id,
            owner_id,
            submitted_by,
            raw_bytes,
            descriptive,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for IngestRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.record_id.validate()?;
        self.owner_id.validate()?;
        self.submitted_by.validate()?;
        self.descriptive.validate()?;
        if self.raw_bytes.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "ingest_request.raw_bytes",
                reason: "must not be empty",
            });
        }
        if self.raw_bytes.len() > MAX_ARTIFACT_BYTES {
            return Err(ContractViolation::InvalidValue {
                field: "ingest_request.raw_bytes",
                reason: "exceeds MAX_ARTIFACT_BYTES",
            });
        }
        Ok(())
    }
}

/// Outcome of comparing a local record with the ledger's copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub record_id: RecordId,
    pub status_before: RecordStatus,
    pub status_after: RecordStatus,
    pub on_ledger: Option<OnLedgerArtifact>,
    pub owner_matches: bool,
    pub content_address_matches: bool,
    pub integrity_hash_matches: bool,
}

impl VerificationReport {
    pub fn consistent(&self) -> bool {
        self.on_ledger.is_some()
            && self.owner_matches
            && self.content_address_matches
            && self.integrity_hash_matches
    }
}

/// Raw artifact → encrypted blob → ledger registration → metadata row + audit entry.
#[derive(Debug, Clone)]
pub struct RecordIngestionPipeline {
    services: SharedServices,
    config: IngestionConfig,
}

impl RecordIngestionPipeline {
    pub fn new(services: SharedServices, config: IngestionConfig) -> Self {
        Self { services, config }
    }

    pub fn record(&self, record_id: &RecordId) -> Option<RecordMetadata> {
        self.services.store().record(record_id).cloned()
    }

    pub fn ingest(&self, now: UnixTimeMs, req: IngestRequest) -> Result<RecordMetadata, PipelineError> {
        req.validate()?;
        let _guard = self
            .services
            .locks
            .lock(format!("record:{}", req.record_id));
        if self.services.store().has_record(&req.record_id) {
            return Err(PipelineError::Storage(medproof_storage::StorageError::DuplicateKey {
                table: "records.record_id",
                key: req.record_id.as_str().to_string(),
            }));
        }
        let record_id = req.record_id.clone();

        let integrity_hash = self.services.vault.hash(&req.raw_bytes);
        let sealed = self
            .services
            .vault
            .encrypt(&req.raw_bytes)
            .map_err(|e| PipelineError::from_vault(e, record_id.as_str()))?;
        let encryption_hash = self.services.vault.hash(&sealed.ciphertext);
        info!(%record_id, bytes = req.raw_bytes.len(), "ingest: artifact sealed");

        let stored = self
            .services
            .content
            .put(&sealed.ciphertext, record_id.as_str())
            .map_err(|e| PipelineError::from_store(e, record_id.as_str()))?;
        if stored.is_degraded() && !self.config.accept_degraded_storage {
            warn!(%record_id, "ingest: content store degraded; refusing to register placeholder");
            return Err(PipelineError::StoreUnavailable {
                message: format!(
                    "content store returned degraded placeholder {}",
                    stored.address()
                ),
            });
        }
        let content_address = stored.address().clone();
        info!(%record_id, %content_address, degraded = stored.is_degraded(), "ingest: blob stored");

        let registered = match self.services.ledger.register_artifact(
            &record_id,
            &req.owner_id,
            &content_address,
            integrity_hash,
        ) {
            Ok(out) => out,
            Err(LedgerError::ConfirmationTimeout { tx_ref }) => {
                let row = RecordMetadata::v1(
                    record_id.clone(),
                    req.owner_id.clone(),
                    content_address,
                    integrity_hash,
                    encryption_hash,
                    sealed.iv,
                    sealed.tag,
                    sealed.plaintext_len,
                    req.descriptive,
                    tx_ref.clone(),
                    RecordStatus::Pending,
                    now,
                )?;
                self.services.store().insert_record(row)?;
                warn!(%record_id, %tx_ref, "ingest: ledger confirmation timed out; record left pending");
                return Err(PipelineError::ConfirmationTimeout { tx_ref });
            }
            Err(err) => {
                log_orphan(&record_id, &content_address, &err);
                return Err(err.into());
            }
        };

        let row = RecordMetadata::v1(
            record_id.clone(),
            req.owner_id.clone(),
            content_address,
            integrity_hash,
            encryption_hash,
            sealed.iv,
            sealed.tag,
            sealed.plaintext_len,
            req.descriptive,
            registered.tx_ref.clone(),
            RecordStatus::Verified,
            now,
        )?;
        let audit = AuditEntryInput::v1(
            req.submitted_by,
            AuditAction::Ingest,
            record_id.as_str(),
            Some(registered.tx_ref.clone()),
            now,
        )?;
        if let Err(err) = self
            .services
            .store()
            .insert_record_with_audit(row.clone(), audit)
        {
            error!(
                %record_id,
                tx_ref = %registered.tx_ref,
                error = %err,
                "ingest: artifact registered on ledger but local commit failed"
            );
            return Err(err.into());
        }
        info!(%record_id, tx_ref = %registered.tx_ref, "ingest: record verified");
        self.services
            .notifier
            .on_record_ingested(&record_id, &req.owner_id);
        Ok(row)
    }

    /// Decrypted artifact bytes of a verified record. Never returns bytes whose integrity
    /// hash does not match the registered one.
    pub fn retrieve(&self, record_id: &RecordId) -> Result<Vec<u8>, PipelineError> {
        let row = self.load(record_id)?;
        self.open(&row)
    }

    /// Read on behalf of `requester_id`. The owner reads directly; anyone else needs an
    /// active local consent covering the record and an on-ledger grant for
    /// `requester_address`, and every such read is logged on the ledger.
    pub fn access_record(
        &self,
        now: UnixTimeMs,
        record_id: &RecordId,
        requester_id: &UserId,
        requester_address: &LedgerAddress,
    ) -> Result<Vec<u8>, PipelineError> {
        let row = self.load(record_id)?;
        if &row.owner_id == requester_id {
            return self.open(&row);
        }

        let consented = self
            .services
            .store()
            .consents_for_grantee(requester_id)
            .iter()
            .any(|c| {
                c.is_active_for(now, requester_id, record_id)
                    && &c.grantee_address == requester_address
            });
        let denied = || PipelineError::AccessDenied {
            record_id: record_id.as_str().to_string(),
            requester_id: requester_id.as_str().to_string(),
        };
        if !consented {
            return Err(denied());
        }
        if !self
            .services
            .ledger
            .check_access(requester_address, &row.owner_id)?
        {
            warn!(%record_id, %requester_id, "access: local consent active but ledger denies access");
            return Err(denied());
        }

        let bytes = self.open(&row)?;
        let logged = self
            .services
            .ledger
            .log_action(record_id, requester_address, VIEW_ACTION)?;
        let audit = AuditEntryInput::v1(
            requester_id.clone(),
            AuditAction::View,
            record_id.as_str(),
            Some(logged.tx_ref.clone()),
            now,
        )?;
        self.services.store().append_audit_entry(audit)?;
        info!(%record_id, %requester_id, tx_ref = %logged.tx_ref, "access: third-party view logged");
        Ok(bytes)
    }

    /// Compares the local row with the ledger. Pending rows move to verified or failed;
    /// rows that already left pending are only reported on.
    pub fn verify_record(
        &self,
        now: UnixTimeMs,
        record_id: &RecordId,
    ) -> Result<VerificationReport, PipelineError> {
        let _guard = self.services.locks.lock(format!("record:{record_id}"));
        let row = self.load_any(record_id)?;
        let on_ledger = self.services.ledger.get_artifact(record_id)?;
        let mut report = VerificationReport {
            record_id: record_id.clone(),
            status_before: row.status,
            status_after: row.status,
            owner_matches: on_ledger.as_ref().is_some_and(|a| a.owner_id == row.owner_id),
            content_address_matches: on_ledger
                .as_ref()
                .is_some_and(|a| a.content_address == row.content_address),
            integrity_hash_matches: on_ledger
                .as_ref()
                .is_some_and(|a| a.integrity_hash == row.integrity_hash),
            on_ledger,
        };
        if row.status != RecordStatus::Pending {
            if report.status_before == RecordStatus::Verified && !report.consistent() {
                error!(%record_id, "verify: verified record disagrees with the ledger");
            }
            return Ok(report);
        }

        let next = if report.consistent() {
            RecordStatus::Verified
        } else if report.on_ledger.is_none()
            && self.services.ledger.receipt(&row.ledger_tx_ref)?.is_none()
        {
            info!(%record_id, tx_ref = %row.ledger_tx_ref, "verify: registration still unconfirmed");
            return Ok(report);
        } else {
            RecordStatus::Failed
        };
        let action = match next {
            RecordStatus::Verified => AuditAction::Verify,
            _ => AuditAction::VerifyFailed,
        };
        let audit = AuditEntryInput::v1(
            system_actor()?,
            action,
            record_id.as_str(),
            Some(row.ledger_tx_ref.clone()),
            now,
        )?;
        self.services
            .store()
            .transition_record_status(record_id, next, Some(audit))?;
        report.status_after = next;
        info!(%record_id, status = next.as_str(), "verify: pending record resolved");
        if next == RecordStatus::Verified {
            self.services
                .notifier
                .on_record_ingested(record_id, &row.owner_id);
        }
        Ok(report)
    }

    fn load_any(&self, record_id: &RecordId) -> Result<RecordMetadata, PipelineError> {
        self.record(record_id).ok_or_else(|| PipelineError::NotFound {
            kind: "record",
            id: record_id.as_str().to_string(),
        })
    }

    fn load(&self, record_id: &RecordId) -> Result<RecordMetadata, PipelineError> {
        let row = self.load_any(record_id)?;
        if row.status != RecordStatus::Verified {
            return Err(PipelineError::RecordNotVerified {
                record_id: record_id.as_str().to_string(),
                status: row.status.as_str(),
            });
        }
        Ok(row)
    }

    fn open(&self, row: &RecordMetadata) -> Result<Vec<u8>, PipelineError> {
        let subject = row.record_id.as_str();
        let ciphertext = match self
            .services
            .content
            .get(&row.content_address)
            .map_err(|e| PipelineError::from_store(e, subject))?
        {
            FetchedBlob::Stored(bytes) => bytes,
            FetchedBlob::Placeholder { address } => {
                return Err(PipelineError::DegradedContent {
                    record_id: subject.to_string(),
                    address: address.as_str().to_string(),
                })
            }
        };
        if self.services.vault.hash(&ciphertext) != row.encryption_hash {
            warn!(record_id = subject, "retrieve: stored ciphertext hash mismatch");
            return Err(PipelineError::Integrity {
                subject: subject.to_string(),
            });
        }
        let plaintext = self
            .services
            .vault
            .decrypt(&ciphertext, &row.encryption_iv, &row.encryption_tag)
            .map_err(|e| PipelineError::from_vault(e, subject))?;
        if self.services.vault.hash(&plaintext) != row.integrity_hash {
            warn!(record_id = subject, "retrieve: plaintext integrity hash mismatch");
            return Err(PipelineError::Integrity {
                subject: subject.to_string(),
            });
        }
        Ok(plaintext)
    }
}

fn log_orphan(record_id: &RecordId, content_address: &ContentAddress, err: &LedgerError) {
    if content_address.is_placeholder() {
        warn!(%record_id, error = %err, "ingest: ledger registration failed");
        return;
    }
    error!(
        %record_id,
        orphaned_blob = %content_address,
        error = %err,
        "ingest: ledger registration failed; stored blob is orphaned"
    );
}
