#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::Path;

use medproof_kernel_contracts::audit::{AuditEntry, AuditEntryInput};
use medproof_kernel_contracts::consent::{ConsentGrant, ConsentStatus};
use medproof_kernel_contracts::ids::{ConsentId, RecordId, UserId};
use medproof_kernel_contracts::ledger::{TokenId, TxRef};
use medproof_kernel_contracts::record::{RecordMetadata, RecordStatus};
use medproof_kernel_contracts::{ContractViolation, UnixTimeMs, Validate};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::AuditTrail;
use crate::journal::{line_err, JsonlFile};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("duplicate key in {table}: {key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("no row in {table} for key {key}")]
    NotFound { table: &'static str, key: String },
    #[error("{table} is append-only")]
    AppendOnlyViolation { table: &'static str },
    #[error("{table} row {key} cannot move from {from} to {to}")]
    InvalidTransition {
        table: &'static str,
        key: String,
        from: &'static str,
        to: &'static str,
    },
    #[error("journal {path}: {message}")]
    Journal { path: String, message: String },
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
}

/// Local metadata store: the `records` and `consents` tables plus the audit trail.
///
/// Every commit that has an audit counterpart appends the audit entry in the same call,
/// after all preconditions have been checked and before the row change becomes visible,
/// so a reader holding the store never sees one without the other.
///
/// With a row journal attached, every inserted or changed row is written as a full snapshot
/// line after its audit entry and before it becomes visible. Replay keeps the last snapshot
/// per key.
#[derive(Debug)]
pub struct MedStore {
    records: BTreeMap<RecordId, RecordMetadata>,
    consents: BTreeMap<ConsentId, ConsentGrant>,
    audit: AuditTrail,
    journal: Option<JsonlFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
enum RowSnapshot {
    Record(RecordMetadata),
    Consent(ConsentGrant),
}

impl MedStore {
    pub fn new_in_memory() -> Self {
        Self::with_audit_trail(AuditTrail::new_in_memory())
    }

    pub fn with_audit_trail(audit: AuditTrail) -> Self {
        Self {
            records: BTreeMap::new(),
            consents: BTreeMap::new(),
            audit,
            journal: None,
        }
    }

    /// Opens (or creates) the `records`/`consents` row journal at `rows_path` and replays it.
    /// Every replayed row is validated; an invalid or unparsable line fails the open.
    pub fn open_jsonl(rows_path: impl AsRef<Path>, audit: AuditTrail) -> Result<Self, StorageError> {
        let (journal, snapshots) = JsonlFile::open::<RowSnapshot>(rows_path.as_ref())?;
        let mut store = Self::with_audit_trail(audit);
        for (idx, snapshot) in snapshots.into_iter().enumerate() {
            let invalid = |v: ContractViolation| line_err(journal.path(), idx + 1, v.to_string());
            match snapshot {
                RowSnapshot::Record(row) => {
                    row.validate().map_err(invalid)?;
                    store.records.insert(row.record_id.clone(), row);
                }
                RowSnapshot::Consent(grant) => {
                    grant.validate().map_err(invalid)?;
                    store.consents.insert(grant.consent_id.clone(), grant);
                }
            }
        }
        info!(
            path = %journal.path().display(),
            records = store.records.len(),
            consents = store.consents.len(),
            "row journal opened"
        );
        store.journal = Some(journal);
        Ok(store)
    }

    fn persist(&mut self, snapshot: RowSnapshot) -> Result<(), StorageError> {
        match self.journal.as_mut() {
            Some(journal) => journal.append(&snapshot),
            None => Ok(()),
        }
    }

    // ------------------------
    // records
    // ------------------------

    pub fn has_record(&self, record_id: &RecordId) -> bool {
        self.records.contains_key(record_id)
    }

    pub fn record(&self, record_id: &RecordId) -> Option<&RecordMetadata> {
        self.records.get(record_id)
    }

    pub fn records_rows(&self) -> Vec<&RecordMetadata> {
        self.records.values().collect()
    }

    pub fn records_by_owner(&self, owner_id: &UserId) -> Vec<&RecordMetadata> {
        self.records
            .values()
            .filter(|r| &r.owner_id == owner_id)
            .collect()
    }

    /// Inserts a record row without an audit counterpart (used for `pending` rows whose
    /// ledger confirmation is still outstanding).
    pub fn insert_record(&mut self, row: RecordMetadata) -> Result<(), StorageError> {
        row.validate()?;
        if self.records.contains_key(&row.record_id) {
            return Err(StorageError::DuplicateKey {
                table: "records.record_id",
                key: row.record_id.as_str().to_string(),
            });
        }
        self.persist(RowSnapshot::Record(row.clone()))?;
        self.records.insert(row.record_id.clone(), row);
        Ok(())
    }

    pub fn insert_record_with_audit(
        &mut self,
        row: RecordMetadata,
        audit: AuditEntryInput,
    ) -> Result<AuditEntry, StorageError> {
        row.validate()?;
        audit.validate()?;
        if self.records.contains_key(&row.record_id) {
            return Err(StorageError::DuplicateKey {
                table: "records.record_id",
                key: row.record_id.as_str().to_string(),
            });
        }
        let entry = self.audit.append(audit)?;
        self.persist(RowSnapshot::Record(row.clone()))?;
        self.records.insert(row.record_id.clone(), row);
        Ok(entry)
    }

    pub fn transition_record_status(
        &mut self,
        record_id: &RecordId,
        next: RecordStatus,
        audit: Option<AuditEntryInput>,
    ) -> Result<RecordMetadata, StorageError> {
        let current = self
            .records
            .get(record_id)
            .ok_or_else(|| StorageError::NotFound {
                table: "records.record_id",
                key: record_id.as_str().to_string(),
            })?;
        if !current.status.can_transition_to(next) {
            return Err(StorageError::InvalidTransition {
                table: "records",
                key: record_id.as_str().to_string(),
                from: current.status.as_str(),
                to: next.as_str(),
            });
        }
        let mut row = current.clone();
        row.status = next;
        if let Some(input) = audit {
            self.audit.append(input)?;
        }
        self.persist(RowSnapshot::Record(row.clone()))?;
        self.records.insert(record_id.clone(), row.clone());
        Ok(row)
    }

    pub fn attempt_delete_record(&mut self, _record_id: &RecordId) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation { table: "records" })
    }

    // ------------------------
    // consents
    // ------------------------

    pub fn consent(&self, consent_id: &ConsentId) -> Option<&ConsentGrant> {
        self.consents.get(consent_id)
    }

    pub fn consents_rows(&self) -> Vec<&ConsentGrant> {
        self.consents.values().collect()
    }

    pub fn consents_for_grantee(&self, grantee_id: &UserId) -> Vec<&ConsentGrant> {
        self.consents
            .values()
            .filter(|c| &c.grantee_id == grantee_id)
            .collect()
    }

    pub fn consents_by_owner(&self, owner_id: &UserId) -> Vec<&ConsentGrant> {
        self.consents
            .values()
            .filter(|c| &c.owner_id == owner_id)
            .collect()
    }

    /// True when some approved, unexpired grant covers `record_id` for `grantee_id`.
    pub fn has_active_consent(
        &self,
        now: UnixTimeMs,
        grantee_id: &UserId,
        record_id: &RecordId,
    ) -> bool {
        self.consents
            .values()
            .any(|c| c.is_active_for(now, grantee_id, record_id))
    }

    pub fn insert_consent_with_audit(
        &mut self,
        grant: ConsentGrant,
        audit: AuditEntryInput,
    ) -> Result<AuditEntry, StorageError> {
        grant.validate()?;
        audit.validate()?;
        if grant.status != ConsentStatus::Pending {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "consents.status",
                    reason: "new consents must be pending",
                },
            ));
        }
        if self.consents.contains_key(&grant.consent_id) {
            return Err(StorageError::DuplicateKey {
                table: "consents.consent_id",
                key: grant.consent_id.as_str().to_string(),
            });
        }
        let entry = self.audit.append(audit)?;
        self.persist(RowSnapshot::Consent(grant.clone()))?;
        self.consents.insert(grant.consent_id.clone(), grant);
        Ok(entry)
    }

    pub fn consent_approve_commit(
        &mut self,
        now: UnixTimeMs,
        consent_id: &ConsentId,
        token: TokenId,
        tx_ref: TxRef,
        audit: AuditEntryInput,
    ) -> Result<ConsentGrant, StorageError> {
        let mut next = self.consent_for_transition(consent_id, ConsentStatus::Approved)?;
        next.status = ConsentStatus::Approved;
        next.responded_at = Some(now);
        next.ledger_token_ref = Some(token);
        next.ledger_tx_ref = Some(tx_ref);
        self.commit_consent(next, audit)
    }

    pub fn consent_reject_commit(
        &mut self,
        now: UnixTimeMs,
        consent_id: &ConsentId,
        audit: AuditEntryInput,
    ) -> Result<ConsentGrant, StorageError> {
        let mut next = self.consent_for_transition(consent_id, ConsentStatus::Rejected)?;
        next.status = ConsentStatus::Rejected;
        next.responded_at = Some(now);
        self.commit_consent(next, audit)
    }

    pub fn consent_revoke_commit(
        &mut self,
        now: UnixTimeMs,
        consent_id: &ConsentId,
        tx_ref: TxRef,
        audit: AuditEntryInput,
    ) -> Result<ConsentGrant, StorageError> {
        let mut next = self.consent_for_transition(consent_id, ConsentStatus::Revoked)?;
        next.status = ConsentStatus::Revoked;
        next.revoked_at = Some(now);
        next.ledger_tx_ref = Some(tx_ref);
        self.commit_consent(next, audit)
    }

    pub fn attempt_delete_consent(&mut self, _consent_id: &ConsentId) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation { table: "consents" })
    }

    fn consent_for_transition(
        &self,
        consent_id: &ConsentId,
        to: ConsentStatus,
    ) -> Result<ConsentGrant, StorageError> {
        let current = self
            .consents
            .get(consent_id)
            .ok_or_else(|| StorageError::NotFound {
                table: "consents.consent_id",
                key: consent_id.as_str().to_string(),
            })?;
        if !current.status.can_transition_to(to) {
            return Err(StorageError::InvalidTransition {
                table: "consents",
                key: consent_id.as_str().to_string(),
                from: current.status.as_str(),
                to: to.as_str(),
            });
        }
        Ok(current.clone())
    }

    fn commit_consent(
        &mut self,
        next: ConsentGrant,
        audit: AuditEntryInput,
    ) -> Result<ConsentGrant, StorageError> {
        next.validate()?;
        audit.validate()?;
        self.audit.append(audit)?;
        self.persist(RowSnapshot::Consent(next.clone()))?;
        self.consents.insert(next.consent_id.clone(), next.clone());
        Ok(next)
    }

    // ------------------------
    // audit
    // ------------------------

    pub fn audit_trail(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn append_audit_entry(&mut self, input: AuditEntryInput) -> Result<AuditEntry, StorageError> {
        self.audit.append(input)
    }

    pub fn audit_entries(&self) -> &[AuditEntry] {
        self.audit.entries()
    }
}

impl Default for MedStore {
    fn default() -> Self {
        Self::new_in_memory()
    }
}
