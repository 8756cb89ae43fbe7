#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::validate_text;
use crate::ids::UserId;
use crate::ledger::TxRef;
use crate::{ContractViolation, SchemaVersion, UnixTimeMs, Validate};

pub const AUDIT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Position of an entry in the local audit trail. Starts at 1, strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AuditSeq(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Ingest,
    Verify,
    VerifyFailed,
    View,
    ConsentRequest,
    ConsentApprove,
    ConsentReject,
    ConsentRevoke,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Ingest => "ingest",
            AuditAction::Verify => "verify",
            AuditAction::VerifyFailed => "verify_failed",
            AuditAction::View => "view",
            AuditAction::ConsentRequest => "consent_request",
            AuditAction::ConsentApprove => "consent_approve",
            AuditAction::ConsentReject => "consent_reject",
            AuditAction::ConsentRevoke => "consent_revoke",
        }
    }

    /// Actions that are only ever recorded together with a confirmed ledger transaction.
    pub fn requires_ledger_ref(self) -> bool {
        matches!(
            self,
            AuditAction::Ingest
                | AuditAction::View
                | AuditAction::ConsentApprove
                | AuditAction::ConsentRevoke
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntryInput {
    pub schema_version: SchemaVersion,
    pub actor_id: UserId,
    pub action: AuditAction,
    pub subject_id: String,
    pub ledger_tx_ref: Option<TxRef>,
    pub timestamp: UnixTimeMs,
}

impl AuditEntryInput {
    pub fn v1(
        actor_id: UserId,
        action: AuditAction,
        subject_id: impl Into<String>,
        ledger_tx_ref: Option<TxRef>,
        timestamp: UnixTimeMs,
    ) -> Result<Self, ContractViolation> {
        let e = Self {
            schema_version: AUDIT_CONTRACT_VERSION,
            actor_id,
            action,
            subject_id: subject_id.into(),
            ledger_tx_ref,
            timestamp,
        };
        e.validate()?;
        Ok(e)
    }
}

impl Validate for AuditEntryInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != AUDIT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "audit_entry_input.schema_version",
                reason: "must match AUDIT_CONTRACT_VERSION",
            });
        }
        self.actor_id.validate()?;
        validate_text("audit_entry_input.subject_id", &self.subject_id, 128)?;
        if self.timestamp.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "audit_entry_input.timestamp",
                reason: "must be > 0",
            });
        }
        if self.action.requires_ledger_ref() && self.ledger_tx_ref.is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "audit_entry_input.ledger_tx_ref",
                reason: "ledger-touching actions must carry the confirmed tx ref",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub schema_version: SchemaVersion,
    pub seq: AuditSeq,
    pub actor_id: UserId,
    pub action: AuditAction,
    pub subject_id: String,
    pub ledger_tx_ref: Option<TxRef>,
    pub timestamp: UnixTimeMs,
}

impl AuditEntry {
    pub fn from_input_v1(seq: AuditSeq, input: AuditEntryInput) -> Result<Self, ContractViolation> {
        input.validate()?;
        if seq.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "audit_entry.seq",
                reason: "must be > 0",
            });
        }
        Ok(Self {
            schema_version: AUDIT_CONTRACT_VERSION,
            seq,
            actor_id: input.actor_id,
            action: input.action,
            subject_id: input.subject_id,
            ledger_tx_ref: input.ledger_tx_ref,
            timestamp: input.timestamp,
        })
    }
}
