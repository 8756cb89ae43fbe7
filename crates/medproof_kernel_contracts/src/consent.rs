#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::common::validate_text;
use crate::ids::{ConsentId, RecordId, UserId};
use crate::ledger::{LedgerAddress, TokenId, TxRef};
use crate::{ContractViolation, SchemaVersion, UnixTimeMs, Validate};

pub const CONSENT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);
pub const CONSENT_MAX_DURATION_DAYS: u32 = 3_650;
pub const CONSENT_MAX_SCOPE_RECORDS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Revoked,
}

impl ConsentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsentStatus::Pending => "pending",
            ConsentStatus::Approved => "approved",
            ConsentStatus::Rejected => "rejected",
            ConsentStatus::Expired => "expired",
            ConsentStatus::Revoked => "revoked",
        }
    }

    /// Owner-driven transitions. `Expired` is never stored by a transition; it is read lazily.
    pub fn can_transition_to(self, next: ConsentStatus) -> bool {
        matches!(
            (self, next),
            (ConsentStatus::Pending, ConsentStatus::Approved)
                | (ConsentStatus::Pending, ConsentStatus::Rejected)
                | (ConsentStatus::Approved, ConsentStatus::Revoked)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentGrant {
    pub schema_version: SchemaVersion,
    pub consent_id: ConsentId,
    pub owner_id: UserId,
    pub grantee_id: UserId,
    pub grantee_address: LedgerAddress,
    pub purpose: String,
    pub scope: BTreeSet<RecordId>,
    pub status: ConsentStatus,
    pub requested_at: UnixTimeMs,
    pub responded_at: Option<UnixTimeMs>,
    pub revoked_at: Option<UnixTimeMs>,
    pub expires_at: UnixTimeMs,
    pub ledger_token_ref: Option<TokenId>,
    pub ledger_tx_ref: Option<TxRef>,
}

impl ConsentGrant {
    /// A fresh request. `expires_at` is exactly `requested_at + duration_days`.
    #[allow(clippy::too_many_arguments)]
    pub fn v1_pending(
        consent_id: ConsentId,
        owner_id: UserId,
        grantee_id: UserId,
        grantee_address: LedgerAddress,
        purpose: String,
        scope: BTreeSet<RecordId>,
        requested_at: UnixTimeMs,
        duration_days: u32,
    ) -> Result<Self, ContractViolation> {
        if duration_days == 0 || duration_days > CONSENT_MAX_DURATION_DAYS {
            return Err(ContractViolation::InvalidValue {
                field: "consent_grant.duration_days",
                reason: "must be within 1..=CONSENT_MAX_DURATION_DAYS",
            });
        }
        let g = Self {
            schema_version: CONSENT_CONTRACT_VERSION,
            consent_id,
            owner_id,
            grantee_id,
            grantee_address,
            purpose,
            scope,
            status: ConsentStatus::Pending,
            requested_at,
            responded_at: None,
            revoked_at: None,
            expires_at: requested_at.plus_days(duration_days),
            ledger_token_ref: None,
            ledger_tx_ref: None,
        };
        g.validate()?;
        Ok(g)
    }

    /// Stored status with lazy expiry applied: an approved grant past `expires_at` reads as expired.
    pub fn effective_status(&self, now: UnixTimeMs) -> ConsentStatus {
        match self.status {
            ConsentStatus::Approved if now >= self.expires_at => ConsentStatus::Expired,
            other => other,
        }
    }

    pub fn is_active_for(&self, now: UnixTimeMs, grantee_id: &UserId, record_id: &RecordId) -> bool {
        self.effective_status(now) == ConsentStatus::Approved
            && &self.grantee_id == grantee_id
            && self.scope.contains(record_id)
    }
}

impl Validate for ConsentGrant {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != CONSENT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "consent_grant.schema_version",
                reason: "must match CONSENT_CONTRACT_VERSION",
            });
        }
        self.consent_id.validate()?;
        self.owner_id.validate()?;
        self.grantee_id.validate()?;
        if self.owner_id == self.grantee_id {
            return Err(ContractViolation::InvalidValue {
                field: "consent_grant.grantee_id",
                reason: "must differ from owner_id",
            });
        }
        validate_text("consent_grant.purpose", &self.purpose, 256)?;
        if self.scope.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "consent_grant.scope",
                reason: "must name at least one record",
            });
        }
        if self.scope.len() > CONSENT_MAX_SCOPE_RECORDS {
            return Err(ContractViolation::InvalidValue {
                field: "consent_grant.scope",
                reason: "exceeds CONSENT_MAX_SCOPE_RECORDS",
            });
        }
        if self.requested_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "consent_grant.requested_at",
                reason: "must be > 0",
            });
        }
        if self.expires_at <= self.requested_at {
            return Err(ContractViolation::InvalidValue {
                field: "consent_grant.expires_at",
                reason: "must be after requested_at",
            });
        }
        if self.status == ConsentStatus::Approved && self.ledger_token_ref.is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "consent_grant.ledger_token_ref",
                reason: "approved grants must carry a ledger token",
            });
        }
        if self.status != ConsentStatus::Pending && self.responded_at.is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "consent_grant.responded_at",
                reason: "must be set once the owner responded",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(days: u32) -> Result<ConsentGrant, ContractViolation> {
        ConsentGrant::v1_pending(
            ConsentId::new("consent_1").unwrap(),
            UserId::new("patient_1").unwrap(),
            UserId::new("clinic_9").unwrap(),
            LedgerAddress::new(format!("0x{}", "ab".repeat(20))).unwrap(),
            "second opinion".to_string(),
            [RecordId::new("rec_1").unwrap()].into_iter().collect(),
            UnixTimeMs(1_000),
            days,
        )
    }

    #[test]
    fn at_consent_01_expiry_is_exact_days_after_request() {
        let g = pending(30).unwrap();
        assert_eq!(g.expires_at, UnixTimeMs(1_000 + 30 * UnixTimeMs::MS_PER_DAY));
        assert_eq!(g.status, ConsentStatus::Pending);
        assert!(pending(0).is_err());
    }

    #[test]
    fn at_consent_02_approved_reads_as_expired_after_deadline() {
        let mut g = pending(1).unwrap();
        g.status = ConsentStatus::Approved;
        g.ledger_token_ref = Some(TokenId(7));
        g.responded_at = Some(UnixTimeMs(2_000));
        assert!(g.validate().is_ok());
        assert_eq!(g.effective_status(UnixTimeMs(2_000)), ConsentStatus::Approved);
        assert_eq!(g.effective_status(g.expires_at), ConsentStatus::Expired);
    }

    #[test]
    fn at_consent_03_approved_without_token_is_rejected() {
        let mut g = pending(1).unwrap();
        g.status = ConsentStatus::Approved;
        g.responded_at = Some(UnixTimeMs(2_000));
        assert!(g.validate().is_err());
    }

    #[test]
    fn at_consent_04_transition_table() {
        use ConsentStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Approved.can_transition_to(Revoked));
        assert!(!Rejected.can_transition_to(Approved));
        assert!(!Approved.can_transition_to(Rejected));
        assert!(!Pending.can_transition_to(Revoked));
        assert!(!Revoked.can_transition_to(Approved));
    }
}
