#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use medproof_kernel_contracts::audit::{AuditAction, AuditEntryInput};
use medproof_kernel_contracts::consent::{ConsentGrant, ConsentStatus};
use medproof_kernel_contracts::ids::{ConsentId, RecordId, UserId};
use medproof_kernel_contracts::ledger::LedgerAddress;
use medproof_kernel_contracts::record::RecordStatus;
use medproof_kernel_contracts::UnixTimeMs;
use tracing::{info, warn};

use crate::{PipelineError, SharedServices};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentRequest {
    pub consent_id: ConsentId,
    pub owner_id: UserId,
    pub grantee_id: UserId,
    pub grantee_address: LedgerAddress,
    pub purpose: String,
    pub scope: BTreeSet<RecordId>,
    pub duration_days: u32,
}

/// Consent lifecycle: request → owner approval (on-ledger grant) or rejection → revocation.
///
/// Expiry is never written; it is derived from `expires_at` when the grant is read.
#[derive(Debug, Clone)]
pub struct ConsentGrantPipeline {
    services: SharedServices,
}

impl ConsentGrantPipeline {
    pub fn new(services: SharedServices) -> Self {
        Self { services }
    }

    pub fn consent(&self, consent_id: &ConsentId) -> Option<ConsentGrant> {
        self.services.store().consent(consent_id).cloned()
    }

    pub fn effective_status(
        &self,
        now: UnixTimeMs,
        consent_id: &ConsentId,
    ) -> Result<ConsentStatus, PipelineError> {
        Ok(self.load(consent_id)?.effective_status(now))
    }

    pub fn request(&self, now: UnixTimeMs, req: ConsentRequest) -> Result<ConsentGrant, PipelineError> {
        let _guard = self.services.locks.lock(format!("consent:{}", req.consent_id));
        {
            let store = self.services.store();
            for record_id in &req.scope {
                let row = store.record(record_id).ok_or_else(|| PipelineError::NotFound {
                    kind: "record",
                    id: record_id.as_str().to_string(),
                })?;
                if row.owner_id != req.owner_id {
                    return Err(PipelineError::NotOwner {
                        subject: record_id.as_str().to_string(),
                        actor_id: req.owner_id.as_str().to_string(),
                    });
                }
                if row.status != RecordStatus::Verified {
                    return Err(PipelineError::RecordNotVerified {
                        record_id: record_id.as_str().to_string(),
                        status: row.status.as_str(),
                    });
                }
            }
        }
        let grant = ConsentGrant::v1_pending(
            req.consent_id.clone(),
            req.owner_id,
            req.grantee_id.clone(),
            req.grantee_address,
            req.purpose,
            req.scope,
            now,
            req.duration_days,
        )?;
        let audit = AuditEntryInput::v1(
            req.grantee_id,
            AuditAction::ConsentRequest,
            req.consent_id.as_str(),
            None,
            now,
        )?;
        self.services
            .store()
            .insert_consent_with_audit(grant.clone(), audit)?;
        info!(consent_id = %grant.consent_id, expires_at = grant.expires_at.0, "consent: requested");
        Ok(grant)
    }

    pub fn approve(
        &self,
        now: UnixTimeMs,
        consent_id: &ConsentId,
        actor_id: &UserId,
    ) -> Result<ConsentGrant, PipelineError> {
        let _guard = self.services.locks.lock(format!("consent:{consent_id}"));
        let grant = self.load_pending_for_owner(consent_id, actor_id)?;
        let remaining_seconds = now
            .seconds_until(grant.expires_at)
            .filter(|s| *s > 0)
            .ok_or_else(|| PipelineError::Expired {
                consent_id: consent_id.as_str().to_string(),
            })?;

        let granted = self.services.ledger.grant_access(
            &grant.owner_id,
            &grant.grantee_address,
            remaining_seconds,
        );
        let granted = match granted {
            Ok(out) => out,
            Err(err) => {
                warn!(%consent_id, error = %err, "consent: ledger grant failed; consent stays pending");
                return Err(err.into());
            }
        };
        let audit = AuditEntryInput::v1(
            actor_id.clone(),
            AuditAction::ConsentApprove,
            consent_id.as_str(),
            Some(granted.tx_ref.clone()),
            now,
        )?;
        let approved = self.services.store().consent_approve_commit(
            now,
            consent_id,
            granted.event.token_id,
            granted.tx_ref.clone(),
            audit,
        )?;
        info!(
            %consent_id,
            token_id = %granted.event.token_id,
            tx_ref = %granted.tx_ref,
            "consent: approved"
        );
        self.services
            .notifier
            .on_consent_resolved(consent_id, &approved.grantee_id, true);
        Ok(approved)
    }

    pub fn reject(
        &self,
        now: UnixTimeMs,
        consent_id: &ConsentId,
        actor_id: &UserId,
    ) -> Result<ConsentGrant, PipelineError> {
        let _guard = self.services.locks.lock(format!("consent:{consent_id}"));
        self.load_pending_for_owner(consent_id, actor_id)?;
        let audit = AuditEntryInput::v1(
            actor_id.clone(),
            AuditAction::ConsentReject,
            consent_id.as_str(),
            None,
            now,
        )?;
        let rejected = self
            .services
            .store()
            .consent_reject_commit(now, consent_id, audit)?;
        info!(%consent_id, "consent: rejected");
        self.services
            .notifier
            .on_consent_resolved(consent_id, &rejected.grantee_id, false);
        Ok(rejected)
    }

    pub fn revoke(
        &self,
        now: UnixTimeMs,
        consent_id: &ConsentId,
        actor_id: &UserId,
    ) -> Result<ConsentGrant, PipelineError> {
        let _guard = self.services.locks.lock(format!("consent:{consent_id}"));
        let grant = self.load(consent_id)?;
        if &grant.owner_id != actor_id {
            return Err(not_owner(consent_id, actor_id));
        }
        let status = grant.effective_status(now);
        let token_id = match (status, grant.ledger_token_ref) {
            (ConsentStatus::Approved, Some(token)) => token,
            _ => {
                return Err(PipelineError::NotRevocable {
                    consent_id: consent_id.as_str().to_string(),
                    status: status.as_str(),
                })
            }
        };

        let revoked_on_ledger = self.services.ledger.revoke_access(token_id)?;
        let audit = AuditEntryInput::v1(
            actor_id.clone(),
            AuditAction::ConsentRevoke,
            consent_id.as_str(),
            Some(revoked_on_ledger.tx_ref.clone()),
            now,
        )?;
        let revoked = self.services.store().consent_revoke_commit(
            now,
            consent_id,
            revoked_on_ledger.tx_ref.clone(),
            audit,
        )?;
        info!(%consent_id, %token_id, tx_ref = %revoked_on_ledger.tx_ref, "consent: revoked");
        Ok(revoked)
    }

    fn load(&self, consent_id: &ConsentId) -> Result<ConsentGrant, PipelineError> {
        self.consent(consent_id).ok_or_else(|| PipelineError::NotFound {
            kind: "consent",
            id: consent_id.as_str().to_string(),
        })
    }

    fn load_pending_for_owner(
        &self,
        consent_id: &ConsentId,
        actor_id: &UserId,
    ) -> Result<ConsentGrant, PipelineError> {
        let grant = self.load(consent_id)?;
        if &grant.owner_id != actor_id {
            return Err(not_owner(consent_id, actor_id));
        }
        if grant.status != ConsentStatus::Pending {
            return Err(PipelineError::AlreadyProcessed {
                consent_id: consent_id.as_str().to_string(),
                status: grant.status.as_str(),
            });
        }
        Ok(grant)
    }
}

fn not_owner(consent_id: &ConsentId, actor_id: &UserId) -> PipelineError {
    PipelineError::NotOwner {
        subject: consent_id.as_str().to_string(),
        actor_id: actor_id.as_str().to_string(),
    }
}
