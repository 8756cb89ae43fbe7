#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use medproof_kernel_contracts::ids::{RecordId, UserId};
use medproof_kernel_contracts::ledger::{LedgerAddress, OnLedgerArtifact, TokenId, TxRef};
use medproof_kernel_contracts::UnixTimeMs;
use tracing::debug;

use crate::ledger_client::{
    LedgerCall, LedgerError, LedgerTransport, SignedTransaction, TxReceipt, TxStatus,
};
use crate::ledger_events::{
    encode_access_granted, encode_access_revoked, encode_action_logged,
    encode_artifact_registered, EventLog,
};

/// In-process emulation of the ledger contract.
///
/// Checks signatures and account sequence numbers the way a node would, applies the call,
/// and stores a receipt with the contract's events. Clones share state. Fault switches let
/// tests reproduce unreachable nodes, unconfirmed transactions and malformed receipts.
#[derive(Debug, Clone, Default)]
pub struct LoopbackLedger {
    inner: Arc<Mutex<LoopbackState>>,
}

#[derive(Debug, Default)]
struct LoopbackState {
    sequences: BTreeMap<LedgerAddress, u64>,
    receipts: BTreeMap<TxRef, TxReceipt>,
    artifacts: BTreeMap<RecordId, OnLedgerArtifact>,
    grants: BTreeMap<TokenId, Grant>,
    submitted: Vec<SignedTransaction>,
    next_token: u64,
    block: u64,
    clock_override: Option<UnixTimeMs>,
    faults: Faults,
}

#[derive(Debug, Clone)]
struct Grant {
    owner_id: UserId,
    grantee: LedgerAddress,
    expires_at_seconds: u64,
    revoked: bool,
}

#[derive(Debug, Default)]
struct Faults {
    fail_next_submit: Option<LedgerError>,
    revert_next: Option<String>,
    withhold_receipts: bool,
    omit_events: bool,
    unreachable: bool,
    replacement_event: Option<EventLog>,
}

impl LoopbackLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, LoopbackState>, LedgerError> {
        self.inner.lock().map_err(|_| LedgerError::Unreachable {
            message: "loopback ledger lock poisoned".to_string(),
        })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut LoopbackState) -> R) -> Option<R> {
        self.inner.lock().ok().map(|mut s| f(&mut s))
    }

    /// The next `submit` fails with `err` without touching ledger state.
    pub fn fail_next_submit(&self, err: LedgerError) {
        self.with_state(|s| s.faults.fail_next_submit = Some(err));
    }

    /// The next accepted transaction is mined with a reverted status.
    pub fn revert_next(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.with_state(|s| s.faults.revert_next = Some(reason));
    }

    /// Transactions are still applied, but `receipt` reports them as unconfirmed.
    pub fn withhold_receipts(&self, on: bool) {
        self.with_state(|s| s.faults.withhold_receipts = on);
    }

    pub fn omit_events(&self, on: bool) {
        self.with_state(|s| s.faults.omit_events = on);
    }

    /// The next successful transaction is applied, but its receipt carries `log` instead of
    /// the event the contract emitted.
    pub fn replace_next_event(&self, log: EventLog) {
        self.with_state(|s| s.faults.replacement_event = Some(log));
    }

    /// Every call fails with `Unreachable` while set.
    pub fn set_unreachable(&self, on: bool) {
        self.with_state(|s| s.faults.unreachable = on);
    }

    pub fn set_clock(&self, now: UnixTimeMs) {
        self.with_state(|s| s.clock_override = Some(now));
    }

    pub fn submitted(&self) -> Vec<SignedTransaction> {
        self.with_state(|s| s.submitted.clone()).unwrap_or_default()
    }

    pub fn artifact_count(&self) -> usize {
        self.with_state(|s| s.artifacts.len()).unwrap_or(0)
    }

    pub fn is_token_revoked(&self, token_id: TokenId) -> Option<bool> {
        self.with_state(|s| s.grants.get(&token_id).map(|g| g.revoked))
            .flatten()
    }
}

impl LoopbackState {
    fn now_seconds(&self) -> u64 {
        match self.clock_override {
            Some(now) => now.as_seconds(),
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    fn ensure_reachable(&self) -> Result<(), LedgerError> {
        if self.faults.unreachable {
            return Err(LedgerError::Unreachable {
                message: "loopback ledger set unreachable".to_string(),
            });
        }
        Ok(())
    }

    /// Applies the call and returns the emitted log, or the revert reason.
    fn execute(&mut self, tx: &SignedTransaction) -> Result<EventLog, String> {
        let now_seconds = self.now_seconds();
        match &tx.tx.call {
            LedgerCall::RegisterArtifact {
                record_id,
                owner_id,
                content_address,
                integrity_hash,
            } => {
                if self.artifacts.contains_key(record_id) {
                    return Err("artifact already registered".to_string());
                }
                self.artifacts.insert(
                    record_id.clone(),
                    OnLedgerArtifact {
                        record_id: record_id.clone(),
                        owner_id: owner_id.clone(),
                        content_address: content_address.clone(),
                        integrity_hash: *integrity_hash,
                        uploaded_by: tx.tx.from.clone(),
                        timestamp: UnixTimeMs(now_seconds.saturating_mul(UnixTimeMs::MS_PER_SECOND)),
                    },
                );
                Ok(encode_artifact_registered(
                    record_id.as_str(),
                    owner_id.as_str(),
                    content_address.as_str(),
                    *integrity_hash,
                ))
            }
            LedgerCall::GrantAccess {
                owner_id,
                grantee_address,
                duration_seconds,
            } => {
                if *duration_seconds == 0 {
                    return Err("duration must be positive".to_string());
                }
                self.next_token += 1;
                let token_id = TokenId(self.next_token);
                let expires_at_seconds = now_seconds.saturating_add(*duration_seconds);
                self.grants.insert(
                    token_id,
                    Grant {
                        owner_id: owner_id.clone(),
                        grantee: grantee_address.clone(),
                        expires_at_seconds,
                        revoked: false,
                    },
                );
                Ok(encode_access_granted(
                    owner_id.as_str(),
                    grantee_address,
                    token_id,
                    expires_at_seconds,
                ))
            }
            LedgerCall::RevokeAccess { token_id } => match self.grants.get_mut(token_id) {
                None => Err(format!("unknown token {token_id}")),
                Some(grant) if grant.revoked => Err(format!("token {token_id} already revoked")),
                Some(grant) => {
                    grant.revoked = true;
                    Ok(encode_access_revoked(*token_id))
                }
            },
            LedgerCall::LogAction {
                record_id,
                actor_address,
                action,
            } => Ok(encode_action_logged(record_id.as_str(), actor_address, action)),
        }
    }
}

impl LedgerTransport for LoopbackLedger {
    fn account_sequence(&self, address: &LedgerAddress) -> Result<u64, LedgerError> {
        let state = self.state()?;
        state.ensure_reachable()?;
        Ok(state.sequences.get(address).copied().unwrap_or(0))
    }

    fn submit(&self, tx: &SignedTransaction) -> Result<TxRef, LedgerError> {
        let mut state = self.state()?;
        state.ensure_reachable()?;
        if let Some(err) = state.faults.fail_next_submit.take() {
            return Err(err);
        }
        tx.verify()?;
        let expected = state.sequences.get(&tx.tx.from).copied().unwrap_or(0);
        if tx.tx.sequence != expected {
            return Err(LedgerError::SequenceMismatch {
                expected,
                submitted: tx.tx.sequence,
            });
        }
        let tx_ref = tx.tx_hash()?;

        state.sequences.insert(tx.tx.from.clone(), expected + 1);
        state.block += 1;
        let block = state.block;
        let forced_revert = state.faults.revert_next.take();
        let outcome = match forced_revert {
            Some(reason) => Err(reason),
            None => state
                .execute(tx)
                .map(|log| state.faults.replacement_event.take().unwrap_or(log)),
        };
        let receipt = match outcome {
            Ok(log) => TxReceipt {
                tx_ref: tx_ref.clone(),
                status: TxStatus::Success,
                block,
                revert_reason: None,
                logs: if state.faults.omit_events {
                    Vec::new()
                } else {
                    vec![log]
                },
            },
            Err(reason) => TxReceipt {
                tx_ref: tx_ref.clone(),
                status: TxStatus::Reverted,
                block,
                revert_reason: Some(reason),
                logs: Vec::new(),
            },
        };
        debug!(
            method = tx.tx.call.method_name(),
            sequence = tx.tx.sequence,
            status = ?receipt.status,
            "loopback ledger mined transaction"
        );
        state.receipts.insert(tx_ref.clone(), receipt);
        state.submitted.push(tx.clone());
        Ok(tx_ref)
    }

    fn receipt(&self, tx_ref: &TxRef) -> Result<Option<TxReceipt>, LedgerError> {
        let state = self.state()?;
        state.ensure_reachable()?;
        if state.faults.withhold_receipts {
            return Ok(None);
        }
        Ok(state.receipts.get(tx_ref).cloned())
    }

    fn check_access(&self, requester: &LedgerAddress, owner_id: &UserId) -> Result<bool, LedgerError> {
        let state = self.state()?;
        state.ensure_reachable()?;
        let now_seconds = state.now_seconds();
        Ok(state.grants.values().any(|g| {
            !g.revoked
                && &g.owner_id == owner_id
                && &g.grantee == requester
                && g.expires_at_seconds > now_seconds
        }))
    }

    fn get_artifact(&self, record_id: &RecordId) -> Result<Option<OnLedgerArtifact>, LedgerError> {
        let state = self.state()?;
        state.ensure_reachable()?;
        Ok(state.artifacts.get(record_id).cloned())
    }

    fn transport_name(&self) -> &'static str {
        "loopback"
    }
}
