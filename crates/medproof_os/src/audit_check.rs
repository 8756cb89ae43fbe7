#![forbid(unsafe_code)]

use medproof_engines::ledger_client::{LedgerClient, LedgerError, TxStatus};
use medproof_kernel_contracts::audit::{AuditEntry, AuditSeq};
use medproof_kernel_contracts::ledger::TxRef;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossCheckIssue {
    /// The ledger has no receipt for the referenced transaction.
    Missing,
    Reverted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossCheckFinding {
    pub seq: AuditSeq,
    pub tx_ref: TxRef,
    pub issue: CrossCheckIssue,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CrossCheckReport {
    pub checked: usize,
    pub confirmed: usize,
    pub findings: Vec<CrossCheckFinding>,
}

impl CrossCheckReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Looks up the receipt of every audit entry that carries a ledger reference.
///
/// Takes a snapshot of entries so callers can release the store before the network reads.
pub fn cross_check(
    entries: &[AuditEntry],
    ledger: &LedgerClient,
) -> Result<CrossCheckReport, LedgerError> {
    let mut report = CrossCheckReport::default();
    for entry in entries {
        let Some(tx_ref) = entry.ledger_tx_ref.as_ref() else {
            continue;
        };
        report.checked += 1;
        let issue = match ledger.receipt(tx_ref)? {
            Some(receipt) if receipt.status == TxStatus::Success => {
                report.confirmed += 1;
                continue;
            }
            Some(_) => CrossCheckIssue::Reverted,
            None => CrossCheckIssue::Missing,
        };
        warn!(seq = entry.seq.0, %tx_ref, ?issue, "audit cross-check finding");
        report.findings.push(CrossCheckFinding {
            seq: entry.seq,
            tx_ref: tx_ref.clone(),
            issue,
        });
    }
    info!(
        checked = report.checked,
        confirmed = report.confirmed,
        findings = report.findings.len(),
        "audit cross-check complete"
    );
    Ok(report)
}
