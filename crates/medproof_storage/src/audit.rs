#![forbid(unsafe_code)]

use std::path::Path;

use medproof_kernel_contracts::audit::{AuditEntry, AuditEntryInput, AuditSeq};
use medproof_kernel_contracts::ids::UserId;
use tracing::{debug, info};

use crate::journal::{line_err, JsonlFile};
use crate::store::StorageError;

/// Append-only audit log.
///
/// Sequence numbers start at 1 and are assigned at append time, so the order of entries is
/// the order in which pipeline steps committed. When a journal is attached every entry is
/// written and flushed as one JSON line before it becomes visible in memory.
#[derive(Debug, Default)]
pub struct AuditTrail {
    entries: Vec<AuditEntry>,
    next_seq: u64,
    journal: Option<JsonlFile>,
}

impl AuditTrail {
    pub fn new_in_memory() -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 1,
            journal: None,
        }
    }

    /// Opens (or creates) a JSONL journal and replays it. Replay fails closed on any gap,
    /// reordering, or unparsable line.
    pub fn open_jsonl(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let (journal, entries) = JsonlFile::open::<AuditEntry>(path.as_ref())?;
        for (idx, entry) in entries.iter().enumerate() {
            let expected = idx as u64 + 1;
            if entry.seq.0 != expected {
                return Err(line_err(
                    journal.path(),
                    idx + 1,
                    format!("expected seq {expected}, found {}", entry.seq.0),
                ));
            }
        }
        let next_seq = entries.len() as u64 + 1;
        info!(path = %journal.path().display(), replayed = entries.len(), "audit journal opened");
        Ok(Self {
            entries,
            next_seq,
            journal: Some(journal),
        })
    }

    pub fn append(&mut self, input: AuditEntryInput) -> Result<AuditEntry, StorageError> {
        let seq = AuditSeq(self.next_seq.max(1));
        let entry = AuditEntry::from_input_v1(seq, input)?;

        if let Some(journal) = self.journal.as_mut() {
            journal.append(&entry)?;
        }

        debug!(
            seq = entry.seq.0,
            action = entry.action.as_str(),
            subject = %entry.subject_id,
            "audit entry appended"
        );
        self.next_seq = seq.0.saturating_add(1);
        self.entries.push(entry.clone());
        Ok(entry)
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries_for_subject(&self, subject_id: &str) -> Vec<&AuditEntry> {
        self.entries
            .iter()
            .filter(|e| e.subject_id == subject_id)
            .collect()
    }

    pub fn entries_by_actor(&self, actor_id: &UserId) -> Vec<&AuditEntry> {
        self.entries
            .iter()
            .filter(|e| &e.actor_id == actor_id)
            .collect()
    }

    pub fn entries_with_ledger_ref(&self) -> Vec<&AuditEntry> {
        self.entries
            .iter()
            .filter(|e| e.ledger_tx_ref.is_some())
            .collect()
    }

    pub fn attempt_overwrite_audit_entry(&mut self, _seq: AuditSeq) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: "audit_entries",
        })
    }

    pub fn attempt_delete_audit_entry(&mut self, _seq: AuditSeq) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: "audit_entries",
        })
    }
}
