#![forbid(unsafe_code)]

//! Event schema of the ledger contract.
//!
//! `topics[0]` is the SHA-256 of the event signature. Indexed string parameters are carried
//! as the SHA-256 of their UTF-8 bytes, addresses and integers as right-aligned 32-byte words.

use medproof_kernel_contracts::ledger::{Digest32, LedgerAddress, TokenId};
use serde::{Deserialize, Serialize};

use crate::crypto_vault::sha256_digest;
use crate::ledger_client::LedgerError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLog {
    pub topics: Vec<Digest32>,
    pub data: Vec<Digest32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEventKind {
    ArtifactRegistered,
    AccessGranted,
    AccessRevoked,
    ActionLogged,
}

impl LedgerEventKind {
    pub fn signature(self) -> &'static str {
        match self {
            LedgerEventKind::ArtifactRegistered => "ArtifactRegistered(string,string,string,bytes32)",
            LedgerEventKind::AccessGranted => "AccessGranted(string,address,uint256,uint256)",
            LedgerEventKind::AccessRevoked => "AccessRevoked(uint256)",
            LedgerEventKind::ActionLogged => "ActionLogged(string,address,string)",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LedgerEventKind::ArtifactRegistered => "ArtifactRegistered",
            LedgerEventKind::AccessGranted => "AccessGranted",
            LedgerEventKind::AccessRevoked => "AccessRevoked",
            LedgerEventKind::ActionLogged => "ActionLogged",
        }
    }

    pub fn topic(self) -> Digest32 {
        sha256_digest(self.signature().as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRegistered {
    pub record_id_hash: Digest32,
    pub owner_id_hash: Digest32,
    pub content_address_hash: Digest32,
    pub integrity_hash: Digest32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGranted {
    pub owner_id_hash: Digest32,
    pub grantee: LedgerAddress,
    pub token_id: TokenId,
    pub expires_at_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRevoked {
    pub token_id: TokenId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionLogged {
    pub record_id_hash: Digest32,
    pub actor: LedgerAddress,
    pub action_hash: Digest32,
}

pub fn text_hash(text: &str) -> Digest32 {
    sha256_digest(text.as_bytes())
}

pub fn u64_word(value: u64) -> Digest32 {
    let mut out = [0u8; 32];
    out[24..].copy_from_slice(&value.to_be_bytes());
    Digest32(out)
}

pub fn address_word(address: &LedgerAddress) -> Digest32 {
    let mut out = [0u8; 32];
    out[12..].copy_from_slice(&address.to_bytes());
    Digest32(out)
}

pub fn word_to_u64(word: &Digest32) -> Result<u64, LedgerError> {
    if word.0[..24].iter().any(|b| *b != 0) {
        return Err(LedgerError::Decode(
            "uint256 word does not fit in 64 bits".to_string(),
        ));
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&word.0[24..]);
    Ok(u64::from_be_bytes(raw))
}

pub fn word_to_address(word: &Digest32) -> Result<LedgerAddress, LedgerError> {
    if word.0[..12].iter().any(|b| *b != 0) {
        return Err(LedgerError::Decode(
            "address word has non-zero padding".to_string(),
        ));
    }
    let mut raw = [0u8; 20];
    raw.copy_from_slice(&word.0[12..]);
    Ok(LedgerAddress::from_bytes(&raw))
}

pub fn encode_artifact_registered(
    record_id: &str,
    owner_id: &str,
    content_address: &str,
    integrity_hash: Digest32,
) -> EventLog {
    EventLog {
        topics: vec![
            LedgerEventKind::ArtifactRegistered.topic(),
            text_hash(record_id),
            text_hash(owner_id),
        ],
        data: vec![text_hash(content_address), integrity_hash],
    }
}

pub fn encode_access_granted(
    owner_id: &str,
    grantee: &LedgerAddress,
    token_id: TokenId,
    expires_at_seconds: u64,
) -> EventLog {
    EventLog {
        topics: vec![
            LedgerEventKind::AccessGranted.topic(),
            text_hash(owner_id),
            address_word(grantee),
        ],
        data: vec![u64_word(token_id.0), u64_word(expires_at_seconds)],
    }
}

pub fn encode_access_revoked(token_id: TokenId) -> EventLog {
    EventLog {
        topics: vec![LedgerEventKind::AccessRevoked.topic()],
        data: vec![u64_word(token_id.0)],
    }
}

pub fn encode_action_logged(record_id: &str, actor: &LedgerAddress, action: &str) -> EventLog {
    EventLog {
        topics: vec![
            LedgerEventKind::ActionLogged.topic(),
            text_hash(record_id),
            address_word(actor),
        ],
        data: vec![text_hash(action)],
    }
}

/// First log whose topic0 matches `kind`.
pub fn find_event<'a>(
    logs: &'a [EventLog],
    kind: LedgerEventKind,
    tx_ref: &str,
) -> Result<&'a EventLog, LedgerError> {
    let topic = kind.topic();
    logs.iter()
        .find(|log| log.topics.first() == Some(&topic))
        .ok_or_else(|| LedgerError::EventNotFound {
            event: kind.name(),
            tx_ref: tx_ref.to_string(),
        })
}

fn topic_at(log: &EventLog, idx: usize, kind: LedgerEventKind) -> Result<&Digest32, LedgerError> {
    log.topics.get(idx).ok_or_else(|| {
        LedgerError::Decode(format!("{} log is missing topic {idx}", kind.name()))
    })
}

fn word_at(log: &EventLog, idx: usize, kind: LedgerEventKind) -> Result<&Digest32, LedgerError> {
    log.data.get(idx).ok_or_else(|| {
        LedgerError::Decode(format!("{} log is missing data word {idx}", kind.name()))
    })
}

pub fn decode_artifact_registered(
    logs: &[EventLog],
    tx_ref: &str,
) -> Result<ArtifactRegistered, LedgerError> {
    let kind = LedgerEventKind::ArtifactRegistered;
    let log = find_event(logs, kind, tx_ref)?;
    Ok(ArtifactRegistered {
        record_id_hash: *topic_at(log, 1, kind)?,
        owner_id_hash: *topic_at(log, 2, kind)?,
        content_address_hash: *word_at(log, 0, kind)?,
        integrity_hash: *word_at(log, 1, kind)?,
    })
}

pub fn decode_access_granted(logs: &[EventLog], tx_ref: &str) -> Result<AccessGranted, LedgerError> {
    let kind = LedgerEventKind::AccessGranted;
    let log = find_event(logs, kind, tx_ref)?;
    Ok(AccessGranted {
        owner_id_hash: *topic_at(log, 1, kind)?,
        grantee: word_to_address(topic_at(log, 2, kind)?)?,
        token_id: TokenId(word_to_u64(word_at(log, 0, kind)?)?),
        expires_at_seconds: word_to_u64(word_at(log, 1, kind)?)?,
    })
}

pub fn decode_access_revoked(logs: &[EventLog], tx_ref: &str) -> Result<AccessRevoked, LedgerError> {
    let kind = LedgerEventKind::AccessRevoked;
    let log = find_event(logs, kind, tx_ref)?;
    Ok(AccessRevoked {
        token_id: TokenId(word_to_u64(word_at(log, 0, kind)?)?),
    })
}

pub fn decode_action_logged(logs: &[EventLog], tx_ref: &str) -> Result<ActionLogged, LedgerError> {
    let kind = LedgerEventKind::ActionLogged;
    let log = find_event(logs, kind, tx_ref)?;
    Ok(ActionLogged {
        record_id_hash: *topic_at(log, 1, kind)?,
        actor: word_to_address(topic_at(log, 2, kind)?)?,
        action_hash: *word_at(log, 0, kind)?,
    })
}
