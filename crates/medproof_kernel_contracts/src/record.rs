#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::{validate_opt_text, validate_text};
use crate::ids::{RecordId, UserId};
use crate::ledger::{Digest32, TxRef};
use crate::{ContractViolation, SchemaVersion, UnixTimeMs, Validate};

pub const RECORD_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Addresses minted while the content store is unreachable start with this marker.
/// No real backend address may ever carry it.
pub const DEGRADED_ADDRESS_PREFIX: &str = "degraded:";

pub const AES_GCM_IV_LEN: usize = 12;
pub const AES_GCM_TAG_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentAddress(String);

impl ContentAddress {
    pub fn new(raw: impl Into<String>) -> Result<Self, ContractViolation> {
        let out = Self(raw.into());
        out.validate()?;
        Ok(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with(DEGRADED_ADDRESS_PREFIX)
    }
}

impl Validate for ContentAddress {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_text("content_address", &self.0, 256)?;
        if self.0.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(ContractViolation::InvalidValue {
                field: "content_address",
                reason: "must not contain whitespace or '/'",
            });
        }
        Ok(())
    }
}

impl TryFrom<String> for ContentAddress {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContentAddress> for String {
    fn from(value: ContentAddress) -> Self {
        value.0
    }
}

impl std::fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Verified,
    Failed,
}

impl RecordStatus {
    pub fn can_transition_to(self, next: RecordStatus) -> bool {
        matches!(
            (self, next),
            (RecordStatus::Pending, RecordStatus::Verified)
                | (RecordStatus::Pending, RecordStatus::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Verified => "verified",
            RecordStatus::Failed => "failed",
        }
    }
}

/// Caller-supplied description of the artifact. Never sent to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DescriptiveMetadata {
    pub title: Option<String>,
    pub category: Option<String>,
    pub media_type: Option<String>,
}

impl Validate for DescriptiveMetadata {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_opt_text("descriptive_metadata.title", &self.title, 256)?;
        validate_opt_text("descriptive_metadata.category", &self.category, 64)?;
        validate_opt_text("descriptive_metadata.media_type", &self.media_type, 128)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub schema_version: SchemaVersion,
    pub record_id: RecordId,
    pub owner_id: UserId,
    pub content_address: ContentAddress,
    pub integrity_hash: Digest32,
    pub encryption_hash: Digest32,
    pub encryption_iv: [u8; AES_GCM_IV_LEN],
    pub encryption_tag: [u8; AES_GCM_TAG_LEN],
    pub plaintext_len: u64,
    pub descriptive: DescriptiveMetadata,
    pub ledger_tx_ref: TxRef,
    pub status: RecordStatus,
    pub created_at: UnixTimeMs,
}

impl RecordMetadata {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        record_id: RecordId,
        owner_id: UserId,
        content_address: ContentAddress,
        integrity_hash: Digest32,
        encryption_hash: Digest32,
        encryption_iv: [u8; AES_GCM_IV_LEN],
        encryption_tag: [u8; AES_GCM_TAG_LEN],
        plaintext_len: u64,
        descriptive: DescriptiveMetadata,
        ledger_tx_ref: TxRef,
        status: RecordStatus,
        created_at: UnixTimeMs,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: RECORD_CONTRACT_VERSION,
            record_id,
            owner_id,
            content_address,
            integrity_hash,
            encryption_hash,
            encryption_iv,
            encryption_tag,
            plaintext_len,
            descriptive,
            ledger_tx_ref,
            status,
            created_at,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for RecordMetadata {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != RECORD_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "record_metadata.schema_version",
                reason: "must match RECORD_CONTRACT_VERSION",
            });
        }
        self.record_id.validate()?;
        self.owner_id.validate()?;
        self.content_address.validate()?;
        self.descriptive.validate()?;
        if self.integrity_hash == self.encryption_hash {
            return Err(ContractViolation::InvalidValue {
                field: "record_metadata.encryption_hash",
                reason: "must differ from integrity_hash",
            });
        }
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "record_metadata.created_at",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}
