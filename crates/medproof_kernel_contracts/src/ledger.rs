#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::{from_hex, to_hex, validate_text};
use crate::ids::{RecordId, UserId};
use crate::record::ContentAddress;
use crate::{ContractViolation, UnixTimeMs, Validate};

/// A 32-byte digest (`bytes32` on the ledger). Serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest32(pub [u8; 32]);

impl Digest32 {
    pub fn from_hex(raw: &str) -> Result<Self, ContractViolation> {
        let bytes = from_hex("digest32", raw)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ContractViolation::InvalidValue {
                field: "digest32",
                reason: "must be exactly 32 bytes",
            })?;
        Ok(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        to_hex(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for Digest32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest32({})", self.to_hex())
    }
}

impl std::fmt::Display for Digest32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for Digest32 {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<Digest32> for String {
    fn from(value: Digest32) -> Self {
        value.to_hex()
    }
}

/// A 20-byte ledger account address, `0x`-prefixed lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LedgerAddress(String);

impl LedgerAddress {
    pub fn new(raw: impl Into<String>) -> Result<Self, ContractViolation> {
        let raw = raw.into();
        let Some(body) = raw.strip_prefix("0x") else {
            return Err(ContractViolation::InvalidValue {
                field: "ledger_address",
                reason: "must start with 0x",
            });
        };
        if body.len() != 40 || !body.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ContractViolation::InvalidValue {
                field: "ledger_address",
                reason: "must be 20 bytes of hex",
            });
        }
        Ok(Self(format!("0x{}", body.to_ascii_lowercase())))
    }

    pub fn from_bytes(bytes: &[u8; 20]) -> Self {
        Self(format!("0x{}", to_hex(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        if let Ok(raw) = from_hex("ledger_address", &self.0) {
            out.copy_from_slice(&raw);
        }
        out
    }
}

impl TryFrom<String> for LedgerAddress {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LedgerAddress> for String {
    fn from(value: LedgerAddress) -> Self {
        value.0
    }
}

impl std::fmt::Display for LedgerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a submitted ledger transaction (its hash as reported by the ledger).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TxRef(String);

impl TxRef {
    pub fn new(raw: impl Into<String>) -> Result<Self, ContractViolation> {
        let raw = raw.into();
        validate_text("tx_ref", &raw, 130)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TxRef {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TxRef> for String {
    fn from(value: TxRef) -> Self {
        value.0
    }
}

impl std::fmt::Display for TxRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Access token minted by `grantAccess`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenId(pub u64);

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The artifact row as the ledger contract reports it from `getArtifact`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnLedgerArtifact {
    pub record_id: RecordId,
    pub owner_id: UserId,
    pub content_address: ContentAddress,
    pub integrity_hash: Digest32,
    pub uploaded_by: LedgerAddress,
    pub timestamp: UnixTimeMs,
}

impl Validate for OnLedgerArtifact {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.record_id.validate()?;
        self.owner_id.validate()?;
        self.content_address.validate()?;
        Ok(())
    }
}
