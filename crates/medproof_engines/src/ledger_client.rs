#![forbid(unsafe_code)]

use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use medproof_kernel_contracts::common::{from_hex, to_hex};
use medproof_kernel_contracts::ids::{RecordId, UserId};
use medproof_kernel_contracts::ledger::{Digest32, LedgerAddress, OnLedgerArtifact, TokenId, TxRef};
use medproof_kernel_contracts::record::ContentAddress;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crypto_vault::sha256_digest;
use crate::ledger_events::{
    decode_access_granted, decode_access_revoked, decode_action_logged,
    decode_artifact_registered, text_hash, AccessGranted, AccessRevoked, ActionLogged,
    ArtifactRegistered, EventLog,
};
use crate::ledger_loopback::LoopbackLedger;
use crate::ledger_rpc::JsonRpcLedgerTransport;
use crate::{env_bounded_u64, env_non_empty};

pub const OPERATOR_KEY_ENV: &str = "MEDPROOF_OPERATOR_KEY_B64";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("transaction {tx_ref} reverted: {reason}")]
    Reverted { tx_ref: TxRef, reason: String },
    #[error("operator account cannot pay for the transaction: {message}")]
    Underfunded { message: String },
    #[error("ledger unreachable: {message}")]
    Unreachable { message: String },
    #[error("expected {event} event not found in receipt of {tx_ref}")]
    EventNotFound { event: &'static str, tx_ref: String },
    #[error("transaction {tx_ref} not confirmed within the maximum wait")]
    ConfirmationTimeout { tx_ref: TxRef },
    #[error("sequence mismatch: ledger expects {expected}, transaction carried {submitted}")]
    SequenceMismatch { expected: u64, submitted: u64 },
    #[error("ledger rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("ledger response could not be decoded: {0}")]
    Decode(String),
}

/// The contract call carried by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "camelCase")]
pub enum LedgerCall {
    #[serde(rename_all = "camelCase")]
    RegisterArtifact {
        record_id: RecordId,
        owner_id: UserId,
        content_address: ContentAddress,
        integrity_hash: Digest32,
    },
    #[serde(rename_all = "camelCase")]
    GrantAccess {
        owner_id: UserId,
        grantee_address: LedgerAddress,
        duration_seconds: u64,
    },
    #[serde(rename_all = "camelCase")]
    RevokeAccess { token_id: TokenId },
    #[serde(rename_all = "camelCase")]
    LogAction {
        record_id: RecordId,
        actor_address: LedgerAddress,
        action: String,
    },
}

impl LedgerCall {
    pub fn method_name(&self) -> &'static str {
        match self {
            LedgerCall::RegisterArtifact { .. } => "registerArtifact",
            LedgerCall::GrantAccess { .. } => "grantAccess",
            LedgerCall::RevokeAccess { .. } => "revokeAccess",
            LedgerCall::LogAction { .. } => "logAction",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    pub from: LedgerAddress,
    pub sequence: u64,
    pub call: LedgerCall,
}

impl UnsignedTransaction {
    /// Bytes covered by the signature: compact JSON in declaration order.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, LedgerError> {
        serde_json::to_vec(self).map_err(|e| LedgerError::Decode(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransaction {
    pub tx: UnsignedTransaction,
    pub public_key: String,
    pub signature: String,
}

impl SignedTransaction {
    /// Transaction hash: SHA-256 over the canonical bytes followed by the signature.
    pub fn tx_hash(&self) -> Result<TxRef, LedgerError> {
        let mut preimage = self.tx.canonical_bytes()?;
        preimage.extend_from_slice(self.signature.as_bytes());
        TxRef::new(format!("0x{}", sha256_digest(&preimage).to_hex()))
            .map_err(|e| LedgerError::Decode(e.to_string()))
    }

    /// Checks the signature and that `from` is the address of the signing key.
    pub fn verify(&self) -> Result<(), LedgerError> {
        let pk_raw = from_hex("public_key", &self.public_key)
            .map_err(|e| LedgerError::Decode(e.to_string()))?;
        let pk_arr: [u8; 32] = pk_raw
            .try_into()
            .map_err(|_| LedgerError::Decode("public key must be 32 bytes".to_string()))?;
        let verifying_key = VerifyingKey::from_bytes(&pk_arr)
            .map_err(|_| LedgerError::Decode("public key is not a valid ed25519 point".to_string()))?;
        if operator_address(&verifying_key) != self.tx.from {
            return Err(LedgerError::Rpc {
                code: -32003,
                message: "sender does not match signing key".to_string(),
            });
        }
        let sig_raw = from_hex("signature", &self.signature)
            .map_err(|e| LedgerError::Decode(e.to_string()))?;
        let sig_arr: [u8; 64] = sig_raw
            .try_into()
            .map_err(|_| LedgerError::Decode("signature must be 64 bytes".to_string()))?;
        verifying_key
            .verify(&self.tx.canonical_bytes()?, &Signature::from_bytes(&sig_arr))
            .map_err(|_| LedgerError::Rpc {
                code: -32003,
                message: "invalid transaction signature".to_string(),
            })
    }
}

/// Address of an ed25519 key: `0x` + the last 20 bytes of SHA-256(public key).
pub fn operator_address(key: &VerifyingKey) -> LedgerAddress {
    let digest = sha256_digest(key.as_bytes());
    let mut raw = [0u8; 20];
    raw.copy_from_slice(&digest.0[12..]);
    LedgerAddress::from_bytes(&raw)
}

/// The single service account that signs every write.
pub struct OperatorSigner {
    key: SigningKey,
    address: LedgerAddress,
}

impl std::fmt::Debug for OperatorSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl OperatorSigner {
    pub fn from_secret(secret: &[u8; 32]) -> Self {
        let key = SigningKey::from_bytes(secret);
        let address = operator_address(&key.verifying_key());
        Self { key, address }
    }

    pub fn from_secret_b64(encoded: &str) -> Result<Self, LedgerError> {
        let raw = BASE64
            .decode(encoded.trim().as_bytes())
            .map_err(|_| LedgerError::Decode("operator key is not valid base64".to_string()))?;
        let secret: [u8; 32] = raw
            .try_into()
            .map_err(|_| LedgerError::Decode("operator key must decode to 32 bytes".to_string()))?;
        Ok(Self::from_secret(&secret))
    }

    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self::from_secret(&secret)
    }

    pub fn address(&self) -> &LedgerAddress {
        &self.address
    }

    pub fn public_key_hex(&self) -> String {
        to_hex(self.key.verifying_key().as_bytes())
    }

    pub fn sign(&self, tx: UnsignedTransaction) -> Result<SignedTransaction, LedgerError> {
        let signature = self.key.sign(&tx.canonical_bytes()?);
        Ok(SignedTransaction {
            tx,
            public_key: self.public_key_hex(),
            signature: to_hex(&signature.to_bytes()),
        })
    }
}

pub fn generate_operator_key_b64() -> String {
    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    BASE64.encode(secret)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Success,
    Reverted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub tx_ref: TxRef,
    pub status: TxStatus,
    pub block: u64,
    #[serde(default)]
    pub revert_reason: Option<String>,
    #[serde(default)]
    pub logs: Vec<EventLog>,
}

/// The wire seam to a ledger node. Implementations must be safe to share between threads.
pub trait LedgerTransport: Send + Sync + std::fmt::Debug {
    fn account_sequence(&self, address: &LedgerAddress) -> Result<u64, LedgerError>;
    fn submit(&self, tx: &SignedTransaction) -> Result<TxRef, LedgerError>;
    /// `Ok(None)` while the transaction is not yet confirmed.
    fn receipt(&self, tx_ref: &TxRef) -> Result<Option<TxReceipt>, LedgerError>;
    fn check_access(&self, requester: &LedgerAddress, owner_id: &UserId) -> Result<bool, LedgerError>;
    fn get_artifact(&self, record_id: &RecordId) -> Result<Option<OnLedgerArtifact>, LedgerError>;
    fn transport_name(&self) -> &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome<E> {
    pub tx_ref: TxRef,
    pub receipt: TxReceipt,
    pub event: E,
}

#[derive(Clone, PartialEq, Eq)]
pub struct LedgerClientConfig {
    pub rpc_url: Option<String>,
    pub request_timeout_ms: u64,
    pub confirm_max_wait_ms: u64,
    pub poll_interval_ms: u64,
    pub operator_key_b64: Option<String>,
}

impl std::fmt::Debug for LedgerClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerClientConfig")
            .field("rpc_url", &self.rpc_url)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("confirm_max_wait_ms", &self.confirm_max_wait_ms)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field(
                "operator_key_b64",
                &self.operator_key_b64.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl Default for LedgerClientConfig {
    fn default() -> Self {
        Self {
            rpc_url: None,
            request_timeout_ms: 10_000,
            confirm_max_wait_ms: 60_000,
            poll_interval_ms: 500,
            operator_key_b64: None,
        }
    }
}

impl LedgerClientConfig {
    pub fn from_env() -> Self {
        Self {
            rpc_url: env_non_empty("MEDPROOF_LEDGER_RPC_URL"),
            request_timeout_ms: env_bounded_u64("MEDPROOF_LEDGER_TIMEOUT_MS", 100..=120_000, 10_000),
            confirm_max_wait_ms: env_bounded_u64(
                "MEDPROOF_LEDGER_CONFIRM_MAX_WAIT_MS",
                0..=600_000,
                60_000,
            ),
            poll_interval_ms: env_bounded_u64("MEDPROOF_LEDGER_POLL_INTERVAL_MS", 1..=30_000, 500),
            operator_key_b64: env_non_empty(OPERATOR_KEY_ENV),
        }
    }
}

/// Submits signed writes and waits for their confirmation.
///
/// All writes share one operator account. The next sequence number lives behind a mutex
/// that is held from signing until the ledger accepts or rejects the submission, so two
/// writes can never carry the same number. The counter only advances on acceptance; a
/// `SequenceMismatch` rejection reseeds it from the ledger and is returned to the caller.
#[derive(Debug)]
pub struct LedgerClient {
    transport: Box<dyn LedgerTransport>,
    signer: OperatorSigner,
    next_sequence: Mutex<Option<u64>>,
    confirm_max_wait: Duration,
    poll_interval: Duration,
}

impl LedgerClient {
    pub fn new(
        transport: Box<dyn LedgerTransport>,
        signer: OperatorSigner,
        confirm_max_wait: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            transport,
            signer,
            next_sequence: Mutex::new(None),
            confirm_max_wait,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// JSON-RPC transport when a URL is configured, otherwise an in-process loopback ledger.
    pub fn from_config(config: &LedgerClientConfig) -> Result<Self, LedgerError> {
        let signer = match config.operator_key_b64.as_deref() {
            Some(encoded) => OperatorSigner::from_secret_b64(encoded)?,
            None => {
                warn!("{OPERATOR_KEY_ENV} unset; signing with an ephemeral operator key");
                OperatorSigner::generate()
            }
        };
        let transport: Box<dyn LedgerTransport> = match config.rpc_url.as_deref() {
            Some(url) => Box::new(JsonRpcLedgerTransport::new(
                url,
                Duration::from_millis(config.request_timeout_ms),
            )),
            None => {
                warn!("MEDPROOF_LEDGER_RPC_URL unset; using the in-process loopback ledger");
                Box::new(LoopbackLedger::new())
            }
        };
        info!(
            transport = transport.transport_name(),
            operator = %signer.address(),
            "ledger client configured"
        );
        Ok(Self::new(
            transport,
            signer,
            Duration::from_millis(config.confirm_max_wait_ms),
            Duration::from_millis(config.poll_interval_ms),
        ))
    }

    pub fn operator_address(&self) -> &LedgerAddress {
        self.signer.address()
    }

    pub fn register_artifact(
        &self,
        record_id: &RecordId,
        owner_id: &UserId,
        content_address: &ContentAddress,
        integrity_hash: Digest32,
    ) -> Result<WriteOutcome<ArtifactRegistered>, LedgerError> {
        let (tx_ref, receipt) = self.write(LedgerCall::RegisterArtifact {
            record_id: record_id.clone(),
            owner_id: owner_id.clone(),
            content_address: content_address.clone(),
            integrity_hash,
        })?;
        let event = decode_artifact_registered(&receipt.logs, tx_ref.as_str())?;
        if event.record_id_hash != text_hash(record_id.as_str()) {
            return Err(LedgerError::EventNotFound {
                event: "ArtifactRegistered",
                tx_ref: tx_ref.as_str().to_string(),
            });
        }
        Ok(WriteOutcome {
            tx_ref,
            receipt,
            event,
        })
    }

    pub fn grant_access(
        &self,
        owner_id: &UserId,
        grantee_address: &LedgerAddress,
        duration_seconds: u64,
    ) -> Result<WriteOutcome<AccessGranted>, LedgerError> {
        let (tx_ref, receipt) = self.write(LedgerCall::GrantAccess {
            owner_id: owner_id.clone(),
            grantee_address: grantee_address.clone(),
            duration_seconds,
        })?;
        let event = decode_access_granted(&receipt.logs, tx_ref.as_str())?;
        if event.grantee != *grantee_address || event.owner_id_hash != text_hash(owner_id.as_str()) {
            return Err(LedgerError::EventNotFound {
                event: "AccessGranted",
                tx_ref: tx_ref.as_str().to_string(),
            });
        }
        Ok(WriteOutcome {
            tx_ref,
            receipt,
            event,
        })
    }

    pub fn revoke_access(&self, token_id: TokenId) -> Result<WriteOutcome<AccessRevoked>, LedgerError> {
        let (tx_ref, receipt) = self.write(LedgerCall::RevokeAccess { token_id })?;
        let event = decode_access_revoked(&receipt.logs, tx_ref.as_str())?;
        Ok(WriteOutcome {
            tx_ref,
            receipt,
            event,
        })
    }

    pub fn log_action(
        &self,
        record_id: &RecordId,
        actor_address: &LedgerAddress,
        action: &str,
    ) -> Result<WriteOutcome<ActionLogged>, LedgerError> {
        let (tx_ref, receipt) = self.write(LedgerCall::LogAction {
            record_id: record_id.clone(),
            actor_address: actor_address.clone(),
            action: action.to_string(),
        })?;
        let event = decode_action_logged(&receipt.logs, tx_ref.as_str())?;
        Ok(WriteOutcome {
            tx_ref,
            receipt,
            event,
        })
    }

    pub fn check_access(&self, requester: &LedgerAddress, owner_id: &UserId) -> Result<bool, LedgerError> {
        self.transport.check_access(requester, owner_id)
    }

    pub fn get_artifact(&self, record_id: &RecordId) -> Result<Option<OnLedgerArtifact>, LedgerError> {
        self.transport.get_artifact(record_id)
    }

    pub fn receipt(&self, tx_ref: &TxRef) -> Result<Option<TxReceipt>, LedgerError> {
        self.transport.receipt(tx_ref)
    }

    fn write(&self, call: LedgerCall) -> Result<(TxRef, TxReceipt), LedgerError> {
        let method = call.method_name();
        let tx_ref = self.sign_and_submit(call)?;
        info!(method, %tx_ref, "ledger transaction submitted");
        let receipt = self.await_receipt(&tx_ref)?;
        info!(method, %tx_ref, block = receipt.block, "ledger transaction confirmed");
        Ok((tx_ref, receipt))
    }

    fn sign_and_submit(&self, call: LedgerCall) -> Result<TxRef, LedgerError> {
        let mut next = self.next_sequence.lock().map_err(|_| LedgerError::Unreachable {
            message: "sequence counter lock poisoned".to_string(),
        })?;
        let sequence = match *next {
            Some(seq) => seq,
            None => self.transport.account_sequence(self.signer.address())?,
        };
        let signed = self.signer.sign(UnsignedTransaction {
            from: self.signer.address().clone(),
            sequence,
            call,
        })?;
        match self.transport.submit(&signed) {
            Ok(tx_ref) => {
                *next = Some(sequence.saturating_add(1));
                Ok(tx_ref)
            }
            Err(err @ LedgerError::SequenceMismatch { .. }) => {
                *next = self.transport.account_sequence(self.signer.address()).ok();
                warn!(error = %err, resynced = ?*next, "ledger sequence resynced");
                Err(err)
            }
            Err(err @ LedgerError::Unreachable { .. }) => {
                // Acceptance is unknown; reseed before the next write.
                *next = None;
                Err(err)
            }
            Err(err) => {
                *next = Some(sequence);
                Err(err)
            }
        }
    }

    fn await_receipt(&self, tx_ref: &TxRef) -> Result<TxReceipt, LedgerError> {
        let deadline = Instant::now() + self.confirm_max_wait;
        loop {
            match self.transport.receipt(tx_ref) {
                Ok(Some(receipt)) => {
                    if receipt.status == TxStatus::Reverted {
                        return Err(LedgerError::Reverted {
                            tx_ref: tx_ref.clone(),
                            reason: receipt
                                .revert_reason
                                .unwrap_or_else(|| "unspecified".to_string()),
                        });
                    }
                    return Ok(receipt);
                }
                Ok(None) => {}
                Err(LedgerError::Unreachable { message }) => {
                    debug!(%tx_ref, %message, "receipt poll failed; retrying");
                }
                Err(err) => return Err(err),
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(%tx_ref, "ledger confirmation wait exhausted");
                return Err(LedgerError::ConfirmationTimeout {
                    tx_ref: tx_ref.clone(),
                });
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }
}
