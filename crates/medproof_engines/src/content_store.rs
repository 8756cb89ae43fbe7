#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use medproof_kernel_contracts::record::{ContentAddress, DEGRADED_ADDRESS_PREFIX};
use medproof_kernel_contracts::ContractViolation;
use serde::Deserialize;
use tracing::{info, warn};

use crate::crypto_vault::sha256_digest;
use crate::{env_bounded_u64, env_flag, env_non_empty};

pub const MEMORY_ADDRESS_PREFIX: &str = "cas1-";
pub const MAX_BLOB_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("no blob at address {address}")]
    NotFound { address: String },
    #[error("content store unavailable: {message}")]
    Unavailable { message: String },
    #[error("content store rejected the request: {message}")]
    Rejected { message: String },
    #[error(transparent)]
    InvalidAddress(#[from] ContractViolation),
}

/// A content-addressed blob backend. Implementations must never hand out an address that
/// starts with [`DEGRADED_ADDRESS_PREFIX`].
pub trait BlobBackend: Send + Sync + std::fmt::Debug {
    fn put(&self, bytes: &[u8], name_hint: &str) -> Result<ContentAddress, StoreError>;
    fn get(&self, address: &ContentAddress) -> Result<Vec<u8>, StoreError>;
    fn backend_name(&self) -> &'static str;
}

impl<B: BlobBackend + ?Sized> BlobBackend for std::sync::Arc<B> {
    fn put(&self, bytes: &[u8], name_hint: &str) -> Result<ContentAddress, StoreError> {
        (**self).put(bytes, name_hint)
    }

    fn get(&self, address: &ContentAddress) -> Result<Vec<u8>, StoreError> {
        (**self).get(address)
    }

    fn backend_name(&self) -> &'static str {
        (**self).backend_name()
    }
}

/// Result of a `put`: either durable, or a placeholder minted while the backend was down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageResult {
    Real { address: ContentAddress },
    Degraded { placeholder_address: ContentAddress },
}

impl StorageResult {
    pub fn address(&self) -> &ContentAddress {
        match self {
            StorageResult::Real { address } => address,
            StorageResult::Degraded {
                placeholder_address,
            } => placeholder_address,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, StorageResult::Degraded { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchedBlob {
    Stored(Vec<u8>),
    /// The address was minted in degraded mode; there are no bytes behind it.
    Placeholder { address: ContentAddress },
}

pub fn is_placeholder_address(address: &ContentAddress) -> bool {
    address.is_placeholder()
}

#[derive(Clone, PartialEq, Eq)]
pub struct ContentStoreConfig {
    pub endpoint: Option<String>,
    pub bearer_token: Option<String>,
    pub connect_timeout_ms: u64,
    /// Overall deadline for one gateway call, covering connect, upload and response body.
    pub request_timeout_ms: u64,
    pub degraded_mode: bool,
}

impl std::fmt::Debug for ContentStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStoreConfig")
            .field("endpoint", &self.endpoint)
            .field(
                "bearer_token",
                &self.bearer_token.as_ref().map(|_| "<redacted>"),
            )
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("degraded_mode", &self.degraded_mode)
            .finish()
    }
}

impl Default for ContentStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            bearer_token: None,
            connect_timeout_ms: 3_000,
            request_timeout_ms: 15_000,
            degraded_mode: false,
        }
    }
}

impl ContentStoreConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: env_non_empty("MEDPROOF_CAS_ENDPOINT"),
            bearer_token: env_non_empty("MEDPROOF_CAS_BEARER"),
            connect_timeout_ms: env_bounded_u64("MEDPROOF_CAS_CONNECT_TIMEOUT_MS", 100..=60_000, 3_000),
            request_timeout_ms: env_bounded_u64("MEDPROOF_CAS_TIMEOUT_MS", 100..=300_000, 15_000),
            degraded_mode: env_flag("MEDPROOF_CAS_DEGRADED_MODE").unwrap_or(false),
        }
    }
}

#[derive(Debug)]
pub struct ContentStore {
    backend: Box<dyn BlobBackend>,
    degraded_mode: bool,
}

impl ContentStore {
    pub fn new(backend: Box<dyn BlobBackend>, degraded_mode: bool) -> Self {
        Self {
            backend,
            degraded_mode,
        }
    }

    /// HTTP gateway when an endpoint is configured, otherwise an in-process store.
    pub fn from_config(config: &ContentStoreConfig) -> Self {
        let backend: Box<dyn BlobBackend> = match &config.endpoint {
            Some(_) => Box::new(HttpBlobBackend::new(config.clone())),
            None => {
                warn!("MEDPROOF_CAS_ENDPOINT unset; blobs are kept in process memory only");
                Box::new(MemoryBlobBackend::default())
            }
        };
        info!(
            backend = backend.backend_name(),
            degraded_mode = config.degraded_mode,
            "content store configured"
        );
        Self::new(backend, config.degraded_mode)
    }

    pub fn degraded_mode_enabled(&self) -> bool {
        self.degraded_mode
    }

    pub fn put(&self, bytes: &[u8], name_hint: &str) -> Result<StorageResult, StoreError> {
        match self.backend.put(bytes, name_hint) {
            Ok(address) => {
                if address.is_placeholder() {
                    return Err(StoreError::Rejected {
                        message: format!(
                            "backend returned an address with the reserved prefix: {address}"
                        ),
                    });
                }
                Ok(StorageResult::Real { address })
            }
            Err(StoreError::Unavailable { message }) if self.degraded_mode => {
                let placeholder_address = ContentAddress::new(format!(
                    "{DEGRADED_ADDRESS_PREFIX}{}",
                    sha256_digest(bytes).to_hex()
                ))?;
                warn!(
                    backend = self.backend.backend_name(),
                    %placeholder_address,
                    reason = %message,
                    "content store unavailable; returning NON-DURABLE placeholder address"
                );
                Ok(StorageResult::Degraded {
                    placeholder_address,
                })
            }
            Err(err) => Err(err),
        }
    }

    pub fn get(&self, address: &ContentAddress) -> Result<FetchedBlob, StoreError> {
        if address.is_placeholder() {
            return Ok(FetchedBlob::Placeholder {
                address: address.clone(),
            });
        }
        self.backend.get(address).map(FetchedBlob::Stored)
    }
}

/// In-process backend; addresses are `cas1-<sha256 hex>`.
#[derive(Debug, Default)]
pub struct MemoryBlobBackend {
    blobs: Mutex<BTreeMap<ContentAddress, Vec<u8>>>,
    offline: AtomicBool,
}

impl MemoryBlobBackend {
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn contains(&self, address: &ContentAddress) -> bool {
        self.blobs
            .lock()
            .map(|blobs| blobs.contains_key(address))
            .unwrap_or(false)
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().map(|blobs| blobs.len()).unwrap_or(0)
    }

    /// Replace the bytes behind an address, simulating at-rest corruption.
    pub fn overwrite_for_tests(&self, address: &ContentAddress, bytes: Vec<u8>) {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert(address.clone(), bytes);
        }
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                message: "memory backend offline".to_string(),
            });
        }
        Ok(())
    }
}

impl BlobBackend for MemoryBlobBackend {
    fn put(&self, bytes: &[u8], _name_hint: &str) -> Result<ContentAddress, StoreError> {
        self.ensure_online()?;
        let address = ContentAddress::new(format!(
            "{MEMORY_ADDRESS_PREFIX}{}",
            sha256_digest(bytes).to_hex()
        ))?;
        let mut blobs = self.blobs.lock().map_err(|_| StoreError::Unavailable {
            message: "memory backend lock poisoned".to_string(),
        })?;
        blobs.entry(address.clone()).or_insert_with(|| bytes.to_vec());
        Ok(address)
    }

    fn get(&self, address: &ContentAddress) -> Result<Vec<u8>, StoreError> {
        self.ensure_online()?;
        let blobs = self.blobs.lock().map_err(|_| StoreError::Unavailable {
            message: "memory backend lock poisoned".to_string(),
        })?;
        blobs.get(address).cloned().ok_or_else(|| StoreError::NotFound {
            address: address.as_str().to_string(),
        })
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Content-addressed HTTP gateway:
/// `POST {endpoint}/v1/blobs?name=<hint>` (octet-stream body) → `{"address": "..."}`,
/// `GET {endpoint}/v1/blobs/{address}` → bytes.
#[derive(Debug)]
pub struct HttpBlobBackend {
    config: ContentStoreConfig,
    agent: ureq::Agent,
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    address: String,
}

impl HttpBlobBackend {
    pub fn new(config: ContentStoreConfig) -> Self {
        let request_timeout = Duration::from_millis(config.request_timeout_ms);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(config.connect_timeout_ms))
            .timeout_read(request_timeout)
            .timeout_write(request_timeout)
            .timeout(request_timeout)
            .build();
        Self { config, agent }
    }

    fn endpoint(&self) -> Result<&str, StoreError> {
        self.config
            .endpoint
            .as_deref()
            .map(|e| e.trim_end_matches('/'))
            .ok_or_else(|| StoreError::Unavailable {
                message: "no content store endpoint configured".to_string(),
            })
    }

    fn authorize(&self, req: ureq::Request) -> ureq::Request {
        match self.config.bearer_token.as_ref() {
            Some(token) => req.set("authorization", &format!("Bearer {token}")),
            None => req,
        }
    }
}

impl BlobBackend for HttpBlobBackend {
    fn put(&self, bytes: &[u8], name_hint: &str) -> Result<ContentAddress, StoreError> {
        let url = format!("{}/v1/blobs", self.endpoint()?);
        let req = self
            .agent
            .post(&url)
            .query("name", name_hint)
            .set("content-type", "application/octet-stream");
        let resp = self
            .authorize(req)
            .send_bytes(bytes)
            .map_err(|e| store_error_from_ureq(e, None))?;
        let body: PutResponse = resp.into_json().map_err(|e| StoreError::Rejected {
            message: format!("unparsable put response: {e}"),
        })?;
        Ok(ContentAddress::new(body.address)?)
    }

    fn get(&self, address: &ContentAddress) -> Result<Vec<u8>, StoreError> {
        let url = format!("{}/v1/blobs/{}", self.endpoint()?, address.as_str());
        let resp = self
            .authorize(self.agent.get(&url))
            .call()
            .map_err(|e| store_error_from_ureq(e, Some(address)))?;
        let mut out = Vec::new();
        resp.into_reader()
            .take(MAX_BLOB_BYTES + 1)
            .read_to_end(&mut out)
            .map_err(|e| StoreError::Unavailable {
                message: format!("blob read failed: {e}"),
            })?;
        if out.len() as u64 > MAX_BLOB_BYTES {
            return Err(StoreError::Rejected {
                message: format!("blob exceeds {MAX_BLOB_BYTES} bytes"),
            });
        }
        Ok(out)
    }

    fn backend_name(&self) -> &'static str {
        "http"
    }
}

fn store_error_from_ureq(err: ureq::Error, address: Option<&ContentAddress>) -> StoreError {
    match err {
        ureq::Error::Status(404, _) => StoreError::NotFound {
            address: address.map(|a| a.as_str().to_string()).unwrap_or_default(),
        },
        ureq::Error::Status(code, _) if code >= 500 || code == 429 => StoreError::Unavailable {
            message: format!("http status {code}"),
        },
        ureq::Error::Status(code, _) => StoreError::Rejected {
            message: format!("http status {code}"),
        },
        ureq::Error::Transport(transport) => StoreError::Unavailable {
            message: format!("transport error: {transport}"),
        },
    }
}
