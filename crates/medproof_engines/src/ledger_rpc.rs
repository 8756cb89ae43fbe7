#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use medproof_kernel_contracts::ids::{RecordId, UserId};
use medproof_kernel_contracts::ledger::{LedgerAddress, OnLedgerArtifact, TxRef};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::ledger_client::{LedgerError, LedgerTransport, SignedTransaction, TxReceipt};

pub const RPC_CODE_SEQUENCE_MISMATCH: i64 = -32010;
pub const RPC_CODE_UNDERFUNDED: i64 = -32011;

/// JSON-RPC 2.0 over HTTP to a ledger node.
#[derive(Debug)]
pub struct JsonRpcLedgerTransport {
    url: String,
    agent: ureq::Agent,
    next_id: AtomicU64,
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl JsonRpcLedgerTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self {
            url: url.into(),
            agent,
            next_id: AtomicU64::new(1),
        }
    }

    fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, LedgerError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let resp = self
            .agent
            .post(&self.url)
            .set("content-type", "application/json")
            .send_json(&request)
            .map_err(ledger_error_from_ureq)?;
        let body: RpcResponse = resp
            .into_json()
            .map_err(|e| LedgerError::Decode(format!("{method}: {e}")))?;
        if let Some(err) = body.error {
            return Err(ledger_error_from_rpc(err));
        }
        serde_json::from_value(body.result.unwrap_or(Value::Null))
            .map_err(|e| LedgerError::Decode(format!("{method}: {e}")))
    }
}

fn ledger_error_from_rpc(err: RpcErrorObject) -> LedgerError {
    match err.code {
        RPC_CODE_SEQUENCE_MISMATCH => {
            let field = |name: &str| {
                err.data
                    .as_ref()
                    .and_then(|d| d.get(name))
                    .and_then(Value::as_u64)
                    .unwrap_or(0)
            };
            LedgerError::SequenceMismatch {
                expected: field("expected"),
                submitted: field("submitted"),
            }
        }
        RPC_CODE_UNDERFUNDED => LedgerError::Underfunded {
            message: err.message,
        },
        code => LedgerError::Rpc {
            code,
            message: err.message,
        },
    }
}

fn ledger_error_from_ureq(err: ureq::Error) -> LedgerError {
    match err {
        ureq::Error::Status(code, _) if code >= 500 || code == 429 => LedgerError::Unreachable {
            message: format!("http status {code}"),
        },
        ureq::Error::Status(code, _) => LedgerError::Rpc {
            code: i64::from(code),
            message: format!("http status {code}"),
        },
        ureq::Error::Transport(transport) => LedgerError::Unreachable {
            message: format!("transport error: {transport}"),
        },
    }
}

impl LedgerTransport for JsonRpcLedgerTransport {
    fn account_sequence(&self, address: &LedgerAddress) -> Result<u64, LedgerError> {
        self.call("ledger_getSequence", json!([address.as_str()]))
    }

    fn submit(&self, tx: &SignedTransaction) -> Result<TxRef, LedgerError> {
        let params = serde_json::to_value(tx).map_err(|e| LedgerError::Decode(e.to_string()))?;
        self.call("ledger_sendTransaction", json!([params]))
    }

    fn receipt(&self, tx_ref: &TxRef) -> Result<Option<TxReceipt>, LedgerError> {
        self.call("ledger_getReceipt", json!([tx_ref.as_str()]))
    }

    fn check_access(&self, requester: &LedgerAddress, owner_id: &UserId) -> Result<bool, LedgerError> {
        self.call(
            "ledger_checkAccess",
            json!([requester.as_str(), owner_id.as_str()]),
        )
    }

    fn get_artifact(&self, record_id: &RecordId) -> Result<Option<OnLedgerArtifact>, LedgerError> {
        self.call("ledger_getArtifact", json!([record_id.as_str()]))
    }

    fn transport_name(&self) -> &'static str {
        "json-rpc"
    }
}
