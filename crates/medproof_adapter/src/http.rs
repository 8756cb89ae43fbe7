#![forbid(unsafe_code)]

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use medproof_os::ingestion::MAX_ARTIFACT_BYTES;
use serde::Serialize;
use tracing::error;

use crate::{
    AdapterFailure, AdapterRuntime, ConsentAction, ConsentActionAdapterRequest,
    ConsentRequestAdapterRequest, RecordContentQuery, RecordIngestAdapterRequest,
};

/// Largest accepted request body: a base64-encoded artifact of `MAX_ARTIFACT_BYTES` plus room
/// for the surrounding JSON fields.
pub const MAX_REQUEST_BODY_BYTES: usize = MAX_ARTIFACT_BYTES.div_ceil(3) * 4 + 64 * 1024;

type SharedRuntime = Arc<AdapterRuntime>;

#[derive(Debug, Serialize)]
struct ErrorBody {
    status: String,
    outcome: String,
    reason: Option<String>,
}

pub fn router(runtime: SharedRuntime) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/records", post(ingest_record))
        .route("/v1/records/:record_id", get(get_record))
        .route("/v1/records/:record_id/content", get(record_content))
        .route("/v1/records/:record_id/verify", post(verify_record))
        .route("/v1/consents", post(request_consent))
        .route("/v1/consents/:consent_id", get(get_consent))
        .route("/v1/consents/:consent_id/:action", post(consent_action))
        .route("/v1/audit/cross-check", get(audit_cross_check))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .with_state(runtime)
}

/// Pipeline calls block on the content store and ledger, so they run on the blocking pool.
async fn run_blocking<T, F>(runtime: SharedRuntime, op: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce(&AdapterRuntime) -> Result<T, AdapterFailure> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || op(&runtime)).await {
        Ok(Ok(body)) => (StatusCode::OK, Json(body)).into_response(),
        Ok(Err(failure)) => failure_response(failure),
        Err(join_err) => {
            error!(error = %join_err, "adapter worker task failed");
            failure_response(AdapterFailure {
                http_status: 500,
                outcome: "INTERNAL",
                reason: "adapter worker task failed".to_string(),
            })
        }
    }
}

fn failure_response(failure: AdapterFailure) -> Response {
    let code =
        StatusCode::from_u16(failure.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if code.is_server_error() {
        error!(status = failure.http_status, reason = %failure.reason, "request failed");
    }
    (
        code,
        Json(ErrorBody {
            status: "error".to_string(),
            outcome: failure.outcome.to_string(),
            reason: Some(failure.reason),
        }),
    )
        .into_response()
}

async fn healthz(State(runtime): State<SharedRuntime>) -> Response {
    run_blocking(runtime, |rt| Ok(rt.health_report())).await
}

async fn ingest_record(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<RecordIngestAdapterRequest>,
) -> Response {
    run_blocking(runtime, move |rt| rt.ingest_record(request)).await
}

async fn get_record(
    State(runtime): State<SharedRuntime>,
    Path(record_id): Path<String>,
) -> Response {
    run_blocking(runtime, move |rt| rt.get_record(&record_id)).await
}

async fn record_content(
    State(runtime): State<SharedRuntime>,
    Path(record_id): Path<String>,
    Query(query): Query<RecordContentQuery>,
) -> Response {
    run_blocking(runtime, move |rt| rt.record_content(&record_id, query)).await
}

async fn verify_record(
    State(runtime): State<SharedRuntime>,
    Path(record_id): Path<String>,
) -> Response {
    run_blocking(runtime, move |rt| rt.verify_record(&record_id)).await
}

async fn request_consent(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<ConsentRequestAdapterRequest>,
) -> Response {
    run_blocking(runtime, move |rt| rt.request_consent(request)).await
}

async fn get_consent(
    State(runtime): State<SharedRuntime>,
    Path(consent_id): Path<String>,
) -> Response {
    run_blocking(runtime, move |rt| rt.get_consent(&consent_id)).await
}

async fn consent_action(
    State(runtime): State<SharedRuntime>,
    Path((consent_id, action)): Path<(String, String)>,
    Json(request): Json<ConsentActionAdapterRequest>,
) -> Response {
    let Some(action) = ConsentAction::parse(&action) else {
        return failure_response(AdapterFailure {
            http_status: 404,
            outcome: "NOT_FOUND",
            reason: format!("unknown consent action {action}"),
        });
    };
    run_blocking(runtime, move |rt| {
        rt.consent_action(&consent_id, action, request)
    })
    .await
}

async fn audit_cross_check(State(runtime): State<SharedRuntime>) -> Response {
    run_blocking(runtime, |rt| rt.audit_cross_check()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AdapterConfig;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use medproof_engines::content_store::ContentStoreConfig;
    use medproof_engines::crypto_vault::{CryptoVaultConfig, KeyPolicy};
    use medproof_engines::ledger_client::LedgerClientConfig;
    use medproof_os::ingestion::IngestionConfig;
    use serde_json::{json, Value};

    const AXUM_DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

    async fn serve_router() -> String {
        let runtime = AdapterRuntime::from_config(&AdapterConfig {
            vault: CryptoVaultConfig {
                key_b64: None,
                policy: KeyPolicy::AllowEphemeral,
            },
            content: ContentStoreConfig::default(),
            ledger: LedgerClientConfig::default(),
            ingestion: IngestionConfig::default(),
            audit_journal: None,
            metadata_journal: None,
        })
        .unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(Arc::new(runtime))).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn post_json(url: String, body: Value) -> (u16, Value) {
        match ureq::post(&url).send_json(body) {
            Ok(resp) => (resp.status(), resp.into_json().unwrap()),
            Err(ureq::Error::Status(code, resp)) => (code, resp.into_json().unwrap()),
            Err(err) => panic!("transport error: {err}"),
        }
    }

    #[test]
    fn at_http_01_body_limit_covers_largest_artifact() {
        let encoded_max = MAX_ARTIFACT_BYTES.div_ceil(3) * 4;
        assert!(MAX_REQUEST_BODY_BYTES > encoded_max);
        assert!(MAX_REQUEST_BODY_BYTES > AXUM_DEFAULT_BODY_LIMIT);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn at_http_02_ingest_accepts_body_above_axum_default_limit() {
        let base = serve_router().await;
        let payload = vec![0x5au8; 3_000_000];
        let body = json!({
            "record_id": "rec_large",
            "owner_id": "patient_1",
            "submitted_by": "provider_1",
            "payload_b64": BASE64.encode(&payload),
            "media_type": "application/dicom"
        });
        assert!(body.to_string().len() > AXUM_DEFAULT_BODY_LIMIT);

        let url = format!("{base}/v1/records");
        let (status, resp) = tokio::task::spawn_blocking(move || post_json(url, body))
            .await
            .unwrap();
        assert_eq!(status, 200, "{resp}");
        assert_eq!(resp["outcome"], "REGISTERED");
        assert_eq!(resp["record"]["plaintext_len"], 3_000_000u64);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn at_http_03_request_time_in_body_is_ignored_and_unknown_action_is_404() {
        let base = serve_router().await;
        let ingest_url = format!("{base}/v1/records");
        let action_url = format!("{base}/v1/consents/c_1/extend");
        let (ingest, action) = tokio::task::spawn_blocking(move || {
            let ingest = post_json(
                ingest_url,
                json!({
                    "record_id": "rec_1",
                    "owner_id": "patient_1",
                    "submitted_by": "provider_1",
                    "payload_b64": BASE64.encode(b"ecg"),
                    "now_ms": 5u64
                }),
            );
            let action = post_json(action_url, json!({"actor_id": "patient_1"}));
            (ingest, action)
        })
        .await
        .unwrap();

        assert_eq!(ingest.0, 200);
        assert!(ingest.1["record"]["created_at_ms"].as_u64().unwrap() > 5);
        assert_eq!(action.0, 404);
        assert_eq!(action.1["outcome"], "NOT_FOUND");
    }
}
