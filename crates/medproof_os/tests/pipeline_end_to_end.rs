#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use medproof_engines::content_store::{ContentStore, MemoryBlobBackend};
use medproof_engines::crypto_vault::CryptoVault;
use medproof_engines::ledger_client::{LedgerClient, LedgerError, OperatorSigner};
use medproof_engines::ledger_loopback::LoopbackLedger;
use medproof_kernel_contracts::audit::{AuditAction, AuditEntryInput};
use medproof_kernel_contracts::consent::ConsentStatus;
use medproof_kernel_contracts::ids::{ConsentId, RecordId, UserId};
use medproof_kernel_contracts::ledger::{LedgerAddress, TxRef};
use medproof_kernel_contracts::record::{DescriptiveMetadata, RecordStatus};
use medproof_kernel_contracts::UnixTimeMs;
use medproof_os::audit_check::{cross_check, CrossCheckIssue};
use medproof_os::consent::{ConsentGrantPipeline, ConsentRequest};
use medproof_os::ingestion::{IngestRequest, IngestionConfig, RecordIngestionPipeline};
use medproof_os::notify::{Notification, RecordingNotifier};
use medproof_os::{PipelineError, SharedServices};
use medproof_storage::{MedStore, StorageError};

const T: UnixTimeMs = UnixTimeMs(1_750_000_000_000);

struct Harness {
    ledger: LoopbackLedger,
    blobs: Arc<MemoryBlobBackend>,
    notifier: Arc<RecordingNotifier>,
    services: SharedServices,
    ingest: RecordIngestionPipeline,
    consent: ConsentGrantPipeline,
}

fn harness_with(degraded_mode: bool, accept_degraded_storage: bool) -> Harness {
    let ledger = LoopbackLedger::new();
    ledger.set_clock(T);
    let blobs = Arc::new(MemoryBlobBackend::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let client = LedgerClient::new(
        Box::new(ledger.clone()),
        OperatorSigner::from_secret(&[4u8; 32]),
        Duration::from_millis(50),
        Duration::from_millis(1),
    );
    let services = SharedServices::new(
        Arc::new(CryptoVault::with_key(&[1u8; 32])),
        Arc::new(ContentStore::new(Box::new(blobs.clone()), degraded_mode)),
        Arc::new(client),
        MedStore::new_in_memory(),
        notifier.clone(),
    );
    let ingest = RecordIngestionPipeline::new(
        services.clone(),
        IngestionConfig {
            accept_degraded_storage,
        },
    );
    let consent = ConsentGrantPipeline::new(services.clone());
    Harness {
        ledger,
        blobs,
        notifier,
        services,
        ingest,
        consent,
    }
}

fn harness() -> Harness {
    harness_with(false, false)
}

fn rid(s: &str) -> RecordId {
    RecordId::new(s).unwrap()
}

fn uid(s: &str) -> UserId {
    UserId::new(s).unwrap()
}

fn cid(s: &str) -> ConsentId {
    ConsentId::new(s).unwrap()
}

fn clinic_address() -> LedgerAddress {
    LedgerAddress::new("0x4444444444444444444444444444444444444444").unwrap()
}

fn request(record: &str, bytes: Vec<u8>) -> IngestRequest {
    IngestRequest::v1(
        rid(record),
        uid("patient_1"),
        uid("provider_1"),
        bytes,
        DescriptiveMetadata {
            title: Some("blood panel".to_string()),
            category: Some("lab".to_string()),
            media_type: Some("application/pdf".to_string()),
        },
    )
    .unwrap()
}

fn consent_request(consent: &str, record: &str, days: u32) -> ConsentRequest {
    ConsentRequest {
        consent_id: cid(consent),
        owner_id: uid("patient_1"),
        grantee_id: uid("clinic_9"),
        grantee_address: clinic_address(),
        purpose: "second opinion".to_string(),
        scope: [rid(record)].into_iter().collect::<BTreeSet<_>>(),
        duration_days: days,
    }
}

fn days(n: u64) -> UnixTimeMs {
    UnixTimeMs(T.0 + n * UnixTimeMs::MS_PER_DAY)
}

#[test]
fn at_pipeline_01_three_megabyte_ingest_round_trips() {
    let h = harness();
    let raw: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let row = h.ingest.ingest(T, request("rec_1", raw.clone())).unwrap();

    assert_eq!(row.status, RecordStatus::Verified);
    assert_eq!(row.integrity_hash.to_hex().len(), 64);
    assert_eq!(row.encryption_hash.to_hex().len(), 64);
    assert_ne!(row.integrity_hash, row.encryption_hash);
    assert_eq!(row.plaintext_len, raw.len() as u64);
    assert!(h.blobs.contains(&row.content_address));

    assert_eq!(h.ingest.retrieve(&rid("rec_1")).unwrap(), raw);

    let store = h.services.store();
    let audit = store.audit_entries();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, AuditAction::Ingest);
    assert_eq!(audit[0].ledger_tx_ref.as_ref(), Some(&row.ledger_tx_ref));
    drop(store);
    assert_eq!(
        h.notifier.events(),
        vec![Notification::RecordIngested {
            record_id: rid("rec_1"),
            owner_id: uid("patient_1"),
        }]
    );
}

#[test]
fn at_pipeline_02_ledger_failure_leaves_orphan_blob_and_no_row() {
    let h = harness();
    h.ledger.fail_next_submit(LedgerError::Unreachable {
        message: "node down".to_string(),
    });
    let err = h
        .ingest
        .ingest(T, request("rec_1", b"discharge summary".to_vec()))
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Ledger(LedgerError::Unreachable { .. })
    ));
    assert!(h.ingest.record(&rid("rec_1")).is_none());
    assert_eq!(h.blobs.blob_count(), 1);
    assert!(h.services.store().audit_entries().is_empty());
    assert!(h.notifier.events().is_empty());
}

#[test]
fn at_pipeline_03_degraded_storage_is_refused_unless_accepted() {
    let strict = harness_with(true, false);
    strict.blobs.set_offline(true);
    assert!(matches!(
        strict.ingest.ingest(T, request("rec_1", b"x-ray".to_vec())),
        Err(PipelineError::StoreUnavailable { .. })
    ));
    assert!(strict.ledger.submitted().is_empty());

    let relaxed = harness_with(true, true);
    relaxed.blobs.set_offline(true);
    let row = relaxed
        .ingest
        .ingest(T, request("rec_1", b"x-ray".to_vec()))
        .unwrap();
    assert!(row.content_address.is_placeholder());
    assert!(matches!(
        relaxed.ingest.retrieve(&rid("rec_1")),
        Err(PipelineError::DegradedContent { .. })
    ));
}

#[test]
fn at_pipeline_04_duplicate_record_is_rejected_before_external_writes() {
    let h = harness();
    h.ingest.ingest(T, request("rec_1", b"first".to_vec())).unwrap();
    let submitted = h.ledger.submitted().len();
    let blobs = h.blobs.blob_count();
    assert!(matches!(
        h.ingest.ingest(T, request("rec_1", b"second".to_vec())),
        Err(PipelineError::Storage(StorageError::DuplicateKey { .. }))
    ));
    assert_eq!(h.ledger.submitted().len(), submitted);
    assert_eq!(h.blobs.blob_count(), blobs);
}

#[test]
fn at_pipeline_05_confirmation_timeout_leaves_pending_until_verified() {
    let h = harness();
    h.ledger.withhold_receipts(true);
    let err = h
        .ingest
        .ingest(T, request("rec_1", b"mri report".to_vec()))
        .unwrap_err();
    let tx_ref = match err {
        PipelineError::ConfirmationTimeout { tx_ref } => tx_ref,
        other => panic!("unexpected: {other:?}"),
    };
    let row = h.ingest.record(&rid("rec_1")).unwrap();
    assert_eq!(row.status, RecordStatus::Pending);
    assert_eq!(row.ledger_tx_ref, tx_ref);
    assert!(h.services.store().audit_entries().is_empty());
    assert!(matches!(
        h.ingest.retrieve(&rid("rec_1")),
        Err(PipelineError::RecordNotVerified { .. })
    ));

    // The transaction was applied even though its receipt never arrived.
    let resolved = h.ingest.verify_record(days(0), &rid("rec_1")).unwrap();
    assert!(resolved.consistent());
    assert_eq!(resolved.status_after, RecordStatus::Verified);

    let again = h.ingest.verify_record(days(0), &rid("rec_1")).unwrap();
    assert_eq!(again.status_before, RecordStatus::Verified);
    assert_eq!(again.status_after, RecordStatus::Verified);

    let audit = h.services.store().audit_entries().to_vec();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, AuditAction::Verify);
    assert_eq!(h.ingest.retrieve(&rid("rec_1")).unwrap(), b"mri report".to_vec());
}

#[test]
fn at_pipeline_06_unconfirmed_reverted_registration_verifies_as_failed() {
    let h = harness();
    h.ledger.withhold_receipts(true);
    h.ledger.revert_next("out of gas");
    assert!(matches!(
        h.ingest.ingest(T, request("rec_1", b"ecg".to_vec())),
        Err(PipelineError::ConfirmationTimeout { .. })
    ));

    let unconfirmed = h.ingest.verify_record(T, &rid("rec_1")).unwrap();
    assert_eq!(unconfirmed.status_after, RecordStatus::Pending);

    h.ledger.withhold_receipts(false);
    let report = h.ingest.verify_record(T, &rid("rec_1")).unwrap();
    assert!(report.on_ledger.is_none());
    assert_eq!(report.status_after, RecordStatus::Failed);
    let audit = h.services.store().audit_entries().to_vec();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, AuditAction::VerifyFailed);
}

#[test]
fn at_pipeline_07_tampered_blob_never_returns_bytes() {
    let h = harness();
    let row = h.ingest.ingest(T, request("rec_1", b"allergy list".to_vec())).unwrap();
    h.blobs
        .overwrite_for_tests(&row.content_address, vec![0u8; row.plaintext_len as usize]);
    assert!(matches!(
        h.ingest.retrieve(&rid("rec_1")),
        Err(PipelineError::Integrity { .. })
    ));
}

#[test]
fn at_pipeline_08_approval_after_expiry_is_expired() {
    let h = harness();
    h.ingest.ingest(T, request("rec_1", b"scan".to_vec())).unwrap();
    let grant = h.consent.request(T, consent_request("c_1", "rec_1", 30)).unwrap();
    assert_eq!(grant.expires_at, days(30));

    assert!(matches!(
        h.consent.approve(days(31), &cid("c_1"), &uid("patient_1")),
        Err(PipelineError::Expired { .. })
    ));
    assert_eq!(
        h.consent.effective_status(days(31), &cid("c_1")).unwrap(),
        ConsentStatus::Pending
    );
}

#[test]
fn at_pipeline_09_approve_once_then_already_processed() {
    let h = harness();
    h.ingest.ingest(T, request("rec_1", b"scan".to_vec())).unwrap();
    h.consent.request(T, consent_request("c_1", "rec_1", 30)).unwrap();

    assert!(matches!(
        h.consent.approve(days(1), &cid("c_1"), &uid("clinic_9")),
        Err(PipelineError::NotOwner { .. })
    ));

    let approved = h
        .consent
        .approve(days(1), &cid("c_1"), &uid("patient_1"))
        .unwrap();
    assert_eq!(approved.status, ConsentStatus::Approved);
    assert!(approved.ledger_token_ref.is_some());
    assert!(approved.ledger_tx_ref.is_some());

    assert!(matches!(
        h.consent.approve(days(1), &cid("c_1"), &uid("patient_1")),
        Err(PipelineError::AlreadyProcessed { status: "approved", .. })
    ));
    assert!(matches!(
        h.consent.reject(days(1), &cid("c_1"), &uid("patient_1")),
        Err(PipelineError::AlreadyProcessed { .. })
    ));
    assert!(h.notifier.events().contains(&Notification::ConsentResolved {
        consent_id: cid("c_1"),
        grantee_id: uid("clinic_9"),
        approved: true,
    }));

    let actions: Vec<AuditAction> = h
        .services
        .store()
        .audit_entries()
        .iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(
        actions,
        vec![
            AuditAction::Ingest,
            AuditAction::ConsentRequest,
            AuditAction::ConsentApprove
        ]
    );
}

#[test]
fn at_pipeline_10_rejection_is_local_and_final() {
    let h = harness();
    h.ingest.ingest(T, request("rec_1", b"scan".to_vec())).unwrap();
    h.consent.request(T, consent_request("c_1", "rec_1", 7)).unwrap();
    let before = h.ledger.submitted().len();
    let rejected = h
        .consent
        .reject(days(1), &cid("c_1"), &uid("patient_1"))
        .unwrap();
    assert_eq!(rejected.status, ConsentStatus::Rejected);
    assert_eq!(h.ledger.submitted().len(), before);
    assert!(matches!(
        h.consent.approve(days(1), &cid("c_1"), &uid("patient_1")),
        Err(PipelineError::AlreadyProcessed { status: "rejected", .. })
    ));
}

#[test]
fn at_pipeline_11_third_party_access_follows_grant_lifecycle() {
    let h = harness();
    h.ingest.ingest(T, request("rec_1", b"biopsy".to_vec())).unwrap();
    h.consent.request(T, consent_request("c_1", "rec_1", 30)).unwrap();

    let denied = h
        .ingest
        .access_record(T, &rid("rec_1"), &uid("clinic_9"), &clinic_address());
    assert!(matches!(denied, Err(PipelineError::AccessDenied { .. })));

    h.consent.approve(T, &cid("c_1"), &uid("patient_1")).unwrap();
    let bytes = h
        .ingest
        .access_record(T, &rid("rec_1"), &uid("clinic_9"), &clinic_address())
        .unwrap();
    assert_eq!(bytes, b"biopsy".to_vec());
    let last = h.services.store().audit_entries().last().cloned().unwrap();
    assert_eq!(last.action, AuditAction::View);
    assert_eq!(last.actor_id, uid("clinic_9"));
    assert!(last.ledger_tx_ref.is_some());

    let owner = h
        .ingest
        .access_record(T, &rid("rec_1"), &uid("patient_1"), &clinic_address())
        .unwrap();
    assert_eq!(owner, b"biopsy".to_vec());

    let stranger = LedgerAddress::new("0x5555555555555555555555555555555555555555").unwrap();
    assert!(matches!(
        h.ingest
            .access_record(T, &rid("rec_1"), &uid("clinic_9"), &stranger),
        Err(PipelineError::AccessDenied { .. })
    ));

    h.consent.revoke(days(1), &cid("c_1"), &uid("patient_1")).unwrap();
    assert!(matches!(
        h.ingest
            .access_record(days(1), &rid("rec_1"), &uid("clinic_9"), &clinic_address()),
        Err(PipelineError::AccessDenied { .. })
    ));
    assert!(matches!(
        h.consent.revoke(days(1), &cid("c_1"), &uid("patient_1")),
        Err(PipelineError::NotRevocable { status: "revoked", .. })
    ));
}

#[test]
fn at_pipeline_12_expired_grant_is_not_revocable_and_denies_access() {
    let h = harness();
    h.ingest.ingest(T, request("rec_1", b"scan".to_vec())).unwrap();
    h.consent.request(T, consent_request("c_1", "rec_1", 2)).unwrap();
    h.consent.approve(T, &cid("c_1"), &uid("patient_1")).unwrap();

    assert_eq!(
        h.consent.effective_status(days(3), &cid("c_1")).unwrap(),
        ConsentStatus::Expired
    );
    assert!(matches!(
        h.ingest
            .access_record(days(3), &rid("rec_1"), &uid("clinic_9"), &clinic_address()),
        Err(PipelineError::AccessDenied { .. })
    ));
    assert!(matches!(
        h.consent.revoke(days(3), &cid("c_1"), &uid("patient_1")),
        Err(PipelineError::NotRevocable { status: "expired", .. })
    ));
}

#[test]
fn at_pipeline_13_grant_receipt_without_event_keeps_consent_pending() {
    let h = harness();
    h.ingest.ingest(T, request("rec_1", b"scan".to_vec())).unwrap();
    h.consent.request(T, consent_request("c_1", "rec_1", 30)).unwrap();
    h.ledger.omit_events(true);
    assert!(matches!(
        h.consent.approve(T, &cid("c_1"), &uid("patient_1")),
        Err(PipelineError::EventNotFound { event: "AccessGranted", .. })
    ));
    assert_eq!(
        h.consent.consent(&cid("c_1")).unwrap().status,
        ConsentStatus::Pending
    );
}

#[test]
fn at_pipeline_14_consent_scope_must_belong_to_owner() {
    let h = harness();
    assert!(matches!(
        h.consent.request(T, consent_request("c_1", "rec_missing", 30)),
        Err(PipelineError::NotFound { kind: "record", .. })
    ));

    let other_owner = IngestRequest::v1(
        rid("rec_2"),
        uid("patient_2"),
        uid("provider_1"),
        b"scan".to_vec(),
        DescriptiveMetadata::default(),
    )
    .unwrap();
    h.ingest.ingest(T, other_owner).unwrap();
    assert!(matches!(
        h.consent.request(T, consent_request("c_1", "rec_2", 30)),
        Err(PipelineError::NotOwner { .. })
    ));
}

#[test]
fn at_pipeline_15_audit_cross_check_flags_unknown_references() {
    let h = harness();
    h.ingest.ingest(T, request("rec_1", b"scan".to_vec())).unwrap();
    h.consent.request(T, consent_request("c_1", "rec_1", 30)).unwrap();
    h.consent.approve(T, &cid("c_1"), &uid("patient_1")).unwrap();

    let snapshot = h.services.store().audit_entries().to_vec();
    let clean = cross_check(&snapshot, &h.services.ledger).unwrap();
    assert_eq!(clean.checked, 2);
    assert!(clean.is_clean());

    h.services
        .store()
        .append_audit_entry(
            AuditEntryInput::v1(
                uid("clinic_9"),
                AuditAction::View,
                "rec_1",
                Some(TxRef::new("0xdeadbeef").unwrap()),
                T,
            )
            .unwrap(),
        )
        .unwrap();
    let entries = h.services.store().audit_entries().to_vec();
    let report = cross_check(&entries, &h.services.ledger).unwrap();
    assert_eq!(report.checked, 3);
    assert_eq!(report.confirmed, 2);
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].issue, CrossCheckIssue::Missing);
}

#[test]
fn at_pipeline_16_concurrent_ingests_keep_audit_sequence_gap_free() {
    let h = harness();
    let ingest = Arc::new(h.ingest.clone());
    let handles: Vec<_> = (0..6)
        .map(|i| {
            let ingest = ingest.clone();
            std::thread::spawn(move || {
                ingest.ingest(T, request(&format!("rec_{i}"), format!("doc {i}").into_bytes()))
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    let seqs: Vec<u64> = h
        .services
        .store()
        .audit_entries()
        .iter()
        .map(|e| e.seq.0)
        .collect();
    assert_eq!(seqs, (1..=6).collect::<Vec<u64>>());
    let ledger_seqs: BTreeSet<u64> = h.ledger.submitted().iter().map(|t| t.tx.sequence).collect();
    assert_eq!(ledger_seqs, (0..6).collect::<BTreeSet<u64>>());
}
