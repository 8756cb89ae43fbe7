#![forbid(unsafe_code)]

use std::sync::Mutex;

use medproof_kernel_contracts::ids::{ConsentId, RecordId, UserId};
use tracing::info;

/// Delivery of user-facing notifications. Called after the state change has committed;
/// implementations must not fail the pipeline.
pub trait NotificationSink: Send + Sync + std::fmt::Debug {
    fn on_record_ingested(&self, record_id: &RecordId, owner_id: &UserId);
    fn on_consent_resolved(&self, consent_id: &ConsentId, grantee_id: &UserId, approved: bool);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl NotificationSink for NoopNotifier {
    fn on_record_ingested(&self, _record_id: &RecordId, _owner_id: &UserId) {}
    fn on_consent_resolved(&self, _consent_id: &ConsentId, _grantee_id: &UserId, _approved: bool) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn on_record_ingested(&self, record_id: &RecordId, owner_id: &UserId) {
        info!(%record_id, %owner_id, "notify: record ingested");
    }

    fn on_consent_resolved(&self, consent_id: &ConsentId, grantee_id: &UserId, approved: bool) {
        info!(%consent_id, %grantee_id, approved, "notify: consent resolved");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    RecordIngested {
        record_id: RecordId,
        owner_id: UserId,
    },
    ConsentResolved {
        consent_id: ConsentId,
        grantee_id: UserId,
        approved: bool,
    },
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<Notification> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    fn push(&self, n: Notification) {
        if let Ok(mut events) = self.events.lock() {
            events.push(n);
        }
    }
}

impl NotificationSink for RecordingNotifier {
    fn on_record_ingested(&self, record_id: &RecordId, owner_id: &UserId) {
        self.push(Notification::RecordIngested {
            record_id: record_id.clone(),
            owner_id: owner_id.clone(),
        });
    }

    fn on_consent_resolved(&self, consent_id: &ConsentId, grantee_id: &UserId, approved: bool) {
        self.push(Notification::ConsentResolved {
            consent_id: consent_id.clone(),
            grantee_id: grantee_id.clone(),
            approved,
        });
    }
}
