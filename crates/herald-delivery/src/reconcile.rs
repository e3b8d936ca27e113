//! Store-side bookkeeping for a dequeued job.
//!
//! Every store call here is best-effort. Failures are collected as
//! [`StoreIssue`]s and returned alongside the result instead of being
//! raised, so the delivery path never branches on bookkeeping errors.

use chrono::{DateTime, Utc};
use herald_core::models::{
    DeliveryJob, NotificationId, NotificationStatus, NotificationUpdate,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::store::DeliveryStore;

/// Store operation a [`StoreIssue`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreStep {
    /// Looking up the record.
    Find,
    /// Creating a missing record.
    Create,
    /// `scheduled -> pending`.
    MarkPending,
    /// `-> sending`.
    MarkSending,
    /// Writing the final `sent` or `failed` status.
    Finalize,
}

/// A swallowed store failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreIssue {
    /// Where it happened.
    pub step: StoreStep,
    /// Store error message.
    pub error: String,
}

/// What reconciliation learned about the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Last status known to be stored, `None` when the store never answered.
    pub status: Option<NotificationStatus>,
    /// The record was created here because it was missing.
    pub created: bool,
    /// Swallowed store failures.
    pub issues: Vec<StoreIssue>,
}

impl Reconciliation {
    /// Returns true when the stored record already reached `sent` or
    /// `failed`, meaning this job is a duplicate.
    pub fn already_finished(&self) -> bool {
        self.status.is_some_and(NotificationStatus::is_terminal)
    }
}

/// Ensures a record exists for `job` and moves it to `sending`.
///
/// A missing record is created as `pending`. A `scheduled` record moves to
/// `pending` first. A refused transition means another writer got there
/// first; it is logged and left alone.
pub async fn reconcile(
    store: &dyn DeliveryStore,
    job: &DeliveryJob,
    now: DateTime<Utc>,
) -> Reconciliation {
    let id = job.notification_id;
    let mut issues = Vec::new();
    let mut created = false;

    let found = match store.find_by_id(id).await {
        Ok(found) => found,
        Err(e) => {
            warn!(notification_id = %id, error = %e, "record lookup failed, creating it");
            issues.push(StoreIssue { step: StoreStep::Find, error: e.to_string() });
            None
        },
    };

    let mut status = match found {
        Some(record) => Some(record.status),
        None => {
            let mut record = job.to_record(now);
            record.status = NotificationStatus::Pending;
            match store.create(record).await {
                Ok(true) => {
                    debug!(notification_id = %id, "created missing notification record");
                    created = true;
                    Some(NotificationStatus::Pending)
                },
                // lost a race with the submitter, or the lookup failed
                Ok(false) => None,
                Err(e) => {
                    warn!(notification_id = %id, error = %e, "failed to create notification record");
                    issues.push(StoreIssue { step: StoreStep::Create, error: e.to_string() });
                    None
                },
            }
        },
    };

    if status.is_some_and(NotificationStatus::is_terminal) {
        return Reconciliation { status, created, issues };
    }

    if status == Some(NotificationStatus::Scheduled) {
        if let Some(next) =
            advance(store, id, NotificationStatus::Pending, StoreStep::MarkPending, &mut issues)
                .await
        {
            status = Some(next);
        }
    }

    if let Some(next) =
        advance(store, id, NotificationStatus::Sending, StoreStep::MarkSending, &mut issues).await
    {
        status = Some(next);
    }

    Reconciliation { status, created, issues }
}

async fn advance(
    store: &dyn DeliveryStore,
    id: NotificationId,
    target: NotificationStatus,
    step: StoreStep,
    issues: &mut Vec<StoreIssue>,
) -> Option<NotificationStatus> {
    match store.update(id, NotificationUpdate::status(target)).await {
        Ok(true) => Some(target),
        Ok(false) => {
            debug!(notification_id = %id, target = %target, "status transition refused");
            None
        },
        Err(e) => {
            warn!(notification_id = %id, target = %target, error = %e, "status transition failed");
            issues.push(StoreIssue { step, error: e.to_string() });
            None
        },
    }
}

/// Writes the final status, conditioned on the record not being terminal.
///
/// Returns whether the update landed. A refused update means the record
/// was finalized elsewhere; a late result never overwrites it.
pub async fn finalize(
    store: &dyn DeliveryStore,
    id: NotificationId,
    update: NotificationUpdate,
    issues: &mut Vec<StoreIssue>,
) -> bool {
    let target = update.status;
    match store.update(id, update).await {
        Ok(true) => true,
        Ok(false) => {
            warn!(
                notification_id = %id,
                target = ?target,
                "final status not applied, record already finished or missing"
            );
            false
        },
        Err(e) => {
            warn!(notification_id = %id, error = %e, "failed to record final status");
            issues.push(StoreIssue { step: StoreStep::Finalize, error: e.to_string() });
            false
        },
    }
}
