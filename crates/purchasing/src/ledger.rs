//! Status history of a purchase.
//!
//! The ledger holds the current status and an append-only list of the
//! transitions that led there. Timestamps never go backwards, and the last
//! change time always equals the newest entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use procura_core::{DomainResult, FieldErrors, ValueObject};

use crate::purchase::{PurchaseStatus, UserRef};

/// One recorded transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusHistoryEntry {
    pub status: PurchaseStatus,
    pub changed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_by: Option<UserRef>,
}

impl ValueObject for StatusHistoryEntry {}

/// Command: move a purchase to `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub status: PurchaseStatus,
    #[serde(default)]
    pub comment: Option<String>,
    /// Procurement officer taking over the purchase with this transition.
    #[serde(default)]
    pub procurement_responsible: Option<UserRef>,
}

impl StatusChange {
    pub fn to(status: PurchaseStatus) -> Self {
        Self {
            status,
            comment: None,
            procurement_responsible: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusLedger {
    status: PurchaseStatus,
    status_history: Vec<StatusHistoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_status_changed_at: Option<DateTime<Utc>>,
}

impl StatusLedger {
    /// A ledger with a status but no recorded transitions yet.
    pub fn new(status: PurchaseStatus) -> Self {
        Self {
            status,
            status_history: Vec::new(),
            last_status_changed_at: None,
        }
    }

    /// A ledger whose history starts with `status` at `at`.
    pub fn seeded(status: PurchaseStatus, at: DateTime<Utc>) -> Self {
        Self {
            status,
            status_history: vec![StatusHistoryEntry {
                status,
                changed_at: at,
                comment: None,
                changed_by: None,
            }],
            last_status_changed_at: Some(at),
        }
    }

    /// Rebuild from persisted state, rejecting histories that go back in time.
    pub fn from_parts(
        status: PurchaseStatus,
        history: Vec<StatusHistoryEntry>,
    ) -> DomainResult<Self> {
        let mut errors = FieldErrors::new();
        for (index, pair) in history.windows(2).enumerate() {
            if pair[1].changed_at < pair[0].changed_at {
                errors.insert(
                    format!("statusHistory[{}]", index + 1),
                    "changedAt precedes the previous entry",
                );
            }
        }
        errors.into_result("status history out of order")?;

        let last_status_changed_at = history.last().map(|e| e.changed_at);
        Ok(Self {
            status,
            status_history: history,
            last_status_changed_at,
        })
    }

    pub fn status(&self) -> PurchaseStatus {
        self.status
    }

    pub fn history(&self) -> &[StatusHistoryEntry] {
        &self.status_history
    }

    pub fn last_changed_at(&self) -> Option<DateTime<Utc>> {
        self.last_status_changed_at
    }

    /// Decide the entry a change would append, without mutating.
    ///
    /// Every status may follow every other; asking for the current status
    /// yields `None`. A `now` earlier than the newest entry is clamped to it.
    pub fn decide(&self, change: &StatusChange, now: DateTime<Utc>) -> Option<StatusHistoryEntry> {
        if change.status == self.status {
            return None;
        }
        let changed_at = match self.last_status_changed_at {
            Some(last) if last > now => last,
            _ => now,
        };
        Some(StatusHistoryEntry {
            status: change.status,
            changed_at,
            comment: change
                .comment
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
            changed_by: change.procurement_responsible.clone(),
        })
    }

    /// Append a decided entry.
    pub fn apply(&mut self, entry: StatusHistoryEntry) {
        let mut entry = entry;
        if let Some(last) = self.last_status_changed_at {
            entry.changed_at = entry.changed_at.max(last);
        }
        self.status = entry.status;
        self.last_status_changed_at = Some(entry.changed_at);
        self.status_history.push(entry);
    }

    /// Decide and apply in one step.
    pub fn change(&mut self, change: &StatusChange, now: DateTime<Utc>) -> Option<&StatusHistoryEntry> {
        let entry = self.decide(change, now)?;
        self.apply(entry);
        self.status_history.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn change_appends_entry_and_moves_status() {
        let mut ledger = StatusLedger::new(PurchaseStatus::InProgress);

        let entry = ledger
            .change(
                &StatusChange::to(PurchaseStatus::UnderReview).with_comment("  sent to legal "),
                test_time(),
            )
            .cloned()
            .unwrap();

        assert_eq!(entry.comment.as_deref(), Some("sent to legal"));
        assert_eq!(ledger.status(), PurchaseStatus::UnderReview);
        assert_eq!(ledger.history().len(), 1);
        assert_eq!(ledger.last_changed_at(), Some(test_time()));
    }

    #[test]
    fn same_status_is_a_no_op() {
        let mut ledger = StatusLedger::seeded(PurchaseStatus::Rejected, test_time());
        let later = test_time() + Duration::minutes(5);

        assert!(ledger.change(&StatusChange::to(PurchaseStatus::Rejected), later).is_none());
        assert_eq!(ledger.history().len(), 1);
        assert_eq!(ledger.last_changed_at(), Some(test_time()));
    }

    #[test]
    fn clock_skew_never_reorders_history() {
        let mut ledger = StatusLedger::seeded(PurchaseStatus::InProgress, test_time());
        let earlier = test_time() - Duration::hours(2);

        ledger.change(&StatusChange::to(PurchaseStatus::Canceled), earlier);

        let history = ledger.history();
        assert_eq!(history[1].changed_at, test_time());
        assert_eq!(ledger.last_changed_at(), Some(test_time()));
    }

    #[test]
    fn every_status_can_follow_every_other() {
        for &from in PurchaseStatus::ALL {
            for &to in PurchaseStatus::ALL {
                let ledger = StatusLedger::new(from);
                let decided = ledger.decide(&StatusChange::to(to), test_time());
                assert_eq!(decided.is_some(), from != to, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn from_parts_rejects_out_of_order_history() {
        let entry = |status, at| StatusHistoryEntry {
            status,
            changed_at: at,
            comment: None,
            changed_by: None,
        };
        let history = vec![
            entry(PurchaseStatus::InProgress, test_time()),
            entry(PurchaseStatus::UnderReview, test_time() - Duration::seconds(1)),
        ];

        let err = StatusLedger::from_parts(PurchaseStatus::UnderReview, history).unwrap_err();
        assert!(err.details().unwrap().get("statusHistory[1]").is_some());

        let ledger = StatusLedger::from_parts(
            PurchaseStatus::UnderReview,
            vec![entry(PurchaseStatus::UnderReview, test_time())],
        )
        .unwrap();
        assert_eq!(ledger.last_changed_at(), Some(test_time()));
    }
}
