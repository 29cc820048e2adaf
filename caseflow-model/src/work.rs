use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::ModelError;
use crate::ids::{CaseId, WorkItemId, WorkerId};

/// Lifecycle of a unit of annotator work.
///
/// ```text
/// Queued --acquire--> Locked --complete--> Completed
///   ^                   |  \--flag-------> NeedsReview
///   +---release/expiry--+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum WorkItemState {
    Queued,
    Locked,
    Completed,
    NeedsReview,
}

impl WorkItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemState::Queued => "queued",
            WorkItemState::Locked => "locked",
            WorkItemState::Completed => "completed",
            WorkItemState::NeedsReview => "needs_review",
        }
    }
}

impl fmt::Display for WorkItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkItemState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(WorkItemState::Queued),
            "locked" => Ok(WorkItemState::Locked),
            "completed" => Ok(WorkItemState::Completed),
            "needs_review" => Ok(WorkItemState::NeedsReview),
            other => Err(ModelError::UnknownState(other.to_string())),
        }
    }
}

/// Exclusive, time-bounded ownership of a work item.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Lease {
    pub owner_id: WorkerId,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// The queueable, lockable unit of work; one per case.
///
/// Owner and expiry travel together in [`Lease`], so they are either both
/// set or both absent. A lease is present only in [`WorkItemState::Locked`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WorkItem {
    pub work_item_id: WorkItemId,
    pub case_id: CaseId,
    pub state: WorkItemState,
    pub lease: Option<Lease>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn queued(case_id: CaseId, now: DateTime<Utc>) -> Self {
        Self {
            work_item_id: WorkItemId::new(),
            case_id,
            state: WorkItemState::Queued,
            lease: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn owner_id(&self) -> Option<&WorkerId> {
        self.lease.as_ref().map(|lease| &lease.owner_id)
    }

    pub fn lease_expiry(&self) -> Option<DateTime<Utc>> {
        self.lease.as_ref().map(|lease| lease.expires_at)
    }

    pub fn is_owned_by(&self, worker: &WorkerId) -> bool {
        self.state == WorkItemState::Locked
            && self.owner_id().is_some_and(|owner| owner == worker)
    }

    /// Rebuild the lease from nullable columns. A half-set pair is rejected.
    pub fn lease_from_parts(
        owner_id: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Lease>, ModelError> {
        match (owner_id, expires_at) {
            (Some(owner), Some(expires_at)) => Ok(Some(Lease {
                owner_id: WorkerId::new(owner)?,
                expires_at,
            })),
            (None, None) => Ok(None),
            (owner_id, expires_at) => Err(ModelError::InconsistentLease {
                owner_id,
                has_expiry: expires_at.is_some(),
            }),
        }
    }
}
