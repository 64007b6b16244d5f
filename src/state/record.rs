//! The durable progress record for one subject.

use std::{collections::BTreeSet, fmt};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Status of a run, as persisted in the checkpoint.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run may still be resumed.
    InProgress,
    /// Every page reached a terminal outcome and the loop exited normally.
    Completed,
    /// The run was aborted by a fatal error.
    Failed,
}

impl RunStatus {
    /// Is this a terminal status? Terminal statuses never revert.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::InProgress => write!(f, "in_progress"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A broken record invariant. Reported by [`ProgressRecord::validate`], and
/// turned into a corrupt-state error by the store.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("total_pages must be at least 1")]
    NoPages,
    #[error("start_page {start_page} is outside 1..={total_pages}")]
    StartOutOfRange { start_page: u32, total_pages: u32 },
    #[error(
        "last_completed_page {last_completed_page} is outside {}..={total_pages}",
        .start_page.saturating_sub(1)
    )]
    CursorOutOfRange {
        last_completed_page: u32,
        start_page: u32,
        total_pages: u32,
    },
    #[error("page {0} is both processed and failed")]
    ProcessedAndFailed(u32),
    #[error("page {page} is recorded but outside {start_page}..={last_completed_page}")]
    PageOutOfRange {
        page: u32,
        start_page: u32,
        last_completed_page: u32,
    },
    #[error("{recorded} pages recorded, but the cursor implies {expected}")]
    CountMismatch { recorded: usize, expected: usize },
    #[error("status is completed but last_completed_page {0} is not total_pages")]
    CompletedEarly(u32),
    #[error("last_updated_at is earlier than started_at")]
    TimeReversed,
    #[error("cannot derive start_page from the recorded pages")]
    UnderivableStart,
}

/// The durable checkpoint of a single subject's run.
///
/// `last_completed_page` is the highest page whose processing has concluded,
/// successfully or not. It is `start_page - 1` before any page is processed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PersistedRecord")]
pub struct ProgressRecord {
    pub subject_id: String,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub start_page: u32,
    pub last_completed_page: u32,
    pub total_pages: u32,
    pub processed_pages: BTreeSet<u32>,
    pub failed_pages: BTreeSet<u32>,
    pub output_location: String,
    pub capture_location: String,
    pub status: RunStatus,

    /// The `last_updated_at` value most recently written to or read from
    /// disk. Never serialized.
    #[serde(skip)]
    persisted_at: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    /// Create a fresh, in-progress record. No page has been processed yet.
    pub fn new(
        subject_id: impl Into<String>,
        total_pages: u32,
        start_page: u32,
        output_location: impl Into<String>,
        capture_location: impl Into<String>,
    ) -> Result<Self, InvariantViolation> {
        let now = Utc::now();
        let record = Self {
            subject_id: subject_id.into(),
            started_at: now,
            last_updated_at: now,
            start_page,
            last_completed_page: start_page.saturating_sub(1),
            total_pages,
            processed_pages: BTreeSet::new(),
            failed_pages: BTreeSet::new(),
            output_location: output_location.into(),
            capture_location: capture_location.into(),
            status: RunStatus::InProgress,
            persisted_at: None,
        };
        record.validate()?;
        Ok(record)
    }

    /// The page the loop should process next.
    pub fn next_page(&self) -> u32 {
        self.start_page
            .max(self.last_completed_page.saturating_add(1))
    }

    /// Number of pages in `start_page..=total_pages`.
    pub fn pages_in_range(&self) -> u32 {
        self.total_pages
            .checked_sub(self.start_page)
            .map_or(0, |n| n.saturating_add(1))
    }

    /// Number of pages that reached a terminal outcome.
    pub fn pages_concluded(&self) -> u32 {
        self.last_completed_page
            .checked_sub(self.start_page)
            .map_or(0, |n| n.saturating_add(1))
    }

    /// Have we concluded every page?
    pub fn cursor_at_end(&self) -> bool {
        self.last_completed_page >= self.total_pages
    }

    /// Record a page that succeeded, and advance the cursor past it.
    pub fn mark_processed(&mut self, page: u32) {
        debug_assert_eq!(page, self.next_page());
        self.failed_pages.remove(&page);
        self.processed_pages.insert(page);
        self.advance_cursor(page);
    }

    /// Record a page that exhausted its retries, and advance the cursor past
    /// it anyway.
    pub fn mark_failed(&mut self, page: u32) {
        debug_assert_eq!(page, self.next_page());
        self.processed_pages.remove(&page);
        self.failed_pages.insert(page);
        self.advance_cursor(page);
    }

    /// Move to a new status. Terminal statuses never revert, so this is a
    /// no-op once the record is completed or failed.
    pub fn set_status(&mut self, status: RunStatus) {
        if !self.status.is_terminal() {
            self.status = status;
            self.touch();
        }
    }

    fn advance_cursor(&mut self, page: u32) {
        self.last_completed_page = self.last_completed_page.max(page);
        self.touch();
    }

    /// Bump `last_updated_at` to now, keeping it monotonic.
    pub fn touch(&mut self) {
        self.last_updated_at = self.last_updated_at.max(Utc::now());
    }

    /// Make sure `last_updated_at` is strictly newer than the last persisted
    /// version of this record.
    pub(crate) fn advance_for_save(&mut self) {
        if let Some(persisted_at) = self.persisted_at {
            if self.last_updated_at <= persisted_at {
                self.last_updated_at =
                    Utc::now().max(persisted_at + ChronoDuration::microseconds(1));
            }
        }
    }

    /// Remember the timestamp we last saw on disk.
    pub(crate) fn mark_persisted(&mut self) {
        self.persisted_at = Some(self.last_updated_at);
    }

    /// Check every structural invariant.
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        if self.total_pages < 1 {
            return Err(InvariantViolation::NoPages);
        }
        if self.start_page < 1 || self.start_page > self.total_pages {
            return Err(InvariantViolation::StartOutOfRange {
                start_page: self.start_page,
                total_pages: self.total_pages,
            });
        }
        if self.last_completed_page < self.start_page.saturating_sub(1)
            || self.last_completed_page > self.total_pages
        {
            return Err(InvariantViolation::CursorOutOfRange {
                last_completed_page: self.last_completed_page,
                start_page: self.start_page,
                total_pages: self.total_pages,
            });
        }
        if let Some(&page) = self.processed_pages.intersection(&self.failed_pages).next()
        {
            return Err(InvariantViolation::ProcessedAndFailed(page));
        }
        let range = self.start_page..=self.last_completed_page;
        if let Some(&page) = self
            .processed_pages
            .iter()
            .chain(self.failed_pages.iter())
            .find(|page| !range.contains(page))
        {
            return Err(InvariantViolation::PageOutOfRange {
                page,
                start_page: self.start_page,
                last_completed_page: self.last_completed_page,
            });
        }
        let recorded = self.processed_pages.len() + self.failed_pages.len();
        let expected = self.pages_concluded() as usize;
        if recorded != expected {
            return Err(InvariantViolation::CountMismatch { recorded, expected });
        }
        if self.status == RunStatus::Completed && !self.cursor_at_end() {
            return Err(InvariantViolation::CompletedEarly(self.last_completed_page));
        }
        if self.last_updated_at < self.started_at {
            return Err(InvariantViolation::TimeReversed);
        }
        Ok(())
    }
}

/// The on-disk shape of a [`ProgressRecord`]. `start_page` is optional so
/// that checkpoints written without it can still be loaded.
#[derive(Deserialize)]
struct PersistedRecord {
    subject_id: String,
    started_at: DateTime<Utc>,
    last_updated_at: DateTime<Utc>,
    #[serde(default)]
    start_page: Option<u32>,
    last_completed_page: u32,
    total_pages: u32,
    processed_pages: BTreeSet<u32>,
    failed_pages: BTreeSet<u32>,
    output_location: String,
    capture_location: String,
    status: RunStatus,
}

impl TryFrom<PersistedRecord> for ProgressRecord {
    type Error = InvariantViolation;

    fn try_from(raw: PersistedRecord) -> Result<Self, Self::Error> {
        let start_page = match raw.start_page {
            Some(start_page) => start_page,
            None => {
                let recorded = (raw.processed_pages.len() + raw.failed_pages.len()) as u32;
                raw.last_completed_page
                    .checked_add(1)
                    .and_then(|next| next.checked_sub(recorded))
                    .filter(|start| *start >= 1)
                    .ok_or(InvariantViolation::UnderivableStart)?
            }
        };
        let record = ProgressRecord {
            subject_id: raw.subject_id,
            started_at: raw.started_at,
            last_updated_at: raw.last_updated_at,
            start_page,
            last_completed_page: raw.last_completed_page,
            total_pages: raw.total_pages,
            processed_pages: raw.processed_pages,
            failed_pages: raw.failed_pages,
            output_location: raw.output_location,
            capture_location: raw.capture_location,
            status: raw.status,
            persisted_at: Some(raw.last_updated_at),
        };
        record.validate()?;
        Ok(record)
    }
}
