//! The one summary we print when a run ends.

use std::{fmt, time::Duration};

use crate::progress::format_duration;

use super::error::WorkflowState;

/// How a run ended.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub subject_id: String,
    pub state: WorkflowState,
    pub processed_count: usize,
    pub failed_pages: Vec<u32>,
    pub last_completed_page: u32,
    pub total_pages: u32,
    pub elapsed: Duration,
    /// Can `resume` pick this run up again?
    pub resumable: bool,
}

impl RunSummary {
    pub fn exit_code(&self) -> i32 {
        self.state.exit_code()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} for {:?}", self.state, self.subject_id)?;
        writeln!(
            f,
            "  Pages processed: {} (cursor at {} of {})",
            self.processed_count, self.last_completed_page, self.total_pages
        )?;
        if self.failed_pages.is_empty() {
            writeln!(f, "  Failed pages: none")?;
        } else {
            let pages = self
                .failed_pages
                .iter()
                .map(|page| page.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(f, "  Failed pages: {} ({pages})", self.failed_pages.len())?;
        }
        writeln!(f, "  Elapsed: {}", format_duration(self.elapsed))?;
        if self.resumable {
            write!(
                f,
                "  Resumable: yes (page-ocr resume --subject {:?})",
                self.subject_id
            )
        } else {
            write!(f, "  Resumable: no")
        }
    }
}
