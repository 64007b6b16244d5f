//! Progress, throughput and ETA figures derived from a [`ProgressRecord`].
//!
//! Everything here is pure: callers pass in the record, the per-page timings
//! they measured and (where needed) the current time. Identical inputs always
//! produce identical outputs.

use std::{collections::VecDeque, fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::state::{ProgressRecord, RunStatus};

/// How many recent page durations feed the moving average.
pub const AVERAGE_WINDOW: usize = 10;

/// The largest percentage we report while a run is still in progress.
const IN_PROGRESS_CEILING: f64 = 99.9;

/// Bad input to one of our estimators.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProgressError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Durations of recently completed pages, measured by the caller.
///
/// Only the last [`AVERAGE_WINDOW`] durations are kept.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PageTimings {
    recent: VecDeque<Duration>,
    timed_pages: usize,
}

impl PageTimings {
    /// Build timings from a sequence of durations, oldest first.
    #[cfg(test)]
    pub fn from_durations(durations: impl IntoIterator<Item = Duration>) -> Self {
        let mut timings = Self::default();
        for duration in durations {
            timings.record(duration);
        }
        timings
    }

    /// Record how long one page took.
    pub fn record(&mut self, duration: Duration) {
        if self.recent.len() == AVERAGE_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(duration);
        self.timed_pages += 1;
    }

    /// How many pages have been timed in total?
    pub fn timed_pages(&self) -> usize {
        self.timed_pages
    }
}

/// A transient view of a run, published to progress sinks. Never stored.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressSample {
    pub record: ProgressRecord,
    pub elapsed: Duration,
    pub timings: PageTimings,
}

/// Estimated time remaining.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Remaining {
    /// Not enough data yet. Deliberately not zero.
    Unknown,
    Estimated(Duration),
}

impl fmt::Display for Remaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Remaining::Unknown => write!(f, "Calculating..."),
            Remaining::Estimated(duration) => write!(f, "{}", format_duration(*duration)),
        }
    }
}

fn check_range(record: &ProgressRecord) -> Result<(), ProgressError> {
    if record.total_pages == 0 {
        return Err(ProgressError::InvalidArgument(
            "total_pages must be at least 1".to_owned(),
        ));
    }
    if record.start_page == 0 || record.start_page > record.total_pages {
        return Err(ProgressError::InvalidArgument(format!(
            "start_page {} is outside 1..={}",
            record.start_page, record.total_pages
        )));
    }
    Ok(())
}

/// Percentage of the page range that has reached a terminal outcome.
///
/// Zero before any page concludes. A run that is still in progress never
/// reports 100.
pub fn percentage(record: &ProgressRecord) -> Result<f64, ProgressError> {
    check_range(record)?;
    let done = f64::from(record.pages_concluded());
    let pct = (100.0 * done / f64::from(record.pages_in_range())).min(100.0);
    if record.status == RunStatus::InProgress {
        Ok(pct.min(IN_PROGRESS_CEILING))
    } else {
        Ok(pct)
    }
}

/// Simple mean of the last [`AVERAGE_WINDOW`] page durations.
pub fn average_page_duration(timings: &PageTimings) -> Option<Duration> {
    if timings.recent.is_empty() {
        return None;
    }
    let total: Duration = timings.recent.iter().sum();
    Some(total / timings.recent.len() as u32)
}

/// Throughput derived from [`average_page_duration`].
pub fn pages_per_minute(timings: &PageTimings) -> Option<f64> {
    average_page_duration(timings)
        .filter(|avg| !avg.is_zero())
        .map(|avg| 60.0 / avg.as_secs_f64())
}

/// Remaining pages times the average page duration.
pub fn estimate_remaining(
    record: &ProgressRecord,
    timings: &PageTimings,
) -> Result<Remaining, ProgressError> {
    check_range(record)?;
    let Some(avg) = average_page_duration(timings) else {
        return Ok(Remaining::Unknown);
    };
    let remaining_pages = record.total_pages.saturating_sub(record.last_completed_page);
    Ok(Remaining::Estimated(
        avg.checked_mul(remaining_pages).unwrap_or(Duration::MAX),
    ))
}

/// Wall-clock time since the record was first created.
pub fn elapsed(record: &ProgressRecord, now: DateTime<Utc>) -> Duration {
    (now - record.started_at).to_std().unwrap_or_default()
}

/// Render a text progress bar like `[█████░░░░░] 50.0%`.
pub fn render_bar(percentage: f64, width: i32) -> Result<String, ProgressError> {
    if width < 0 {
        return Err(ProgressError::InvalidArgument(format!(
            "bar width {width} is negative"
        )));
    }
    if !(0.0..=100.0).contains(&percentage) {
        return Err(ProgressError::InvalidArgument(format!(
            "percentage {percentage} is outside 0..=100"
        )));
    }
    let width = width as usize;
    let filled = ((width as f64) * percentage / 100.0).floor() as usize;
    Ok(format!(
        "[{}{}] {:.1}%",
        "█".repeat(filled),
        "░".repeat(width - filled),
        percentage
    ))
}

/// Format a duration as `1h 2m 3s`, `2m 3s` or `3s`.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Named progress metrics, for display and logging.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressSummary {
    pub subject_id: String,
    pub current_page: u32,
    pub total_pages: u32,
    pub progress_percentage: f64,
    pub elapsed: String,
    pub elapsed_secs: f64,
    pub remaining: Option<String>,
    pub remaining_secs: Option<f64>,
    pub average_page_secs: Option<f64>,
    pub pages_per_minute: Option<f64>,
    pub failed_pages_count: usize,
    pub failed_pages: Vec<u32>,
    /// Pages timed during this session.
    pub timed_pages: usize,
}

impl ProgressSummary {
    /// Flatten into a JSON object keyed by metric name.
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Compute every metric for a sample.
pub fn summary(sample: &ProgressSample) -> Result<ProgressSummary, ProgressError> {
    let record = &sample.record;
    let remaining = match estimate_remaining(record, &sample.timings)? {
        Remaining::Unknown => None,
        Remaining::Estimated(duration) => Some(duration),
    };
    Ok(ProgressSummary {
        subject_id: record.subject_id.clone(),
        current_page: record.last_completed_page,
        total_pages: record.total_pages,
        progress_percentage: percentage(record)?,
        elapsed: format_duration(sample.elapsed),
        elapsed_secs: sample.elapsed.as_secs_f64(),
        remaining: remaining.map(format_duration),
        remaining_secs: remaining.map(|d| d.as_secs_f64()),
        average_page_secs: average_page_duration(&sample.timings).map(|d| d.as_secs_f64()),
        pages_per_minute: pages_per_minute(&sample.timings),
        failed_pages_count: record.failed_pages.len(),
        failed_pages: record.failed_pages.iter().copied().collect(),
        timed_pages: sample.timings.timed_pages(),
    })
}

/// Human-readable progress lines. `verbose` adds throughput and failures.
pub fn display_lines(sample: &ProgressSample, verbose: bool) -> Result<String, ProgressError> {
    let record = &sample.record;
    let mut lines = vec![
        format!(
            "Progress: {}/{} pages ({:.1}%)",
            record.last_completed_page,
            record.total_pages,
            percentage(record)?
        ),
        format!("Elapsed: {}", format_duration(sample.elapsed)),
        format!(
            "Remaining: {}",
            estimate_remaining(record, &sample.timings)?
        ),
    ];
    if verbose {
        if let Some(avg) = average_page_duration(&sample.timings) {
            lines.push(format!("Avg time per page: {:.2}s", avg.as_secs_f64()));
        }
        if let Some(ppm) = pages_per_minute(&sample.timings) {
            lines.push(format!("Pages per minute: {ppm:.1}"));
        }
        if !record.failed_pages.is_empty() {
            lines.push(format!("Failed pages: {}", record.failed_pages.len()));
        }
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(total_pages: u32, start_page: u32) -> ProgressRecord {
        ProgressRecord::new("book", total_pages, start_page, "out.txt", "shots")
            .unwrap()
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn percentage_is_zero_before_any_page() {
        assert_eq!(percentage(&record(10, 1)).unwrap(), 0.0);
        assert_eq!(percentage(&record(10, 4)).unwrap(), 0.0);
    }

    #[test]
    fn percentage_is_monotonic_in_cursor() {
        let mut r = record(7, 2);
        let mut last = percentage(&r).unwrap();
        for page in 2..=7 {
            if page % 3 == 0 {
                r.mark_failed(page);
            } else {
                r.mark_processed(page);
            }
            let pct = percentage(&r).unwrap();
            assert!(pct >= last, "{pct} < {last} at page {page}");
            last = pct;
        }
    }

    #[test]
    fn percentage_reaches_100_only_when_finished() {
        let mut r = record(4, 1);
        for page in 1..=4 {
            r.mark_processed(page);
        }
        assert!(percentage(&r).unwrap() < 100.0);
        r.set_status(RunStatus::Completed);
        assert_eq!(percentage(&r).unwrap(), 100.0);
    }

    #[test]
    fn percentage_uses_the_page_range() {
        let mut r = record(10, 6);
        r.mark_processed(6);
        assert_eq!(percentage(&r).unwrap(), 20.0);
    }

    #[test]
    fn zero_total_pages_is_invalid() {
        let mut r = record(1, 1);
        r.total_pages = 0;
        assert!(matches!(
            percentage(&r),
            Err(ProgressError::InvalidArgument(_))
        ));
        assert!(estimate_remaining(&r, &PageTimings::default()).is_err());
    }

    #[test]
    fn remaining_is_unknown_without_samples() {
        let r = record(10, 1);
        assert_eq!(
            estimate_remaining(&r, &PageTimings::default()).unwrap(),
            Remaining::Unknown
        );
        assert_eq!(Remaining::Unknown.to_string(), "Calculating...");
    }

    #[test]
    fn remaining_uses_mean_of_recent_pages() {
        let mut r = record(10, 1);
        r.mark_processed(1);
        r.mark_processed(2);
        let timings = PageTimings::from_durations([secs(2), secs(4)]);
        assert_eq!(average_page_duration(&timings), Some(secs(3)));
        assert_eq!(
            estimate_remaining(&r, &timings).unwrap(),
            Remaining::Estimated(secs(24))
        );
        assert_eq!(pages_per_minute(&timings), Some(20.0));
    }

    #[test]
    fn moving_average_forgets_old_pages() {
        let mut durations = vec![secs(100); 5];
        durations.extend(vec![secs(1); AVERAGE_WINDOW]);
        let timings = PageTimings::from_durations(durations);
        assert_eq!(timings.timed_pages(), 5 + AVERAGE_WINDOW);
        assert_eq!(average_page_duration(&timings), Some(secs(1)));
    }

    #[test]
    fn render_bar_fills_proportionally() {
        assert_eq!(render_bar(50.0, 10).unwrap(), "[█████░░░░░] 50.0%");
        assert_eq!(render_bar(0.0, 4).unwrap(), "[░░░░] 0.0%");
        assert_eq!(render_bar(100.0, 4).unwrap(), "[████] 100.0%");
        assert_eq!(render_bar(42.0, 0).unwrap(), "[] 42.0%");
    }

    #[test]
    fn render_bar_rejects_bad_input() {
        assert!(render_bar(50.0, -1).is_err());
        assert!(render_bar(101.0, 10).is_err());
        assert!(render_bar(f64::NAN, 10).is_err());
    }

    #[test]
    fn format_duration_picks_largest_unit() {
        assert_eq!(format_duration(secs(5)), "5s");
        assert_eq!(format_duration(secs(65)), "1m 5s");
        assert_eq!(format_duration(secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn elapsed_is_measured_from_start() {
        let r = record(3, 1);
        let now = r.started_at + chrono::Duration::seconds(90);
        assert_eq!(elapsed(&r, now), secs(90));
        let before = r.started_at - chrono::Duration::seconds(1);
        assert_eq!(elapsed(&r, before), Duration::ZERO);
    }

    #[test]
    fn summary_is_deterministic() {
        let mut r = record(10, 1);
        r.mark_processed(1);
        r.mark_failed(2);
        let sample = ProgressSample {
            record: r,
            elapsed: secs(30),
            timings: PageTimings::from_durations([secs(10)]),
        };
        let a = summary(&sample).unwrap();
        let b = summary(&sample).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.progress_percentage, 20.0);
        assert_eq!(a.remaining.as_deref(), Some("1m 20s"));
        assert_eq!(a.failed_pages, vec![2]);

        let map = a.to_map();
        assert_eq!(map["current_page"], Value::from(2));
        assert_eq!(map["failed_pages_count"], Value::from(1));
    }

    #[test]
    fn display_lines_include_verbose_details() {
        let mut r = record(4, 1);
        r.mark_failed(1);
        let sample = ProgressSample {
            record: r,
            elapsed: secs(3),
            timings: PageTimings::default(),
        };
        let text = display_lines(&sample, true).unwrap();
        assert!(text.contains("Progress: 1/4 pages (25.0%)"));
        assert!(text.contains("Remaining: Calculating..."));
        assert!(text.contains("Failed pages: 1"));
    }
}
