//! Durable, atomic persistence of [`ProgressRecord`]s, one file per subject.

use std::{
    fs,
    io::{self, Write as _},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::prelude::*;

use super::{
    error::StateError,
    record::{ProgressRecord, RunStatus},
};

/// Suffix of every checkpoint file name.
const STATE_FILE_SUFFIX: &str = "_state.json";

/// Turn a subject ID into something safe to use as a file name stem.
///
/// Alphanumerics, `_` and `-` are kept, spaces become `_` after trimming, and
/// everything else becomes `_`.
pub fn safe_file_stem(subject_id: &str) -> String {
    subject_id
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == ' ' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim()
        .replace(' ', "_")
}

/// Just enough of a checkpoint file to see who owns it.
#[derive(Deserialize)]
struct StoredSubject {
    subject_id: String,
}

/// A short description of one checkpoint, for listings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CheckpointSummary {
    pub subject_id: String,
    pub status: RunStatus,
    pub start_page: u32,
    pub last_completed_page: u32,
    pub total_pages: u32,
    pub processed_count: usize,
    pub failed_pages: Vec<u32>,
    pub last_updated_at: DateTime<Utc>,
}

impl From<&ProgressRecord> for CheckpointSummary {
    fn from(record: &ProgressRecord) -> Self {
        Self {
            subject_id: record.subject_id.clone(),
            status: record.status,
            start_page: record.start_page,
            last_completed_page: record.last_completed_page,
            total_pages: record.total_pages,
            processed_count: record.processed_pages.len(),
            failed_pages: record.failed_pages.iter().copied().collect(),
            last_updated_at: record.last_updated_at,
        }
    }
}

/// File-backed checkpoint store.
///
/// The store makes no business decisions, and it does not arbitrate between
/// concurrent writers: only one controller ever runs a given subject.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| {
            StateError::persistence("create directory for", dir.display().to_string(), err)
        })?;
        debug!(dir = %dir.display(), "Opened checkpoint store");
        Ok(Self { dir })
    }

    /// The directory holding our checkpoint files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the checkpoint for `subject_id` lives.
    pub fn path_for(&self, subject_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}", safe_file_stem(subject_id), STATE_FILE_SUFFIX))
    }

    /// Persist `record`, replacing any previous version atomically.
    ///
    /// A crash during this call leaves either the old or the new file on
    /// disk. `last_updated_at` is bumped first if the caller did not already
    /// advance it past the last persisted version.
    #[instrument(level = "debug", skip_all, fields(subject = %record.subject_id))]
    pub fn save(&self, record: &mut ProgressRecord) -> Result<(), StateError> {
        record.advance_for_save();
        let path = self.path_for(&record.subject_id);
        let display = path.display().to_string();
        let json = serde_json::to_vec_pretty(&*record).map_err(|err| {
            StateError::persistence("serialize", display.clone(), io::Error::other(err))
        })?;

        let mut tmp = NamedTempFile::new_in(&self.dir)
            .map_err(|err| StateError::persistence("create temp file for", display.clone(), err))?;
        tmp.write_all(&json)
            .and_then(|()| tmp.write_all(b"\n"))
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|err| StateError::persistence("write", display.clone(), err))?;
        tmp.persist(&path)
            .map_err(|err| StateError::persistence("replace", display.clone(), err.error))?;
        sync_dir(&self.dir)
            .map_err(|err| StateError::persistence("sync directory of", display, err))?;

        record.mark_persisted();
        debug!(
            last_completed_page = record.last_completed_page,
            status = %record.status,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Load the checkpoint for `subject_id`.
    #[instrument(level = "debug", skip(self))]
    pub fn load(&self, subject_id: &str) -> Result<ProgressRecord, StateError> {
        let path = self.path_for(subject_id);
        let display = path.display().to_string();
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StateError::NotFound {
                    subject_id: subject_id.to_owned(),
                });
            }
            Err(err) => return Err(StateError::persistence("read", display, err)),
        };
        let record = serde_json::from_slice::<ProgressRecord>(&data)
            .map_err(|err| StateError::corrupt(display.clone(), err))?;
        if record.subject_id != subject_id {
            return Err(StateError::corrupt(
                display,
                format!("file belongs to subject {:?}", record.subject_id),
            ));
        }
        Ok(record)
    }

    /// Can we resume `subject_id`? True only for a valid, in-progress record.
    pub fn can_resume(&self, subject_id: &str) -> bool {
        match self.load(subject_id) {
            Ok(record) => record.status == RunStatus::InProgress,
            Err(err) => {
                if !err.is_not_found() {
                    warn!("Cannot resume {subject_id:?}: {err}");
                }
                false
            }
        }
    }

    /// Delete the checkpoint for `subject_id`.
    #[instrument(level = "debug", skip(self))]
    pub fn delete(&self, subject_id: &str) -> Result<(), StateError> {
        let path = self.path_for(subject_id);
        let not_found = || StateError::NotFound {
            subject_id: subject_id.to_owned(),
        };
        // Different subjects can share a file name. Only delete our own file.
        // Unparseable files are still deletable.
        match fs::read(&path) {
            Ok(data) => {
                if let Ok(owner) = serde_json::from_slice::<StoredSubject>(&data) {
                    if owner.subject_id != subject_id {
                        warn!(
                            path = %path.display(),
                            owner = %owner.subject_id,
                            "Not deleting another subject's checkpoint"
                        );
                        return Err(not_found());
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(not_found()),
            Err(err) => {
                return Err(StateError::persistence(
                    "read",
                    path.display().to_string(),
                    err,
                ));
            }
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "Deleted checkpoint");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(not_found()),
            Err(err) => Err(StateError::persistence(
                "delete",
                path.display().to_string(),
                err,
            )),
        }
    }

    /// Summaries of every readable checkpoint, in no particular order.
    /// Unreadable files are logged and skipped.
    pub fn list(&self) -> Result<Vec<CheckpointSummary>, StateError> {
        let entries = fs::read_dir(&self.dir).map_err(|err| {
            StateError::persistence("list", self.dir.display().to_string(), err)
        })?;
        let mut summaries = vec![];
        for entry in entries {
            let entry = entry.map_err(|err| {
                StateError::persistence("list", self.dir.display().to_string(), err)
            })?;
            let path = entry.path();
            let is_checkpoint = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(STATE_FILE_SUFFIX));
            if !is_checkpoint {
                continue;
            }
            let parsed = fs::read(&path)
                .map_err(anyhow::Error::from)
                .and_then(|data| {
                    serde_json::from_slice::<ProgressRecord>(&data)
                        .map_err(anyhow::Error::from)
                });
            match parsed {
                Ok(record) => summaries.push(CheckpointSummary::from(&record)),
                Err(err) => warn!(path = %path.display(), "Skipping unreadable checkpoint: {err}"),
            }
        }
        Ok(summaries)
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
