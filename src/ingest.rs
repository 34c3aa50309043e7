//! Ingestion pipeline: dataset directory -> store.
//!
//! Users are processed in name order and their raw files in file-name order.
//! Each accepted activity is committed together with its trackpoints and a
//! `(user, source file)` checkpoint, so a rerun skips exactly the files that
//! were durably written before. An operator-supplied [`ResumeFrom`](crate::config::ResumeFrom) position
//! can additionally skip ahead without touching the store.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{debug, info, warn};
use serde::Serialize;

use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::labels::LabelMatcher;
use crate::segment::{ActivitySegmenter, SegmentOutcome, SourceFile, TRAJECTORY_DIR};
use crate::store::TrajectoryStore;
use crate::User;

/// Counters describing one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub users_seen: usize,
    pub users_created: usize,
    /// Users whose processing stopped on an error
    pub users_failed: Vec<String>,
    pub activities_inserted: usize,
    pub trackpoints_inserted: usize,
    /// Files rejected by the segmenter
    pub files_rejected: usize,
    /// Files skipped because their checkpoint already exists
    pub files_already_ingested: usize,
    /// Files skipped because they precede the resume position
    pub files_before_resume: usize,
}

/// Drives segmentation and persistence for a whole dataset.
pub struct IngestionPipeline<'a, S: TrajectoryStore> {
    store: &'a mut S,
    config: IngestConfig,
}

impl<'a, S: TrajectoryStore> IngestionPipeline<'a, S> {
    pub fn new(store: &'a mut S, config: IngestConfig) -> Self {
        Self { store, config }
    }

    /// Ingest every user directory under the configured data root.
    ///
    /// The configuration is validated first; an invalid one fails the run
    /// before any user is touched.
    pub fn run(&mut self) -> Result<IngestReport> {
        self.config.validate()?;
        let segmenter = ActivitySegmenter::new(&self.config)?;
        let started = Instant::now();
        let labeled = match &self.config.labeled_ids {
            Some(path) => Some(read_labeled_ids(path)?),
            None => None,
        };

        let users = list_user_dirs(&self.config.data_root)?;
        let resume = self.config.resume.clone();
        if let Some(r) = &resume {
            info!(
                "[Ingest] Resuming from user {} activity #{}",
                r.user_id, r.activity
            );
        }

        let mut report = IngestReport::default();
        let mut resume_user_found = false;
        for (user_id, user_dir) in users {
            if let Some(r) = &resume {
                if user_id < r.user_id {
                    continue;
                }
                resume_user_found |= user_id == r.user_id;
            }
            report.users_seen += 1;

            let has_labels = match &labeled {
                Some(ids) => ids.contains(&user_id),
                None => LabelMatcher::path_for(&user_dir).is_file(),
            };
            let user = User {
                id: user_id.clone(),
                has_labels,
            };
            let first_position = match &resume {
                Some(r) if r.user_id == user_id => r.activity,
                _ => 1,
            };

            if let Err(e) =
                self.ingest_user(&segmenter, &user, &user_dir, first_position, &mut report)
            {
                warn!("[Ingest] User {} failed: {}", user_id, e);
                report.users_failed.push(user_id);
            }
        }

        if let Some(r) = resume.as_ref().filter(|_| !resume_user_found) {
            warn!(
                "[Ingest] Resume user {} not found under {}; users sorting before it were skipped",
                r.user_id,
                self.config.data_root.display()
            );
        }

        info!(
            "[Ingest] Done in {:.1}s: {} users, {} activities, {} trackpoints, {} rejected, {} already ingested, {} failed users",
            started.elapsed().as_secs_f64(),
            report.users_seen,
            report.activities_inserted,
            report.trackpoints_inserted,
            report.files_rejected,
            report.files_already_ingested,
            report.users_failed.len()
        );
        Ok(report)
    }

    /// Ingest one user's files starting at the given 1-indexed position.
    fn ingest_user(
        &mut self,
        segmenter: &ActivitySegmenter,
        user: &User,
        user_dir: &Path,
        first_position: usize,
        report: &mut IngestReport,
    ) -> Result<()> {
        if self.store.ensure_user(user)? {
            report.users_created += 1;
        }

        let labels = match LabelMatcher::load(&LabelMatcher::path_for(user_dir)) {
            Ok(labels) => labels,
            Err(e) => {
                warn!("[Ingest] Ignoring labels of user {}: {}", user.id, e);
                LabelMatcher::empty()
            }
        };

        let files = ActivitySegmenter::source_files(user_dir)?;
        let (mut inserted, mut rejected) = (0usize, 0usize);
        for file in &files {
            if file.position < first_position {
                report.files_before_resume += 1;
                continue;
            }
            if self.store.is_ingested(&user.id, &file.source_id)? {
                report.files_already_ingested += 1;
                continue;
            }
            match segmenter.segment_file(file, &labels) {
                SegmentOutcome::Accepted(draft) => {
                    let activity = self.store.save_activity(&user.id, &draft).map_err(|e| {
                        warn!(
                            "[Ingest] Write failed for {}: {}",
                            describe(user, file),
                            e
                        );
                        e
                    })?;
                    inserted += 1;
                    report.activities_inserted += 1;
                    report.trackpoints_inserted += draft.points.len();
                    debug!(
                        "[Ingest] {} -> activity {} ({:?})",
                        describe(user, file),
                        activity.id,
                        activity.transportation_mode
                    );
                }
                SegmentOutcome::Rejected(_) => {
                    rejected += 1;
                    report.files_rejected += 1;
                }
            }
        }

        info!(
            "[Ingest] User {}: {} files, {} inserted, {} rejected",
            user.id,
            files.len(),
            inserted,
            rejected
        );
        Ok(())
    }
}

fn describe(user: &User, file: &SourceFile) -> String {
    format!("{}/{} (#{})", user.id, file.source_id, file.position)
}

/// User directories (those containing a trajectory folder), sorted by name.
pub fn list_user_dirs(data_root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = fs::read_dir(data_root).map_err(|e| IngestError::io(data_root, e))?;
    let mut users = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| IngestError::io(data_root, e))?;
        let path = entry.path();
        if !path.join(TRAJECTORY_DIR).is_dir() {
            continue;
        }
        users.push((entry.file_name().to_string_lossy().into_owned(), path));
    }
    users.sort();
    Ok(users)
}

fn read_labeled_ids(path: &Path) -> Result<HashSet<String>> {
    let text = fs::read_to_string(path).map_err(|e| IngestError::io(path, e))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}
