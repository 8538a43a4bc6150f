//! Structural repository verification and repair.
//!
//! `check` walks every committed segment verifying the header magic and
//! every entry's CRC and size, then cross-checks the in-memory index
//! against what replay would produce. `repair` additionally salvages the
//! readable entries of damaged segments and rebuilds index and hints from
//! scratch. A bounded check persists its position and resumes from there
//! on the next run. Object decryption lives a layer up, with the key.

use std::fs;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use cairn_types::error::{CairnError, Result};

use super::index::{write_atomic, Hints, RepoIndex};
use super::segment::{LogEntry, SegmentScan, SegmentWriter};
use super::{Access, Repository};

const CHECK_STATE_FILE: &str = "check_state";

#[derive(Debug, Serialize, Deserialize)]
struct CheckState {
    /// Last fully verified segment number.
    last_segment: u64,
}

#[derive(Debug, Default, Clone)]
pub struct RepoCheckOptions {
    /// Salvage readable entries and rebuild the index.
    pub repair: bool,
    /// Bound the check; progress is persisted and resumed next run.
    /// Ignored when `repair` is set.
    pub max_duration: Option<Duration>,
}

#[derive(Debug)]
pub struct CheckIssue {
    pub segment: u64,
    pub offset: Option<u64>,
    pub message: String,
}

#[derive(Debug)]
pub struct RepoCheckReport {
    pub segments_checked: usize,
    pub entries_checked: u64,
    /// False when a bounded run stopped early.
    pub completed: bool,
    pub issues: Vec<CheckIssue>,
}

impl RepoCheckReport {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

impl Repository {
    /// Verify segment structure; optionally repair.
    pub fn check(&mut self, opts: &RepoCheckOptions) -> Result<RepoCheckReport> {
        if opts.repair {
            self.require_writable_for_repair()?;
            return self.repair_segments();
        }

        let started = Instant::now();
        let resume_after = match opts.max_duration {
            Some(_) => self.load_check_state()?,
            None => None,
        };
        let Some(committed) = self.committed_segment() else {
            self.clear_check_state();
            return Ok(RepoCheckReport {
                segments_checked: 0,
                entries_checked: 0,
                completed: true,
                issues: Vec::new(),
            });
        };

        let mut report = RepoCheckReport {
            segments_checked: 0,
            entries_checked: 0,
            completed: true,
            issues: Vec::new(),
        };
        let mut rebuilt = RepoIndex::new();
        let mut last_checked = resume_after;

        let segments: Vec<u64> = self
            .list_segments()?
            .into_iter()
            .filter(|&seg| seg <= committed)
            .filter(|&seg| resume_after.map_or(true, |after| seg > after))
            .collect();

        for seg in segments {
            self.check_one_segment(seg, &mut report, Some(&mut rebuilt))?;
            report.segments_checked += 1;
            last_checked = Some(seg);

            if let Some(max) = opts.max_duration {
                if started.elapsed() >= max {
                    report.completed = false;
                    break;
                }
            }
        }

        if report.completed {
            // Cross-check the index only when this run (not a resumed
            // partial pass) saw every segment.
            if resume_after.is_none() {
                for (id, loc) in self.index().iter() {
                    match rebuilt.get(id) {
                        Some(actual) if actual == *loc => {}
                        Some(_) => report.issues.push(CheckIssue {
                            segment: loc.segment,
                            offset: Some(loc.offset),
                            message: format!("index entry for {id} does not match segment contents"),
                        }),
                        None => report.issues.push(CheckIssue {
                            segment: loc.segment,
                            offset: Some(loc.offset),
                            message: format!("index references {id} but no live PUT exists"),
                        }),
                    }
                }
            }
            self.clear_check_state();
        } else if let Some(seg) = last_checked {
            self.save_check_state(seg)?;
            info!(
                last_segment = seg,
                "partial check paused; next run resumes after this segment"
            );
        }

        Ok(report)
    }

    fn require_writable_for_repair(&self) -> Result<()> {
        if self.access != Access::ReadWrite {
            return Err(CairnError::Other(
                "repair requires a read-write repository".into(),
            ));
        }
        Ok(())
    }

    /// Scan one segment, recording issues. When `rebuilt` is given, replay
    /// its entries into it for the final index cross-check.
    fn check_one_segment(
        &self,
        seg: u64,
        report: &mut RepoCheckReport,
        mut rebuilt: Option<&mut RepoIndex>,
    ) -> Result<()> {
        let path = self.segment_path(seg);
        let mut scan = match SegmentScan::open(&path, seg) {
            Ok(scan) => scan,
            Err(CairnError::UnknownSegmentMagic { .. }) => {
                report.issues.push(CheckIssue {
                    segment: seg,
                    offset: None,
                    message: "unknown magic or unsupported version".into(),
                });
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        loop {
            match scan.next_entry() {
                Ok(Some((offset, entry))) => {
                    report.entries_checked += 1;
                    if let Some(rebuilt) = rebuilt.as_deref_mut() {
                        match entry {
                            LogEntry::Put { id, payload } => {
                                rebuilt.insert(
                                    id,
                                    super::index::Location {
                                        segment: seg,
                                        offset,
                                        size: super::segment::put_entry_size(payload.len() as u64),
                                    },
                                );
                            }
                            LogEntry::Delete { id } => {
                                rebuilt.remove(&id);
                            }
                            LogEntry::Commit => {}
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    report.issues.push(CheckIssue {
                        segment: seg,
                        offset: match &e {
                            CairnError::CrcMismatch { offset, .. } => Some(*offset),
                            _ => None,
                        },
                        message: e.to_string(),
                    });
                    // Framing is untrustworthy past the first error.
                    break;
                }
            }
        }
        Ok(())
    }

    /// Salvage pass: rewrite damaged segments keeping readable entries,
    /// then rebuild index and hints by full replay and persist them.
    fn repair_segments(&mut self) -> Result<RepoCheckReport> {
        let Some(committed) = self.committed_segment() else {
            return Ok(RepoCheckReport {
                segments_checked: 0,
                entries_checked: 0,
                completed: true,
                issues: Vec::new(),
            });
        };

        let mut report = RepoCheckReport {
            segments_checked: 0,
            entries_checked: 0,
            completed: true,
            issues: Vec::new(),
        };

        let segments: Vec<u64> = self
            .list_segments()?
            .into_iter()
            .filter(|&seg| seg <= committed)
            .collect();

        for seg in &segments {
            self.salvage_segment(*seg, &mut report)?;
            report.segments_checked += 1;
        }

        // Rebuild from the salvaged log.
        self.index = RepoIndex::new();
        self.hints = Hints::default();
        for seg in &segments {
            self.replay_segment(*seg, None)?;
        }
        write_atomic(
            &self.path.join(format!("index.{committed}")),
            &rmp_serde::to_vec(&self.index)?,
        )?;
        write_atomic(
            &self.path.join(format!("hints.{committed}")),
            &rmp_serde::to_vec(&self.hints)?,
        )?;
        self.clear_check_state();

        Ok(report)
    }

    /// Rewrite one segment keeping every entry that still parses. No-op
    /// for clean segments.
    fn salvage_segment(&mut self, seg: u64, report: &mut RepoCheckReport) -> Result<()> {
        let path = self.segment_path(seg);
        let mut scan = match SegmentScan::open(&path, seg) {
            Ok(scan) => scan,
            Err(CairnError::UnknownSegmentMagic { .. }) => {
                // Nothing salvageable without a valid header.
                warn!(segment = seg, "removing segment with unknown magic");
                report.issues.push(CheckIssue {
                    segment: seg,
                    offset: None,
                    message: "unknown magic; segment removed".into(),
                });
                fs::remove_file(&path)?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut entries: Vec<LogEntry> = Vec::new();
        let mut damaged = false;
        loop {
            match scan.next_entry() {
                Ok(Some((_, entry))) => {
                    report.entries_checked += 1;
                    entries.push(entry);
                }
                Ok(None) => break,
                Err(e) => {
                    damaged = true;
                    report.issues.push(CheckIssue {
                        segment: seg,
                        offset: match &e {
                            CairnError::CrcMismatch { offset, .. } => Some(*offset),
                            _ => None,
                        },
                        message: format!("{e}; salvaging remaining entries"),
                    });
                    // Positions the scan at the next parsable entry, or at
                    // end of file, where the loop terminates cleanly.
                    scan.resync();
                }
            }
        }

        if !damaged {
            return Ok(());
        }

        warn!(
            segment = seg,
            salvaged = entries.len(),
            "rewriting damaged segment"
        );
        let tmp = path.with_extension("salvage");
        let _ = fs::remove_file(&tmp);
        let mut writer = SegmentWriter::create(&tmp, seg)?;
        for entry in &entries {
            match entry {
                LogEntry::Put { id, payload } => {
                    writer.put(id, payload)?;
                }
                LogEntry::Delete { id } => {
                    writer.delete(id)?;
                }
                LogEntry::Commit => {
                    writer.commit()?;
                }
            }
        }
        writer.sync()?;
        drop(writer);
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    // ----- partial-check cursor -----

    fn check_state_path(&self) -> std::path::PathBuf {
        self.path.join(CHECK_STATE_FILE)
    }

    fn load_check_state(&self) -> Result<Option<u64>> {
        match fs::read(self.check_state_path()) {
            Ok(data) => {
                let state: CheckState = rmp_serde::from_slice(&data)?;
                Ok(Some(state.last_segment))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save_check_state(&self, last_segment: u64) -> Result<()> {
        write_atomic(
            &self.check_state_path(),
            &rmp_serde::to_vec(&CheckState { last_segment })?,
        )
    }

    fn clear_check_state(&self) {
        let _ = fs::remove_file(self.check_state_path());
    }
}
