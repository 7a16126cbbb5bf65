//! Translation of operations into tool invocations.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::config::AppConfig;
use crate::error::{JobError, SpawnError};
use crate::jobs::{Job, JobKind, JobOptions, MaintenanceOp};
use crate::tasks::parser::ParseMode;

/// Answer the tool requires on stdin before it destroys every archive.
const PURGE_CONFIRMATION: &str = "No Tomorrow\n";

/// Progress report interval passed to backups, in bytes.
const PROGRESS_BYTES: u64 = 1024 * 1024;

/// Extraction flags for a restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Extract into this directory instead of the original locations.
    pub restore_dir: Option<PathBuf>,
    pub overwrite: bool,
    pub keep_newer: bool,
    /// Keep absolute paths as stored.
    pub preserve_paths: bool,
    /// Restrict extraction to these members (all when empty).
    pub files: Vec<String>,
}

impl RestoreOptions {
    pub fn from_job_options(options: &JobOptions) -> Self {
        Self {
            restore_dir: options.restore_dir(),
            overwrite: options.overwrite(),
            keep_newer: options.keep_newer(),
            preserve_paths: options.preserve_paths(),
            files: Vec::new(),
        }
    }
}

/// A single tool operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Backup {
        archive: String,
        sources: Vec<PathBuf>,
        excludes: Vec<String>,
        dry_run: bool,
    },
    Restore {
        archive: String,
        options: RestoreOptions,
    },
    ListArchives,
    ArchiveStats {
        archive: String,
    },
    ArchiveContents {
        archive: String,
    },
    DeleteArchives {
        archives: Vec<String>,
    },
    /// Rebuild the local cache from server state.
    RepairCache {
        prune: bool,
    },
    /// Delete every archive of the machine.
    Purge,
    OverallStats,
    Version,
}

impl Operation {
    /// The operation a job run performs.
    pub fn for_job(job: &Job, options: &JobOptions, now: DateTime<Utc>) -> Result<Self, JobError> {
        Ok(match job.kind {
            JobKind::Backup => Self::Backup {
                archive: job.archive_name(options, now),
                sources: job.sources.clone(),
                excludes: options.excludes(),
                dry_run: options.dry_run(),
            },
            JobKind::Restore => Self::Restore {
                archive: job
                    .archive
                    .clone()
                    .ok_or_else(|| JobError::Invalid(format!("restore job '{}' has no archive", job.name)))?,
                options: RestoreOptions::from_job_options(options),
            },
            JobKind::Maintenance => match options.maintenance_op()? {
                MaintenanceOp::Fsck => Self::RepairCache { prune: false },
                MaintenanceOp::FsckPrune => Self::RepairCache { prune: true },
                MaintenanceOp::ListArchives => Self::ListArchives,
                MaintenanceOp::PrintStats => Self::OverallStats,
            },
        })
    }

    /// Scheduling class. Everything except backups and restores is maintenance.
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Backup { .. } => JobKind::Backup,
            Self::Restore { .. } => JobKind::Restore,
            _ => JobKind::Maintenance,
        }
    }

    pub fn parse_mode(&self) -> ParseMode {
        match self {
            Self::ListArchives => ParseMode::Listing,
            Self::ArchiveContents { .. } => ParseMode::Contents,
            Self::Version => ParseMode::Version,
            _ => ParseMode::Generic,
        }
    }

    /// Human readable task label.
    pub fn label(&self) -> String {
        match self {
            Self::Backup { archive, .. } => format!("Backup {archive}"),
            Self::Restore { archive, .. } => format!("Restore {archive}"),
            Self::ListArchives => "List archives".to_string(),
            Self::ArchiveStats { archive } => format!("Stats for {archive}"),
            Self::ArchiveContents { archive } => format!("Contents of {archive}"),
            Self::DeleteArchives { archives } => match archives.as_slice() {
                [one] => format!("Delete {one}"),
                many => format!("Delete {} archives", many.len()),
            },
            Self::RepairCache { prune: false } => "Repair cache".to_string(),
            Self::RepairCache { prune: true } => "Repair cache (prune)".to_string(),
            Self::Purge => "Purge all archives".to_string(),
            Self::OverallStats => "Overall stats".to_string(),
            Self::Version => "Tool version".to_string(),
        }
    }

    /// Build the concrete invocation.
    pub fn build(&self, config: &AppConfig) -> Result<CommandSpec, SpawnError> {
        let program = config.tool_path.to_string_lossy().into_owned();
        let mut args: Vec<String> = Vec::new();
        let mut stdin = None;

        if !matches!(self, Self::Version) {
            if let Some(key) = &config.key_file {
                args.push("--keyfile".into());
                args.push(key.to_string_lossy().into_owned());
            }
            if let Some(cache) = &config.cache_dir {
                args.push("--cachedir".into());
                args.push(cache.to_string_lossy().into_owned());
            }
        }

        match self {
            Self::Backup {
                archive,
                sources,
                excludes,
                dry_run,
            } => {
                args.extend(["-c".into(), "-f".into(), archive.clone()]);
                args.push("--print-stats".into());
                args.extend(["--progress-bytes".into(), PROGRESS_BYTES.to_string()]);
                for pattern in excludes {
                    args.extend(["--exclude".into(), pattern.clone()]);
                }
                if *dry_run {
                    args.push("--dry-run".into());
                }
                args.extend(sources.iter().map(|p| p.to_string_lossy().into_owned()));
            }
            Self::Restore { archive, options } => {
                args.extend(["-x".into(), "-f".into(), archive.clone()]);
                if let Some(dir) = &options.restore_dir {
                    args.extend(["-C".into(), dir.to_string_lossy().into_owned()]);
                }
                if !options.overwrite {
                    args.push("-k".into());
                } else if options.keep_newer {
                    args.push("--keep-newer-files".into());
                }
                if options.preserve_paths {
                    args.push("-P".into());
                }
                args.extend(options.files.iter().cloned());
            }
            Self::ListArchives => args.extend(["--list-archives".into(), "-vv".into()]),
            Self::ArchiveStats { archive } => {
                args.extend(["--print-stats".into(), "-f".into(), archive.clone()]);
            }
            Self::ArchiveContents { archive } => {
                args.extend(["-t".into(), "-v".into(), "-f".into(), archive.clone()]);
            }
            Self::DeleteArchives { archives } => {
                if archives.is_empty() {
                    return Err(SpawnError::InvalidArgument {
                        program,
                        reason: "no archives to delete".into(),
                    });
                }
                args.push("-d".into());
                for archive in archives {
                    args.extend(["-f".into(), archive.clone()]);
                }
            }
            Self::RepairCache { prune } => args.push(if *prune {
                "--fsck-prune".into()
            } else {
                "--fsck".into()
            }),
            Self::Purge => {
                args.push("--nuke".into());
                stdin = Some(PURGE_CONFIRMATION.to_string());
            }
            Self::OverallStats => args.push("--print-stats".into()),
            Self::Version => args.push("--version".into()),
        }

        if let Some(bad) = args.iter().find(|a| a.contains('\0')) {
            return Err(SpawnError::InvalidArgument {
                program,
                reason: format!("argument contains NUL byte: {bad:?}"),
            });
        }

        Ok(CommandSpec {
            program,
            args,
            stdin,
            working_dir: None,
        })
    }
}

/// A fully resolved process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
    pub working_dir: Option<PathBuf>,
}
