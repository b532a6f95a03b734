//! Backend modules wrapping the external tools of a run.
//!
//! Currently the following backends are implemented:
//!
//! - [DatabaseDump]: Dump of the Nextcloud database.
//! - [Mirror]: Copy of the web root and the data directory using `rsync`.
//! - [ResticRepository]: Deduplicated snapshots of the above using `restic`.
//!
//! [backup_steps] and [restore_steps] arrange them into the fixed order of
//! a run.

pub mod database;
pub mod mirror;
pub mod repository;
pub mod restic;

use std::path::Path;

pub use database::DatabaseDump;
pub use mirror::Mirror;
pub use repository::{PruneSnapshots, PutSnapshot, RepoError, RestoreSnapshot, SnapshotRepository};
pub use restic::ResticRepository;

use crate::config::BackupConfig;
use crate::pipeline::{Step, StepKind};

/// Repository tag of the web root snapshots.
pub const WEBUI_TAG: &str = "webui-backup";
/// Repository tag of the data directory snapshots.
pub const DATA_TAG: &str = "data-backup";
/// Repository tag of the database dump snapshots.
pub const DATABASE_TAG: &str = "database-backup";

/// Steps of a backup run.
///
/// Every artifact is produced before it is snapshotted and every snapshot
/// is taken before the repository is pruned. All steps are critical.
pub fn backup_steps<'a>(
    config: &'a BackupConfig,
    repository: &'a dyn SnapshotRepository,
) -> Vec<Step<'a>> {
    let destination = &config.destination;
    let sources = &config.sources;
    let dump = DatabaseDump::new(&config.database, destination.database_dir());
    let dump_file = dump.dump_file();

    vec![
        Step::new("dump-database", StepKind::Command, dump),
        Step::new(
            "mirror-webui",
            StepKind::Transfer,
            Mirror::new(
                sources.webui.clone(),
                destination.webui_dir(),
                &sources.rsync_command,
            ),
        ),
        Step::new(
            "mirror-data",
            StepKind::Transfer,
            Mirror::new(
                sources.data.clone(),
                destination.data_dir(),
                &sources.rsync_command,
            ),
        ),
        Step::new(
            "snapshot-webui",
            StepKind::SnapshotPut,
            PutSnapshot::new(repository, destination.webui_dir(), WEBUI_TAG),
        ),
        Step::new(
            "snapshot-data",
            StepKind::SnapshotPut,
            PutSnapshot::new(repository, destination.data_dir(), DATA_TAG),
        ),
        Step::new(
            "snapshot-database",
            StepKind::SnapshotPut,
            PutSnapshot::new(repository, dump_file, DATABASE_TAG),
        ),
        Step::new(
            "prune",
            StepKind::SnapshotPrune,
            PruneSnapshots::new(repository, config.retention),
        ),
    ]
}

/// Steps of a restore run.
///
/// The latest snapshot of every tag is restored into its own directory
/// below `staging`. Live data is never touched and nothing is pruned.
pub fn restore_steps<'a>(
    repository: &'a dyn SnapshotRepository,
    staging: &Path,
) -> Vec<Step<'a>> {
    [
        ("restore-database", DATABASE_TAG),
        ("restore-webui", WEBUI_TAG),
        ("restore-data", DATA_TAG),
    ]
    .into_iter()
    .map(|(name, tag)| {
        Step::new(
            name,
            StepKind::Transfer,
            RestoreSnapshot::new(repository, tag, staging.join(tag)),
        )
    })
    .collect()
}
