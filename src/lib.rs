//! Library to backup your [Nextcloud][nc] installation into a [restic][restic]
//! repository.
//!
//! A run verifies that the backup destination is mounted, dumps the
//! database, mirrors the web root and the data directory and stores all
//! three as tagged snapshots before old snapshots are pruned. The result is
//! reported by email. The individual tools are wrapped in the [`backends`]
//! module, their sequencing lives in [`pipeline`].
//!
//! [nc]: https://nextcloud.com/
//! [restic]: https://restic.net/

#![forbid(unsafe_code)]

pub mod backends;
pub mod cli;
pub mod config;
pub mod mount;
pub mod notify;
pub mod orchestrator;
pub mod pipeline;
pub mod signal;
pub mod util;
