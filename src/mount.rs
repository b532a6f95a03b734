//! Precondition check that the backup destination is really mounted.
//!
//! The check reads the kernel's mount table instead of testing whether the
//! path exists: a network share that dropped leaves an empty directory
//! behind, and writing the backup into it would fill the root filesystem.

use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};

use crate::config::DestinationConfig;

/// Mount table of the current process.
pub const PROC_MOUNTS: &str = "/proc/self/mounts";

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mount_point: PathBuf,
    pub fstype: String,
}

#[derive(Debug, Display, Error)]
/// Errors of the [MountGuard].
pub enum MountError {
    #[display("{} is not mounted", _0.display())]
    NotMounted(#[error(ignore)] PathBuf),
    #[display("{} is a {found} mount, expected {expected}", mount_point.display())]
    WrongFilesystem {
        mount_point: PathBuf,
        expected: String,
        found: String,
    },
    #[display("Reading the mount table {} failed: {_1}", _0.display())]
    MountTable(#[error(not(source))] PathBuf, #[error(source)] io::Error),
}

/// Verifies mount points against a mount table.
#[derive(Debug, Clone)]
pub struct MountGuard {
    mount_table: PathBuf,
}

impl Default for MountGuard {
    fn default() -> Self {
        Self::with_mount_table(PROC_MOUNTS)
    }
}

impl MountGuard {
    /// Use the mount table at `path` instead of [PROC_MOUNTS].
    pub fn with_mount_table(path: impl Into<PathBuf>) -> Self {
        Self {
            mount_table: path.into(),
        }
    }

    /// Returns the entry mounted at `mount_point`.
    pub fn verify(&self, mount_point: &Path) -> Result<MountEntry, MountError> {
        let contents = std::fs::read_to_string(&self.mount_table)
            .map_err(|e| MountError::MountTable(self.mount_table.clone(), e))?;

        // the last entry is the one visible on stacked mounts
        parse_mount_table(&contents)
            .into_iter()
            .rev()
            .find(|entry| entry.mount_point == mount_point)
            .ok_or_else(|| MountError::NotMounted(mount_point.to_path_buf()))
    }

    /// Verifies the mount of the backup destination including its type.
    pub fn verify_destination(&self, destination: &DestinationConfig) -> Result<MountEntry, MountError> {
        let entry = self.verify(&destination.mount_point)?;
        if let Some(expected) = &destination.expected_fstype {
            if &entry.fstype != expected {
                return Err(MountError::WrongFilesystem {
                    mount_point: entry.mount_point,
                    expected: expected.clone(),
                    found: entry.fstype,
                });
            }
        }

        log::info!(
            target: "mount",
            "Backup destination {} is mounted from {} ({})",
            entry.mount_point.display(),
            entry.source,
            entry.fstype
        );
        Ok(entry)
    }
}

/// Parses the `fstab(5)` formatted mount table.
pub fn parse_mount_table(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let mount_point = fields.next()?;
            let fstype = fields.next()?;
            Some(MountEntry {
                source: unescape(source),
                mount_point: unescape(mount_point).into(),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

/// Decodes the octal escapes (`\040` for space, ...) of the mount table.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        let escape = bytes.get(idx + 1..idx + 4).filter(|digits| {
            bytes[idx] == b'\\' && digits.iter().all(|d| (b'0'..=b'7').contains(d))
        });
        match escape.and_then(|digits| u8::from_str_radix(std::str::from_utf8(digits).ok()?, 8).ok()) {
            Some(byte) => {
                decoded.push(byte);
                idx += 4;
            }
            None => {
                decoded.push(bytes[idx]);
                idx += 1;
            }
        }
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/sda1 / ext4 rw,relatime 0 0
//nas/backup /mnt/backup cifs rw,relatime,vers=3.0 0 0
/dev/sdb1 /mnt/usb\\040disk vfat rw 0 0
";

    fn guard(contents: &str) -> (tempfile::TempDir, MountGuard) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mounts");
        std::fs::write(&path, contents).unwrap();
        (dir, MountGuard::with_mount_table(path))
    }

    #[test]
    fn finds_mounted_share() {
        let (_dir, guard) = guard(MOUNTS);

        let entry = guard.verify(Path::new("/mnt/backup")).unwrap();

        assert_eq!(entry.source, "//nas/backup");
        assert_eq!(entry.fstype, "cifs");
    }

    #[test]
    fn existing_directory_is_not_a_mount() {
        let (_dir, guard) = guard(MOUNTS);

        let err = guard.verify(Path::new("/mnt")).unwrap_err();

        assert!(matches!(err, MountError::NotMounted(path) if path == Path::new("/mnt")));
    }

    #[test]
    fn decodes_escaped_spaces() {
        let (_dir, guard) = guard(MOUNTS);

        assert!(guard.verify(Path::new("/mnt/usb disk")).is_ok());
    }

    #[test]
    fn checks_filesystem_type() {
        let (_dir, guard) = guard(MOUNTS);
        let destination = DestinationConfig {
            mount_point: "/mnt/backup".into(),
            backup_root: "/mnt/backup/acme".into(),
            expected_fstype: Some("nfs4".to_string()),
        };

        let err = guard.verify_destination(&destination).unwrap_err();

        assert_eq!(err.to_string(), "/mnt/backup is a cifs mount, expected nfs4");
    }

    #[test]
    fn unreadable_table_is_an_error() {
        let guard = MountGuard::with_mount_table("/nonexistent/mounts");

        let err = guard.verify(Path::new("/mnt/backup")).unwrap_err();

        assert!(matches!(err, MountError::MountTable(..)));
        assert!(std::error::Error::source(&err).is_some_and(|source| source.is::<io::Error>()));
    }
}
