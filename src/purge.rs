//! Recursive deletion that stays on one filesystem.
//!
//! After the root switch the initramfs contents are still sitting in memory, reachable only
//! through a directory handle that was opened on the old `/` before the switch.  [`purge()`]
//! empties that directory.  Everything happens relative to open directory handles: resolving
//! paths from `/` would by then land in the new root.
//!
//! Anything living on a different device than the starting directory is left alone.  This is what
//! keeps a filesystem that is still mounted somewhere below the purged directory from being wiped
//! out along with it.

use std::{ffi::CStr, os::fd::OwnedFd};

use log::{debug, warn};
use rustix::{
    fs::{fstat, openat, statat, unlinkat, AtFlags, Dir, FileType, Mode, OFlags},
    io::Errno,
};
use thiserror::Error;

/// Purging failed in a way that makes it pointless to carry on.
#[derive(Error, Debug)]
pub enum PurgeError {
    #[error("Failed to open directory for purging")]
    Open(#[source] Errno),
    #[error("Failed to read directory")]
    Read(#[source] Errno),
}

/// What a purge did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Entries that were unlinked.
    pub removed: usize,
    /// Entries left alone because they're on a different device.
    pub foreign: usize,
    /// Entries that couldn't be stat'ed or unlinked.
    pub failed: usize,
}

/// An open directory plus the device that the whole purge is confined to.
struct DirectoryScope {
    fd: OwnedFd,
    dev: u64,
}

impl DirectoryScope {
    fn open_child(&self, name: &CStr) -> rustix::io::Result<DirectoryScope> {
        let fd = openat(
            &self.fd,
            name,
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
            Mode::empty(),
        )?;
        Ok(DirectoryScope { fd, dev: self.dev })
    }

    fn purge(&self, report: &mut PurgeReport) -> Result<(), PurgeError> {
        for item in Dir::read_from(&self.fd).map_err(PurgeError::Open)? {
            let entry = item.map_err(PurgeError::Read)?;
            let name = entry.file_name();
            if name == c"." || name == c".." {
                continue;
            }

            let stat = match statat(&self.fd, name, AtFlags::SYMLINK_NOFOLLOW) {
                Ok(stat) => stat,
                Err(errno) => {
                    warn!("stat of {name:?} failed: {errno}");
                    report.failed += 1;
                    continue;
                }
            };

            if stat.st_dev != self.dev {
                debug!("leaving {name:?} alone: different device");
                report.foreign += 1;
                continue;
            }

            let is_dir = FileType::from_raw_mode(stat.st_mode) == FileType::Directory;
            if is_dir {
                match self.open_child(name) {
                    Ok(child) => child.purge(report)?,
                    Err(errno) => warn!("failed to open {name:?}: {errno}"),
                }
            }

            let flags = if is_dir {
                AtFlags::REMOVEDIR
            } else {
                AtFlags::empty()
            };
            match unlinkat(&self.fd, name, flags) {
                Ok(()) => report.removed += 1,
                Err(errno) => {
                    warn!("failed to unlink {name:?}: {errno}");
                    report.failed += 1;
                }
            }
        }

        Ok(())
    }
}

/// Deletes everything below `dir` that lives on the same device as `dir` itself.
///
/// Failing to stat or unlink an individual entry is logged and counted in the report, but doesn't
/// stop the purge.  Failing to read a directory does.  The directory itself is not removed.
pub fn purge(dir: OwnedFd) -> Result<PurgeReport, PurgeError> {
    let stat = fstat(&dir).map_err(PurgeError::Open)?;
    let scope = DirectoryScope {
        fd: dir,
        dev: stat.st_dev,
    };

    let mut report = PurgeReport::default();
    scope.purge(&mut report)?;
    debug!("purge finished: {report:?}");
    Ok(report)
}
