//! Classic mount(2) support.
//!
//! The initramfs runs before anything else and needs to work on whatever kernel the image ships
//! with, so this sticks to the old `mount()` syscall rather than the fsopen()/fsmount() family.
//! Every failure carries the errno together with the paths involved, since that's usually all
//! there is to go on when a machine fails to boot.

use std::{
    ffi::CString,
    fmt,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use rustix::{
    io::Errno,
    mount::{mount as mount_fs, mount_move, unmount as umount, MountFlags, UnmountFlags},
};
use tempfile::TempDir;
use thiserror::Error;

/// A mount-related syscall failed.
#[derive(Error, Debug)]
pub enum MountError {
    #[error("Failed to mount {} on {} (type {fstype})", what.display(), target.display())]
    Mount {
        what: PathBuf,
        target: PathBuf,
        fstype: String,
        #[source]
        errno: Errno,
    },
    #[error("Moving mountpoint {} to {} failed", from.display(), to.display())]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        errno: Errno,
    },
    #[error("Failed to unmount {}", target.display())]
    Unmount {
        target: PathBuf,
        #[source]
        errno: Errno,
    },
    #[error("Mount options for {} contain a NUL byte", target.display())]
    InvalidData { target: PathBuf },
}

/// Everything needed for a single call to `mount()`.
///
/// The defaults (`auto` type, `relatime`, no options) suit ordinary block devices; special
/// filesystems like `devtmpfs` or `sysfs` need their type and flags set explicitly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountRequest {
    pub source: PathBuf,
    pub target: PathBuf,
    pub fstype: String,
    pub flags: MountFlags,
    pub data: String,
}

impl MountRequest {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            fstype: "auto".to_string(),
            flags: MountFlags::RELATIME,
            data: String::new(),
        }
    }

    pub fn fstype(mut self, fstype: &str) -> Self {
        self.fstype = fstype.to_string();
        self
    }

    pub fn flags(mut self, flags: MountFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn data(mut self, data: &str) -> Self {
        self.data = data.to_string();
        self
    }
}

impl fmt::Display for MountRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} on {} type {} ({:?}",
            self.source.display(),
            self.target.display(),
            self.fstype,
            self.flags
        )?;
        if !self.data.is_empty() {
            write!(f, ", {}", self.data)?;
        }
        write!(f, ")")
    }
}

/// Performs the mount described by `request`.  The target directory must already exist.
pub fn mount(request: &MountRequest) -> Result<(), MountError> {
    let data = CString::new(request.data.as_str()).map_err(|_| MountError::InvalidData {
        target: request.target.clone(),
    })?;

    debug!("mount {request}");
    mount_fs(
        request.source.as_path(),
        request.target.as_path(),
        request.fstype.as_str(),
        request.flags,
        Some(data.as_c_str()),
    )
    .map_err(|errno| MountError::Mount {
        what: request.source.clone(),
        target: request.target.clone(),
        fstype: request.fstype.clone(),
        errno,
    })
}

/// Atomically relocates the mount at `from` to `to`.
///
/// Afterwards `from` is an ordinary (empty) directory again, which the caller may want to remove.
pub fn move_mount(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<(), MountError> {
    let (from, to) = (from.as_ref(), to.as_ref());
    debug!("move mount {} -> {}", from.display(), to.display());
    mount_move(from, to).map_err(|errno| MountError::Move {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        errno,
    })
}

pub fn unmount(target: impl AsRef<Path>) -> Result<(), MountError> {
    let target = target.as_ref();
    debug!("unmount {}", target.display());
    umount(target, UnmountFlags::empty()).map_err(|errno| MountError::Unmount {
        target: target.to_path_buf(),
        errno,
    })
}

/// A filesystem mounted on a private temporary directory.
///
/// Dropping this unmounts the filesystem and then removes the directory.  An unmount failure at
/// that point is logged but otherwise ignored: by then the caller has whatever answer it was
/// looking for, and a stuck mount shouldn't turn that into an error.
#[derive(Debug)]
pub struct TmpMount {
    dir: TempDir,
}

impl TmpMount {
    /// Mounts `source` on `dir`, which becomes owned by the returned value.  On failure, `dir` is
    /// removed again.
    pub fn mount(
        dir: TempDir,
        source: impl Into<PathBuf>,
        fstype: &str,
        flags: MountFlags,
    ) -> Result<TmpMount, MountError> {
        mount(&MountRequest::new(source, dir.path()).fstype(fstype).flags(flags))?;
        Ok(TmpMount { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Drop for TmpMount {
    fn drop(&mut self) {
        if let Err(err) = unmount(self.dir.path()) {
            warn!("{err}, detaching instead");
            if let Err(errno) = umount(self.dir.path(), UnmountFlags::DETACH) {
                warn!("umount(MNT_DETACH) failed: {errno}");
            }
        }
    }
}
