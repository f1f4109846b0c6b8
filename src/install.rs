//! Replacing the system image on the boot partition.
//!
//! The boot partition holds up to four images:
//!
//!  - `system.img`: what the next boot will use
//!  - `system.cur`: a backup of the image the machine is currently running, if `system.img` was
//!    replaced while in use
//!  - `system.old`: a backup from an earlier install, removed at the start of the next one
//!  - `system.new`: a partial copy, only present while an install is in progress
//!
//! The one thing that must hold at every point, including after a crash or a failed install, is
//! that `system.img` exists and is bootable.  New images are written under a temporary name and
//! only renamed into place once they're complete, and if something goes wrong after the running
//! image was moved aside it gets moved back.
//!
//! All file operations are done relative to an open handle on the boot partition directory, which
//! is also used to hold an exclusive `flock()` for the duration of the install.

use std::{
    ffi::CStr,
    fmt,
    fs::File,
    io,
    os::fd::OwnedFd,
    path::{Path, PathBuf},
};

use log::{debug, error, info, warn};
use rustix::{
    fs::{flock, open, openat, renameat, statat, unlinkat, AtFlags, FlockOperation, Mode, OFlags},
    io::Errno,
};
use thiserror::Error;

use crate::{
    losetup::ActiveProbe,
    util::ErrnoFilter,
    verify::{ImageInfo, ImageVerifier, VerifyError},
};

/// Where the initramfs leaves the boot partition mounted.
pub const DEFAULT_BOOT_PARTITION: &str = "/run/initramfs/boot";

pub const INSTALLED: &CStr = c"system.img";
pub const CURRENT: &CStr = c"system.cur";
pub const OLD: &CStr = c"system.old";
pub const NEW: &CStr = c"system.new";

/// The part of an install that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    RemoveOld,
    Copy,
    Probe,
    Preserve,
    Commit,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Step::RemoveOld => "removing the old system image",
            Step::Copy => "copying the new system image",
            Step::Probe => "checking whether the system image is in use",
            Step::Preserve => "preserving the running system image",
            Step::Commit => "installing the new system image",
        })
    }
}

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Boot partition {} does not exist or is not a directory", path.display())]
    BootPartitionMissing { path: PathBuf },
    #[error("Cannot open boot partition {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        errno: Errno,
    },
    #[error("Another install is already running on {}", path.display())]
    Busy { path: PathBuf },
    #[error("Cannot lock boot partition {}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        errno: Errno,
    },
    #[error("System image file {} is corrupt", path.display())]
    ImageCorrupt {
        path: PathBuf,
        #[source]
        error: VerifyError,
    },
    #[error("Failed {step}{}", if *restored { " (original system image restored)" } else { "" })]
    CopyOrRenameFailed {
        step: Step,
        restored: bool,
        #[source]
        source: io::Error,
    },
}

/// An open, exclusively locked boot partition.
#[derive(Debug)]
pub struct BootPartition {
    fd: OwnedFd,
    path: PathBuf,
}

impl BootPartition {
    /// Opens and locks the boot partition at `path`.  Fails with [`InstallError::Busy`] rather
    /// than waiting if another process holds the lock.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, InstallError> {
        let path = path.as_ref().to_path_buf();

        let fd = open(
            &path,
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(|errno| match errno {
            Errno::NOENT | Errno::NOTDIR => InstallError::BootPartitionMissing { path: path.clone() },
            errno => InstallError::Open {
                path: path.clone(),
                errno,
            },
        })?;

        match flock(&fd, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => {}
            Err(Errno::WOULDBLOCK) => return Err(InstallError::Busy { path }),
            Err(errno) => return Err(InstallError::Lock { path, errno }),
        }

        debug!("locked boot partition {}", path.display());
        Ok(Self { fd, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The absolute path of one of the image files.
    pub fn image_path(&self, name: &CStr) -> PathBuf {
        self.path.join(&*name.to_string_lossy())
    }

    pub fn exists(&self, name: &CStr) -> rustix::io::Result<bool> {
        Ok(statat(&self.fd, name, AtFlags::SYMLINK_NOFOLLOW)
            .filter_errno(Errno::NOENT)?
            .is_some())
    }

    /// Removes `name`, returning `false` if it wasn't there.
    fn remove(&self, name: &CStr) -> rustix::io::Result<bool> {
        Ok(unlinkat(&self.fd, name, AtFlags::empty())
            .filter_errno(Errno::NOENT)?
            .is_some())
    }

    fn rename(&self, from: &CStr, to: &CStr) -> rustix::io::Result<()> {
        debug!("rename {from:?} -> {to:?}");
        renameat(&self.fd, from, &self.fd, to)
    }

    fn create(&self, name: &CStr) -> rustix::io::Result<File> {
        let fd = openat(
            &self.fd,
            name,
            OFlags::WRONLY | OFlags::CREATE | OFlags::EXCL | OFlags::CLOEXEC,
            Mode::from_raw_mode(0o644),
        )?;
        Ok(File::from(fd))
    }
}

impl Drop for BootPartition {
    fn drop(&mut self) {
        if let Err(errno) = flock(&self.fd, FlockOperation::Unlock) {
            warn!("Unlocking {} failed: {errno}", self.path.display());
        }
    }
}

/// What a successful replacement did besides installing the new image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplaceReport {
    /// A backup from a previous install was deleted.
    pub removed_old: bool,
    /// The running image was kept as `system.cur`.
    pub preserved_current: bool,
}

/// Swaps a verified candidate image in as `system.img`.
pub struct ImageReplacer<'a, P> {
    partition: &'a BootPartition,
    probe: P,
}

impl<'a, P: ActiveProbe> ImageReplacer<'a, P> {
    /// `probe` decides whether the installed image is in use and should therefore be kept.
    pub fn new(partition: &'a BootPartition, probe: P) -> Self {
        Self { partition, probe }
    }

    /// Copies `candidate` onto the boot partition and makes it the installed image.
    ///
    /// On failure, `system.img` is put back the way it was if it had already been moved away, and
    /// the partial copy is removed.
    pub fn replace(&self, candidate: &Path) -> Result<ReplaceReport, InstallError> {
        let mut report = ReplaceReport::default();
        match self.try_replace(candidate, &mut report) {
            Ok(()) => Ok(report),
            Err((step, source)) => {
                error!("Failed {step}: {source}");
                let restored = self.roll_back();
                Err(InstallError::CopyOrRenameFailed {
                    step,
                    restored,
                    source,
                })
            }
        }
    }

    fn try_replace(
        &self,
        candidate: &Path,
        report: &mut ReplaceReport,
    ) -> Result<(), (Step, io::Error)> {
        let boot = self.partition;
        let fail = |step: Step| move |err: Errno| (step, io::Error::from(err));

        if boot.remove(OLD).map_err(fail(Step::RemoveOld))? {
            info!("Old system image removed to preserve disk space.");
            report.removed_old = true;
        }

        // leftover from an install that was interrupted during the copy
        if boot.remove(NEW).map_err(fail(Step::Copy))? {
            warn!("Removed incomplete {}", boot.image_path(NEW).display());
        }

        self.copy(candidate).map_err(|err| (Step::Copy, err))?;

        let installed = boot.image_path(INSTALLED);
        let active = boot.exists(INSTALLED).map_err(fail(Step::Probe))?
            && self
                .probe
                .is_active(&installed)
                .map_err(|err| (Step::Probe, err))?;
        if active {
            boot.rename(INSTALLED, CURRENT)
                .map_err(fail(Step::Preserve))?;
            info!("Original system image preserved.");
            report.preserved_current = true;
        }

        boot.rename(NEW, INSTALLED).map_err(fail(Step::Commit))?;
        Ok(())
    }

    fn copy(&self, candidate: &Path) -> io::Result<()> {
        let mut source = File::open(candidate)?;
        let mut dest = self.partition.create(NEW)?;
        let size = io::copy(&mut source, &mut dest)?;
        dest.sync_all()?;
        debug!("copied {size} bytes from {}", candidate.display());
        Ok(())
    }

    // Returns true if system.cur had to be moved back to system.img.
    fn roll_back(&self) -> bool {
        let boot = self.partition;
        let mut restored = false;

        match (boot.exists(INSTALLED), boot.exists(CURRENT)) {
            (Ok(false), Ok(true)) => match boot.rename(CURRENT, INSTALLED) {
                Ok(()) => {
                    info!("Original system image restored.");
                    restored = true;
                }
                Err(errno) => error!("Restoring the original system image failed: {errno}"),
            },
            (Ok(_), Ok(_)) => {}
            (Err(errno), _) | (_, Err(errno)) => {
                error!("Cannot check state of {}: {errno}", boot.path().display())
            }
        }

        if let Err(errno) = boot.remove(NEW) {
            warn!("Cannot remove {}: {errno}", boot.image_path(NEW).display());
        }

        restored
    }
}

/// The result of a successful install.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub image: ImageInfo,
    pub replaced: ReplaceReport,
}

/// Installs candidate images onto a boot partition.
#[derive(Debug)]
pub struct Installer<P> {
    boot_partition: PathBuf,
    verifier: ImageVerifier,
    probe: P,
}

impl<P: ActiveProbe> Installer<P> {
    pub fn new(boot_partition: impl Into<PathBuf>, probe: P) -> Self {
        Self {
            boot_partition: boot_partition.into(),
            verifier: ImageVerifier::default(),
            probe,
        }
    }

    pub fn with_verifier(mut self, verifier: ImageVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    /// Verifies `image` and makes it the installed system image.  Nothing on the boot partition is
    /// touched unless the image verifies.
    pub fn install(&self, image: &Path) -> Result<InstallReport, InstallError> {
        self.install_with(image, |_| {})
    }

    /// Like [`Self::install`], but calls `verified` with the image's metadata as soon as it has
    /// been verified, before anything is copied.
    pub fn install_with(
        &self,
        image: &Path,
        verified: impl FnOnce(&ImageInfo),
    ) -> Result<InstallReport, InstallError> {
        let partition = BootPartition::open(&self.boot_partition)?;

        let info = self
            .verifier
            .verify(image)
            .map_err(|error| InstallError::ImageCorrupt {
                path: image.to_path_buf(),
                error,
            })?;
        debug!("verified {}: {info:?}", image.display());
        verified(&info);

        let probe = |installed: &Path| self.probe.is_active(installed);
        let replaced = ImageReplacer::new(&partition, probe).replace(image)?;

        // make sure the rename is on disk before anyone reboots
        rustix::fs::sync();

        Ok(InstallReport {
            image: info,
            replaced,
        })
    }
}
