//! Checking that a candidate system image is mountable.
//!
//! Before an image is allowed anywhere near the boot partition, we mount it read-only in a
//! private temporary directory.  If the kernel accepts it, it's good enough to boot from.  While
//! it's mounted we also pick up the `.genpack` metadata (which profile and artifact the image was
//! built from) so that the user can see what they're about to install.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

use log::debug;
use rustix::mount::MountFlags;
use tempfile::TempDir;
use thiserror::Error;

use crate::{
    loopdev,
    mount::{MountError, TmpMount},
    probe::{probe_fstype, ProbeError},
};

/// Directory at the root of every genpack image with information about how it was built.
pub const METADATA_DIR: &str = ".genpack";

/// Verification of a candidate image failed.
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Failed to create temporary mountpoint")]
    TempDir(#[source] io::Error),
    #[error("Cannot open {}", path.display())]
    Open { path: PathBuf, source: io::Error },
    #[error("Cannot probe {}", path.display())]
    Probe {
        path: PathBuf,
        #[source]
        error: ProbeError,
    },
    #[error("{} does not contain a filesystem", path.display())]
    NotFilesystem { path: PathBuf },
    #[error("Failed to attach {} to a loop device", path.display())]
    Loop { path: PathBuf, source: io::Error },
    #[error("{} could not be mounted", path.display())]
    Mount {
        path: PathBuf,
        #[source]
        error: MountError,
    },
}

/// Informational tags found in an image's [`METADATA_DIR`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub fstype: Option<String>,
    pub profile: Option<String>,
    pub artifact: Option<String>,
}

// Only the first word counts; the files are written by hand often enough to end up with trailing
// newlines or comments.
fn read_token(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    content.split_whitespace().next().map(str::to_string)
}

/// Reads the metadata of an image whose root directory is `root`.  Missing files are not an
/// error: plenty of perfectly bootable images were built without them.
pub fn read_image_info(root: &Path) -> ImageInfo {
    let metadata = root.join(METADATA_DIR);
    if !metadata.is_dir() {
        debug!("no {METADATA_DIR} in image");
        return ImageInfo::default();
    }

    ImageInfo {
        fstype: None,
        profile: read_token(&metadata.join("profile")),
        artifact: read_token(&metadata.join("artifact")),
    }
}

/// Mounts candidate images to make sure they're usable.
#[derive(Clone, Debug, Default)]
pub struct ImageVerifier {
    tmpdir: Option<PathBuf>,
}

impl ImageVerifier {
    /// Creates temporary mountpoints under `dir` instead of the default temporary directory.
    pub fn with_tmpdir(dir: impl Into<PathBuf>) -> Self {
        Self {
            tmpdir: Some(dir.into()),
        }
    }

    fn mountpoint(&self) -> io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("genpack-install-");
        match &self.tmpdir {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        }
    }

    /// Mounts `image` read-only and reports its metadata.
    ///
    /// Whatever the outcome, the image is unmounted and the temporary mountpoint removed before
    /// this returns.  Nothing is ever written to the image.
    pub fn verify(&self, image: &Path) -> Result<ImageInfo, VerifyError> {
        let mountpoint = self.mountpoint().map_err(VerifyError::TempDir)?;

        let file = File::open(image).map_err(|source| VerifyError::Open {
            path: image.to_path_buf(),
            source,
        })?;

        let fstype = probe_fstype(image)
            .map_err(|error| VerifyError::Probe {
                path: image.to_path_buf(),
                error,
            })?
            .ok_or_else(|| VerifyError::NotFilesystem {
                path: image.to_path_buf(),
            })?;
        debug!("{} looks like {fstype}", image.display());

        // NB: drop order matters.  The mount goes first, then the loop device (which autoclears
        // once unmounted and closed), and only then does the mountpoint get removed.
        let device = loopdev::attach(&file).map_err(|source| VerifyError::Loop {
            path: image.to_path_buf(),
            source,
        })?;
        let mnt = TmpMount::mount(mountpoint, device.path(), fstype, MountFlags::RDONLY)
            .map_err(|error| VerifyError::Mount {
                path: image.to_path_buf(),
                error,
            })?;

        let info = read_image_info(mnt.path());
        drop(mnt);
        drop(device);

        Ok(ImageInfo {
            fstype: Some(fstype.to_string()),
            ..info
        })
    }
}

#[cfg(test)]
mod test {
    use std::fs::{create_dir, read_dir};

    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::{tempdir, write_file};

    #[test]
    fn test_read_image_info() {
        let root = tempdir();
        create_dir(root.path().join(METADATA_DIR)).unwrap();
        write_file(&root, ".genpack/profile", "demo\n");
        write_file(&root, ".genpack/artifact", "v1");

        assert_eq!(
            read_image_info(root.path()),
            ImageInfo {
                fstype: None,
                profile: Some("demo".into()),
                artifact: Some("v1".into()),
            }
        );
    }

    #[test]
    fn test_read_image_info_partial() {
        let root = tempdir();
        assert_eq!(read_image_info(root.path()), ImageInfo::default());

        create_dir(root.path().join(METADATA_DIR)).unwrap();
        write_file(&root, ".genpack/artifact", "  gentoo-20250101 built by ci\n");
        write_file(&root, ".genpack/profile", "");
        assert_eq!(
            read_image_info(root.path()),
            ImageInfo {
                fstype: None,
                profile: None,
                artifact: Some("gentoo-20250101".into()),
            }
        );
    }

    #[test]
    fn test_verify_empty_file() {
        let tmp = tempdir();
        let image = write_file(&tmp, "system.img", "");
        let mounts = tempdir();

        let err = ImageVerifier::with_tmpdir(mounts.path())
            .verify(&image)
            .unwrap_err();
        assert!(matches!(err, VerifyError::NotFilesystem { .. }));
        // no leftover mountpoint
        assert!(read_dir(mounts.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_verify_missing_file() {
        let tmp = tempdir();
        let mounts = tempdir();

        let err = ImageVerifier::with_tmpdir(mounts.path())
            .verify(&tmp.path().join("system.img"))
            .unwrap_err();
        assert!(matches!(err, VerifyError::Open { .. }));
        assert!(read_dir(mounts.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_verify_missing_tmpdir() {
        let tmp = tempdir();
        let image = write_file(&tmp, "system.img", "");

        let err = ImageVerifier::with_tmpdir(tmp.path().join("nope"))
            .verify(&image)
            .unwrap_err();
        assert!(matches!(err, VerifyError::TempDir(_)));
    }
}
