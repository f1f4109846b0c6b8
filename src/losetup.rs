//! Finding out whether an image file is in use.
//!
//! The running system's image is attached to a loop device by the bootloader/initramfs.  We ask
//! `losetup -j` about it rather than walking `/sys/block/loop*` because `losetup` already knows
//! how to match a backing file against every loop device, including ones set up by other mount
//! namespaces.

use std::{
    ffi::OsString,
    io::{self, ErrorKind, Read},
    path::Path,
    process::{Command, Stdio},
};

use log::{debug, warn};

/// Something that can tell whether an image file is currently loop-mounted.
pub trait ActiveProbe {
    fn is_active(&self, image: &Path) -> io::Result<bool>;
}

impl<F: Fn(&Path) -> io::Result<bool>> ActiveProbe for F {
    fn is_active(&self, image: &Path) -> io::Result<bool> {
        self(image)
    }
}

/// Queries `losetup -j <image>`.
#[derive(Clone, Debug)]
pub struct LoopbackDetector {
    program: OsString,
    args: Vec<OsString>,
}

impl Default for LoopbackDetector {
    fn default() -> Self {
        Self::new("losetup")
    }
}

impl LoopbackDetector {
    /// Uses `program` in place of `losetup`.  It gets called with `-j <image>`.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
        }
    }

    /// Extra arguments to pass before `-j <image>`.
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl ActiveProbe for LoopbackDetector {
    /// The image is active if the query succeeds and names at least one loop device.  If the
    /// query fails (including because `losetup` isn't installed) the image is reported inactive.
    fn is_active(&self, image: &Path) -> io::Result<bool> {
        let mut child = match Command::new(&self.program)
            .args(&self.args)
            .arg("-j")
            .arg(image)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("{:?} not found, assuming {} is not in use", self.program, image.display());
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        // Backing file names are whatever bytes the filesystem allows, so don't insist on UTF-8.
        let mut output = vec![];
        let read = match child.stdout.take() {
            Some(mut stdout) => stdout.read_to_end(&mut output).map(drop),
            None => Ok(()),
        };

        // reap the child even if reading failed
        let status = child.wait()?;
        read?;
        if !status.success() {
            debug!("{:?} -j {}: {status}", self.program, image.display());
            return Ok(false);
        }

        let devices: Vec<_> = output
            .split(|&b| b == b'\n')
            .filter(|line| !line.trim_ascii().is_empty())
            .map(String::from_utf8_lossy)
            .collect();
        debug!("{} is attached to {devices:?}", image.display());
        Ok(!devices.is_empty())
    }
}
