//! Switching from the initramfs to the system image.
//!
//! This is what runs as PID 1 on a paravirtualized genpack machine.  The system image is attached
//! as a second virtio disk (`/dev/vdb`).  We mount it read-only, give it a fresh `/run`, hand over
//! the `/dev` and `/sys` mounts, make it the new `/` and then free the memory held by the old
//! initramfs before executing the real init.
//!
//! The sequence is modelled as a series of [`Stage`]s.  The side effects are all reached through
//! [`SwitchOps`] so that the ordering can be checked without being PID 1 on a throwaway VM.

use std::{
    convert::Infallible,
    ffi::OsStr,
    fmt, io,
    os::{fd::OwnedFd, unix::process::CommandExt},
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, info};
use rustix::{
    fs::{open, Mode, OFlags},
    mount::MountFlags,
    process::{chdir, chroot, Pid},
};
use thiserror::Error;

use crate::{
    mount::{self, MountError, MountRequest},
    probe::{self, ProbeError},
    purge::{self, PurgeError, PurgeReport},
    util::ensure_dir,
};

/// How far the switch has got.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Init,
    DevSysMounted,
    RootMounted,
    RunTmpfsMounted,
    MountsRelocated,
    OldRootPurged,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Error, Debug)]
pub enum SwitchError {
    #[error("PID must be 1 (running as {pid})")]
    NotInit { pid: i32 },
    #[error(transparent)]
    Mount(#[from] MountError),
    #[error("Cannot determine filesystem type of {}", device.display())]
    Probe {
        device: PathBuf,
        #[source]
        error: ProbeError,
    },
    #[error("Filesystem type of {} could not be determined", device.display())]
    FstypeUndetermined { device: PathBuf },
    #[error("Failed to {op} {}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to purge old root")]
    Purge(#[from] PurgeError),
    #[error("Cannot execute {}", program.display())]
    ExecFailed {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The paths involved in the switch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwitchConfig {
    /// Block device holding the system image.
    pub system_device: PathBuf,
    /// Where to mount it before it becomes `/`.
    pub new_root: PathBuf,
    /// What to execute once the switch is complete.  Gets the system device as its only argument.
    pub init: PathBuf,
    pub dev: PathBuf,
    pub sys: PathBuf,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            system_device: "/dev/vdb".into(),
            new_root: "/root".into(),
            init: "/sbin/overlay-init".into(),
            dev: "/dev".into(),
            sys: "/sys".into(),
        }
    }
}

/// The host operations that a root switch is made of.
pub trait SwitchOps {
    /// An open directory, kept across the switch to reach the old root.
    type Handle;

    /// Creates a directory (mode 0755) unless it already exists.
    fn create_dir(&mut self, path: &Path) -> io::Result<()>;
    fn remove_dir(&mut self, path: &Path) -> io::Result<()>;
    fn remove_dir_all(&mut self, path: &Path) -> io::Result<()>;
    fn probe_fstype(&mut self, device: &Path) -> Result<Option<&'static str>, ProbeError>;
    fn mount(&mut self, request: &MountRequest) -> Result<(), MountError>;
    fn move_mount(&mut self, from: &Path, to: &Path) -> Result<(), MountError>;
    fn open_dir(&mut self, path: &Path) -> io::Result<Self::Handle>;
    fn chdir(&mut self, path: &Path) -> io::Result<()>;
    fn chroot(&mut self, path: &Path) -> io::Result<()>;
    fn purge(&mut self, dir: Self::Handle) -> Result<PurgeReport, PurgeError>;
    /// Replaces the current process.  Only returns on failure.
    fn exec(&mut self, program: &Path, args: &[&OsStr]) -> io::Error;
}

/// The real thing.
#[derive(Debug, Default)]
pub struct Kernel;

impl SwitchOps for Kernel {
    type Handle = OwnedFd;

    fn create_dir(&mut self, path: &Path) -> io::Result<()> {
        ensure_dir(path, 0o755)?;
        Ok(())
    }

    fn remove_dir(&mut self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir(path)
    }

    fn remove_dir_all(&mut self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir_all(path)
    }

    fn probe_fstype(&mut self, device: &Path) -> Result<Option<&'static str>, ProbeError> {
        probe::probe_fstype(device)
    }

    fn mount(&mut self, request: &MountRequest) -> Result<(), MountError> {
        mount::mount(request)
    }

    fn move_mount(&mut self, from: &Path, to: &Path) -> Result<(), MountError> {
        mount::move_mount(from, to)
    }

    fn open_dir(&mut self, path: &Path) -> io::Result<OwnedFd> {
        Ok(open(
            path,
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )?)
    }

    fn chdir(&mut self, path: &Path) -> io::Result<()> {
        Ok(chdir(path)?)
    }

    fn chroot(&mut self, path: &Path) -> io::Result<()> {
        Ok(chroot(path)?)
    }

    fn purge(&mut self, dir: OwnedFd) -> Result<PurgeReport, PurgeError> {
        purge::purge(dir)
    }

    fn exec(&mut self, program: &Path, args: &[&OsStr]) -> io::Error {
        Command::new(program).arg0(program).args(args).exec()
    }
}

/// Drives a root switch from start to handoff.
#[derive(Debug)]
pub struct RootSwitch<O> {
    config: SwitchConfig,
    ops: O,
    stage: Stage,
}

impl<O: SwitchOps> RootSwitch<O> {
    pub fn new(config: SwitchConfig, ops: O) -> Self {
        Self {
            config,
            ops,
            stage: Stage::Init,
        }
    }

    /// The last stage that completed.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    fn reached(&mut self, stage: Stage) {
        info!("Reached stage {stage}");
        self.stage = stage;
    }

    fn create_dir(&mut self, path: &Path) -> Result<(), SwitchError> {
        self.ops.create_dir(path).map_err(|source| SwitchError::Io {
            op: "create",
            path: path.to_path_buf(),
            source,
        })
    }

    /// Runs the whole switch, assuming we are `pid`.  On success the process has been replaced
    /// by the next-stage init, so this only ever returns an error.
    pub fn run(&mut self, pid: Pid) -> Result<Infallible, SwitchError> {
        if pid != Pid::INIT {
            return Err(SwitchError::NotInit {
                pid: pid.as_raw_nonzero().get(),
            });
        }

        self.mount_dev_sys()?;
        self.mount_root()?;
        self.mount_run()?;
        self.relocate_mounts()?;
        self.enter_new_root()?;

        let init = self.config.init.clone();
        let args = [self.config.system_device.as_os_str()];
        info!("Executing {}", init.display());
        Err(SwitchError::ExecFailed {
            source: self.ops.exec(&init, &args),
            program: init,
        })
    }

    fn mount_dev_sys(&mut self) -> Result<(), SwitchError> {
        let SwitchConfig { dev, sys, .. } = self.config.clone();

        self.create_dir(&dev)?;
        self.ops.mount(
            &MountRequest::new("udev", &dev)
                .fstype("devtmpfs")
                .flags(MountFlags::NOSUID)
                .data("mode=0755,size=10M"),
        )?;

        self.create_dir(&sys)?;
        self.ops.mount(
            &MountRequest::new("sysfs", &sys)
                .fstype("sysfs")
                .flags(MountFlags::NOEXEC | MountFlags::NOSUID | MountFlags::NODEV),
        )?;

        self.reached(Stage::DevSysMounted);
        Ok(())
    }

    fn mount_root(&mut self) -> Result<(), SwitchError> {
        let SwitchConfig {
            system_device,
            new_root,
            ..
        } = self.config.clone();

        self.create_dir(&new_root)?;

        let fstype = self
            .ops
            .probe_fstype(&system_device)
            .map_err(|error| SwitchError::Probe {
                device: system_device.clone(),
                error,
            })?
            .ok_or_else(|| SwitchError::FstypeUndetermined {
                device: system_device.clone(),
            })?;
        debug!("{} is {fstype}", system_device.display());

        self.ops.mount(
            &MountRequest::new(&system_device, &new_root)
                .fstype(fstype)
                .flags(MountFlags::RDONLY),
        )?;

        self.reached(Stage::RootMounted);
        Ok(())
    }

    fn mount_run(&mut self) -> Result<(), SwitchError> {
        let run = self.config.new_root.join("run");
        self.ops.mount(
            &MountRequest::new("tmpfs", run)
                .fstype("tmpfs")
                .flags(MountFlags::NODEV | MountFlags::NOSUID | MountFlags::STRICTATIME)
                .data("mode=755"),
        )?;

        self.reached(Stage::RunTmpfsMounted);
        Ok(())
    }

    fn relocate_mounts(&mut self) -> Result<(), SwitchError> {
        let SwitchConfig {
            new_root, dev, sys, ..
        } = self.config.clone();

        self.ops.move_mount(&sys, &new_root.join("sys"))?;
        self.ops
            .remove_dir(&sys)
            .map_err(|source| SwitchError::Io {
                op: "remove",
                path: sys.clone(),
                source,
            })?;

        // whatever the initramfs had in /dev before devtmpfs went over it goes too
        self.ops.move_mount(&dev, &new_root.join("dev"))?;
        self.ops
            .remove_dir_all(&dev)
            .map_err(|source| SwitchError::Io {
                op: "remove",
                path: dev.clone(),
                source,
            })?;

        self.reached(Stage::MountsRelocated);
        Ok(())
    }

    fn enter_new_root(&mut self) -> Result<(), SwitchError> {
        let new_root = self.config.new_root.clone();
        let io_error = |op: &'static str, path: &Path| {
            let path = path.to_path_buf();
            move |source| SwitchError::Io { op, path, source }
        };

        // the only way back to the initramfs once we've switched
        let old_root = self
            .ops
            .open_dir(Path::new("/"))
            .map_err(io_error("open", Path::new("/")))?;

        self.ops
            .chdir(&new_root)
            .map_err(io_error("change directory to", &new_root))?;
        self.ops.move_mount(&new_root, Path::new("/"))?;
        self.ops
            .chroot(Path::new("."))
            .map_err(io_error("change root to", &new_root))?;
        self.ops
            .chdir(Path::new("/"))
            .map_err(io_error("change directory to", Path::new("/")))?;

        let report = self.ops.purge(old_root)?;
        info!(
            "Removed {} entries from old root ({} on other filesystems, {} failed)",
            report.removed, report.foreign, report.failed
        );

        self.reached(Stage::OldRootPurged);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    // Records every operation instead of performing it.
    #[derive(Debug, Default)]
    struct Recorder {
        log: Vec<String>,
        fstype: Option<&'static str>,
        fail_mount: Option<PathBuf>,
    }

    impl Recorder {
        fn with_fstype(fstype: &'static str) -> Self {
            Self {
                fstype: Some(fstype),
                ..Default::default()
            }
        }

        fn record(&mut self, op: String) {
            self.log.push(op);
        }
    }

    impl SwitchOps for Recorder {
        type Handle = PathBuf;

        fn create_dir(&mut self, path: &Path) -> io::Result<()> {
            self.record(format!("mkdir {}", path.display()));
            Ok(())
        }

        fn remove_dir(&mut self, path: &Path) -> io::Result<()> {
            self.record(format!("rmdir {}", path.display()));
            Ok(())
        }

        fn remove_dir_all(&mut self, path: &Path) -> io::Result<()> {
            self.record(format!("rm -r {}", path.display()));
            Ok(())
        }

        fn probe_fstype(&mut self, device: &Path) -> Result<Option<&'static str>, ProbeError> {
            self.record(format!("probe {}", device.display()));
            Ok(self.fstype)
        }

        fn mount(&mut self, request: &MountRequest) -> Result<(), MountError> {
            self.record(format!(
                "mount {} {} {}",
                request.fstype,
                request.source.display(),
                request.target.display()
            ));
            if self.fail_mount.as_deref() == Some(request.target.as_path()) {
                return Err(MountError::Mount {
                    what: request.source.clone(),
                    target: request.target.clone(),
                    fstype: request.fstype.clone(),
                    errno: rustix::io::Errno::NODEV,
                });
            }
            Ok(())
        }

        fn move_mount(&mut self, from: &Path, to: &Path) -> Result<(), MountError> {
            self.record(format!("move {} {}", from.display(), to.display()));
            Ok(())
        }

        fn open_dir(&mut self, path: &Path) -> io::Result<PathBuf> {
            self.record(format!("open {}", path.display()));
            Ok(path.to_path_buf())
        }

        fn chdir(&mut self, path: &Path) -> io::Result<()> {
            self.record(format!("chdir {}", path.display()));
            Ok(())
        }

        fn chroot(&mut self, path: &Path) -> io::Result<()> {
            self.record(format!("chroot {}", path.display()));
            Ok(())
        }

        fn purge(&mut self, dir: PathBuf) -> Result<PurgeReport, PurgeError> {
            self.record(format!("purge {}", dir.display()));
            Ok(PurgeReport::default())
        }

        fn exec(&mut self, program: &Path, args: &[&OsStr]) -> io::Error {
            self.record(format!("exec {} {args:?}", program.display()));
            io::ErrorKind::NotFound.into()
        }
    }

    fn pid(raw: i32) -> Pid {
        Pid::from_raw(raw).unwrap()
    }

    #[test]
    fn test_not_init() {
        let mut switch = RootSwitch::new(SwitchConfig::default(), Recorder::with_fstype("ext4"));
        let err = switch.run(pid(42)).unwrap_err();
        assert!(matches!(err, SwitchError::NotInit { pid: 42 }));
        assert!(switch.ops().log.is_empty());
        assert_eq!(switch.stage(), Stage::Init);
    }

    #[test]
    fn test_fstype_undetermined() {
        let mut switch = RootSwitch::new(SwitchConfig::default(), Recorder::default());
        let err = switch.run(Pid::INIT).unwrap_err();
        assert!(matches!(err, SwitchError::FstypeUndetermined { .. }));
        assert_eq!(switch.stage(), Stage::DevSysMounted);
        assert_eq!(
            switch.ops().log,
            [
                "mkdir /dev",
                "mount devtmpfs udev /dev",
                "mkdir /sys",
                "mount sysfs sysfs /sys",
                "mkdir /root",
                "probe /dev/vdb",
            ]
        );
    }

    #[test]
    fn test_mount_failure_stops() {
        let ops = Recorder {
            fail_mount: Some("/root/run".into()),
            ..Recorder::with_fstype("squashfs")
        };
        let mut switch = RootSwitch::new(SwitchConfig::default(), ops);
        let err = switch.run(Pid::INIT).unwrap_err();
        assert!(matches!(err, SwitchError::Mount(MountError::Mount { .. })));
        assert_eq!(switch.stage(), Stage::RootMounted);
        assert_eq!(
            switch.ops().log.last().map(String::as_str),
            Some("mount tmpfs tmpfs /root/run")
        );
    }

    #[test]
    fn test_full_sequence() {
        let mut switch = RootSwitch::new(SwitchConfig::default(), Recorder::with_fstype("squashfs"));
        let err = switch.run(Pid::INIT).unwrap_err();
        // the recorder can't actually exec anything
        assert!(matches!(err, SwitchError::ExecFailed { .. }));
        assert_eq!(switch.stage(), Stage::OldRootPurged);
        assert_eq!(
            switch.ops().log,
            [
                "mkdir /dev",
                "mount devtmpfs udev /dev",
                "mkdir /sys",
                "mount sysfs sysfs /sys",
                "mkdir /root",
                "probe /dev/vdb",
                "mount squashfs /dev/vdb /root",
                "mount tmpfs tmpfs /root/run",
                "move /sys /root/sys",
                "rmdir /sys",
                "move /dev /root/dev",
                "rm -r /dev",
                "open /",
                "chdir /root",
                "move /root /",
                "chroot .",
                "chdir /",
                "purge /",
                "exec /sbin/overlay-init [\"/dev/vdb\"]",
            ]
        );
    }

    #[test]
    fn test_custom_config() {
        let config = SwitchConfig {
            system_device: "/dev/vdc".into(),
            new_root: "/newroot".into(),
            init: "/sbin/init".into(),
            ..Default::default()
        };
        let mut switch = RootSwitch::new(config, Recorder::with_fstype("ext4"));
        switch.run(Pid::INIT).unwrap_err();
        let log = &switch.ops().log;
        assert!(log.contains(&"mount ext4 /dev/vdc /newroot".to_string()));
        assert!(log.contains(&"move /dev /newroot/dev".to_string()));
        assert_eq!(
            log.last().map(String::as_str),
            Some("exec /sbin/init [\"/dev/vdc\"]")
        );
    }

    #[test]
    fn test_stage_order() {
        assert!(Stage::Init < Stage::DevSysMounted);
        assert!(Stage::MountsRelocated < Stage::OldRootPurged);
        assert_eq!(Stage::RunTmpfsMounted.to_string(), "RunTmpfsMounted");
    }
}
