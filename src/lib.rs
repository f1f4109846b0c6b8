//! Early boot and image lifecycle support for genpack systems.
//!
//! A genpack system boots from a single filesystem image (`system.img`) that lives on the boot
//! partition and is exposed to the virtual machine as a block device.  This crate contains the two
//! programs that manage that image:
//!
//!  - `init-paravirt` runs as PID 1 inside the initramfs.  It mounts the system image read-only,
//!    moves `/dev` and `/sys` into it, switches the root over, purges the initramfs and execs the
//!    next-stage init.  See [`switch_root`].
//!  - `genpack-install` replaces `system.img` with a new image, keeping a backup of the running
//!    image and guaranteeing that a bootable `system.img` exists no matter where the process dies.
//!    See [`install`].

pub mod install;
pub mod loopdev;
pub mod losetup;
pub mod mount;
pub mod probe;
pub mod purge;
pub mod switch_root;
pub mod util;
pub mod verify;
