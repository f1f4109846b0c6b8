//! Attaching image files to loop devices.
//!
//! The kernel can't mount a regular file directly, so an image has to be exposed as a block device
//! first.  `mount -o loop` does this by way of libmount; here we do it ourselves with
//! `LOOP_CTL_GET_FREE` and `LOOP_CONFIGURE`.

#![allow(unsafe_code)]

use std::{
    fs::{File, OpenOptions},
    io::{Error, Result},
    os::fd::{AsFd, AsRawFd},
    path::{Path, PathBuf},
};

use log::debug;
use rustix::ioctl::{ioctl, opcode, Opcode, Setter};

/// Flags for loop device configuration.
pub mod flags {
    /// Read-only loop device.
    pub const LO_FLAGS_READ_ONLY: u32 = 1;
    /// Automatically detach on last close.
    pub const LO_FLAGS_AUTOCLEAR: u32 = 4;
}

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

#[repr(C)]
#[derive(Default)]
struct LoopConfig {
    fd: u32,
    block_size: u32,
    info: LoopInfo64,
    reserved: [u64; 8],
}

#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl Default for LoopInfo64 {
    fn default() -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

// LOOP_CTL_GET_FREE returns the device number as the ioctl's return value, which none of the
// rustix helper types model.
struct LoopCtlGetFree;

unsafe impl rustix::ioctl::Ioctl for LoopCtlGetFree {
    type Output = std::ffi::c_int;

    const IS_MUTATING: bool = false;

    fn opcode(&self) -> rustix::ioctl::Opcode {
        LOOP_CTL_GET_FREE
    }

    fn as_ptr(&mut self) -> *mut std::ffi::c_void {
        std::ptr::null_mut()
    }

    unsafe fn output_from_ptr(
        out: rustix::ioctl::IoctlOutput,
        _ptr: *mut std::ffi::c_void,
    ) -> rustix::io::Result<std::ffi::c_int> {
        Ok(out)
    }
}

const LOOP_CTL_GET_FREE: Opcode = opcode::none(0x4C, 0x82);
// The loop ioctls predate the _IOC() encoding: the number is just 'L' << 8 | nr.
const LOOP_CONFIGURE: Opcode = 0x4C0A;

/// An attached loop device.
///
/// With [`flags::LO_FLAGS_AUTOCLEAR`] the kernel detaches the device once this handle is closed
/// and nothing has it mounted any more, so keep this alive until the mount is gone.
#[derive(Debug)]
pub struct LoopDevice {
    file: File,
    path: PathBuf,
}

impl LoopDevice {
    /// The device node, as needed for `mount()`.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsFd for LoopDevice {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// Attaches `backing` to a free loop device, read-only and with autoclear.
pub fn attach(backing: impl AsFd) -> Result<LoopDevice> {
    attach_with_flags(
        backing,
        flags::LO_FLAGS_READ_ONLY | flags::LO_FLAGS_AUTOCLEAR,
    )
}

/// Attaches `backing` to a free loop device with custom flags (see [`flags`]).
pub fn attach_with_flags(backing: impl AsFd, lo_flags: u32) -> Result<LoopDevice> {
    let control = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/loop-control")?;

    let free: i32 = unsafe { ioctl(&control, LoopCtlGetFree) }.map_err(Error::other)?;

    if free < 0 {
        return Err(Error::other("no free loop device"));
    }

    let path = PathBuf::from(format!("/dev/loop{free}"));
    let file = OpenOptions::new()
        .read(true)
        .write(lo_flags & flags::LO_FLAGS_READ_ONLY == 0)
        .open(&path)?;

    // block_size 0 keeps the kernel default of 512, which every filesystem can live with
    let config = LoopConfig {
        fd: backing.as_fd().as_raw_fd() as u32,
        block_size: 0,
        info: LoopInfo64 {
            lo_flags,
            ..Default::default()
        },
        reserved: [0; 8],
    };

    unsafe {
        ioctl(
            &file,
            Setter::<{ LOOP_CONFIGURE }, LoopConfig>::new(config),
        )
        .map_err(Error::other)?;
    }

    debug!("attached {}", path.display());
    Ok(LoopDevice { file, path })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_opcodes() {
        // linux/loop.h
        assert_eq!(LOOP_CTL_GET_FREE, 0x4C82);
        assert_eq!(LOOP_CONFIGURE, 0x4C0A);
    }

    #[test]
    fn test_attach() {
        let mut tf = NamedTempFile::new().unwrap();
        tf.write_all(&[0u8; 1 << 20]).unwrap();
        tf.flush().unwrap();

        let file = File::open(tf.path()).unwrap();
        let result = attach(&file);

        if rustix::process::getuid().is_root() {
            let device = result.unwrap();
            assert!(device.path().starts_with("/dev/loop"));
            assert!(device.path().exists());
        } else {
            assert!(result.is_err());
        }
    }
}
