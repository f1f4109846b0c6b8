//! Filesystem type detection from on-disk superblocks.
//!
//! The kernel's `mount()` won't guess a filesystem type for us, so before the system image can be
//! mounted we need to look at it and figure out what it is.  This reads the first few dozen
//! kilobytes of the device (enough to cover every superblock location we know about) and checks
//! them against a table of signatures, much like `blkid` does.

use std::{
    fs::File,
    io::{self, ErrorKind},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use log::debug;
use thiserror::Error;
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, Immutable, KnownLayout,
};

/// Probing a device failed before any signature could be checked.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Cannot open {} for probing", path.display())]
    Unavailable { path: PathBuf, source: io::Error },
    #[error("Failed to read superblocks from {}", path.display())]
    Read { path: PathBuf, source: io::Error },
}

// btrfs keeps its superblock at 64k, which is the furthest out of everything we look at.
const BTRFS_SUPERBLOCK_OFFSET: usize = 0x10000;
const PROBE_AREA_SIZE: usize = BTRFS_SUPERBLOCK_OFFSET + 0x80;

const SUPERBLOCK_OFFSET_1K: usize = 1024;

/* ext2/3/4 */

const EXT_MAGIC: u16 = 0xef53;

const EXT3_FEATURE_COMPAT_HAS_JOURNAL: u32 = 0x0004;
const EXT3_FEATURE_INCOMPAT_SUPP: u32 = 0x0002 | 0x0004 | 0x0010; // FILETYPE | RECOVER | META_BG
const EXT3_FEATURE_RO_COMPAT_SUPP: u32 = 0x0001 | 0x0002 | 0x0004; // SPARSE_SUPER | LARGE_FILE | BTREE_DIR

#[allow(dead_code)]
#[derive(FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct ExtSuperblock {
    counts: [u8; 0x38],
    magic: U16,
    state: U16,
    errors: U16,
    minor_rev_level: U16,

    lastcheck: U32,
    checkinterval: U32,
    creator_os: U32,
    rev_level: U32,

    def_resuid: U16,
    def_resgid: U16,
    first_ino: U32,
    inode_size: U16,
    block_group_nr: U16,
    feature_compat: U32,

    feature_incompat: U32,
    feature_ro_compat: U32,
}

impl ExtSuperblock {
    fn flavor(&self) -> &'static str {
        if self.feature_incompat.get() & !EXT3_FEATURE_INCOMPAT_SUPP != 0
            || self.feature_ro_compat.get() & !EXT3_FEATURE_RO_COMPAT_SUPP != 0
        {
            "ext4"
        } else if self.feature_compat.get() & EXT3_FEATURE_COMPAT_HAS_JOURNAL != 0 {
            "ext3"
        } else {
            "ext2"
        }
    }
}

/* squashfs */

const SQUASHFS_MAGIC: u32 = 0x73717368; // "hsqs"

#[allow(dead_code)]
#[derive(FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct SquashfsSuperblock {
    magic: U32,
    inode_count: U32,
    modification_time: U32,
    block_size: U32,

    fragment_entry_count: U32,
    compression_id: U16,
    block_log: U16,
    flags: U16,
    id_count: U16,
    version_major: U16,
    version_minor: U16,
}

/* erofs */

const EROFS_MAGIC_V1: u32 = 0xe0f5e1e2;

/// Signatures which are identified by a fixed byte string at a fixed offset.
const MAGIC_STRINGS: &[(&str, usize, &[u8])] = &[
    ("xfs", 0, b"XFSB"),
    ("btrfs", BTRFS_SUPERBLOCK_OFFSET + 0x40, b"_BHRfS_M"),
    ("iso9660", 0x8001, b"CD001"),
];

fn bytes_at(area: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    area.get(offset..offset.checked_add(len)?)
}

fn probe_squashfs(area: &[u8]) -> Option<&'static str> {
    let (sb, _) = SquashfsSuperblock::ref_from_prefix(area).ok()?;
    if sb.magic.get() != SQUASHFS_MAGIC {
        return None;
    }
    match sb.version_major.get() >= 4 {
        true => Some("squashfs"),
        false => Some("squashfs3"),
    }
}

fn probe_erofs(area: &[u8]) -> Option<&'static str> {
    let (magic, _) = U32::ref_from_prefix(area.get(SUPERBLOCK_OFFSET_1K..)?).ok()?;
    (magic.get() == EROFS_MAGIC_V1).then_some("erofs")
}

fn probe_ext(area: &[u8]) -> Option<&'static str> {
    let (sb, _) = ExtSuperblock::ref_from_prefix(area.get(SUPERBLOCK_OFFSET_1K..)?).ok()?;
    (sb.magic.get() == EXT_MAGIC).then(|| sb.flavor())
}

fn probe_vfat(area: &[u8]) -> Option<&'static str> {
    if bytes_at(area, 510, 2) != Some(&[0x55, 0xaa][..]) {
        return None;
    }
    let fat32 = bytes_at(area, 0x52, 8) == Some(&b"FAT32   "[..]);
    let fat1x = bytes_at(area, 0x36, 4) == Some(&b"FAT1"[..]);
    (fat32 || fat1x).then_some("vfat")
}

/// Identifies the filesystem whose superblocks are contained in `area`, which holds the first
/// bytes of a device (possibly fewer than a full probe area, for tiny devices).
pub fn identify(area: &[u8]) -> Option<&'static str> {
    if let Some(fstype) = probe_squashfs(area)
        .or_else(|| probe_erofs(area))
        .or_else(|| probe_ext(area))
    {
        return Some(fstype);
    }

    for (fstype, offset, magic) in MAGIC_STRINGS {
        if bytes_at(area, *offset, magic.len()) == Some(*magic) {
            return Some(fstype);
        }
    }

    probe_vfat(area)
}

// Like read_exact_at(), but a short device is not an error: we just get less data.
fn read_probe_area(file: &File) -> io::Result<Vec<u8>> {
    let mut area = vec![0u8; PROBE_AREA_SIZE];
    let mut filled = 0;

    while filled < area.len() {
        match file.read_at(&mut area[filled..], filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    area.truncate(filled);
    Ok(area)
}

/// Determines the filesystem type of a block device (or image file).
///
/// Returns `Ok(None)` if the device doesn't carry any superblock we recognise.  That's not an
/// error: it's up to the caller to decide what an unformatted device means.
pub fn probe_fstype(device: impl AsRef<Path>) -> Result<Option<&'static str>, ProbeError> {
    let path = device.as_ref();

    let file = File::open(path).map_err(|source| ProbeError::Unavailable {
        path: path.to_path_buf(),
        source,
    })?;

    let area = read_probe_area(&file).map_err(|source| ProbeError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let fstype = identify(&area);
    debug!("probed {}: {fstype:?}", path.display());
    Ok(fstype)
}
