//! Tests that need real mounts.  They quietly pass when not run as root.

use std::{
    fs::{create_dir, create_dir_all, read_dir, read_to_string, write},
    path::Path,
    process::Command,
};

use rustix::{
    fs::{open, Mode, OFlags},
    mount::MountFlags,
    process::getuid,
};
use similar_asserts::assert_eq;
use tempfile::TempDir;

use genpack_boot::{
    mount::{self, move_mount, unmount, MountRequest},
    purge::purge,
    verify::{ImageInfo, ImageVerifier, VerifyError},
};

fn is_empty(dir: &Path) -> bool {
    read_dir(dir).unwrap().next().is_none()
}

fn tmpfs(target: &Path) {
    mount::mount(&MountRequest::new("tmpfs", target).fstype("tmpfs")).unwrap();
}

#[test]
fn test_purge_stays_on_device() {
    if !getuid().is_root() {
        return;
    }

    // an outer tmpfs so that we know exactly which device we're on
    let tmp = TempDir::new().unwrap();
    tmpfs(tmp.path());

    let top = tmp.path().join("top");
    create_dir_all(top.join("a/b")).unwrap();
    write(top.join("a/b/file"), "x").unwrap();
    write(top.join("file"), "x").unwrap();
    let inner = top.join("inner");
    create_dir(&inner).unwrap();
    tmpfs(&inner);
    write(inner.join("keep"), "me").unwrap();

    let fd = open(
        &top,
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .unwrap();
    let report = purge(fd).unwrap();
    assert_eq!(report.removed, 4);
    assert_eq!(report.foreign, 1);

    assert_eq!(read_to_string(inner.join("keep")).unwrap(), "me");
    unmount(&inner).unwrap();
    unmount(tmp.path()).unwrap();
}

#[test]
fn test_move_mount() {
    if !getuid().is_root() {
        return;
    }

    let tmp = TempDir::new().unwrap();
    tmpfs(tmp.path());
    let (from, to) = (tmp.path().join("from"), tmp.path().join("to"));
    create_dir(&from).unwrap();
    create_dir(&to).unwrap();

    mount::mount(
        &MountRequest::new("tmpfs", &from)
            .fstype("tmpfs")
            .flags(MountFlags::NODEV | MountFlags::NOSUID)
            .data("mode=755"),
    )
    .unwrap();
    write(from.join("hello"), "world").unwrap();

    move_mount(&from, &to).unwrap();
    assert!(is_empty(&from));
    assert_eq!(read_to_string(to.join("hello")).unwrap(), "world");

    unmount(&to).unwrap();
    unmount(tmp.path()).unwrap();
}

#[test_with::executable(mksquashfs)]
#[test]
fn test_verify_metadata() {
    if !getuid().is_root() {
        return;
    }

    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("root");
    create_dir_all(root.join(".genpack")).unwrap();
    write(root.join(".genpack/profile"), "demo\n").unwrap();
    write(root.join(".genpack/artifact"), "v1").unwrap();
    let image = tmp.path().join("system.img");
    let status = Command::new("mksquashfs")
        .arg(&root)
        .arg(&image)
        .args(["-quiet", "-noappend"])
        .status()
        .unwrap();
    assert!(status.success());

    let mounts = TempDir::new().unwrap();
    let info = ImageVerifier::with_tmpdir(mounts.path())
        .verify(&image)
        .unwrap();
    assert_eq!(
        info,
        ImageInfo {
            fstype: Some("squashfs".into()),
            profile: Some("demo".into()),
            artifact: Some("v1".into()),
        }
    );
    assert!(is_empty(mounts.path()));
}

#[test_with::executable(mkfs.ext4)]
#[test]
fn test_verify_truncated() {
    if !getuid().is_root() {
        return;
    }

    // a valid superblock with nothing behind it: probing succeeds, mounting doesn't
    let tmp = TempDir::new().unwrap();
    let image = tmp.path().join("system.img");
    let status = Command::new("mkfs.ext4")
        .args(["-q", "-F"])
        .arg(&image)
        .arg("8M")
        .status()
        .unwrap();
    assert!(status.success());
    let file = std::fs::OpenOptions::new().write(true).open(&image).unwrap();
    file.set_len(4096).unwrap();

    let mounts = TempDir::new().unwrap();
    let err = ImageVerifier::with_tmpdir(mounts.path())
        .verify(&image)
        .unwrap_err();
    assert!(matches!(err, VerifyError::Mount { .. }));
    assert!(is_empty(mounts.path()));

    // nothing left mounted anywhere under there either
    let mountinfo = read_to_string("/proc/self/mountinfo").unwrap();
    assert!(!mountinfo.contains(mounts.path().to_str().unwrap()));
}
