//! Mount and ownership primitives behind a trait so the hierarchy
//! bootstrap can be exercised against a fake filesystem.

use std::{
    io,
    os::unix::fs::MetadataExt,
    path::Path,
};

/// Answers whether `path` is the root of a mounted filesystem by
/// comparing its device id with its parent's. Probing mount(2) for an
/// error would risk stacking a second mount, so this never mounts.
/// A path that does not exist is simply not a mount point.
pub fn is_mount_point(path: &Path) -> io::Result<bool> {
    let meta = match path.metadata() {
        Ok(meta) => meta,
        Err(ref err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    let parent = match path.parent() {
        Some(parent) => parent,
        // the filesystem root is always a mount point
        None => return Ok(true),
    };
    let parent_meta = parent.metadata()?;
    Ok(meta.dev() != parent_meta.dev())
}

/// The filesystem operations the bootstrap needs from the host. The
/// production implementation talks to the kernel; tests substitute a
/// recording fake.
pub trait MountFs {
    fn mount(&self, source: &str, target: &Path, fstype: &str, data: &str)
        -> Result<(), nix::Error>;
    fn chown(&self, path: &Path, uid: libc::uid_t, gid: libc::gid_t) -> Result<(), nix::Error>;
    fn is_mount_point(&self, path: &Path) -> io::Result<bool>;
}

/// Real kernel-backed implementation.
#[derive(Debug, Default)]
pub struct OsFs;

impl MountFs for OsFs {
    fn mount(
        &self,
        source: &str,
        target: &Path,
        fstype: &str,
        data: &str,
    ) -> Result<(), nix::Error> {
        nix::mount::mount(
            Some(source),
            target,
            Some(fstype),
            nix::mount::MsFlags::empty(),
            Some(data),
        )
    }

    fn chown(&self, path: &Path, uid: libc::uid_t, gid: libc::gid_t) -> Result<(), nix::Error> {
        nix::unistd::chown(
            path,
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        )
    }

    fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
        is_mount_point(path)
    }
}
