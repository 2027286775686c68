//! Low-level helpers for the cgroup pseudo-files shared by the container
//! lifecycle, the enforcer and the shares balancer.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

#[derive(Debug, thiserror::Error)]
pub enum CgroupError {
    #[error("failed to read data from {path}")]
    Read {
        path: PathBuf,
        #[source]
        cause: io::Error,
    },
    #[error("failed to write data to {path}")]
    Write {
        path: PathBuf,
        #[source]
        cause: io::Error,
    },
    #[error("failed to create cgroup directory {path}")]
    CreateCgroupDir {
        path: PathBuf,
        #[source]
        cause: io::Error,
    },
    #[error("failed to remove cgroup directory {path}")]
    RemoveCgroupDir {
        path: PathBuf,
        #[source]
        cause: io::Error,
    },
    #[error("malformed value in {path}: {content:?}")]
    Parse { path: PathBuf, content: String },
    #[error("cgroup {path} still holds processes after {attempts} drain passes")]
    DrainAttemptsExhausted { path: PathBuf, attempts: usize },
    #[error("failed to update container state file {path}")]
    State {
        path: PathBuf,
        #[source]
        cause: io::Error,
    },
    #[error("malformed container state file {path}")]
    StateJson {
        path: PathBuf,
        #[source]
        cause: serde_json::Error,
    },
}

pub(crate) fn read_to_string(path: &Path) -> Result<String, CgroupError> {
    fs::read_to_string(path).map_err(|cause| CgroupError::Read {
        path: path.to_path_buf(),
        cause,
    })
}

pub(crate) fn write(path: &Path, data: &[u8]) -> Result<(), CgroupError> {
    fs::write(path, data).map_err(|cause| CgroupError::Write {
        path: path.to_path_buf(),
        cause,
    })
}

pub(crate) fn create_dir_all(path: &Path) -> Result<(), CgroupError> {
    fs::create_dir_all(path).map_err(|cause| CgroupError::CreateCgroupDir {
        path: path.to_path_buf(),
        cause,
    })
}

/// Removes a cgroup directory tree. A directory that is already gone is
/// an already-satisfied post-condition, not an error.
pub(crate) fn remove_dir_all(path: &Path) -> Result<(), CgroupError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(ref cause) if cause.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(cause) => Err(CgroupError::RemoveCgroupDir {
            path: path.to_path_buf(),
            cause,
        }),
    }
}

pub(crate) fn read_u64(path: &Path) -> Result<u64, CgroupError> {
    let content = read_to_string(path)?;
    content
        .trim()
        .parse()
        .map_err(|_| CgroupError::Parse {
            path: path.to_path_buf(),
            content,
        })
}

/// Lists the pids currently member of a cgroup directory.
pub(crate) fn get_pids(cgroup_dir: &Path) -> Result<Vec<libc::pid_t>, CgroupError> {
    let path = cgroup_dir.join("cgroup.procs");
    let content = read_to_string(&path)?;
    let mut pids = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let pid = line.parse().map_err(|_| CgroupError::Parse {
            path: path.clone(),
            content: line.to_string(),
        })?;
        pids.push(pid);
    }
    Ok(pids)
}

/// Moves one pid into a cgroup by writing it to the group's
/// `cgroup.procs`. The file is opened for plain writing, never created:
/// on a real cgroupfs it always exists and creating a regular file in
/// its place would mask a missing cgroup.
pub(crate) fn write_pid(cgroup_dir: &Path, pid: libc::pid_t) -> Result<(), CgroupError> {
    let path = cgroup_dir.join("cgroup.procs");
    let write_err = |cause| CgroupError::Write {
        path: path.clone(),
        cause,
    };
    let mut file = fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .map_err(write_err)?;
    let mut buf = itoa::Buffer::new();
    file.write_all(buf.format(pid).as_bytes()).map_err(write_err)
}

/// True when the cgroup currently holds at least one process. Any read
/// failure counts as "no processes" so callers can race a concurrent
/// container destroy without special-casing it.
pub(crate) fn has_procs(cgroup_dir: &Path) -> bool {
    match get_pids(cgroup_dir) {
        Ok(pids) => !pids.is_empty(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_pids_parses_one_pid_per_line() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cgroup.procs"), "12\n345\n").unwrap();
        assert_eq!(get_pids(dir.path()).unwrap(), vec![12, 345]);
    }

    #[test]
    fn get_pids_of_empty_group_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cgroup.procs"), "").unwrap();
        assert!(get_pids(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn get_pids_surfaces_missing_group() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            get_pids(&dir.path().join("gone")),
            Err(CgroupError::Read { .. })
        ));
    }

    #[test]
    fn write_pid_requires_existing_procs_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(write_pid(dir.path(), 42).is_err());

        fs::write(dir.path().join("cgroup.procs"), "").unwrap();
        write_pid(dir.path(), 42).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("cgroup.procs")).unwrap(),
            "42"
        );
    }

    #[test]
    fn remove_dir_all_tolerates_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        remove_dir_all(&dir.path().join("nope")).unwrap();
    }

    #[test]
    fn has_procs_is_false_on_unreadable_group() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_procs(&dir.path().join("gone")));
    }
}
