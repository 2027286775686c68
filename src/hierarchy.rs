//! One-time bootstrap of the cgroup pseudo-filesystem hierarchy.
//!
//! Runs once at daemon startup, before any container exists: mounts the
//! hierarchy root (legacy model) or verifies the unified tree, creates
//! the warden working directory every other facility nests under, and,
//! when CPU throttling is enabled, the top-level `good`/`bad` split the
//! enforcer migrates containers between. Re-running against an already
//! bootstrapped root is a no-op.

mod detect;
mod v1;
mod v2;

pub use detect::CgroupVersion;
pub(crate) use v2::enable_supported_controllers;

use crate::{cgfs::CgroupError, mount::MountFs, DeviceRule, Settings};
use std::{
    collections::HashMap,
    fs,
    io::{self, Read},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

/// Name of the top-level cgroup holding containers inside their
/// entitlement.
pub const GOOD_CGROUP: &str = "good";
/// Name of the top-level cgroup holding containers over their
/// entitlement.
pub const BAD_CGROUP: &str = "bad";

const UNIFIED_MOUNT: &str = "unified";
const UNIFIED_ROOT: &str = "/sys/fs/cgroup";
const PROC_CGROUPS_HEADER: [&str; 4] = ["#subsys_name", "hierarchy", "num_cgroups", "enabled"];

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("unknown /proc/cgroups format: {content}")]
    MalformedProcCgroups { content: String },
    #[error("failed to read {what}")]
    ReadProcFile {
        what: &'static str,
        #[source]
        cause: io::Error,
    },
    #[error("failed to create directory {path}")]
    CreateDir {
        path: PathBuf,
        #[source]
        cause: io::Error,
    },
    #[error("failed to check whether {path} is a mount point")]
    CheckMountPoint {
        path: PathBuf,
        #[source]
        cause: io::Error,
    },
    #[error("failed to mount subsystem '{subsystem}' at {path}")]
    MountSubsystem {
        subsystem: String,
        path: PathBuf,
        #[source]
        cause: nix::Error,
    },
    #[error("failed to mount unified hierarchy at {path}")]
    MountUnified {
        path: PathBuf,
        #[source]
        cause: nix::Error,
    },
    #[error("failed to chown {path}")]
    Chown {
        path: PathBuf,
        #[source]
        cause: nix::Error,
    },
    #[error("failed to write device policy to {path}")]
    DevicePolicy {
        path: PathBuf,
        #[source]
        cause: io::Error,
    },
    #[error(transparent)]
    Cgroup(#[from] CgroupError),
}

/// One line of the current process's `/proc/self/cgroup`: which
/// subsystems share a hierarchy (the mount option string) and where in
/// that hierarchy this process lives.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Grouping {
    pub(crate) subsystems: String,
    pub(crate) path: String,
}

/// An entry of the kernel's `/proc/cgroups` table.
#[derive(Debug, PartialEq)]
pub(crate) struct KernelSubsystem {
    pub(crate) name: String,
    pub(crate) enabled: bool,
}

/// Assembles the cgroup hierarchy. Consumed by [`Starter::start`]; the
/// proc-file readers are injected so startup against malformed kernel
/// tables is testable.
pub struct Starter {
    root: PathBuf,
    warden_cgroup: String,
    cpu_throttling: bool,
    allowed_devices: Vec<DeviceRule>,
    proc_cgroups: Box<dyn Read>,
    proc_self_cgroup: Box<dyn Read>,
    owner: Option<(libc::uid_t, libc::gid_t)>,
    version: CgroupVersion,
    fs: Box<dyn MountFs>,
}

impl Starter {
    pub fn new(
        settings: &Settings,
        version: CgroupVersion,
        proc_cgroups: Box<dyn Read>,
        proc_self_cgroup: Box<dyn Read>,
        allowed_devices: Vec<DeviceRule>,
        fs: Box<dyn MountFs>,
    ) -> Starter {
        Starter {
            root: settings.cgroup_root.clone(),
            warden_cgroup: settings.warden_cgroup.clone(),
            cpu_throttling: settings.throttling.is_enabled(),
            allowed_devices,
            proc_cgroups,
            proc_self_cgroup,
            owner: settings.owner,
            version,
            fs,
        }
    }

    /// Chowns every created cgroup directory to this owner, which lets
    /// a rootless daemon manage them afterwards.
    pub fn with_owner(mut self, uid: libc::uid_t, gid: libc::gid_t) -> Starter {
        self.owner = Some((uid, gid));
        self
    }

    pub fn start(mut self) -> Result<(), StartError> {
        fs::create_dir_all(&self.root).map_err(|cause| StartError::CreateDir {
            path: self.root.clone(),
            cause,
        })?;

        let mounted =
            self.fs
                .is_mount_point(&self.root)
                .map_err(|cause| StartError::CheckMountPoint {
                    path: self.root.clone(),
                    cause,
                })?;
        if mounted {
            tracing::info!(path = %self.root.display(), "hierarchy root already mounted");
        } else if let Err(error) =
            self.fs
                .mount("cgroup", &self.root, "tmpfs", "uid=0,gid=0,mode=0755")
        {
            // the path may still be usable, e.g. a bind-mounted scratch
            // dir in a test environment
            tracing::error!(path = %self.root.display(), %error, "tmpfs mount failed, continuing");
        }

        match self.version {
            CgroupVersion::V2 => self.start_unified(),
            CgroupVersion::V1 => {
                let proc_self = read_all(&mut self.proc_self_cgroup, "/proc/self/cgroup")?;
                let proc_cgroups = read_all(&mut self.proc_cgroups, "/proc/cgroups")?;
                self.start_legacy(&proc_cgroups, &proc_self)
            }
        }
    }

    fn create_chowned_cgroup(&self, path: &Path) -> Result<(), StartError> {
        tracing::debug!(path = %path.display(), "creating warden cgroup");
        fs::create_dir_all(path).map_err(|cause| StartError::CreateDir {
            path: path.to_path_buf(),
            cause,
        })?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|cause| {
            StartError::CreateDir {
                path: path.to_path_buf(),
                cause,
            }
        })?;
        self.recursive_chown(path)
    }

    fn recursive_chown(&self, path: &Path) -> Result<(), StartError> {
        let (uid, gid) = match self.owner {
            Some(owner) => owner,
            None => return Ok(()),
        };
        self.chown_tree(path, uid, gid)
    }

    fn chown_tree(
        &self,
        path: &Path,
        uid: libc::uid_t,
        gid: libc::gid_t,
    ) -> Result<(), StartError> {
        self.fs
            .chown(path, uid, gid)
            .map_err(|cause| StartError::Chown {
                path: path.to_path_buf(),
                cause,
            })?;
        let entries = fs::read_dir(path).map_err(|cause| StartError::CreateDir {
            path: path.to_path_buf(),
            cause,
        })?;
        for entry in entries {
            let entry = entry.map_err(|cause| StartError::CreateDir {
                path: path.to_path_buf(),
                cause,
            })?;
            let child = entry.path();
            if child.is_dir() {
                self.chown_tree(&child, uid, gid)?;
            } else {
                self.fs
                    .chown(&child, uid, gid)
                    .map_err(|cause| StartError::Chown { path: child, cause })?;
            }
        }
        Ok(())
    }
}

fn read_all(reader: &mut Box<dyn Read>, what: &'static str) -> Result<String, StartError> {
    let mut content = String::new();
    reader
        .read_to_string(&mut content)
        .map_err(|cause| StartError::ReadProcFile { what, cause })?;
    Ok(content)
}

/// Parses `/proc/self/cgroup` (`id:subsystems:path` lines) into a map
/// from each individual subsystem to the hierarchy it shares with
/// others and the path this process occupies in it. Subsystems sharing
/// a hierarchy (commonly `cpu,cpuacct`) must later be mounted together
/// under that combined option string.
pub(crate) fn subsystem_groupings(content: &str) -> HashMap<String, Grouping> {
    let mut groupings = HashMap::new();
    for line in content.lines() {
        let segs: Vec<&str> = line.split(':').collect();
        if segs.len() != 3 {
            continue;
        }
        for subsystem in segs[1].split(',') {
            groupings.insert(
                subsystem.to_string(),
                Grouping {
                    subsystems: segs[1].to_string(),
                    path: segs[2].to_string(),
                },
            );
        }
    }
    groupings
}

/// Hierarchies that appear in `/proc/self/cgroup` but have no kernel
/// controller behind them (`name=systemd` and friends). They still
/// have to be mounted for the container runtime to see a complete
/// hierarchy.
pub(crate) fn named_hierarchies<'a>(
    groupings: &'a HashMap<String, Grouping>,
    kernel_subsystems: &[&str],
) -> Vec<(&'a str, &'a Grouping)> {
    groupings
        .iter()
        .filter(|(name, _)| {
            name.starts_with("name=") && !kernel_subsystems.contains(&name.as_str())
        })
        .map(|(name, grouping)| (name.as_str(), grouping))
        .collect()
}

/// Parses the kernel's `/proc/cgroups` table. Anything that does not
/// scan — a missing or reworded header, a row whose numeric columns do
/// not parse, empty input — is a fatal, typed startup error.
pub(crate) fn parse_proc_cgroups(content: &str) -> Result<Vec<KernelSubsystem>, StartError> {
    let mut lines = content.lines();
    let header = match lines.next() {
        Some(header) => header,
        None => {
            return Err(StartError::MalformedProcCgroups {
                content: "(empty)".to_string(),
            })
        }
    };
    if header.split_whitespace().collect::<Vec<_>>() != PROC_CGROUPS_HEADER {
        return Err(StartError::MalformedProcCgroups {
            content: header.to_string(),
        });
    }

    let mut subsystems = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let malformed = || StartError::MalformedProcCgroups {
            content: line.to_string(),
        };
        if fields.len() < 4 {
            return Err(malformed());
        }
        fields[1].parse::<u64>().map_err(|_| malformed())?;
        fields[2].parse::<u64>().map_err(|_| malformed())?;
        let enabled = fields[3].parse::<u64>().map_err(|_| malformed())?;
        subsystems.push(KernelSubsystem {
            name: fields[0].to_string(),
            enabled: enabled != 0,
        });
    }
    Ok(subsystems)
}

/// Resolves the absolute path of the warden CPU cgroup — the context
/// every throttling component (enforcer, balancer, container
/// lifecycle) operates under. On the legacy model the daemon may
/// itself live in a nested cgroup (rootless operation), so the prefix
/// is discovered from `/proc/self/cgroup`.
pub fn cpu_cgroup_path(settings: &Settings, version: CgroupVersion) -> Result<PathBuf, StartError> {
    match version {
        CgroupVersion::V2 => {
            Ok(unified_mount_path(&settings.cgroup_root).join(&settings.warden_cgroup))
        }
        CgroupVersion::V1 => {
            let content = fs::read_to_string("/proc/self/cgroup").map_err(|cause| {
                StartError::ReadProcFile {
                    what: "/proc/self/cgroup",
                    cause,
                }
            })?;
            Ok(nested_cpu_path(settings, &content))
        }
    }
}

fn nested_cpu_path(settings: &Settings, proc_self_cgroup: &str) -> PathBuf {
    let groupings = subsystem_groupings(proc_self_cgroup);
    let mut path = settings.cgroup_root.join("cpu");
    if let Some(grouping) = groupings.get("cpu") {
        path = path.join(grouping.path.trim_start_matches('/'));
    }
    path.join(&settings.warden_cgroup)
}

/// Where the unified hierarchy is mounted for a given root: the system
/// mount point is used as-is, anything else gets a dedicated `unified`
/// subdirectory mounted by bootstrap.
pub(crate) fn unified_mount_path(root: &Path) -> PathBuf {
    if root.starts_with(UNIFIED_ROOT) {
        root.to_path_buf()
    } else {
        root.join(UNIFIED_MOUNT)
    }
}
