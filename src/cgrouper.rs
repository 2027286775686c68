//! Per-container CPU cgroup lifecycle. Three interchangeable
//! strategies sit behind one closed enum, selected once from
//! configuration: the throttling strategy manages the container's
//! `bad` cgroup, the passthrough strategy only cleans up the plain
//! per-container cgroup, and the delegated strategy does nothing
//! because an external runtime owns accounting.

use crate::{
    cgfs::{self, CgroupError},
    hierarchy::{enable_supported_controllers, CgroupVersion, BAD_CGROUP, GOOD_CGROUP},
    CpuStats, ThrottlingMode,
};
use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};

/// Nanoseconds per USER_HZ tick; `cpuacct.stat` reports user/system
/// time in ticks on the legacy hierarchy.
static NS_PER_TICK: Lazy<u64> = Lazy::new(|| {
    let ticks_per_sec = nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK)
        .ok()
        .flatten()
        .unwrap_or(100) as u64;
    1_000_000_000 / ticks_per_sec
});

#[derive(Debug)]
pub struct CpuCgrouper {
    inner: Inner,
}

#[derive(Debug)]
enum Inner {
    Throttled(Throttled),
    Passthrough(Passthrough),
    Delegated,
}

#[derive(Debug)]
struct Throttled {
    cpu_root: PathBuf,
    version: CgroupVersion,
}

#[derive(Debug)]
struct Passthrough {
    cpu_root: PathBuf,
}

impl CpuCgrouper {
    pub fn new(mode: ThrottlingMode, cpu_cgroup_path: PathBuf, version: CgroupVersion) -> Self {
        let inner = match mode {
            ThrottlingMode::Enabled => Inner::Throttled(Throttled {
                cpu_root: cpu_cgroup_path,
                version,
            }),
            ThrottlingMode::Disabled => Inner::Passthrough(Passthrough {
                cpu_root: cpu_cgroup_path,
            }),
            ThrottlingMode::Delegated => Inner::Delegated,
        };
        CpuCgrouper { inner }
    }

    /// Called at container creation. The `good` side is created by the
    /// OCI runtime as part of the normal cgroup assignment; creating
    /// the `bad` side eagerly here means a later punish never races
    /// cgroup creation.
    pub fn prepare_cgroups(&self, handle: &str) -> Result<(), CgroupError> {
        match &self.inner {
            Inner::Throttled(throttled) => throttled.prepare(handle),
            Inner::Passthrough(_) | Inner::Delegated => Ok(()),
        }
    }

    /// Called at container destruction. Directories that are already
    /// gone are fine.
    pub fn cleanup_cgroups(&self, handle: &str) -> Result<(), CgroupError> {
        match &self.inner {
            Inner::Throttled(throttled) => throttled.cleanup(handle),
            Inner::Passthrough(passthrough) => {
                cgfs::remove_dir_all(&passthrough.cpu_root.join(handle))
            }
            Inner::Delegated => Ok(()),
        }
    }

    /// Completes the caller's measured CPU stats into a total over both
    /// halves of the container's cgroup pair, uniformly in nanoseconds.
    pub fn read_total_usage(
        &self,
        handle: &str,
        current: CpuStats,
    ) -> Result<CpuStats, CgroupError> {
        match &self.inner {
            Inner::Throttled(throttled) => {
                let bad = throttled.read_bad_usage(handle)?;
                Ok(CpuStats {
                    usage: current.usage + bad.usage,
                    user: current.user + bad.user,
                    system: current.system + bad.system,
                })
            }
            Inner::Passthrough(_) => Ok(current),
            Inner::Delegated => Ok(CpuStats::default()),
        }
    }
}

impl Throttled {
    fn prepare(&self, handle: &str) -> Result<(), CgroupError> {
        let bad = self.cpu_root.join(BAD_CGROUP).join(handle);
        tracing::debug!(handle, path = %bad.display(), "preparing bad cgroup");
        cgfs::create_dir_all(&bad)?;
        if self.version == CgroupVersion::V2 {
            enable_supported_controllers(&bad)?;
        }
        Ok(())
    }

    fn cleanup(&self, handle: &str) -> Result<(), CgroupError> {
        cgfs::remove_dir_all(&self.cpu_root.join(BAD_CGROUP).join(handle))?;
        cgfs::remove_dir_all(&self.cpu_root.join(GOOD_CGROUP).join(handle))
    }

    /// The bad cgroup is created eagerly at prepare, so a missing
    /// directory means the container is mid-create or mid-destroy;
    /// either way it owes no throttled time yet.
    fn read_bad_usage(&self, handle: &str) -> Result<CpuStats, CgroupError> {
        let path = self.cpu_root.join(BAD_CGROUP).join(handle);
        if !path.exists() {
            return Ok(CpuStats::default());
        }

        match self.version {
            CgroupVersion::V1 => {
                let usage = cgfs::read_u64(&path.join("cpuacct.usage"))?;
                let stat_path = path.join("cpuacct.stat");
                let content = cgfs::read_to_string(&stat_path)?;
                let (user_ticks, system_ticks) = parse_cpuacct_stat(&content, &stat_path)?;
                Ok(CpuStats {
                    usage,
                    user: user_ticks * *NS_PER_TICK,
                    system: system_ticks * *NS_PER_TICK,
                })
            }
            CgroupVersion::V2 => {
                let stat_path = path.join("cpu.stat");
                let content = cgfs::read_to_string(&stat_path)?;
                parse_cpu_stat(&content, &stat_path)
            }
        }
    }
}

/// `cpuacct.stat` carries `user <ticks>` / `system <ticks>` lines.
fn parse_cpuacct_stat(content: &str, path: &Path) -> Result<(u64, u64), CgroupError> {
    let mut user = 0;
    let mut system = 0;
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let key = match fields.next() {
            Some(key) => key,
            None => continue,
        };
        let value = fields
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| CgroupError::Parse {
                path: path.to_path_buf(),
                content: line.to_string(),
            })?;
        match key {
            "user" => user = value,
            "system" => system = value,
            _ => {}
        }
    }
    Ok((user, system))
}

/// `cpu.stat` on the unified hierarchy reports everything in
/// microseconds.
fn parse_cpu_stat(content: &str, path: &Path) -> Result<CpuStats, CgroupError> {
    let mut stats = CpuStats::default();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let key = match fields.next() {
            Some(key) => key,
            None => continue,
        };
        let value: u64 = match fields.next().and_then(|v| v.parse().ok()) {
            Some(value) => value,
            None => {
                return Err(CgroupError::Parse {
                    path: path.to_path_buf(),
                    content: line.to_string(),
                })
            }
        };
        match key {
            "usage_usec" => stats.usage = value * 1000,
            "user_usec" => stats.user = value * 1000,
            "system_usec" => stats.system = value * 1000,
            _ => {}
        }
    }
    Ok(stats)
}
