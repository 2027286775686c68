/*!
 * Resource-control plane for a Linux container backend.
 *
 * Keeps each container's measured CPU consumption inside its
 * entitlement by migrating container processes between a `good` and a
 * `bad` CPU cgroup and periodically rebalancing the share budget
 * between the two. Also owns the one-time bootstrap of the cgroup
 * filesystem hierarchy everything else depends on.
 *
 * Works against both kernel cgroup models: legacy per-subsystem
 * hierarchies and the unified tree.
 */

pub mod balancer;
mod cgfs;
pub mod cgrouper;
pub mod enforcer;
pub mod error;
pub mod hierarchy;
pub mod metrics;
pub mod mount;
pub mod service;
pub mod shares;
pub mod throttler;

pub use crate::{
    balancer::{MemoryProvider, SharesBalancer, SysinfoMemoryProvider},
    cgfs::CgroupError,
    cgrouper::CpuCgrouper,
    enforcer::{CpuEnforcer, Enforcer},
    error::{AggregateError, BoxError, Error},
    hierarchy::{CgroupVersion, StartError, Starter, BAD_CGROUP, GOOD_CGROUP},
    metrics::{ContainerManager, ContainerMetricsSource, MetricsSource},
    service::{CompositeRunnable, PollingService, Runnable},
    throttler::Throttler,
};

use serde::{Deserialize, Serialize};
use std::{path::PathBuf, str::FromStr};

/// How container CPU accounting and throttling is managed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottlingMode {
    /// Containers are split across good/bad cgroups and migrated by
    /// the enforcer.
    Enabled,
    /// Plain per-container cgroups, no migration.
    Disabled,
    /// Cgroup lifecycle is owned by an external runtime (containerd);
    /// this plane touches nothing.
    Delegated,
}

impl ThrottlingMode {
    pub fn is_enabled(self) -> bool {
        self == ThrottlingMode::Enabled
    }
}

impl FromStr for ThrottlingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(ThrottlingMode::Enabled),
            "disabled" => Ok(ThrottlingMode::Disabled),
            "delegated" => Ok(ThrottlingMode::Delegated),
            other => Err(format!(
                "unknown throttling mode '{}' (expected enabled, disabled or delegated)",
                other
            )),
        }
    }
}

/// Cumulative CPU time of one container, uniformly in nanoseconds.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct CpuStats {
    pub usage: u64,
    pub user: u64,
    pub system: u64,
}

/// One container's measured usage paired with its entitlement, as
/// reported by the container manager each cycle.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ContainerMetrics {
    pub cpu: CpuStats,
    pub cpu_entitlement: u64,
}

/// A device cgroup whitelist entry, rendered in the kernel's
/// `type major:minor access` form with `*` for wildcards.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceRule {
    pub device_type: char,
    pub major: Option<i64>,
    pub minor: Option<i64>,
    pub access: String,
}

impl DeviceRule {
    pub fn char_device(major: Option<i64>, minor: Option<i64>, access: &str) -> DeviceRule {
        DeviceRule {
            device_type: 'c',
            major,
            minor,
            access: access.to_string(),
        }
    }

    pub(crate) fn rule_line(&self) -> String {
        let number = |n: Option<i64>| match n {
            Some(n) => n.to_string(),
            None => "*".to_string(),
        };
        format!(
            "{} {}:{} {}",
            self.device_type,
            number(self.major),
            number(self.minor),
            self.access
        )
    }
}

/// Daemon-level configuration for the control plane.
#[non_exhaustive]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Settings {
    /// Root of the cgroup filesystem. The default `/sys/fs/cgroup`
    /// can be overridden at runtime with the `CGWARDEN_CGROUPFS`
    /// environment variable.
    pub cgroup_root: PathBuf,

    /// Name of the working cgroup directory created under every
    /// hierarchy; all container cgroups nest below it.
    pub warden_cgroup: String,

    pub throttling: ThrottlingMode,

    /// Owner for created cgroup directories, required for rootless
    /// operation.
    pub owner: Option<(libc::uid_t, libc::gid_t)>,

    /// Root of the OCI runtime's state directory, when its recorded
    /// cgroup paths must be kept in sync with migrations.
    pub runc_root: Option<PathBuf>,

    /// Namespace under the runtime state root.
    pub namespace: String,

    /// Scales the bad cgroup's aggregate share budget.
    pub shares_multiplier: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            cgroup_root: std::env::var_os("CGWARDEN_CGROUPFS")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/sys/fs/cgroup")),
            warden_cgroup: "warden".to_string(),
            throttling: ThrottlingMode::Disabled,
            owner: None,
            runc_root: None,
            namespace: "warden".to_string(),
            shares_multiplier: 1.0,
        }
    }
}

impl Settings {
    pub fn new() -> Settings {
        Default::default()
    }

    /// The runtime state directory state-file patches go to, if any.
    pub fn runtime_state_dir(&self) -> Option<PathBuf> {
        self.runc_root
            .as_ref()
            .map(|root| root.join(&self.namespace))
    }
}
