//! Rebalances the aggregate CPU share budget between the top-level
//! good and bad cgroups as containers migrate between them.

use crate::{
    cgfs::{self, CgroupError},
    error::{BoxError, Error},
    hierarchy::{CgroupVersion, BAD_CGROUP, GOOD_CGROUP},
    service::Runnable,
    shares,
};
use std::{fs, path::{Path, PathBuf}};

const MB: u64 = 1024 * 1024;

/// The host memory collaborator.
pub trait MemoryProvider {
    fn total_memory(&self) -> Result<u64, BoxError>;
}

/// Reads total system memory straight from the kernel via sysinfo(2).
#[derive(Debug, Default)]
pub struct SysinfoMemoryProvider;

impl MemoryProvider for SysinfoMemoryProvider {
    fn total_memory(&self) -> Result<u64, BoxError> {
        let info = nix::sys::sysinfo::sysinfo()?;
        Ok(info.ram_total())
    }
}

pub struct SharesBalancer<P> {
    memory_provider: P,
    good_cgroup_path: PathBuf,
    bad_cgroup_path: PathBuf,
    multiplier: f64,
    version: CgroupVersion,
}

impl<P> SharesBalancer<P> {
    pub fn new(
        cpu_cgroup_path: &Path,
        memory_provider: P,
        multiplier: f64,
        version: CgroupVersion,
    ) -> Self {
        SharesBalancer {
            memory_provider,
            good_cgroup_path: cpu_cgroup_path.join(GOOD_CGROUP),
            bad_cgroup_path: cpu_cgroup_path.join(BAD_CGROUP),
            multiplier,
            version,
        }
    }
}

impl<P: MemoryProvider> SharesBalancer<P> {
    /// Sums the shares of every container currently occupying the bad
    /// cgroup, skipping sub-cgroups with no live processes.
    fn count_shares(&self, cgroup_path: &Path) -> Result<u64, Error> {
        let read_err = |cause| {
            Error::from(CgroupError::Read {
                path: cgroup_path.to_path_buf(),
                cause,
            })
        };
        let mut total = 0;
        for entry in fs::read_dir(cgroup_path).map_err(read_err)? {
            let entry = entry.map_err(read_err)?;
            if !entry.path().is_dir() {
                continue;
            }
            if !cgfs::has_procs(&entry.path()) {
                continue;
            }
            total += self.get_shares(&entry.path())?;
        }
        Ok(total)
    }

    fn get_shares(&self, cgroup_path: &Path) -> Result<u64, Error> {
        let shares = match self.version {
            CgroupVersion::V1 => cgfs::read_u64(&cgroup_path.join("cpu.shares"))?,
            CgroupVersion::V2 => {
                let weight = cgfs::read_u64(&cgroup_path.join("cpu.weight"))?;
                shares::weight_to_shares(weight)
            }
        };
        Ok(shares)
    }

    fn set_shares(&self, cgroup_path: &Path, shares: u64) -> Result<(), Error> {
        tracing::info!(path = %cgroup_path.display(), shares, "setting aggregate shares");
        let mut buf = itoa::Buffer::new();
        match self.version {
            CgroupVersion::V1 => {
                // the kernel clamps an oversized write into the legal
                // shares range by itself
                cgfs::write(
                    &cgroup_path.join("cpu.shares"),
                    buf.format(shares).as_bytes(),
                )?;
            }
            CgroupVersion::V2 => {
                let weight = shares::shares_to_weight(shares).min(shares::MAX_WEIGHT);
                cgfs::write(
                    &cgroup_path.join("cpu.weight"),
                    buf.format(weight).as_bytes(),
                )?;
            }
        }
        Ok(())
    }
}

impl<P: MemoryProvider + Send + Sync> Runnable for SharesBalancer<P> {
    fn name(&self) -> &'static str {
        "shares-balancer"
    }

    fn run(&self) -> Result<(), Error> {
        let total_memory = self
            .memory_provider
            .total_memory()
            .map_err(|cause| Error::TotalMemory { cause })?;

        let mut bad_shares = self.count_shares(&self.bad_cgroup_path)?;
        bad_shares = (bad_shares as f64 * self.multiplier) as u64;
        if bad_shares == 0 {
            bad_shares = shares::MIN_SHARES;
        }

        // Fixed legacy policy: the good budget is total memory in
        // megabytes minus the bad shares. When the bad side exceeds
        // the budget the subtraction wraps; the kernel clamps the
        // resulting oversized value to the maximum, and the v2 path
        // clamps the converted weight explicitly.
        let good_shares = (total_memory / MB).wrapping_sub(bad_shares);

        self.set_shares(&self.good_cgroup_path, good_shares)?;
        self.set_shares(&self.bad_cgroup_path, bad_shares)?;
        Ok(())
    }
}
