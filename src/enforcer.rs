//! Punish/release enforcement: migrates all of a container's processes
//! between its good and bad CPU cgroups while preserving the
//! container's share value across the move.

use crate::{
    cgfs::{self, CgroupError},
    error::Error,
    hierarchy::{CgroupVersion, BAD_CGROUP, GOOD_CGROUP},
};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// Upper bound on list-and-move passes over the source cgroup. The
/// kernel offers no atomic bulk move, so processes forked mid-migration
/// are picked up by later passes; a container forking faster than it
/// drains hits the cap, surfaces an error and is retried on a later
/// cycle instead of wedging the worker forever.
const MAX_DRAIN_PASSES: usize = 32;

pub trait Enforcer {
    fn punish(&self, handle: &str) -> Result<(), Error>;
    fn release(&self, handle: &str) -> Result<(), Error>;
}

#[derive(Debug)]
pub struct CpuEnforcer {
    good_cgroup_path: PathBuf,
    bad_cgroup_path: PathBuf,
    shares_file: &'static str,
    version: CgroupVersion,
    /// `<runtime root>/<namespace>`, holding one state file per
    /// container. None when no OCI runtime state needs patching.
    state_dir: Option<PathBuf>,
}

impl CpuEnforcer {
    pub fn new(
        cpu_cgroup_path: &Path,
        version: CgroupVersion,
        state_dir: Option<PathBuf>,
    ) -> CpuEnforcer {
        let shares_file = match version {
            CgroupVersion::V1 => "cpu.shares",
            CgroupVersion::V2 => "cpu.weight",
        };
        CpuEnforcer {
            good_cgroup_path: cpu_cgroup_path.join(GOOD_CGROUP),
            bad_cgroup_path: cpu_cgroup_path.join(BAD_CGROUP),
            shares_file,
            version,
            state_dir,
        }
    }

    /// Shares are copied before any process lands in the destination
    /// group, so a migrated container never runs under a stale weight.
    fn copy_shares(&self, from: &Path, to: &Path) -> Result<(), CgroupError> {
        let shares = cgfs::read_to_string(&from.join(self.shares_file))?;
        cgfs::write(&to.join(self.shares_file), shares.as_bytes())
    }

    fn move_pids(&self, from: &Path, to: &Path) -> Result<(), CgroupError> {
        for _ in 0..MAX_DRAIN_PASSES {
            let pids = cgfs::get_pids(from)?;
            if pids.is_empty() {
                return Ok(());
            }
            tracing::debug!(
                from = %from.display(),
                to = %to.display(),
                count = pids.len(),
                "moving processes"
            );
            for pid in pids {
                cgfs::write_pid(to, pid)?;
            }
        }
        Err(CgroupError::DrainAttemptsExhausted {
            path: from.to_path_buf(),
            attempts: MAX_DRAIN_PASSES,
        })
    }

    /// The OCI runtime resolves container pids through the cgroup path
    /// recorded in its state file; on the unified hierarchy that path
    /// changes with every migration and has to be patched, atomically,
    /// so the runtime never reads a torn file. A container without a
    /// state file has simply not been created by that runtime.
    fn update_state_cgroup_path(&self, handle: &str, cgroup_path: &Path) -> Result<(), CgroupError> {
        if self.version != CgroupVersion::V2 {
            return Ok(());
        }
        let state_dir = match &self.state_dir {
            Some(dir) => dir.join(handle),
            None => return Ok(()),
        };
        let state_path = state_dir.join("state.json");

        let file = match fs::File::open(&state_path) {
            Ok(file) => file,
            Err(ref cause) if cause.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(cause) => {
                return Err(CgroupError::State {
                    path: state_path,
                    cause,
                })
            }
        };
        let mut state: serde_json::Value = serde_json::from_reader(io::BufReader::new(file))
            .map_err(|cause| CgroupError::StateJson {
                path: state_path.clone(),
                cause,
            })?;

        let rendered = cgroup_path.display().to_string();
        match state
            .get_mut("cgroup_paths")
            .and_then(|paths| paths.as_object_mut())
        {
            Some(paths) => {
                paths.insert(String::new(), serde_json::Value::String(rendered));
            }
            None => {
                if let Some(object) = state.as_object_mut() {
                    let mut paths = serde_json::Map::new();
                    paths.insert(String::new(), serde_json::Value::String(rendered));
                    object.insert("cgroup_paths".to_string(), serde_json::Value::Object(paths));
                }
            }
        }

        let tmp_path = state_dir.join("state.json.tmp");
        let tmp = fs::File::create(&tmp_path).map_err(|cause| CgroupError::State {
            path: tmp_path.clone(),
            cause,
        })?;
        serde_json::to_writer(&tmp, &state).map_err(|cause| CgroupError::StateJson {
            path: tmp_path.clone(),
            cause,
        })?;
        drop(tmp);
        fs::rename(&tmp_path, &state_path).map_err(|cause| CgroupError::State {
            path: state_path,
            cause,
        })
    }
}

impl Enforcer for CpuEnforcer {
    #[tracing::instrument(skip(self))]
    fn punish(&self, handle: &str) -> Result<(), Error> {
        let good = self.good_cgroup_path.join(handle);
        // the container either predates throttling or is already fully
        // migrated; both are satisfied post-conditions
        if !cgroup_exists(&good) {
            tracing::info!(handle, path = %good.display(), "good cgroup does not exist, skipping punish");
            return Ok(());
        }
        let bad = self.bad_cgroup_path.join(handle);

        self.copy_shares(&good, &bad)?;
        self.move_pids(&good, &bad)?;
        self.update_state_cgroup_path(handle, &bad)?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn release(&self, handle: &str) -> Result<(), Error> {
        let bad = self.bad_cgroup_path.join(handle);
        if !cgroup_exists(&bad) {
            tracing::info!(handle, path = %bad.display(), "bad cgroup does not exist, skipping release");
            return Ok(());
        }
        let good = self.good_cgroup_path.join(handle);

        // shares stay as punish left them, already consistent
        self.move_pids(&bad, &good)?;
        self.update_state_cgroup_path(handle, &good)?;
        Ok(())
    }
}

fn cgroup_exists(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(_) => true,
        Err(ref err) if err.kind() == io::ErrorKind::NotFound => false,
        Err(err) => {
            tracing::error!(path = %path.display(), error = %err, "failed to stat cgroup path");
            false
        }
    }
}
