//! Unified hierarchy bootstrap. The kernel already presents a single
//! tree, so this is mostly verification plus carving out the warden
//! subtree and delegating controllers into it.

use super::{unified_mount_path, StartError, Starter, BAD_CGROUP, GOOD_CGROUP};
use crate::cgfs::{self, CgroupError};
use std::{fs, path::Path};

impl Starter {
    pub(super) fn start_unified(&self) -> Result<(), StartError> {
        let mount_path = unified_mount_path(&self.root);
        if mount_path != self.root {
            self.idempotent_cgroup2_mount(&mount_path)?;
        }

        let warden_path = mount_path.join(&self.warden_cgroup);
        self.create_chowned_cgroup(&warden_path)?;
        enable_supported_controllers(&warden_path)?;

        if self.cpu_throttling {
            for name in &[GOOD_CGROUP, BAD_CGROUP] {
                let path = warden_path.join(name);
                self.create_chowned_cgroup(&path)?;
                enable_supported_controllers(&path)?;
            }
        }

        Ok(())
    }

    fn idempotent_cgroup2_mount(&self, path: &Path) -> Result<(), StartError> {
        fs::create_dir_all(path).map_err(|cause| StartError::CreateDir {
            path: path.to_path_buf(),
            cause,
        })?;

        match self.fs.mount("cgroup", path, "cgroup2", "") {
            Ok(()) => {
                tracing::info!(path = %path.display(), "mounted unified hierarchy");
            }
            Err(nix::Error::Sys(nix::errno::Errno::EBUSY)) => {
                tracing::info!(path = %path.display(), "unified hierarchy already mounted");
            }
            Err(cause) => {
                return Err(StartError::MountUnified {
                    path: path.to_path_buf(),
                    cause,
                })
            }
        }
        Ok(())
    }
}

/// Delegates every controller the parent offers into a freshly created
/// cgroup. Without `cpu` in the parent's `cgroup.subtree_control` the
/// child cannot account CPU at all. Tries one bulk write, then falls
/// back to per-controller writes, tolerating the ones the kernel
/// rejects in a nested tree.
pub(crate) fn enable_supported_controllers(cgroup_path: &Path) -> Result<(), CgroupError> {
    let parent = match cgroup_path.parent() {
        Some(parent) => parent,
        None => return Ok(()),
    };

    let content = cgfs::read_to_string(&parent.join("cgroup.controllers"))?;
    let controllers: Vec<String> = content
        .split_whitespace()
        .map(|controller| format!("+{}", controller))
        .collect();
    if controllers.is_empty() {
        return Ok(());
    }

    let subtree_control = parent.join("cgroup.subtree_control");
    if fs::write(&subtree_control, controllers.join(" ")).is_err() {
        for controller in &controllers {
            let _ = fs::write(&subtree_control, controller);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hierarchy::CgroupVersion,
        mount::MountFs,
        Settings, ThrottlingMode,
    };
    use std::{
        io::{self, Read},
        path::PathBuf,
    };

    /// All-Ok fake; the unified flow needs no mount inspection beyond
    /// "did it not explode".
    struct NullFs;

    impl MountFs for NullFs {
        fn mount(&self, _: &str, _: &Path, _: &str, _: &str) -> Result<(), nix::Error> {
            Ok(())
        }

        fn chown(&self, _: &Path, _: u32, _: u32) -> Result<(), nix::Error> {
            Ok(())
        }

        fn is_mount_point(&self, _: &Path) -> io::Result<bool> {
            Ok(true)
        }
    }

    fn reader() -> Box<dyn Read> {
        Box::new(io::empty())
    }

    fn start(root: &Path) -> Result<(), StartError> {
        let mut settings = Settings::default();
        settings.cgroup_root = root.to_path_buf();
        settings.warden_cgroup = "warden".to_string();
        settings.throttling = ThrottlingMode::Enabled;
        Starter::new(
            &settings,
            CgroupVersion::V2,
            reader(),
            reader(),
            Vec::new(),
            Box::new(NullFs),
        )
        .start()
    }

    fn seed_controllers(dir: &PathBuf, controllers: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("cgroup.controllers"), controllers).unwrap();
    }

    #[test]
    fn creates_good_and_bad_and_delegates_controllers() {
        let root = tempfile::tempdir().unwrap();
        let unified = root.path().join("unified");
        seed_controllers(&unified, "cpuset cpu io memory pids");
        seed_controllers(&unified.join("warden"), "cpu memory pids");

        start(root.path()).unwrap();

        assert!(unified.join("warden/good").is_dir());
        assert!(unified.join("warden/bad").is_dir());
        assert_eq!(
            fs::read_to_string(unified.join("cgroup.subtree_control")).unwrap(),
            "+cpuset +cpu +io +memory +pids"
        );
        assert_eq!(
            fs::read_to_string(unified.join("warden/cgroup.subtree_control")).unwrap(),
            "+cpu +memory +pids"
        );
    }

    #[test]
    fn missing_controllers_file_fails_startup() {
        let root = tempfile::tempdir().unwrap();
        let err = start(root.path()).unwrap_err();
        assert!(matches!(err, StartError::Cgroup(CgroupError::Read { .. })));
    }

    #[test]
    fn rejected_controller_writes_are_tolerated() {
        let root = tempfile::tempdir().unwrap();
        let unified = root.path().join("unified");
        seed_controllers(&unified, "cpu");
        seed_controllers(&unified.join("warden"), "cpu");
        // a directory in place of the control file makes every write
        // fail, standing in for a kernel that rejects delegation
        fs::create_dir_all(unified.join("cgroup.subtree_control")).unwrap();

        start(root.path()).unwrap();
    }
}
