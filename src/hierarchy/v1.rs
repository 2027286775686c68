//! Legacy hierarchy assembly: one mount per kernel subsystem, grouped
//! subsystems mounted together, plus named hierarchies.

use super::{
    named_hierarchies, parse_proc_cgroups, subsystem_groupings, StartError, Starter, BAD_CGROUP,
    GOOD_CGROUP,
};
use std::{
    fs,
    path::{Path, PathBuf},
};

impl Starter {
    pub(super) fn start_legacy(
        &self,
        proc_cgroups: &str,
        proc_self_cgroup: &str,
    ) -> Result<(), StartError> {
        let groupings = subsystem_groupings(proc_self_cgroup);
        let subsystems = parse_proc_cgroups(proc_cgroups)?;
        let kernel_names: Vec<&str> = subsystems.iter().map(|s| s.name.as_str()).collect();

        for subsystem in &subsystems {
            if !subsystem.enabled {
                tracing::debug!(subsystem = %subsystem.name, "subsystem disabled by kernel, skipping");
                continue;
            }

            // Subsystems sharing a hierarchy must be mounted under the
            // combined option string, and the warden dir goes under the
            // path this process already occupies in that hierarchy.
            let (to_mount, dir_to_create) = match groupings.get(&subsystem.name) {
                Some(grouping) => (
                    grouping.subsystems.clone(),
                    Path::new(grouping.path.trim_start_matches('/')).join(&self.warden_cgroup),
                ),
                None => (subsystem.name.clone(), PathBuf::from(&self.warden_cgroup)),
            };

            let mount_path = self.root.join(&subsystem.name);
            let warden_path = mount_path.join(&dir_to_create);
            self.create_and_chown_cgroup(&mount_path, &to_mount, &warden_path)?;

            if subsystem.name == "devices" {
                let policy_target = if self.cpu_throttling {
                    warden_path.join(GOOD_CGROUP)
                } else {
                    warden_path.clone()
                };
                self.modify_allowed_devices(&policy_target)?;
            }
        }

        for (subsystem, grouping) in named_hierarchies(&groupings, &kernel_names) {
            let name = subsystem.trim_start_matches("name=");
            let mount_path = self.root.join(name);
            let warden_path = mount_path
                .join(grouping.path.trim_start_matches('/'))
                .join(&self.warden_cgroup);
            self.create_and_chown_cgroup(&mount_path, subsystem, &warden_path)?;
        }

        Ok(())
    }

    fn create_and_chown_cgroup(
        &self,
        mount_path: &Path,
        subsystem: &str,
        warden_path: &Path,
    ) -> Result<(), StartError> {
        self.idempotent_cgroup_mount(mount_path, subsystem)?;
        self.create_chowned_cgroup(warden_path)?;

        if self.cpu_throttling {
            self.create_chowned_cgroup(&warden_path.join(GOOD_CGROUP))?;
            if subsystem.split(',').any(|s| s == "cpu") {
                self.create_chowned_cgroup(&warden_path.join(BAD_CGROUP))?;
            }
        }

        Ok(())
    }

    fn idempotent_cgroup_mount(&self, path: &Path, subsystem: &str) -> Result<(), StartError> {
        fs::create_dir_all(path).map_err(|cause| StartError::CreateDir {
            path: path.to_path_buf(),
            cause,
        })?;

        match self.fs.mount("cgroup", path, "cgroup", subsystem) {
            Ok(()) => {
                tracing::info!(path = %path.display(), subsystem, "mounted subsystem");
            }
            // mounting over an existing mount of the same source and
            // type reports EBUSY
            Err(nix::Error::Sys(nix::errno::Errno::EBUSY)) => {
                tracing::info!(path = %path.display(), subsystem, "subsystem already mounted");
            }
            Err(cause) => {
                return Err(StartError::MountSubsystem {
                    subsystem: subsystem.to_string(),
                    path: path.to_path_buf(),
                    cause,
                })
            }
        }
        Ok(())
    }

    fn modify_allowed_devices(&self, dir: &Path) -> Result<(), StartError> {
        if has_subdirectories(dir)? {
            tracing::debug!(path = %dir.display(), "cgroup has children, device policy left as-is");
            return Ok(());
        }

        let policy_err = |path: PathBuf| move |cause| StartError::DevicePolicy { path, cause };

        tracing::info!(path = %dir.display(), "writing device policy");
        fs::write(dir.join("devices.deny"), b"a")
            .map_err(policy_err(dir.join("devices.deny")))?;
        for device in &self.allowed_devices {
            fs::write(dir.join("devices.allow"), device.rule_line())
                .map_err(policy_err(dir.join("devices.allow")))?;
        }
        Ok(())
    }
}

fn has_subdirectories(dir: &Path) -> Result<bool, StartError> {
    let entries = fs::read_dir(dir).map_err(|cause| StartError::DevicePolicy {
        path: dir.to_path_buf(),
        cause,
    })?;
    for entry in entries {
        let entry = entry.map_err(|cause| StartError::DevicePolicy {
            path: dir.to_path_buf(),
            cause,
        })?;
        if entry.path().is_dir() {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use crate::{
        hierarchy::{CgroupVersion, StartError, Starter},
        mount::MountFs,
        DeviceRule, Settings, ThrottlingMode,
    };
    use parking_lot::Mutex;
    use std::{
        collections::HashSet,
        io::{self, Read},
        path::{Path, PathBuf},
        sync::Arc,
    };

    const PROC_CGROUPS: &str = "#subsys_name\thierarchy\tnum_cgroups\tenabled\n\
                                cpu\t11\t2\t1\n\
                                cpuacct\t11\t2\t1\n\
                                devices\t10\t2\t1\n\
                                memory\t9\t2\t0\n";
    const PROC_SELF: &str = "11:cpu,cpuacct:/parent\n10:devices:/\n";

    #[derive(Debug, Clone)]
    struct Mount {
        source: String,
        target: PathBuf,
        fstype: String,
        data: String,
    }

    #[derive(Clone, Default)]
    struct FakeFs(Arc<FakeFsInner>);

    #[derive(Default)]
    struct FakeFsInner {
        mounts: Mutex<Vec<Mount>>,
        chowns: Mutex<Vec<(PathBuf, u32, u32)>>,
        root_mounted: Mutex<bool>,
        busy: Mutex<HashSet<String>>,
        denied: Mutex<HashSet<String>>,
    }

    impl FakeFs {
        fn mounts(&self) -> Vec<Mount> {
            self.0.mounts.lock().clone()
        }

        fn mark_busy(&self, data: &str) {
            self.0.busy.lock().insert(data.to_string());
        }

        fn deny(&self, data: &str) {
            self.0.denied.lock().insert(data.to_string());
        }
    }

    impl MountFs for FakeFs {
        fn mount(
            &self,
            source: &str,
            target: &Path,
            fstype: &str,
            data: &str,
        ) -> Result<(), nix::Error> {
            if self.0.denied.lock().contains(data) {
                return Err(nix::Error::Sys(nix::errno::Errno::EACCES));
            }
            if self.0.busy.lock().contains(data) {
                return Err(nix::Error::Sys(nix::errno::Errno::EBUSY));
            }
            self.0.mounts.lock().push(Mount {
                source: source.to_string(),
                target: target.to_path_buf(),
                fstype: fstype.to_string(),
                data: data.to_string(),
            });
            Ok(())
        }

        fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<(), nix::Error> {
            self.0.chowns.lock().push((path.to_path_buf(), uid, gid));
            Ok(())
        }

        fn is_mount_point(&self, _path: &Path) -> io::Result<bool> {
            Ok(*self.0.root_mounted.lock())
        }
    }

    fn reader(content: &str) -> Box<dyn Read> {
        Box::new(io::Cursor::new(content.to_string()))
    }

    fn settings(root: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.cgroup_root = root.to_path_buf();
        settings.warden_cgroup = "warden".to_string();
        settings.throttling = ThrottlingMode::Enabled;
        settings
    }

    fn starter(settings: &Settings, fake: &FakeFs, proc_cgroups: &str, proc_self: &str) -> Starter {
        Starter::new(
            settings,
            CgroupVersion::V1,
            reader(proc_cgroups),
            reader(proc_self),
            vec![DeviceRule::char_device(Some(1), Some(3), "rwm")],
            Box::new(fake.clone()),
        )
    }

    #[test]
    fn mounts_enabled_subsystems_and_builds_warden_dirs() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());
        let fake = FakeFs::default();

        starter(&settings, &fake, PROC_CGROUPS, PROC_SELF)
            .start()
            .unwrap();

        let mounts = fake.mounts();
        assert_eq!(mounts[0].fstype, "tmpfs");
        assert_eq!(mounts[0].target, root.path());

        let cgroup_mounts: Vec<&Mount> =
            mounts.iter().filter(|m| m.fstype == "cgroup").collect();
        let find = |target: PathBuf| {
            cgroup_mounts
                .iter()
                .find(|m| m.target == target)
                .unwrap_or_else(|| panic!("no mount at {:?}", target))
                .data
                .clone()
        };
        assert_eq!(find(root.path().join("cpu")), "cpu,cpuacct");
        assert_eq!(find(root.path().join("cpuacct")), "cpu,cpuacct");
        assert_eq!(find(root.path().join("devices")), "devices");
        // the disabled memory subsystem is skipped
        assert!(!cgroup_mounts
            .iter()
            .any(|m| m.target == root.path().join("memory")));

        // warden dirs nest under the daemon's own cgroup path
        assert!(root.path().join("cpu/parent/warden/good").is_dir());
        assert!(root.path().join("cpu/parent/warden/bad").is_dir());
        assert!(root.path().join("cpuacct/parent/warden/bad").is_dir());
        assert!(root.path().join("devices/warden/good").is_dir());
    }

    #[test]
    fn writes_device_policy_into_the_good_cgroup() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());
        let fake = FakeFs::default();

        starter(&settings, &fake, PROC_CGROUPS, PROC_SELF)
            .start()
            .unwrap();

        let good = root.path().join("devices/warden/good");
        assert_eq!(std::fs::read_to_string(good.join("devices.deny")).unwrap(), "a");
        assert_eq!(
            std::fs::read_to_string(good.join("devices.allow")).unwrap(),
            "c 1:3 rwm"
        );
    }

    #[test]
    fn device_policy_left_alone_when_cgroup_has_children() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());
        let fake = FakeFs::default();
        std::fs::create_dir_all(root.path().join("devices/warden/good/existing")).unwrap();

        starter(&settings, &fake, PROC_CGROUPS, PROC_SELF)
            .start()
            .unwrap();

        assert!(!root
            .path()
            .join("devices/warden/good/devices.deny")
            .exists());
    }

    #[test]
    fn malformed_proc_cgroups_aborts_startup() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());
        let fake = FakeFs::default();

        let err = starter(&settings, &fake, "#subsys_name bogus\n", PROC_SELF)
            .start()
            .unwrap_err();
        assert!(matches!(err, StartError::MalformedProcCgroups { .. }));
    }

    #[test]
    fn already_mounted_subsystems_are_tolerated() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());
        let fake = FakeFs::default();
        fake.mark_busy("cpu,cpuacct");
        fake.mark_busy("devices");

        starter(&settings, &fake, PROC_CGROUPS, PROC_SELF)
            .start()
            .unwrap();
        // and a full re-run stays clean
        starter(&settings, &fake, PROC_CGROUPS, PROC_SELF)
            .start()
            .unwrap();
    }

    #[test]
    fn failing_subsystem_mount_names_the_subsystem() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());
        let fake = FakeFs::default();
        fake.deny("devices");

        let err = starter(&settings, &fake, PROC_CGROUPS, PROC_SELF)
            .start()
            .unwrap_err();
        match err {
            StartError::MountSubsystem { subsystem, .. } => assert_eq!(subsystem, "devices"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn named_hierarchies_are_mounted_as_their_own_subsystem() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());
        let fake = FakeFs::default();
        let proc_self = format!("{}9:name=systemd:/init\n", PROC_SELF);

        starter(&settings, &fake, PROC_CGROUPS, &proc_self)
            .start()
            .unwrap();

        let mounts = fake.mounts();
        let systemd = mounts
            .iter()
            .find(|m| m.target == root.path().join("systemd"))
            .expect("named hierarchy not mounted");
        assert_eq!(systemd.data, "name=systemd");
        assert!(root.path().join("systemd/init/warden").is_dir());
    }

    #[test]
    fn chowns_created_cgroups_for_rootless_owner() {
        let root = tempfile::tempdir().unwrap();
        let mut settings = settings(root.path());
        settings.owner = Some((1000, 1000));
        let fake = FakeFs::default();

        starter(&settings, &fake, PROC_CGROUPS, PROC_SELF)
            .start()
            .unwrap();

        let chowns = fake.0.chowns.lock();
        assert!(chowns
            .iter()
            .any(|(path, uid, gid)| path.ends_with("cpu/parent/warden") && *uid == 1000 && *gid == 1000));
    }
}
