//! Cgroup hierarchy model detection.

use std::path::Path;

#[derive(Eq, PartialEq, Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub enum CgroupVersion {
    /// Legacy per-subsystem hierarchies.
    V1,
    /// Unified hierarchy.
    V2,
}

const CGROUP_SUPER_MAGIC: i64 = 0x0027_e0eb;
const CGROUP2_SUPER_MAGIC: i64 = 0x6367_7270;

impl CgroupVersion {
    /// Detects which hierarchy model the root path carries, preferring
    /// the filesystem magic (man 2 statfs). Before bootstrap the root
    /// may not be mounted at all; then the presence of
    /// `cgroup.subtree_control` is the tie-breaker and the default is
    /// the legacy model that bootstrap knows how to assemble.
    pub fn detect(root: &Path) -> CgroupVersion {
        if let Ok(stat) = nix::sys::statfs::statfs(root) {
            match stat.filesystem_type().0 as i64 {
                CGROUP2_SUPER_MAGIC => return CgroupVersion::V2,
                CGROUP_SUPER_MAGIC => return CgroupVersion::V1,
                _ => {}
            }
        }
        if root.join("cgroup.subtree_control").exists() {
            CgroupVersion::V2
        } else {
            CgroupVersion::V1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmounted_scratch_dir_detects_as_legacy() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(CgroupVersion::detect(dir.path()), CgroupVersion::V1);
    }

    #[test]
    fn subtree_control_marker_detects_as_unified() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cgroup.subtree_control"), "").unwrap();
        assert_eq!(CgroupVersion::detect(dir.path()), CgroupVersion::V2);
    }
}
