//! Bind-mount plumbing for exposing a provisioned container root at a
//! volume's target path.

use std::path::Path;

use anyhow::Context;
use nix::mount::{mount, umount, MsFlags};
use nix::sys::stat::stat;
use tracing::debug;

/// Mount options recognized by [`Mounter::bind_mount`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MountOption {
    Bind,
    ReadOnly,
}

/// The seam between the stager and the host's mount table.
pub trait Mounter: Send + Sync {
    /// Bind-mounts `source` at `target` with the given options.
    fn bind_mount(&self, source: &Path, target: &Path, options: &[MountOption])
        -> anyhow::Result<()>;

    /// Unmounts `target`. Succeeds silently when `target` is not a mount
    /// point.
    fn unmount(&self, target: &Path) -> anyhow::Result<()>;
}

/// A [`Mounter`] issuing real mount(2)/umount(2) syscalls.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        options: &[MountOption],
    ) -> anyhow::Result<()> {
        let mut flags = MsFlags::empty();
        for option in options {
            match option {
                MountOption::Bind => flags |= MsFlags::MS_BIND,
                MountOption::ReadOnly => flags |= MsFlags::MS_RDONLY,
            }
        }
        mount(Some(source), target, None::<&str>, flags, None::<&str>).with_context(|| {
            format!(
                "mount {} to {} with options={:?} failed",
                source.display(),
                target.display(),
                options
            )
        })?;
        if flags.contains(MsFlags::MS_RDONLY) {
            // MS_RDONLY is ignored on a fresh bind; it only takes effect on
            // a remount.
            mount(
                None::<&str>,
                target,
                None::<&str>,
                flags | MsFlags::MS_BIND | MsFlags::MS_REMOUNT,
                None::<&str>,
            )
            .with_context(|| format!("read-only remount of {} failed", target.display()))?;
        }
        debug!(source = %source.display(), target = %target.display(), "mounted");
        Ok(())
    }

    fn unmount(&self, target: &Path) -> anyhow::Result<()> {
        let mounted = is_mount_point(target)
            .with_context(|| format!("unmount {} failed", target.display()))?;
        if !mounted {
            debug!(target = %target.display(), "not a mount point, nothing to unmount");
            return Ok(());
        }
        umount(target).with_context(|| format!("unmount {} failed", target.display()))?;
        debug!(target = %target.display(), "unmounted");
        Ok(())
    }
}

/// Device-number probe in the style of kubelet's IsLikelyNotMountPoint: a
/// path whose device differs from its parent's is a mount point. Bind
/// mounts from the same filesystem are missed; the roots staged here come
/// from the builder's own storage filesystem.
pub fn is_mount_point(path: &Path) -> anyhow::Result<bool> {
    let parent = match path.parent() {
        Some(parent) => parent,
        None => return Ok(true),
    };
    let path_stat =
        stat(path).with_context(|| format!("can't stat {}", path.display()))?;
    let parent_stat =
        stat(parent).with_context(|| format!("can't stat {}", parent.display()))?;
    Ok(path_stat.st_dev != parent_stat.st_dev)
}


#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn plain_directory_is_not_a_mount_point() {
        let dir = TempDir::new().expect("tempdir");
        assert!(!is_mount_point(dir.path()).expect("stat should succeed"));
    }

    #[test]
    fn missing_path_errors() {
        let dir = TempDir::new().expect("tempdir");
        assert!(is_mount_point(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn unmount_of_non_mount_point_succeeds_silently() {
        let dir = TempDir::new().expect("tempdir");
        SystemMounter
            .unmount(dir.path())
            .expect("unmount of a plain directory should be a no-op");
    }

    #[test]
    fn unmount_of_missing_target_errors() {
        let dir = TempDir::new().expect("tempdir");
        assert!(SystemMounter.unmount(&dir.path().join("nope")).is_err());
    }
}
