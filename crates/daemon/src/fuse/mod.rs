//! FUSE adapter
//!
//! Presents the remote drive as a local directory tree:
//! - **[`DriveFs`]**: the `fuser::Filesystem` implementation
//! - **[`InodeTable`]**: stable inode numbers for remote object ids
//! - **[`mount`]**: spawns the background FUSE session

mod drive_fs;
mod inode_table;

use std::path::Path;

use fuser::{BackgroundSession, MountOption};

pub use drive_fs::DriveFs;
pub use inode_table::InodeTable;

pub const FS_NAME: &str = "drivefs";

/// errno reported to the kernel for a core error
pub fn errno(err: &common::Error) -> libc::c_int {
    match err {
        common::Error::NotFound(_) => libc::ENOENT,
        common::Error::InvalidName(_) => libc::EINVAL,
        _ => libc::EIO,
    }
}

/// Translate user-supplied `-o` options. Unknown options are passed through verbatim.
pub fn mount_options(extra: &[String]) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(FS_NAME.to_string()),
        MountOption::AutoUnmount,
        MountOption::NoExec,
    ];

    for option in extra.iter().map(|o| o.trim()).filter(|o| !o.is_empty()) {
        let option = match option {
            "allow_other" => MountOption::AllowOther,
            "allow_root" => MountOption::AllowRoot,
            "default_permissions" => MountOption::DefaultPermissions,
            "ro" => MountOption::RO,
            "exec" => MountOption::Exec,
            "noatime" => MountOption::NoAtime,
            other => MountOption::CUSTOM(other.to_string()),
        };
        if option == MountOption::Exec {
            options.retain(|o| *o != MountOption::NoExec);
        }
        if !options.contains(&option) {
            options.push(option);
        }
    }
    options
}

/// Mount `fs` at `mountpoint` on a background thread. Dropping the
/// returned session unmounts.
pub fn mount(
    fs: DriveFs,
    mountpoint: &Path,
    extra_options: &[String],
) -> std::io::Result<BackgroundSession> {
    let options = mount_options(extra_options);
    tracing::info!(mountpoint = %mountpoint.display(), ?options, "mounting FUSE filesystem");
    fuser::spawn_mount2(fs, mountpoint, &options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(errno(&common::Error::NotFound("x".into())), libc::ENOENT);
        assert_eq!(errno(&common::Error::InvalidName("a/b".into())), libc::EINVAL);
        assert_eq!(errno(&common::Error::Timeout), libc::EIO);
        assert_eq!(errno(&common::Error::QuotaExceeded), libc::EIO);
    }

    #[test]
    fn test_mount_options() {
        let options = mount_options(&[
            "allow_other".to_string(),
            " ".to_string(),
            "max_read=131072".to_string(),
            "allow_other".to_string(),
        ]);
        assert_eq!(options[0], MountOption::FSName("drivefs".to_string()));
        assert!(options.contains(&MountOption::AutoUnmount));
        assert!(options.contains(&MountOption::AllowOther));
        assert!(options.contains(&MountOption::CUSTOM("max_read=131072".to_string())));
        assert_eq!(
            options
                .iter()
                .filter(|o| **o == MountOption::AllowOther)
                .count(),
            1
        );
    }

    #[test]
    fn test_exec_replaces_noexec() {
        let options = mount_options(&["exec".to_string()]);
        assert!(options.contains(&MountOption::Exec));
        assert!(!options.contains(&MountOption::NoExec));
    }
}
