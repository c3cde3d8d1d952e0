// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mounting block devices and images, with retrying unmounts.

use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::runner::Ui;
use crate::util::{run_command_check_status, run_command_check_status_logged};

const UNMOUNT_ATTEMPTS: u32 = 10;

#[derive(Debug, Error)]
pub enum MountError {
    #[error("failed to mount {device} at {mount_point}: {reason}")]
    MountFailed { device: Utf8PathBuf, mount_point: Utf8PathBuf, reason: String },
}

/// An active mount. Unmounted exactly once, either explicitly via
/// [`unmount`] or when the session is dropped.
///
/// [`unmount`]: MountSession::unmount
pub struct MountSession {
    mount_point: Utf8PathBuf,
    unmounted: bool,
}

impl MountSession {
    /// Mounts `device` at `mount_point`, creating the mount point first and
    /// clearing any leftover mount on it.
    pub fn mount(
        device: &Utf8Path,
        mount_point: &Utf8Path,
        read_only: bool,
        ui: &Ui,
    ) -> anyhow::Result<Self> {
        run_command_check_status(
            Command::new("sudo").args(["mkdir", "-p", mount_point.as_str()]),
            ui,
        )?;

        // A stale mount from an interrupted earlier run would otherwise
        // shadow the new one.
        unmount_retry(mount_point);

        let mut cmd = Command::new("sudo");
        cmd.arg("mount");
        if read_only {
            cmd.arg("-r");
        }
        cmd.args([device.as_str(), mount_point.as_str()]);

        if let Err(e) = run_command_check_status(&mut cmd, ui) {
            return Err(MountError::MountFailed {
                device: device.to_owned(),
                mount_point: mount_point.to_owned(),
                reason: e.to_string(),
            }
            .into());
        }

        log::debug!("mounted {device} at {mount_point}");
        Ok(Self { mount_point: mount_point.to_owned(), unmounted: false })
    }

    pub fn mount_point(&self) -> &Utf8Path {
        &self.mount_point
    }

    /// Unmounts the session's mount point. Safe to call more than once.
    pub fn unmount(&mut self) {
        if !self.unmounted {
            unmount_retry(&self.mount_point);
            let _ = run_command_check_status_logged(
                Command::new("sudo")
                    .args(["rmdir", self.mount_point.as_str()]),
            );
            self.unmounted = true;
        }
    }
}

impl Drop for MountSession {
    fn drop(&mut self) {
        self.unmount();
    }
}

/// Unmounts `mount_point`, retrying while the kernel reports it busy. After
/// [`UNMOUNT_ATTEMPTS`] tries the mount is detached lazily so the caller can
/// make progress; the kernel finishes the unmount once the last user goes
/// away.
pub fn unmount_retry(mount_point: &Utf8Path) {
    let _ = run_command_check_status_logged(&mut Command::new("sync"));

    let mut tries = 0;
    loop {
        let mounted = Command::new("mountpoint")
            .args(["-q", mount_point.as_str()])
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !mounted {
            return;
        }

        if run_command_check_status_logged(
            Command::new("sudo").args(["umount", mount_point.as_str()]),
        )
        .is_ok()
        {
            return;
        }

        if tries >= UNMOUNT_ATTEMPTS {
            log::warn!(
                "could not unmount {mount_point}, unmounting it lazily"
            );
            let _ = run_command_check_status_logged(
                Command::new("sudo").args([
                    "umount",
                    "-l",
                    mount_point.as_str(),
                ]),
            );
            return;
        }

        std::thread::sleep(std::time::Duration::from_secs(1));
        tries += 1;
    }
}

/// Picks the directory under which this tool's mount points live. Prefers an
/// existing per-user media directory, then falls back to whichever standard
/// base is writable.
pub fn resolve_mount_base(user: &str) -> Utf8PathBuf {
    resolve_mount_base_under(Utf8Path::new("/"), user)
}

fn resolve_mount_base_under(root: &Utf8Path, user: &str) -> Utf8PathBuf {
    let candidates = [
        root.join("run/media").join(user),
        root.join("media").join(user),
        root.join("mnt").join(user),
    ];

    for candidate in &candidates {
        if candidate.is_dir() {
            return candidate.clone();
        }
    }

    for base in
        [root.join("run/media"), root.join("media"), root.join("mnt")]
    {
        if base_is_writable(&base, user) {
            return base.join(user);
        }
    }

    root.join("media").join(user)
}

/// Checks that `base` will accept a per-user subdirectory by actually
/// creating one and writing a marker file into it.
fn base_is_writable(base: &Utf8Path, user: &str) -> bool {
    let probe_dir = base.join(user);
    if std::fs::create_dir_all(&probe_dir).is_err() {
        return false;
    }

    let marker = probe_dir.join(".bvm-test");
    let ok = std::fs::write(&marker, b"").is_ok();
    let _ = std::fs::remove_file(&marker);
    let _ = std::fs::remove_dir(&probe_dir);
    ok
}

/// The mount point for a VM's system disk. Scoped by the VM's RDP port so
/// two VMs can be serviced at once.
pub fn disk_mount_point(user: &str, rdp_port: u16) -> Utf8PathBuf {
    resolve_mount_base(user).join(format!("bvm-mount{rdp_port}"))
}

/// The name of the user running this process.
pub fn current_username() -> String {
    std::env::var("USER").unwrap_or_else(|_| "root".to_owned())
}

#[cfg(test)]
mod test {
    use super::*;

    fn fake_root() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path =
            Utf8Path::from_path(dir.path()).unwrap().to_owned();
        (dir, path)
    }

    #[test]
    fn prefers_existing_run_media_dir() {
        let (_guard, root) = fake_root();
        std::fs::create_dir_all(root.join("run/media/alice")).unwrap();
        std::fs::create_dir_all(root.join("media/alice")).unwrap();
        assert_eq!(
            resolve_mount_base_under(&root, "alice"),
            root.join("run/media/alice")
        );
    }

    #[test]
    fn falls_back_to_media_dir() {
        let (_guard, root) = fake_root();
        std::fs::create_dir_all(root.join("media/alice")).unwrap();
        assert_eq!(
            resolve_mount_base_under(&root, "alice"),
            root.join("media/alice")
        );
    }

    #[test]
    fn probes_writable_base_when_no_user_dir_exists() {
        let (_guard, root) = fake_root();
        std::fs::create_dir_all(root.join("run/media")).unwrap();
        assert_eq!(
            resolve_mount_base_under(&root, "alice"),
            root.join("run/media/alice")
        );
        // The probe directory must not be left behind.
        assert!(!root.join("run/media/alice").exists());
    }
}
