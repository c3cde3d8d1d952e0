// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Leases on kernel network block devices, used to expose partitions inside a
//! qcow2 image to the host.

use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::runner::Ui;
use crate::util::{run_command_check_status, run_command_check_status_logged};

/// The number of device nodes the nbd kernel module creates by default.
const NBD_SLOTS: u32 = 16;

const CONNECT_ATTEMPTS: u32 = 5;
const PARTITION_WAIT_ATTEMPTS: u32 = 5;
const RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error(
        "no free /dev/nbd device among {NBD_SLOTS} slots; detach one with \
         'qemu-nbd --disconnect'"
    )]
    DeviceExhausted,

    #[error(
        "failed to bind {backing} to {device} after {CONNECT_ATTEMPTS} \
         attempts"
    )]
    BindFailed { device: Utf8PathBuf, backing: Utf8PathBuf },

    #[error("partition {partition} never appeared on {device}")]
    PartitionNotFound { device: Utf8PathBuf, partition: u32 },
}

/// An exclusive claim on one `/dev/nbdN` node, bound to a qcow2 image. The
/// binding is undone exactly once, either by an explicit [`release`] or when
/// the lease is dropped.
///
/// [`release`]: BlockDeviceLease::release
pub struct BlockDeviceLease {
    device: Utf8PathBuf,
    partition: Utf8PathBuf,
    released: bool,
}

impl BlockDeviceLease {
    /// Binds `backing` to a free nbd device and waits for the numbered
    /// `partition` to surface as `/dev/nbdNp<partition>`.
    pub fn acquire(
        backing: &Utf8Path,
        partition: u32,
        ui: &Ui,
    ) -> anyhow::Result<Self> {
        run_command_check_status(
            Command::new("sudo").args(["modprobe", "nbd"]),
            ui,
        )?;

        // Flush pending writes so a previous user of the image can't race the
        // new binding.
        run_command_check_status(&mut Command::new("sync"), ui)?;

        let device = find_free_device(ui)?;
        ui.set_substep(format!("binding {backing} to {device}"));
        connect(&device, backing, ui)?;

        let partition_path =
            Utf8PathBuf::from(format!("{device}p{partition}"));
        for _ in 0..PARTITION_WAIT_ATTEMPTS {
            if partition_path.exists() {
                return Ok(Self {
                    device,
                    partition: partition_path,
                    released: false,
                });
            }
            std::thread::sleep(RETRY_DELAY);
        }

        // Show the operator what the device actually carries before giving
        // the slot back.
        if let Ok(output) =
            Command::new("lsblk").arg(device.as_str()).output()
        {
            log::warn!(
                "partitions available on {device}:\n{}",
                String::from_utf8_lossy(&output.stdout)
            );
        }

        disconnect(&device);
        Err(LeaseError::PartitionNotFound { device, partition }.into())
    }

    /// The path to the partition this lease was acquired for.
    pub fn partition(&self) -> &Utf8Path {
        &self.partition
    }

    /// Unbinds the device. Safe to call more than once; only the first call
    /// does anything.
    pub fn release(&mut self) {
        if !self.released {
            disconnect(&self.device);
            self.released = true;
        }
    }
}

impl Drop for BlockDeviceLease {
    fn drop(&mut self) {
        self.release();
    }
}

fn connect(
    device: &Utf8Path,
    backing: &Utf8Path,
    ui: &Ui,
) -> Result<(), LeaseError> {
    for attempt in 0..CONNECT_ATTEMPTS {
        if run_command_check_status(
            Command::new("sudo").args([
                "qemu-nbd",
                &format!("--connect={device}"),
                backing.as_str(),
            ]),
            ui,
        )
        .is_ok()
        {
            return Ok(());
        }

        log::debug!(
            "qemu-nbd connect attempt {} to {device} failed",
            attempt + 1
        );
        disconnect(device);
        std::thread::sleep(RETRY_DELAY);
    }

    Err(LeaseError::BindFailed {
        device: device.to_owned(),
        backing: backing.to_owned(),
    })
}

fn disconnect(device: &Utf8Path) {
    if let Err(e) = run_command_check_status_logged(
        Command::new("sudo").args(["qemu-nbd", "--disconnect", device.as_str()]),
    ) {
        log::warn!("failed to disconnect {device}: {e}");
    }
}

/// Scans `/dev/nbd0` through `/dev/nbd15` for a device with nothing mounted
/// on it.
fn find_free_device(ui: &Ui) -> Result<Utf8PathBuf, LeaseError> {
    for i in 0..NBD_SLOTS {
        let device = Utf8PathBuf::from(format!("/dev/nbd{i}"));
        if !device.exists() {
            break;
        }

        ui.set_substep(format!("checking whether {device} is free"));
        let output = Command::new("lsblk")
            .args([device.as_str(), "-no", "MOUNTPOINTS"])
            .output();

        let free = match output {
            Ok(output) => {
                device_is_free(&String::from_utf8_lossy(&output.stdout))
            }
            // lsblk failing to describe the device means nothing has claimed
            // it yet.
            Err(_) => true,
        };

        if free {
            return Ok(device);
        }
    }

    Err(LeaseError::DeviceExhausted)
}

/// Decides from `lsblk <dev> -no MOUNTPOINTS` output whether a device is
/// unclaimed. A connected device with mounted partitions lists a mount point
/// per line; an unused one prints only blank lines.
fn device_is_free(lsblk_output: &str) -> bool {
    lsblk_output.trim().is_empty()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn blank_lsblk_output_means_free() {
        assert!(device_is_free(""));
        assert!(device_is_free("\n"));
        assert!(device_is_free("\n\n\n"));
    }

    #[test]
    fn mounted_partition_means_taken() {
        assert!(!device_is_free("\n/media/user/bvm-mount3389\n"));
    }
}
