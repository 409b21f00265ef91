/*
 * Copyright (C) 2020 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

//! Boot Mount Broker: mounts the boot device at the boot
//! directory if it isn't already mounted there, and only unmounts what it
//! itself mounted. Reworks the C tri-state `-1/0/1` return into an enum.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::sysstub::SystemStub;

/// Outcome of a mount attempt. `AlreadyMounted` and `WeMounted` both mean
/// "the boot directory is now usable"; only the latter obliges the caller to
/// unmount afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum MountOutcome {
    AlreadyMounted(Utf8PathBuf),
    WeMounted(Utf8PathBuf),
}

/// Ensure `boot_device` is mounted at `boot_dir`. If something else is
/// already mounted there, adopt it rather than remounting over it.
pub(crate) fn mount_boot(
    stub: &dyn SystemStub,
    boot_device: &Utf8Path,
    boot_dir: &Utf8Path,
    fstype: &str,
) -> Result<MountOutcome> {
    if stub.is_mounted(boot_dir)? {
        log::debug!("{boot_dir} is already mounted, adopting it");
        return Ok(MountOutcome::AlreadyMounted(boot_dir.to_owned()));
    }
    stub.mount(boot_device, boot_dir, fstype)?;
    log::debug!("mounted {boot_device} at {boot_dir}");
    Ok(MountOutcome::WeMounted(boot_dir.to_owned()))
}

/// Unmount what [`mount_boot`] mounted. A no-op when `outcome` is
/// `AlreadyMounted`, since we never tear down a mount we didn't create.
pub(crate) fn umount_boot(stub: &dyn SystemStub, outcome: &MountOutcome) -> Result<()> {
    match outcome {
        MountOutcome::AlreadyMounted(path) => {
            log::debug!("{path} was already mounted before we ran, leaving it mounted");
            Ok(())
        }
        MountOutcome::WeMounted(path) => {
            stub.umount(path)?;
            log::debug!("unmounted {path}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysstub::FakeSystemStub;

    #[test]
    fn mounts_when_not_already_mounted() {
        let stub = FakeSystemStub::new("/sys");
        let outcome = mount_boot(
            &stub,
            Utf8Path::new("/dev/sda1"),
            Utf8Path::new("/boot"),
            "vfat",
        )
        .unwrap();
        assert_eq!(outcome, MountOutcome::WeMounted(Utf8PathBuf::from("/boot")));
        assert_eq!(stub.mount_calls.borrow().len(), 1);
    }

    #[test]
    fn adopts_a_premounted_esp_without_remounting() {
        let stub = FakeSystemStub::new("/sys");
        stub.mounted_paths
            .borrow_mut()
            .insert(Utf8PathBuf::from("/boot"), Utf8PathBuf::from("/dev/sda1"));
        let outcome = mount_boot(
            &stub,
            Utf8Path::new("/dev/sda1"),
            Utf8Path::new("/boot"),
            "vfat",
        )
        .unwrap();
        assert_eq!(
            outcome,
            MountOutcome::AlreadyMounted(Utf8PathBuf::from("/boot"))
        );
        assert!(stub.mount_calls.borrow().is_empty());
    }

    #[test]
    fn umount_is_a_noop_for_adopted_mounts() {
        let stub = FakeSystemStub::new("/sys");
        let outcome = MountOutcome::AlreadyMounted(Utf8PathBuf::from("/boot"));
        umount_boot(&stub, &outcome).unwrap();
        assert!(stub.umount_calls.borrow().is_empty());
    }

    #[test]
    fn umount_tears_down_what_we_mounted() {
        let stub = FakeSystemStub::new("/sys");
        let outcome = mount_boot(
            &stub,
            Utf8Path::new("/dev/sda1"),
            Utf8Path::new("/boot"),
            "vfat",
        )
        .unwrap();
        umount_boot(&stub, &outcome).unwrap();
        assert_eq!(stub.umount_calls.borrow().len(), 1);
        assert!(!stub.is_mounted(Utf8Path::new("/boot")).unwrap());
    }
}
