/*
 * Copyright (C) 2020 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

//! Host Inspector: resolves the installation prefix, probes
//! firmware mode, discovers a boot device, resolves its filesystem type,
//! and probes the root device, producing an immutable [`SystemConfig`].

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::blockdev;
use crate::model::{Capabilities, SystemConfig};
use crate::sysstub::SystemStub;

/// Inspect the host (or image tree) rooted at `prefix` and produce a
/// `SystemConfig`. Mirrors `cbm_inspect_root` from the original C sources.
#[context("Inspecting root at {prefix}")]
pub(crate) fn inspect_root(
    stub: &dyn SystemStub,
    prefix: &Utf8Path,
    image_mode: bool,
) -> Result<SystemConfig> {
    let realp = camino::Utf8PathBuf::from_path_buf(
        prefix
            .canonicalize()
            .with_context(|| format!("path specified does not exist: {prefix}"))?,
    )
    .map_err(|p| anyhow::anyhow!("non-UTF-8 path: {}", p.display()))?;

    let mut wanted_boot_mask = Capabilities::NONE;
    let mut boot_device: Option<Utf8PathBuf> = None;

    // Native UEFI: /sys/firmware/efi exists, and we're not in image mode.
    let native_uefi = if !image_mode {
        let fw_path = stub.sysfs_path().join("firmware/efi");
        fw_path.as_std_path().exists()
    } else {
        false
    };

    // GPT can hold both a legacy boot partition and an ESP at once; native
    // UEFI takes precedence, so only probe legacy when not native-UEFI.
    if !native_uefi || image_mode {
        if let Some(dev) = blockdev::get_legacy_boot_device(&realp)? {
            log::info!("Discovered legacy boot device: {dev}");
            boot_device = Some(dev);
            wanted_boot_mask = Capabilities::LEGACY | Capabilities::GPT;
        }
    }

    if boot_device.is_none() && !image_mode {
        if let Some(dev) = blockdev::get_boot_device(&realp)? {
            log::info!("Discovered UEFI ESP: {dev}");
            boot_device = Some(dev);
            wanted_boot_mask = Capabilities::UEFI | Capabilities::GPT;
        }
    }

    if boot_device.is_none() {
        wanted_boot_mask = if image_mode {
            Capabilities::UEFI
        } else if native_uefi {
            Capabilities::UEFI
        } else {
            Capabilities::LEGACY
        };
    }

    // Our probe methods are GPT-only; if we found a device, it's GPT.
    if let Some(dev) = &boot_device {
        match dev.as_std_path().canonicalize() {
            Ok(real) => {
                let real = Utf8PathBuf::from_path_buf(real)
                    .map_err(|p| anyhow::anyhow!("non-UTF-8 path: {}", p.display()))?;
                log::info!("Fully resolved boot device: {real}");
                boot_device = Some(real);
            }
            Err(e) => {
                log::error!("Cannot determine boot device: {dev}: {e}");
            }
        }
        wanted_boot_mask |= Capabilities::GPT;
    }

    if let Some(dev) = &boot_device {
        wanted_boot_mask |= blockdev::probe_fstype(dev);
    }

    let root_device = blockdev::probe_root_device(&realp)?;

    Ok(SystemConfig {
        prefix: realp.into_std_path_buf(),
        boot_device: boot_device.map(Utf8PathBuf::into_std_path_buf),
        root_device,
        wanted_boot_mask,
        image_mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysstub::FakeSystemStub;

    #[test]
    fn missing_prefix_is_an_error() {
        let stub = FakeSystemStub::new("/sys");
        let result = inspect_root(&stub, Utf8Path::new("/does/not/exist/at/all"), false);
        assert!(result.is_err());
    }

    #[test]
    fn image_mode_without_device_wants_uefi() {
        let td = tempfile::tempdir().unwrap();
        let prefix = Utf8Path::from_path(td.path()).unwrap();
        let stub = FakeSystemStub::new("/sys");
        let config = inspect_root(&stub, prefix, true).unwrap();
        assert_eq!(config.wanted_boot_mask, Capabilities::UEFI);
        assert!(config.boot_device.is_none());
    }
}
