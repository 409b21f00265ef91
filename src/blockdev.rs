/*
 * Copyright (C) 2020 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

//! Block-device probing primitives: `lsblk`/`blkid`/`findmnt` shell-outs
//! giving the Host Inspector and backends a concrete way to resolve
//! partitions, filesystem types and parent disks, in the idiom
//! `bootupd/src/bios.rs` uses for its own shell-outs, kept behind the
//! [`crate::sysstub::SystemStub`] injection point wherever host state
//! would otherwise be read directly.

use std::process::Command;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;

use crate::model::{Capabilities, RootDeviceInfo};
use crate::sysstub::SystemStub;

/// Probe the root device mounted at `prefix` for its UUID/PARTUUID/LUKS
/// UUID. Mirrors `cbm_probe_path` from the original C sources.
pub(crate) fn probe_root_device(prefix: &camino::Utf8Path) -> Result<RootDeviceInfo> {
    let source = findmnt_source(prefix)?;
    let Some(source) = source else {
        // No mount info available (e.g. a chroot/container test fixture):
        // fall back to a best-effort UUID lookup so callers still get a
        // sane (non-empty) record rather than failing outright.
        return Ok(RootDeviceInfo {
            uuid: blkid_tag(prefix.as_str(), "UUID").unwrap_or_default(),
            part_uuid: None,
            luks_uuid: None,
        });
    };
    let uuid = blkid_tag(source.as_str(), "UUID").unwrap_or_default();
    let part_uuid = blkid_tag(source.as_str(), "PARTUUID");
    let luks_uuid = blkid_tag(source.as_str(), "UUID")
        .filter(|_| blkid_tag(source.as_str(), "TYPE").as_deref() == Some("crypto_LUKS"));
    Ok(RootDeviceInfo {
        uuid,
        part_uuid,
        luks_uuid,
    })
}

/// Find a legacy (BIOS boot, GPT) boot device relative to `prefix`, if any.
pub(crate) fn get_legacy_boot_device(prefix: &camino::Utf8Path) -> Result<Option<Utf8PathBuf>> {
    find_partition_by_type(prefix, "BIOS boot")
}

/// Find the system's ESP.
pub(crate) fn get_boot_device(prefix: &camino::Utf8Path) -> Result<Option<Utf8PathBuf>> {
    find_partition_by_type(prefix, "EFI System")
}

/// Resolve the parent whole-disk device for a partition under `prefix`.
pub(crate) fn get_parent_disk(prefix: &camino::Utf8Path) -> Result<Utf8PathBuf> {
    let source = findmnt_source(prefix)?
        .ok_or_else(|| anyhow::anyhow!("cannot determine root device for {prefix}"))?;
    let output = Command::new("lsblk")
        .args(["--paths", "--noheadings", "--output", "PKNAME"])
        .arg(&source)
        .output()
        .context("running lsblk")?;
    if !output.status.success() {
        anyhow::bail!("lsblk failed for {source}");
    }
    let parent = String::from_utf8(output.stdout)?.trim().to_string();
    if parent.is_empty() {
        anyhow::bail!("lsblk returned no parent device for {source}");
    }
    Ok(Utf8PathBuf::from(parent))
}

/// Probe the filesystem type of `device`, returning the matching capability
/// bit (an `EXTFS`/`FATFS` equivalent of a `libblkid` probe). Empty mask
/// means "unrecognized".
pub(crate) fn probe_fstype(device: &camino::Utf8Path) -> Capabilities {
    match blkid_tag(device.as_str(), "TYPE").as_deref() {
        Some("ext2") | Some("ext3") | Some("ext4") => Capabilities::EXTFS,
        Some("vfat") => Capabilities::FATFS,
        _ => Capabilities::NONE,
    }
}

/// Query where `device` is currently mounted, if anywhere, via the
/// injectable [`SystemStub`].
pub(crate) fn mountpoint_for_device(
    stub: &dyn SystemStub,
    device: &camino::Utf8Path,
) -> Result<Option<Utf8PathBuf>> {
    stub.mountpoint_for_device(device)
}

/// Resolve `device`'s GPT partition number, for `efibootmgr --part`.
pub(crate) fn get_partition_number(device: &camino::Utf8Path) -> Result<String> {
    let output = Command::new("lsblk")
        .args(["--noheadings", "--output", "PARTN"])
        .arg(device)
        .output()
        .context("running lsblk")?;
    if !output.status.success() {
        anyhow::bail!("lsblk failed for {device}");
    }
    let partn = String::from_utf8(output.stdout)?.trim().to_string();
    if partn.is_empty() {
        anyhow::bail!("lsblk returned no partition number for {device}");
    }
    Ok(partn)
}

fn findmnt_source(path: &camino::Utf8Path) -> Result<Option<Utf8PathBuf>> {
    let output = Command::new("findmnt")
        .args(["--noheadings", "--output", "SOURCE"])
        .arg(path)
        .output()
        .context("running findmnt")?;
    if !output.status.success() {
        return Ok(None);
    }
    let s = String::from_utf8(output.stdout)?.trim().to_string();
    if s.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Utf8PathBuf::from(s)))
    }
}

fn blkid_tag(device: &str, tag: &str) -> Option<String> {
    let output = Command::new("blkid")
        .args(["-s", tag, "-o", "value"])
        .arg(device)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let s = String::from_utf8(output.stdout).ok()?.trim().to_string();
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

#[derive(serde::Deserialize)]
struct LsblkDevices {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(serde::Deserialize)]
struct LsblkDevice {
    path: String,
    pttype: Option<String>,
    parttypename: Option<String>,
}

fn find_partition_by_type(
    prefix: &camino::Utf8Path,
    parttypename: &str,
) -> Result<Option<Utf8PathBuf>> {
    let Some(disk) = get_parent_disk(prefix).ok() else {
        return Ok(None);
    };
    let output = Command::new("lsblk")
        .args(["--json", "--output", "PATH,PTTYPE,PARTTYPENAME"])
        .arg(&disk)
        .output()
        .context("running lsblk")?;
    if !output.status.success() {
        return Ok(None);
    }
    let parsed: LsblkDevices = match serde_json::from_slice(&output.stdout) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    for dev in parsed.blockdevices {
        if dev.pttype.as_deref() == Some("gpt") && dev.parttypename.as_deref() == Some(parttypename)
        {
            return Ok(Some(Utf8PathBuf::from(dev.path)));
        }
    }
    Ok(None)
}
