/*
 * Copyright (C) 2020 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

//! Freestanding Initramfs Reconciler: initrds dropped under
//! `usr/lib/initrd-freestanding` that are not tied to any particular
//! kernel, staged onto the boot device alongside (or inside the UEFI
//! destination of) the selected backend. Ported from
//! `bootman.c: boot_manager_{enumerate,copy,remove}_initrd_freestanding`.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::Utf8Path;

use crate::bootloader::{BootContext, BootLoader};
use crate::config::FREESTANDING_PREFIX;
use crate::files;
use crate::model::Capabilities;

/// Map of staged name (`freestanding-<filename>`) to the source filename
/// under `initrd_freestanding_dir`.
pub(crate) type FreestandingInitrdMap = BTreeMap<String, String>;

/// Walk `initrd_dir`, recording every non-empty regular file found.
/// A missing directory is not an error — it simply means there are no
/// freestanding initrds configured for this system.
pub(crate) fn enumerate(initrd_dir: &Utf8Path) -> Result<FreestandingInitrdMap> {
    let mut out = FreestandingInitrdMap::new();
    let entries = match std::fs::read_dir(initrd_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("path {initrd_dir} does not exist");
            return Ok(out);
        }
        Err(e) => return Err(e).with_context(|| format!("opening {initrd_dir}")),
    };
    for entry in entries {
        let entry = entry?;
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        if !meta.is_file() || meta.len() == 0 {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        out.insert(format!("{FREESTANDING_PREFIX}{name}"), name);
    }
    Ok(out)
}

/// Copy every enumerated freestanding initrd onto the boot device, under
/// the selected backend's UEFI destination subdirectory if it has one.
pub(crate) fn copy(
    bootloader: &dyn BootLoader,
    ctx: &BootContext<'_>,
    initrd_dir: &Utf8Path,
    map: &FreestandingInitrdMap,
) -> Result<()> {
    let is_uefi = bootloader.get_capabilities(ctx).contains(Capabilities::UEFI);
    let dest_sub = bootloader.get_kernel_destination();
    if is_uefi && dest_sub.is_none() {
        anyhow::bail!("UEFI-class backend did not provide a kernel destination");
    }

    let base = match dest_sub {
        Some(sub) => ctx.boot_dir.join(sub),
        None => ctx.boot_dir.to_owned(),
    };
    files::mkdir_p(base.as_std_path())?;

    for (staged_name, source_name) in map {
        let source = initrd_dir.join(source_name);
        let target = base.join(staged_name);
        if !files::files_match(source.as_std_path(), target.as_std_path()) {
            files::copy_file_atomic(source.as_std_path(), target.as_std_path(), 0o644)
                .with_context(|| format!("installing freestanding initrd {target}"))?;
        }
    }
    Ok(())
}

/// Remove any previously staged freestanding initrd that is no longer in
/// `map` (i.e. its source file under `initrd_dir` was deleted).
pub(crate) fn remove_orphans(
    bootloader: &dyn BootLoader,
    ctx: &BootContext<'_>,
    map: &FreestandingInitrdMap,
) -> Result<()> {
    let is_uefi = bootloader.get_capabilities(ctx).contains(Capabilities::UEFI);
    let dest_sub = bootloader.get_kernel_destination();
    if is_uefi && dest_sub.is_none() {
        anyhow::bail!("UEFI-class backend did not provide a kernel destination");
    }
    let base = match dest_sub {
        Some(sub) => ctx.boot_dir.join(sub),
        None => ctx.boot_dir.to_owned(),
    };

    let entries = std::fs::read_dir(base.as_std_path())
        .with_context(|| format!("opening {base} to remove orphaned freestanding initrds"))?;
    for entry in entries {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if !name.starts_with(FREESTANDING_PREFIX) {
            continue;
        }
        if map.contains_key(&name) {
            continue;
        }
        let target = base.join(&name);
        std::fs::remove_file(target.as_std_path())
            .with_context(|| format!("removing stale freestanding initrd {target}"))?;
    }
    Ok(())
}
