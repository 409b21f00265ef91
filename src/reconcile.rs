/*
 * Copyright (C) 2020 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

//! Kernel Reconciler: stages a kernel's blob/initrd onto the
//! boot device at the location its backend expects, then hands off to the
//! backend to queue/unqueue and (re)synthesize configuration. Ported from
//! `bootman.c: boot_manager_install_kernel/remove_kernel/set_default_kernel/
//! list_kernels`.

use anyhow::Result;
use camino::Utf8Path;

use crate::bootloader::{BootContext, BootLoader};
use crate::files;
use crate::model::{Kernel, KernelArray};

/// Stage `kernel`'s blob (and initrd, if any) under `boot_dir`, at the
/// location its backend's [`BootLoader::get_kernel_destination`] names
/// (the boot-directory root for non-UEFI backends), then queue it.
pub(crate) fn install_kernel(
    bootloader: &mut dyn BootLoader,
    ctx: &BootContext<'_>,
    kernel: &Kernel,
) -> Result<()> {
    stage_kernel_files(bootloader, ctx.boot_dir, kernel)?;
    bootloader.install_kernel(ctx, kernel)
}

/// Remove `kernel`'s staged blob/initrd and unqueue it from the backend.
pub(crate) fn remove_kernel(
    bootloader: &mut dyn BootLoader,
    ctx: &BootContext<'_>,
    kernel: &Kernel,
) -> Result<()> {
    unstage_kernel_files(bootloader, ctx.boot_dir, kernel)?;
    bootloader.remove_kernel(ctx, kernel)
}

/// Set `kernel` as the default among `all_kernels`, refusing if it is not
/// one of the kernels currently on record.
pub(crate) fn set_default_kernel(
    bootloader: &mut dyn BootLoader,
    ctx: &BootContext<'_>,
    all_kernels: &KernelArray<'_>,
    kernel: &Kernel,
) -> Result<()> {
    if !all_kernels.iter().any(|k| k.same_as(kernel)) {
        anyhow::bail!(
            "no matching kernel {} in the kernel set, refusing to set as default",
            kernel
        );
    }
    bootloader.set_default_kernel(ctx, Some(kernel))
}

fn destination_dir(boot_dir: &Utf8Path, bootloader: &dyn BootLoader) -> camino::Utf8PathBuf {
    match bootloader.get_kernel_destination() {
        Some(sub) => boot_dir.join(sub),
        None => boot_dir.to_owned(),
    }
}

fn stage_kernel_files(
    bootloader: &dyn BootLoader,
    boot_dir: &Utf8Path,
    kernel: &Kernel,
) -> Result<()> {
    let dest_dir = destination_dir(boot_dir, bootloader);
    files::mkdir_p(dest_dir.as_std_path())?;

    let blob_dest = dest_dir.join(&kernel.target.legacy_path);
    if !files::files_match(&kernel.source.path, blob_dest.as_std_path()) {
        files::copy_file_atomic(&kernel.source.path, blob_dest.as_std_path(), 0o644)?;
    }

    if let Some(initrd_name) = &kernel.target.initrd_path {
        if let Some(initrd_src) = sibling_initrd_path(kernel) {
            let initrd_dest = dest_dir.join(initrd_name);
            if initrd_src.exists() && !files::files_match(&initrd_src, initrd_dest.as_std_path()) {
                files::copy_file_atomic(&initrd_src, initrd_dest.as_std_path(), 0o644)?;
            }
        }
    }
    Ok(())
}

fn unstage_kernel_files(
    bootloader: &dyn BootLoader,
    boot_dir: &Utf8Path,
    kernel: &Kernel,
) -> Result<()> {
    let dest_dir = destination_dir(boot_dir, bootloader);
    let blob_dest = dest_dir.join(&kernel.target.legacy_path);
    if blob_dest.as_std_path().exists() {
        std::fs::remove_file(blob_dest.as_std_path())?;
    }
    if let Some(initrd_name) = &kernel.target.initrd_path {
        let initrd_dest = dest_dir.join(initrd_name);
        if initrd_dest.as_std_path().exists() {
            std::fs::remove_file(initrd_dest.as_std_path())?;
        }
    }
    Ok(())
}

/// Kernel discovery lays blob + initrd next to each other under
/// `kernels::discover_kernels`'s per-kernel directory; recover the initrd's
/// source path from the blob's.
fn sibling_initrd_path(kernel: &Kernel) -> Option<std::path::PathBuf> {
    kernel.source.path.parent().map(|p| p.join("initrd"))
}
