//! Shim-wrapped UEFI backend: wraps [`SystemdBootBackend`] for kernel and
//! loader-entry handling, adding shim binary staging and EFI boot-variable
//! registration via `efibootmgr`. Grounded on the `clear_efi_target`/
//! `create_efi_boot_entry` functions in
//! `examples/other_examples/..__coreos-bootupd__src-efi.rs.rs`.

use std::process::Command;

use anyhow::{Context, Result};

use crate::blockdev;
use crate::bootloader::{BootContext, BootLoader};
use crate::files;
use crate::model::{Capabilities, Kernel};

use super::systemd_boot::{SystemdBootBackend, KERNEL_DESTINATION};

#[cfg(target_arch = "x86_64")]
const SHIM_EFI: &str = "shimx64.efi";
#[cfg(target_arch = "aarch64")]
const SHIM_EFI: &str = "shimaa64.efi";
#[cfg(target_arch = "riscv64")]
const SHIM_EFI: &str = "shimriscv64.efi";

#[cfg(target_arch = "x86_64")]
const LOADER_STUB: &str = "BOOTX64.EFI";
#[cfg(target_arch = "aarch64")]
const LOADER_STUB: &str = "BOOTAA64.EFI";
#[cfg(target_arch = "riscv64")]
const LOADER_STUB: &str = "BOOTRISCV64.EFI";

/// Name shim chainloads into after itself, by this crate's convention
/// (shim's own default is `grubx64.efi`-shaped; we stage the
/// systemd-boot-class binary under that name instead of grub's).
const CHAINLOADED_NAME: &str = "loader.efi";

const EFIBOOTMGR: &str = "efibootmgr";

pub(crate) struct ShimBackend {
    inner: SystemdBootBackend,
}

impl ShimBackend {
    pub(crate) fn new() -> Self {
        Self {
            inner: SystemdBootBackend::new(),
        }
    }
}

impl BootLoader for ShimBackend {
    fn name(&self) -> &'static str {
        "shim"
    }

    fn init(&mut self, ctx: &BootContext<'_>) -> Result<()> {
        self.inner.init(ctx)
    }

    fn needs_install(&self, ctx: &BootContext<'_>) -> Result<bool> {
        self.inner.needs_install(ctx)
    }

    fn needs_update(&self, ctx: &BootContext<'_>) -> Result<bool> {
        self.inner.needs_update(ctx)
    }

    fn install_kernel(&mut self, ctx: &BootContext<'_>, kernel: &Kernel) -> Result<()> {
        self.inner.install_kernel(ctx, kernel)
    }

    fn remove_kernel(&mut self, ctx: &BootContext<'_>, kernel: &Kernel) -> Result<()> {
        self.inner.remove_kernel(ctx, kernel)
    }

    fn set_default_kernel(
        &mut self,
        ctx: &BootContext<'_>,
        kernel: Option<&Kernel>,
    ) -> Result<()> {
        self.inner.set_default_kernel(ctx, kernel)
    }

    fn get_default_kernel(&self, ctx: &BootContext<'_>) -> Result<Option<String>> {
        self.inner.get_default_kernel(ctx)
    }

    fn install(&mut self, ctx: &BootContext<'_>) -> Result<()> {
        let dest_dir = ctx.boot_dir.join(KERNEL_DESTINATION);
        files::mkdir_p(dest_dir.as_std_path())?;

        // Stage shim as the loader firmware will boot, and the real
        // systemd-boot-class binary as the target shim chainloads.
        let shim_src = ctx.prefix.join("usr/lib/shim").join(SHIM_EFI);
        let shim_dest = dest_dir.join(LOADER_STUB);
        files::copy_file_atomic(shim_src.as_std_path(), shim_dest.as_std_path(), 0o644)
            .with_context(|| format!("staging {shim_src}"))?;

        let loader_src = ctx
            .prefix
            .join("usr/lib/systemd/boot/efi")
            .join(super::systemd_boot::SYSTEMD_BOOT_EFI);
        let loader_dest = dest_dir.join(CHAINLOADED_NAME);
        files::copy_file_atomic(loader_src.as_std_path(), loader_dest.as_std_path(), 0o644)
            .with_context(|| format!("staging {loader_src}"))?;

        register_efi_boot_entry(ctx)?;
        files::sync_filesystems();
        Ok(())
    }

    fn update(&mut self, ctx: &BootContext<'_>) -> Result<()> {
        self.install(ctx)
    }

    fn remove(&mut self, ctx: &BootContext<'_>) -> Result<()> {
        clear_efi_boot_entry()?;
        self.inner.remove(ctx)
    }

    fn destroy(&mut self) {
        self.inner.destroy();
    }

    fn get_capabilities(&self, ctx: &BootContext<'_>) -> Capabilities {
        let shim_bin = ctx.prefix.join("usr/lib/shim").join(SHIM_EFI);
        if !shim_bin.as_std_path().is_file() {
            log::debug!("shim binary not found at {shim_bin}");
            return Capabilities::NONE;
        }
        self.inner.get_capabilities(ctx)
    }

    fn get_kernel_destination(&self) -> Option<&str> {
        self.inner.get_kernel_destination()
    }
}

const EFI_BOOT_ENTRY_LABEL: &str = "bootctld";

fn register_efi_boot_entry(ctx: &BootContext<'_>) -> Result<()> {
    clear_efi_boot_entry()?;
    let disk = blockdev::get_parent_disk(ctx.prefix)?;
    let esp = ctx.boot_device.map(|p| p.to_owned()).unwrap_or_else(|| disk.clone());
    let part_num = blockdev::get_partition_number(&esp)?;
    let loader = format!("\\{}\\{}", KERNEL_DESTINATION.replace('/', "\\"), LOADER_STUB);
    let status = Command::new(EFIBOOTMGR)
        .args([
            "--create",
            "--disk",
            disk.as_str(),
            "--part",
            &part_num,
            "--loader",
            &loader,
            "--label",
            EFI_BOOT_ENTRY_LABEL,
        ])
        .status()
        .context("running efibootmgr")?;
    if !status.success() {
        anyhow::bail!("efibootmgr --create exited: {status}");
    }
    Ok(())
}

fn clear_efi_boot_entry() -> Result<()> {
    let output = Command::new(EFIBOOTMGR)
        .output()
        .context("running efibootmgr")?;
    if !output.status.success() {
        anyhow::bail!("efibootmgr failed");
    }
    let text = String::from_utf8_lossy(&output.stdout);
    for line in text.lines().filter_map(|l| l.strip_prefix("Boot")) {
        let Some((id, rest)) = line.split_once(' ') else {
            continue;
        };
        let name = rest.split('\t').next().unwrap_or(rest).trim();
        if name.eq_ignore_ascii_case(EFI_BOOT_ENTRY_LABEL) {
            let id = id.trim_end_matches('*');
            let status = Command::new(EFIBOOTMGR)
                .args(["-b", id, "-B"])
                .status()
                .context("running efibootmgr -B")?;
            if !status.success() {
                anyhow::bail!("efibootmgr -B exited: {status}");
            }
        }
    }
    Ok(())
}
