//! Plain (non-shim) UEFI backend, synthesizing systemd-boot/BLS-style
//! loader entries. Grounded on `bootupd`'s EFI component shape
//! (`examples/other_examples/..__coreos-bootupd__src-efi.rs.rs`:
//! `is_efi_booted`, ESP staging, the `EFILIB`/`EFIBOOTMGR` naming
//! convention) adapted to clr-boot-manager's queue-then-synthesize model
//! instead of `bootupd`'s file-tree checksum update flow.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;

use crate::bootloader::{BootContext, BootLoader};
use crate::files;
use crate::model::{Capabilities, Kernel};

#[cfg(target_arch = "x86_64")]
pub(crate) const SYSTEMD_BOOT_EFI: &str = "systemd-bootx64.efi";
#[cfg(target_arch = "aarch64")]
pub(crate) const SYSTEMD_BOOT_EFI: &str = "systemd-bootaa64.efi";
#[cfg(target_arch = "riscv64")]
pub(crate) const SYSTEMD_BOOT_EFI: &str = "systemd-bootriscv64.efi";

#[cfg(target_arch = "x86_64")]
const LOADER_STUB: &str = "BOOTX64.EFI";
#[cfg(target_arch = "aarch64")]
const LOADER_STUB: &str = "BOOTAA64.EFI";
#[cfg(target_arch = "riscv64")]
const LOADER_STUB: &str = "BOOTRISCV64.EFI";

/// Subdirectory under the boot directory kernels/initrds are staged into.
pub(crate) const KERNEL_DESTINATION: &str = "EFI/BOOT";

#[derive(Default)]
pub(crate) struct SystemdBootBackend {
    kernel_queue: Vec<Kernel>,
    base_path: Utf8PathBuf,
}

impl SystemdBootBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn entries_dir(&self) -> Utf8PathBuf {
        self.base_path.join("loader/entries")
    }

    fn loader_conf(&self) -> Utf8PathBuf {
        self.base_path.join("loader/loader.conf")
    }

    fn kernel_dest_dir(&self) -> Utf8PathBuf {
        self.base_path.join(KERNEL_DESTINATION)
    }

    fn entry_path(&self, kernel: &Kernel) -> Utf8PathBuf {
        self.entries_dir()
            .join(format!("{}.conf", kernel.target.legacy_path))
    }

    fn render_entry(&self, kernel: &Kernel, ctx: &BootContext<'_>) -> String {
        let mut s = String::new();
        s.push_str(&format!("title {}\n", kernel.meta.bpath));
        s.push_str(&format!(
            "linux /{}/{}\n",
            KERNEL_DESTINATION, kernel.target.legacy_path
        ));
        if let Some(initrd) = &kernel.target.initrd_path {
            s.push_str(&format!("initrd /{}/{}\n", KERNEL_DESTINATION, initrd));
        }
        let mut options = String::new();
        if let Some(part_uuid) = &ctx.root_device.part_uuid {
            options.push_str(&format!("root=PARTUUID={part_uuid} "));
        } else {
            options.push_str(&format!("root=UUID={} ", ctx.root_device.uuid));
        }
        if let Some(luks_uuid) = &ctx.root_device.luks_uuid {
            options.push_str(&format!("rd.luks.uuid={luks_uuid} "));
        }
        options.push_str(&kernel.meta.cmdline);
        s.push_str(&format!("options {}\n", options.trim_end()));
        s
    }
}

impl BootLoader for SystemdBootBackend {
    fn name(&self) -> &'static str {
        "systemd-boot"
    }

    fn init(&mut self, ctx: &BootContext<'_>) -> Result<()> {
        self.kernel_queue.clear();
        self.base_path = ctx.boot_dir.to_owned();
        Ok(())
    }

    fn needs_install(&self, _ctx: &BootContext<'_>) -> Result<bool> {
        Ok(true)
    }

    fn needs_update(&self, _ctx: &BootContext<'_>) -> Result<bool> {
        Ok(true)
    }

    fn install_kernel(&mut self, _ctx: &BootContext<'_>, kernel: &Kernel) -> Result<()> {
        let dest_dir = self.kernel_dest_dir();
        files::mkdir_p(dest_dir.as_std_path())?;
        let kernel_dest = dest_dir.join(&kernel.target.legacy_path);
        if !files::files_match(kernel.source.path.as_path(), kernel_dest.as_std_path()) {
            files::copy_file_atomic(kernel.source.path.as_path(), kernel_dest.as_std_path(), 0o644)?;
        }
        if self
            .kernel_queue
            .iter()
            .any(|k| k.source.path == kernel.source.path)
        {
            return Ok(());
        }
        self.kernel_queue.push(kernel.clone());
        Ok(())
    }

    fn remove_kernel(&mut self, _ctx: &BootContext<'_>, kernel: &Kernel) -> Result<()> {
        self.kernel_queue
            .retain(|k| k.source.path != kernel.source.path);
        let entry = self.entry_path(kernel);
        if entry.as_std_path().exists() {
            std::fs::remove_file(entry.as_std_path())
                .with_context(|| format!("removing {entry}"))?;
        }
        let kernel_dest = self.kernel_dest_dir().join(&kernel.target.legacy_path);
        if kernel_dest.as_std_path().exists() {
            std::fs::remove_file(kernel_dest.as_std_path())
                .with_context(|| format!("removing {kernel_dest}"))?;
        }
        Ok(())
    }

    fn set_default_kernel(
        &mut self,
        ctx: &BootContext<'_>,
        default_kernel: Option<&Kernel>,
    ) -> Result<()> {
        files::mkdir_p(self.entries_dir().as_std_path())?;
        for k in &self.kernel_queue {
            let entry_path = self.entry_path(k);
            let rendered = self.render_entry(k, ctx);
            if let Some(old) = files::file_get_text(entry_path.as_std_path())? {
                if old == rendered {
                    continue;
                }
            }
            files::file_set_text(entry_path.as_std_path(), &rendered)?;
        }

        let loader_conf = match default_kernel {
            Some(k) => format!("default {}\ntimeout 0\n", k.target.legacy_path),
            None => "timeout 5\n".to_string(),
        };
        let loader_conf_path = self.loader_conf();
        if files::file_get_text(loader_conf_path.as_std_path())?.as_deref() != Some(&loader_conf) {
            files::file_set_text(loader_conf_path.as_std_path(), &loader_conf)?;
        }
        files::sync_filesystems();
        Ok(())
    }

    fn get_default_kernel(&self, _ctx: &BootContext<'_>) -> Result<Option<String>> {
        let Some(text) = files::file_get_text(self.loader_conf().as_std_path())? else {
            return Ok(None);
        };
        Ok(text
            .lines()
            .find_map(|l| l.strip_prefix("default ").map(str::trim))
            .map(str::to_string))
    }

    fn install(&mut self, ctx: &BootContext<'_>) -> Result<()> {
        let dest_dir = self.kernel_dest_dir();
        files::mkdir_p(dest_dir.as_std_path())?;
        let src_binary = ctx
            .prefix
            .join("usr/lib/systemd/boot/efi")
            .join(SYSTEMD_BOOT_EFI);
        let dest_binary = dest_dir.join(LOADER_STUB);
        files::copy_file_atomic(src_binary.as_std_path(), dest_binary.as_std_path(), 0o644)
            .with_context(|| format!("staging {src_binary}"))?;
        files::sync_filesystems();
        Ok(())
    }

    fn update(&mut self, ctx: &BootContext<'_>) -> Result<()> {
        self.install(ctx)
    }

    fn remove(&mut self, _ctx: &BootContext<'_>) -> Result<()> {
        let dest_binary = self.kernel_dest_dir().join(LOADER_STUB);
        if dest_binary.as_std_path().exists() {
            std::fs::remove_file(dest_binary.as_std_path())?;
        }
        Ok(())
    }

    fn destroy(&mut self) {
        self.kernel_queue.clear();
        self.base_path = Utf8PathBuf::new();
    }

    fn get_capabilities(&self, ctx: &BootContext<'_>) -> Capabilities {
        let binary = ctx
            .prefix
            .join("usr/lib/systemd/boot/efi")
            .join(SYSTEMD_BOOT_EFI);
        if !binary.as_std_path().is_file() {
            log::debug!("systemd-boot EFI binary not found at {binary}");
            return Capabilities::NONE;
        }
        Capabilities::UEFI | Capabilities::GPT | Capabilities::FATFS
    }

    fn get_kernel_destination(&self) -> Option<&str> {
        Some(KERNEL_DESTINATION)
    }
}
