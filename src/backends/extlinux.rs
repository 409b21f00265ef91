/*
 * Copyright (C) 2020 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

//! Legacy (BIOS/GPT) extlinux backend. Ported from
//! `extlinux.c`: the whole configuration file is re-synthesized from the
//! queued kernel set every time a default is set, written only if its
//! content actually changed, and `remove_kernel` is an intentional no-op
//! since the next `set_default_kernel` rewrites the config from scratch
//! anyway (see DESIGN.md).

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::process::Command;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;

use crate::bootloader::{BootContext, BootLoader};
use crate::blockdev;
use crate::files;
use crate::model::{Capabilities, Kernel};

/// Exact byte count clr-boot-manager's original design copies from
/// `gptmbr.bin`: enough to cover the MBR boot code area without touching
/// the partition table that follows it.
const MBR_SYSLINUX_SIZE: u64 = 440;

#[derive(Default)]
pub(crate) struct ExtlinuxBackend {
    kernel_queue: Vec<Kernel>,
    base_path: Utf8PathBuf,
    update_in_place: bool,
}

impl ExtlinuxBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl BootLoader for ExtlinuxBackend {
    fn name(&self) -> &'static str {
        "extlinux"
    }

    fn init(&mut self, ctx: &BootContext<'_>) -> Result<()> {
        self.kernel_queue.clear();
        self.base_path = ctx.boot_dir.to_owned();
        self.update_in_place = self.base_path.join("ldlinux.sys").as_std_path().exists();
        Ok(())
    }

    fn needs_install(&self, _ctx: &BootContext<'_>) -> Result<bool> {
        Ok(true)
    }

    fn needs_update(&self, _ctx: &BootContext<'_>) -> Result<bool> {
        Ok(true)
    }

    fn install_kernel(&mut self, _ctx: &BootContext<'_>, kernel: &Kernel) -> Result<()> {
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

    fn remove_kernel(&mut self, _ctx: &BootContext<'_>, _kernel: &Kernel) -> Result<()> {
        Ok(())
    }

    fn set_default_kernel(
        &mut self,
        ctx: &BootContext<'_>,
        default_kernel: Option<&Kernel>,
    ) -> Result<()> {
        let config_path = self.base_path.join("extlinux.cfg");
        let mut buf = String::new();

        if default_kernel.is_none() {
            buf.push_str("TIMEOUT 100\n");
        }

        for k in &self.kernel_queue {
            if let Some(default_kernel) = default_kernel {
                if k.source.path == default_kernel.source.path {
                    buf.push_str(&format!("DEFAULT {}\n", k.target.legacy_path));
                }
            }

            buf.push_str(&format!("LABEL {}\n", k.target.legacy_path));
            buf.push_str(&format!("  KERNEL {}\n", k.target.legacy_path));

            let mut initrds: Vec<&str> = Vec::new();
            if let Some(initrd) = &k.target.initrd_path {
                initrds.push(initrd);
            }
            for name in ctx.freestanding_initrds {
                initrds.push(name);
            }
            if !initrds.is_empty() {
                buf.push_str(&format!("  INITRD {}\n", initrds.join(",")));
            }

            buf.push_str("APPEND ");
            if let Some(part_uuid) = &ctx.root_device.part_uuid {
                buf.push_str(&format!("root=PARTUUID={part_uuid} "));
            } else {
                buf.push_str(&format!("root=UUID={} ", ctx.root_device.uuid));
            }
            if let Some(luks_uuid) = &ctx.root_device.luks_uuid {
                buf.push_str(&format!("rd.luks.uuid={luks_uuid} "));
            }
            buf.push_str(&format!("{}\n", k.meta.cmdline));
        }

        if let Some(old) = files::file_get_text(config_path.as_std_path())? {
            if old == buf {
                return Ok(());
            }
        }

        files::file_set_text(config_path.as_std_path(), &buf)?;
        files::sync_filesystems();
        Ok(())
    }

    fn get_default_kernel(&self, _ctx: &BootContext<'_>) -> Result<Option<String>> {
        // extlinux.cfg is write-only from our side; we never parse it back.
        Ok(None)
    }

    fn install(&mut self, ctx: &BootContext<'_>) -> Result<()> {
        let boot_device = blockdev::get_parent_disk(ctx.prefix)?;
        let gptmbr = ctx.prefix.join("usr/share/extlinux/gptmbr.bin");

        let mut src = File::open(gptmbr.as_std_path())
            .with_context(|| format!("opening {gptmbr}"))?
            .take(MBR_SYSLINUX_SIZE);
        let mut dest = OpenOptions::new()
            .write(true)
            .open(boot_device.as_std_path())
            .with_context(|| format!("opening {boot_device} for writing"))?;
        let copied = std::io::copy(&mut src, &mut dest)
            .with_context(|| format!("writing MBR bootcode to {boot_device}"))?;
        if copied != MBR_SYSLINUX_SIZE {
            anyhow::bail!(
                "short write of MBR bootcode: wrote {copied} of {MBR_SYSLINUX_SIZE} bytes"
            );
        }
        dest.flush()?;

        let extlinux_bin = ctx.prefix.join("usr/bin/extlinux");
        let mut cmd = Command::new(extlinux_bin.as_std_path());
        if self.update_in_place {
            cmd.arg("-U");
        } else {
            cmd.arg("-i");
        }
        cmd.arg(self.base_path.as_std_path());
        let status = cmd
            .status()
            .with_context(|| format!("running {:?}", cmd))?;
        if !status.success() {
            anyhow::bail!("extlinux exited: {status}");
        }

        files::sync_filesystems();
        Ok(())
    }

    fn update(&mut self, ctx: &BootContext<'_>) -> Result<()> {
        self.install(ctx)
    }

    fn remove(&mut self, _ctx: &BootContext<'_>) -> Result<()> {
        Ok(())
    }

    fn destroy(&mut self) {
        self.kernel_queue.clear();
        self.base_path = Utf8PathBuf::new();
        self.update_in_place = false;
    }

    fn get_capabilities(&self, ctx: &BootContext<'_>) -> Capabilities {
        let extlinux_bin = ctx.prefix.join("usr/bin/extlinux");
        if !is_executable(extlinux_bin.as_std_path()) {
            log::debug!("extlinux not found at {extlinux_bin}");
            return Capabilities::NONE;
        }
        Capabilities::GPT | Capabilities::LEGACY
    }

    fn get_kernel_destination(&self) -> Option<&str> {
        None
    }
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{KernelMeta, KernelSource, KernelTarget, RootDeviceInfo};
    use crate::sysstub::FakeSystemStub;
    use camino::Utf8Path;

    fn mk_kernel(name: &str) -> Kernel {
        Kernel {
            meta: KernelMeta {
                ktype: "org.bootctld.native".into(),
                version: "5.10.0".into(),
                release: 100,
                bpath: name.into(),
                cmdline: "quiet".into(),
            },
            source: KernelSource {
                path: format!("/usr/lib/kernel/{name}").into(),
            },
            target: KernelTarget {
                legacy_path: name.into(),
                initrd_path: None,
            },
        }
    }

    #[test]
    fn writes_timeout_when_no_default_is_set() {
        let td = tempfile::tempdir().unwrap();
        let boot_dir = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
        let stub = FakeSystemStub::new("/sys");
        let root = RootDeviceInfo {
            uuid: "1111-2222".into(),
            part_uuid: None,
            luks_uuid: None,
        };
        let ctx = BootContext {
            stub: &stub,
            prefix: Utf8Path::new("/"),
            boot_dir: &boot_dir,
            boot_device: None,
            root_device: &root,
            cmdline: "",
            freestanding_initrds: &[],
        };
        let mut backend = ExtlinuxBackend::new();
        backend.init(&ctx).unwrap();
        backend.set_default_kernel(&ctx, None).unwrap();

        let contents = std::fs::read_to_string(boot_dir.join("extlinux.cfg")).unwrap();
        assert!(contents.starts_with("TIMEOUT 100\n"));
    }

    #[test]
    fn synthesizes_default_stanza_and_skips_rewrite_when_unchanged() {
        let td = tempfile::tempdir().unwrap();
        let boot_dir = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
        let stub = FakeSystemStub::new("/sys");
        let root = RootDeviceInfo {
            uuid: "".into(),
            part_uuid: Some("abcd-1234".into()),
            luks_uuid: None,
        };
        let ctx = BootContext {
            stub: &stub,
            prefix: Utf8Path::new("/"),
            boot_dir: &boot_dir,
            boot_device: None,
            root_device: &root,
            cmdline: "",
            freestanding_initrds: &[],
        };
        let mut backend = ExtlinuxBackend::new();
        backend.init(&ctx).unwrap();
        let k = mk_kernel("org.bootctld.native-5.10.0-100");
        backend.install_kernel(&ctx, &k).unwrap();
        backend.set_default_kernel(&ctx, Some(&k)).unwrap();

        let config_path = boot_dir.join("extlinux.cfg");
        let first = std::fs::read_to_string(&config_path).unwrap();
        assert!(first.contains("DEFAULT org.bootctld.native-5.10.0-100"));
        assert!(first.contains("root=PARTUUID=abcd-1234"));

        let mtime_before = std::fs::metadata(&config_path).unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        backend.set_default_kernel(&ctx, Some(&k)).unwrap();
        let mtime_after = std::fs::metadata(&config_path).unwrap().modified().unwrap();
        assert_eq!(mtime_before, mtime_after);
    }

    #[test]
    fn install_kernel_is_idempotent_for_the_same_source_path() {
        let td = tempfile::tempdir().unwrap();
        let boot_dir = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
        let stub = FakeSystemStub::new("/sys");
        let root = RootDeviceInfo::default();
        let ctx = BootContext {
            stub: &stub,
            prefix: Utf8Path::new("/"),
            boot_dir: &boot_dir,
            boot_device: None,
            root_device: &root,
            cmdline: "",
            freestanding_initrds: &[],
        };
        let mut backend = ExtlinuxBackend::new();
        backend.init(&ctx).unwrap();
        let k = mk_kernel("org.bootctld.native-5.10.0-100");
        backend.install_kernel(&ctx, &k).unwrap();
        backend.install_kernel(&ctx, &k).unwrap();
        assert_eq!(backend.kernel_queue.len(), 1);
    }

    #[test]
    fn remove_kernel_is_a_documented_noop() {
        let td = tempfile::tempdir().unwrap();
        let boot_dir = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
        let stub = FakeSystemStub::new("/sys");
        let root = RootDeviceInfo::default();
        let ctx = BootContext {
            stub: &stub,
            prefix: Utf8Path::new("/"),
            boot_dir: &boot_dir,
            boot_device: None,
            root_device: &root,
            cmdline: "",
            freestanding_initrds: &[],
        };
        let mut backend = ExtlinuxBackend::new();
        backend.init(&ctx).unwrap();
        let k = mk_kernel("org.bootctld.native-5.10.0-100");
        backend.install_kernel(&ctx, &k).unwrap();
        backend.remove_kernel(&ctx, &k).unwrap();
        assert_eq!(backend.kernel_queue.len(), 1);
    }
}
