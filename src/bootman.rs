/*
 * Copyright (C) 2020 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

//! Boot Manager Facade: the single entry point callers (the
//! CLI, eventually other front-ends) go through. Owns the selected
//! bootloader backend, the system configuration produced by the Host
//! Inspector, and the derived paths every other component needs. Ported
//! from `bootman.c` in its entirety — `boot_manager_new`, `set_prefix`,
//! `set_boot_dir`, `modify_bootloader`, `set_uname`, `install_kernel`,
//! `remove_kernel`, `set_default_kernel`, `get_default_kernel`,
//! `list_kernels`, and the freestanding-initrd trio.

use std::str::FromStr;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::bootloader::{self, BootContext, BootLoader};
use crate::config;
use crate::initrd::{self, FreestandingInitrdMap};
use crate::kernels;
use crate::model::{Capabilities, Kernel, KernelArray, SystemConfig};
use crate::mount;
use crate::reconcile;
use crate::sysconfig;
use crate::sysstub::{RealSystemStub, SystemStub};

use crate::backends::extlinux::ExtlinuxBackend;
#[cfg(feature = "shim")]
use crate::backends::shim::ShimBackend;
use crate::backends::systemd_boot::SystemdBootBackend;

/// Which operations [`BootManager::modify_bootloader`] should perform.
/// Mirrors the `BOOTLOADER_OPERATION_{INSTALL,REMOVE,UPDATE,NO_CHECK}`
/// flag set.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ModifyBootloaderFlags {
    pub(crate) install: bool,
    pub(crate) remove: bool,
    pub(crate) update: bool,
    /// Skip the backend's `needs_install`/`needs_update` gate and act
    /// unconditionally.
    pub(crate) no_check: bool,
}

/// The backend priority order consulted by prefix (re)selection: shim-wrapped
/// UEFI first (so a shim-capable system prefers it over plain systemd-boot),
/// then plain UEFI, then legacy extlinux last. Mirrors the fixed ordering of
/// `bootman_known_loaders`.
fn known_backends() -> Vec<Box<dyn BootLoader>> {
    #[allow(unused_mut)]
    let mut backends: Vec<Box<dyn BootLoader>> = Vec::new();
    #[cfg(feature = "shim")]
    backends.push(Box::new(ShimBackend::new()));
    backends.push(Box::new(SystemdBootBackend::new()));
    backends.push(Box::new(ExtlinuxBackend::new()));
    backends
}

fn fstype_str(caps: Capabilities) -> &'static str {
    if caps.contains(Capabilities::FATFS) {
        "vfat"
    } else if caps.contains(Capabilities::EXTFS) {
        "ext4"
    } else {
        "auto"
    }
}

/// Free function (rather than a `&self` method) so call sites can borrow
/// `self`'s fields individually and keep that borrow disjoint from a
/// simultaneous `&mut self.bootloader` borrow.
#[allow(clippy::too_many_arguments)]
fn make_context<'a>(
    stub: &'a dyn SystemStub,
    prefix: &'a Utf8Path,
    boot_dir: &'a Utf8Path,
    boot_device: Option<&'a Utf8Path>,
    root_device: &'a crate::model::RootDeviceInfo,
    cmdline: &'a str,
    freestanding_initrds: &'a [String],
) -> BootContext<'a> {
    BootContext {
        stub,
        prefix,
        boot_dir,
        boot_device,
        root_device,
        cmdline,
        freestanding_initrds,
    }
}

/// Top-level handle every caller drives the system through.
pub(crate) struct BootManager {
    stub: Box<dyn SystemStub>,
    image_mode: bool,

    prefix: Utf8PathBuf,
    sysconfig: SystemConfig,
    boot_device: Option<Utf8PathBuf>,

    bootloader: Box<dyn BootLoader>,
    kernel_dir: Utf8PathBuf,
    initrd_freestanding_dir: Utf8PathBuf,
    cmdline: String,

    /// Caller override for the boot directory (e.g. a test fixture, or an
    /// already-mounted ESP at a non-default path). `None` uses
    /// `<prefix>/boot`.
    abs_bootdir: Option<Utf8PathBuf>,

    /// The running kernel's release, if [`BootManager::set_uname`] was
    /// called with a parseable uname string. Used only to annotate
    /// `list_kernels` output.
    running_release: Option<u64>,

    freestanding_map: FreestandingInitrdMap,

    /// Parsed once per `set_prefix` call, never mutated in place.
    os_release: OsReleaseInfo,
}

impl BootManager {
    /// Construct against the real host, rooted at `prefix`.
    pub(crate) fn new(prefix: &Utf8Path, image_mode: bool) -> Result<Self> {
        Self::new_with_stub(Box::new(RealSystemStub), prefix, image_mode)
    }

    /// Construct against an injected [`SystemStub`], for tests.
    pub(crate) fn new_with_stub(
        stub: Box<dyn SystemStub>,
        prefix: &Utf8Path,
        image_mode: bool,
    ) -> Result<Self> {
        let mut mgr = Self {
            stub,
            image_mode,
            prefix: prefix.to_owned(),
            sysconfig: SystemConfig {
                prefix: prefix.to_owned().into_std_path_buf(),
                boot_device: None,
                root_device: Default::default(),
                wanted_boot_mask: Capabilities::NONE,
                image_mode,
            },
            boot_device: None,
            bootloader: Box::new(ExtlinuxBackend::new()),
            kernel_dir: Utf8PathBuf::new(),
            initrd_freestanding_dir: Utf8PathBuf::new(),
            cmdline: String::new(),
            abs_bootdir: None,
            running_release: None,
            freestanding_map: FreestandingInitrdMap::new(),
            os_release: OsReleaseInfo::empty(),
        };
        mgr.set_prefix(prefix)?;
        Ok(mgr)
    }

    /// Re-root the facade at `prefix`: re-probes the host, re-derives every
    /// prefix-relative path, and re-selects (and re-initializes) a
    /// bootloader backend. Mirrors `boot_manager_set_prefix`.
    pub(crate) fn set_prefix(&mut self, prefix: &Utf8Path) -> Result<()> {
        self.bootloader.destroy();

        let sysconfig = sysconfig::inspect_root(&*self.stub, prefix, self.image_mode)?;
        let realprefix = Utf8PathBuf::from_path_buf(sysconfig.prefix.clone())
            .map_err(|p| anyhow::anyhow!("non-UTF-8 prefix: {}", p.display()))?;
        let boot_device = sysconfig
            .boot_device
            .clone()
            .map(|p| {
                Utf8PathBuf::from_path_buf(p)
                    .map_err(|p| anyhow::anyhow!("non-UTF-8 boot device: {}", p.display()))
            })
            .transpose()?;

        self.kernel_dir = realprefix.join(config::KERNEL_DIRECTORY);
        self.initrd_freestanding_dir = realprefix.join(config::INITRD_DIRECTORY);
        self.cmdline = crate::cmdline::parse_cmdline_files(&realprefix);
        self.os_release = OsReleaseInfo::read(&realprefix)
            .with_context(|| format!("parsing os-release under {realprefix}"))?;
        self.prefix = realprefix;
        self.boot_device = boot_device;
        self.sysconfig = sysconfig;

        self.select_and_init_bootloader()
    }

    /// Plain filenames of every currently-enumerated freestanding initrd, in
    /// the facade's iteration order.
    fn freestanding_initrd_names(&self) -> Vec<String> {
        self.freestanding_map.values().cloned().collect()
    }

    fn select_and_init_bootloader(&mut self) -> Result<()> {
        let boot_dir = self.effective_boot_dir();
        let freestanding = self.freestanding_initrd_names();
        let ctx = make_context(
            &*self.stub,
            &self.prefix,
            &boot_dir,
            self.boot_device.as_deref(),
            &self.sysconfig.root_device,
            &self.cmdline,
            &freestanding,
        );
        let mut known = known_backends();
        let idx = bootloader::select_bootloader(&known, self.sysconfig.wanted_boot_mask, &ctx)?;
        let mut chosen = known.remove(idx);
        chosen.init(&ctx)?;
        log::info!("selected bootloader backend: {}", chosen.name());
        self.bootloader = chosen;
        Ok(())
    }

    fn effective_boot_dir(&self) -> Utf8PathBuf {
        self.abs_bootdir
            .clone()
            .unwrap_or_else(|| self.prefix.join(config::BOOT_DIRECTORY))
    }

    pub(crate) fn get_boot_dir(&self) -> Utf8PathBuf {
        self.effective_boot_dir()
    }

    /// Override the boot directory (e.g. to point at an already-mounted
    /// ESP), re-initializing the selected backend against it. Mirrors
    /// `boot_manager_set_boot_dir`.
    pub(crate) fn set_boot_dir(&mut self, dir: &Utf8Path) -> Result<()> {
        self.abs_bootdir = Some(dir.to_owned());
        let boot_dir = self.effective_boot_dir();
        let freestanding = self.freestanding_initrd_names();
        let ctx = make_context(
            &*self.stub,
            &self.prefix,
            &boot_dir,
            self.boot_device.as_deref(),
            &self.sysconfig.root_device,
            &self.cmdline,
            &freestanding,
        );
        self.bootloader.init(&ctx)
    }

    /// Run `body` with the boot device mounted at the boot directory (a
    /// no-op whenever `wanted_boot_mask` contains `LEGACY`: `/boot` is `/`
    /// in that mode, per spec §4.2 step 5/§4.5, regardless of whether a
    /// legacy BIOS-boot partition was separately discovered), then unmount
    /// whatever we mounted.
    fn with_boot_mounted<R>(
        &mut self,
        body: impl FnOnce(&mut Box<dyn BootLoader>, &BootContext<'_>) -> Result<R>,
    ) -> Result<R> {
        let mut boot_dir = self.effective_boot_dir();
        let legacy_only = self.sysconfig.wanted_boot_mask.contains(Capabilities::LEGACY);
        let outcome = if legacy_only {
            None
        } else {
            match &self.boot_device {
                Some(dev) => {
                    // Before mounting ourselves, check whether the boot device
                    // is already mounted somewhere else (e.g. a premounted ESP
                    // under an installer) and adopt that path rather than
                    // mounting over the expected one. Adoption only updates
                    // where we look for the boot directory from now on; it does
                    // not re-run the backend's `init`, which would discard any
                    // kernels already queued on it this session.
                    if !self.stub.is_mounted(&boot_dir)? {
                        if let Some(adopted) = self.stub.mountpoint_for_device(dev)? {
                            log::info!("adopting already-mounted boot device at {adopted}");
                            self.abs_bootdir = Some(adopted.clone());
                            boot_dir = adopted.clone();
                            Some(mount::MountOutcome::AlreadyMounted(adopted))
                        } else {
                            crate::files::mkdir_p(boot_dir.as_std_path())?;
                            let fstype = fstype_str(self.sysconfig.wanted_boot_mask);
                            Some(mount::mount_boot(&*self.stub, dev, &boot_dir, fstype)?)
                        }
                    } else {
                        Some(mount::MountOutcome::AlreadyMounted(boot_dir.clone()))
                    }
                }
                None => None,
            }
        };

        // Each field is borrowed directly here (rather than through a
        // `&self` accessor) so this immutable borrow stays disjoint from
        // the `&mut self.bootloader` borrow taken for `body` below.
        let freestanding = self.freestanding_initrd_names();
        let ctx = make_context(
            &*self.stub,
            &self.prefix,
            &boot_dir,
            self.boot_device.as_deref(),
            &self.sysconfig.root_device,
            &self.cmdline,
            &freestanding,
        );
        let result = body(&mut self.bootloader, &ctx);

        if let Some(outcome) = &outcome {
            if let Err(e) = mount::umount_boot(&*self.stub, outcome) {
                log::warn!("failed to unmount boot directory: {e:#}");
            }
        }
        result
    }

    /// Dispatch exactly one of install/remove/update on the selected backend
    /// per `flags`, in that priority order (install wins over remove wins
    /// over update, matching `boot_manager_modify_bootloader`'s
    /// if/else-if chain); an empty or otherwise unrecognized flag
    /// combination is a fatal error, not a silent no-op.
    pub(crate) fn modify_bootloader(&mut self, flags: ModifyBootloaderFlags) -> Result<()> {
        if !self.sysconfig.is_sane() {
            anyhow::bail!("system configuration is not sane, refusing to modify bootloader");
        }
        self.with_boot_mounted(|bootloader, ctx| {
            if flags.install {
                if flags.no_check || bootloader.needs_install(ctx)? {
                    bootloader.install(ctx)?;
                }
            } else if flags.remove {
                bootloader.remove(ctx)?;
            } else if flags.update {
                if flags.no_check || bootloader.needs_update(ctx)? {
                    bootloader.update(ctx)?;
                }
            } else {
                anyhow::bail!("unknown bootloader operation");
            }
            Ok(())
        })
    }

    fn discovered_kernels(&self) -> Result<Vec<Kernel>> {
        kernels::discover_kernels(&self.kernel_dir, &self.cmdline)
    }

    /// Look up a discovered kernel by its `target.legacy_path` (the stable
    /// identifier `list_kernels` prints and callers pass back in).
    pub(crate) fn find_kernel(&self, bpath: &str) -> Result<Kernel> {
        self.discovered_kernels()?
            .into_iter()
            .find(|k| k.target.legacy_path == bpath)
            .ok_or_else(|| anyhow::anyhow!("no such kernel: {bpath}"))
    }

    pub(crate) fn install_kernel(&mut self, kernel: &Kernel) -> Result<()> {
        if !self.sysconfig.is_sane() {
            anyhow::bail!("system configuration is not sane, refusing to install a kernel");
        }
        self.with_boot_mounted(|bootloader, ctx| {
            reconcile::install_kernel(bootloader.as_mut(), ctx, kernel)
        })
    }

    pub(crate) fn remove_kernel(&mut self, kernel: &Kernel) -> Result<()> {
        self.with_boot_mounted(|bootloader, ctx| {
            reconcile::remove_kernel(bootloader.as_mut(), ctx, kernel)
        })
    }

    pub(crate) fn set_default_kernel(&mut self, kernel: &Kernel) -> Result<()> {
        let discovered = self.discovered_kernels()?;
        let all: KernelArray<'_> = discovered.iter().collect();
        self.with_boot_mounted(|bootloader, ctx| {
            reconcile::set_default_kernel(bootloader.as_mut(), ctx, &all, kernel)
        })
    }

    pub(crate) fn get_default_kernel(&mut self) -> Result<Option<String>> {
        self.with_boot_mounted(|bootloader, ctx| bootloader.get_default_kernel(ctx))
    }

    /// List every discovered kernel, most recent first, each prefixed by
    /// `"* "` if it is the bootloader's current default and `"  "`
    /// otherwise. Mirrors `boot_manager_list_kernels`.
    pub(crate) fn list_kernels(&mut self) -> Result<Vec<String>> {
        let discovered = self.discovered_kernels()?;
        let mut sorted: KernelArray<'_> = discovered.iter().collect();
        crate::model::sort_kernels(&mut sorted);

        let default = self.get_default_kernel()?;
        Ok(sorted
            .iter()
            .map(|k| {
                let marker = if default.as_deref() == Some(k.target.legacy_path.as_str()) {
                    "*"
                } else {
                    " "
                };
                format!("{marker} {k}")
            })
            .collect())
    }

    /// Record the currently running kernel's release, parsed from a
    /// `uname -r`-style string whose final `-`-delimited field is the
    /// release number. Soft-fails (returns `false`) on an unparseable
    /// string, mirroring `boot_manager_set_uname`'s tolerant behavior.
    pub(crate) fn set_uname(&mut self, uname: &str) -> bool {
        match uname.rsplit('-').next().and_then(|s| u64::from_str(s).ok()) {
            Some(release) => {
                self.running_release = Some(release);
                true
            }
            None => {
                log::debug!("could not parse uname string: {uname}");
                false
            }
        }
    }

    /// Stage every freestanding initrd found under
    /// `usr/lib/initrd-freestanding`, and remove any previously staged one
    /// whose source has since disappeared. Mirrors the
    /// `boot_manager_{enumerate,copy,remove}_initrd_freestanding` trio.
    pub(crate) fn sync_freestanding_initrds(&mut self) -> Result<()> {
        let map = initrd::enumerate(&self.initrd_freestanding_dir)?;
        // Captured as a local rather than `&self.initrd_freestanding_dir`
        // so the closure below doesn't hold a borrow of `self` that would
        // conflict with `with_boot_mounted`'s own `&mut self`.
        let initrd_dir = self.initrd_freestanding_dir.clone();
        self.with_boot_mounted(|bootloader, ctx| {
            initrd::copy(bootloader.as_ref(), ctx, &initrd_dir, &map)
                .context("staging freestanding initrds")?;
            initrd::remove_orphans(bootloader.as_ref(), ctx, &map)
                .context("removing stale freestanding initrds")
        })?;
        self.freestanding_map = map;
        Ok(())
    }

    pub(crate) fn freestanding_initrd_count(&self) -> usize {
        self.freestanding_map.len()
    }

    /// Mirrors `boot_manager_get_os_name`, which returns `PRETTY_NAME`.
    pub(crate) fn get_os_name(&self) -> Option<&str> {
        self.os_release.pretty_name.as_deref()
    }

    /// Mirrors `boot_manager_get_os_id`, which returns `ID`.
    pub(crate) fn get_os_id(&self) -> Option<&str> {
        self.os_release.id.as_deref()
    }
}

/// Minimal `/etc/os-release` fields this crate surfaces. The upstream
/// `os-release` crate only ever reads the real `/etc/os-release`; since we
/// need to read one relative to an arbitrary prefix (image mode, tests),
/// parse it ourselves using the same `KEY=VALUE` grammar.
#[derive(Clone, Debug, Default)]
struct OsReleaseInfo {
    pretty_name: Option<String>,
    id: Option<String>,
}

impl OsReleaseInfo {
    fn empty() -> Self {
        Self::default()
    }

    /// Parse `<prefix>/etc/os-release`, or return an empty record if the
    /// file doesn't exist (plenty of image roots legitimately have none).
    /// Any other I/O error, or content that isn't valid UTF-8, is fatal —
    /// a present-but-unreadable os-release indicates a broken root, not an
    /// absent one.
    fn read(prefix: &Utf8Path) -> Result<Self> {
        let path = prefix.join("etc/os-release");
        let text = match std::fs::read_to_string(path.as_std_path()) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::empty()),
            Err(e) => return Err(e).with_context(|| format!("reading {path}")),
        };
        let mut info = Self::empty();
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "PRETTY_NAME" => info.pretty_name = Some(value),
                "ID" => info.id = Some(value),
                _ => {}
            }
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{KernelMeta, KernelSource, KernelTarget};
    use crate::sysstub::FakeSystemStub;

    /// An image-mode tree with a systemd-boot EFI binary staged, so that
    /// the facade's `wanted_boot_mask` of `UEFI` (forced for image mode)
    /// resolves to a real backend without needing a live UEFI host.
    fn fixture_prefix() -> (tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let prefix = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
        let efi_dir = prefix.join("usr/lib/systemd/boot/efi");
        std::fs::create_dir_all(&efi_dir).unwrap();
        std::fs::write(
            efi_dir.join(crate::backends::systemd_boot::SYSTEMD_BOOT_EFI),
            b"fake-efi-binary",
        )
        .unwrap();
        (td, prefix)
    }

    #[test]
    fn selects_systemd_boot_when_its_efi_binary_is_present_in_image_mode() {
        let (_td, prefix) = fixture_prefix();
        let stub: Box<dyn SystemStub> = Box::new(FakeSystemStub::new(prefix.join("sys")));
        let mut mgr = BootManager::new_with_stub(stub, &prefix, true).unwrap();
        // The fixture's prefix is a bare tempdir, not a real mounted root,
        // so the real root-device probe legitimately finds nothing here;
        // fake a resolved UUID the way `boot_device` is faked elsewhere in
        // these tests, so sanity reflects what a real host would produce.
        mgr.sysconfig.root_device.uuid = "fake-root-uuid".into();
        assert_eq!(mgr.bootloader.name(), "systemd-boot");
        assert!(mgr.sysconfig.is_sane());
    }

    #[test]
    fn set_uname_soft_fails_on_unparseable_input() {
        let (_td, prefix) = fixture_prefix();
        let stub: Box<dyn SystemStub> = Box::new(FakeSystemStub::new(prefix.join("sys")));
        let mut mgr = BootManager::new_with_stub(stub, &prefix, true).unwrap();
        assert!(!mgr.set_uname("not-a-uname-string!!"));
        assert!(mgr.set_uname("5.10.0-100"));
        assert_eq!(mgr.running_release, Some(100));
    }

    #[test]
    fn with_boot_mounted_adopts_a_boot_device_already_mounted_elsewhere() {
        let (_td, prefix) = fixture_prefix();
        let fake = FakeSystemStub::new(prefix.join("sys"));
        fake.device_mountpoints.borrow_mut().insert(
            Utf8PathBuf::from("/dev/fake-esp"),
            Utf8PathBuf::from("/mnt/esp"),
        );
        let stub: Box<dyn SystemStub> = Box::new(fake);
        let mut mgr = BootManager::new_with_stub(stub, &prefix, true).unwrap();
        mgr.boot_device = Some(Utf8PathBuf::from("/dev/fake-esp"));
        mgr.sysconfig.root_device.uuid = "fake-root-uuid".into();

        mgr.modify_bootloader(ModifyBootloaderFlags {
            install: true,
            no_check: true,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(mgr.get_boot_dir(), Utf8PathBuf::from("/mnt/esp"));
    }

    #[test]
    fn list_kernels_marks_the_default_entry() {
        let (_td, prefix) = fixture_prefix();
        let kernel_dir = prefix.join(config::KERNEL_DIRECTORY);
        let kdir = kernel_dir.join("org.bootctld.native-5.10.0-100");
        std::fs::create_dir_all(&kdir).unwrap();
        std::fs::write(kdir.join("vmlinuz"), b"fake-kernel").unwrap();

        let stub: Box<dyn SystemStub> = Box::new(FakeSystemStub::new(prefix.join("sys")));
        let mut mgr = BootManager::new_with_stub(stub, &prefix, true).unwrap();
        mgr.sysconfig.root_device.uuid = "fake-root-uuid".into();

        let kernel = Kernel {
            meta: KernelMeta {
                ktype: "org.bootctld.native".into(),
                version: "5.10.0".into(),
                release: 100,
                bpath: "org.bootctld.native-5.10.0-100".into(),
                cmdline: "quiet".into(),
            },
            source: KernelSource {
                path: kdir.join("vmlinuz").into_std_path_buf(),
            },
            target: KernelTarget {
                legacy_path: "org.bootctld.native-5.10.0-100".into(),
                initrd_path: None,
            },
        };
        mgr.install_kernel(&kernel).unwrap();
        mgr.set_default_kernel(&kernel).unwrap();

        let lines = mgr.list_kernels().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with('*'));
    }
}
