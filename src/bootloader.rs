/*
 * Copyright (C) 2020 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

//! Bootloader Backend Contract and Registry/Selector.
//!
//! Every backend lives behind the [`BootLoader`] trait; [`select_bootloader`]
//! walks a fixed, priority-ordered list and picks the first whose declared
//! capabilities are a superset of what the Host Inspector determined the
//! system wants. This mirrors `bootman_known_loaders` and
//! `boot_manager_select_bootloader` in the original sources, with the C
//! `bool`-returning vtable turned into `Result`-returning trait methods.

use anyhow::Result;
use camino::Utf8Path;

use crate::model::{Capabilities, Kernel, RootDeviceInfo};
use crate::sysstub::SystemStub;

/// Everything a backend needs to act, without holding a reference back to
/// the facade that owns it (that would require the trait object to be
/// generic over its owner, which `dyn BootLoader` rules out).
pub(crate) struct BootContext<'a> {
    pub(crate) stub: &'a dyn SystemStub,
    pub(crate) prefix: &'a Utf8Path,
    pub(crate) boot_dir: &'a Utf8Path,
    /// The physical boot device (ESP/BIOS-boot partition), when one was
    /// discovered. `None` in image mode, where there is no real device to
    /// register EFI boot variables against.
    pub(crate) boot_device: Option<&'a Utf8Path>,
    pub(crate) root_device: &'a RootDeviceInfo,
    pub(crate) cmdline: &'a str,
    /// Plain filenames (not the `freestanding-`-prefixed staged name) of
    /// every freestanding initrd currently enumerated by the facade, in
    /// iteration order. Legacy-stanza synthesis appends these after a
    /// kernel's own initrd in its `INITRD` line.
    pub(crate) freestanding_initrds: &'a [String],
}

/// The bootloader backend contract. Each method corresponds 1:1 to a field
/// of the original `BootLoader` vtable; `kernel_queue`/`base_path`-style
/// backend-private state lives on the implementing struct instead of in
/// file-scope statics.
pub(crate) trait BootLoader {
    fn name(&self) -> &'static str;

    /// (Re-)initialise backend-private state for the current boot
    /// directory. Called once a prefix/boot dir is selected, and again
    /// whenever the boot directory changes (e.g. after mounting the ESP).
    fn init(&mut self, ctx: &BootContext<'_>) -> Result<()>;

    fn needs_install(&self, ctx: &BootContext<'_>) -> Result<bool>;
    fn install(&mut self, ctx: &BootContext<'_>) -> Result<()>;
    fn needs_update(&self, ctx: &BootContext<'_>) -> Result<bool>;
    fn update(&mut self, ctx: &BootContext<'_>) -> Result<()>;

    /// Queue `kernel` for inclusion the next time configuration is
    /// (re)written by [`BootLoader::set_default_kernel`].
    fn install_kernel(&mut self, ctx: &BootContext<'_>, kernel: &Kernel) -> Result<()>;
    fn remove_kernel(&mut self, ctx: &BootContext<'_>, kernel: &Kernel) -> Result<()>;

    /// Write out backend configuration, marking `kernel` (if any) as the
    /// default entry. `None` means "no default", e.g. before any kernel has
    /// been installed.
    fn set_default_kernel(&mut self, ctx: &BootContext<'_>, kernel: Option<&Kernel>)
        -> Result<()>;
    fn get_default_kernel(&self, ctx: &BootContext<'_>) -> Result<Option<String>>;

    fn remove(&mut self, ctx: &BootContext<'_>) -> Result<()>;

    /// Release backend-private state ahead of re-init or facade teardown.
    fn destroy(&mut self);

    fn get_capabilities(&self, ctx: &BootContext<'_>) -> Capabilities;

    /// Subdirectory under the boot directory that UEFI-class backends
    /// install kernels/initrds into (e.g. `EFI/BOOT`). `None` for
    /// non-UEFI backends.
    fn get_kernel_destination(&self) -> Option<&str>;
}

/// Find the index of the first backend (in priority order) whose
/// capabilities are a superset of `wanted`. Mirrors
/// `boot_manager_select_bootloader`'s linear scan and "first match wins"
/// rule — callers provide the backend list in priority order (extlinux
/// before a UEFI-class backend would let it shadow UEFI systems, so
/// ordering is a registry-level concern, not a resolved-here heuristic).
/// Returns an index rather than a reference so callers can subsequently
/// move the chosen backend out of the list (e.g. via `Vec::remove`).
pub(crate) fn select_bootloader(
    known: &[Box<dyn BootLoader>],
    wanted: Capabilities,
    ctx: &BootContext<'_>,
) -> Result<usize> {
    known
        .iter()
        .position(|l| l.get_capabilities(ctx).contains(wanted))
        .ok_or_else(|| anyhow::anyhow!("no appropriate bootloader found for this system"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RootDeviceInfo;
    use crate::sysstub::FakeSystemStub;

    struct StubLoader {
        caps: Capabilities,
    }

    impl BootLoader for StubLoader {
        fn name(&self) -> &'static str {
            "stub"
        }
        fn init(&mut self, _ctx: &BootContext<'_>) -> Result<()> {
            Ok(())
        }
        fn needs_install(&self, _ctx: &BootContext<'_>) -> Result<bool> {
            Ok(true)
        }
        fn install(&mut self, _ctx: &BootContext<'_>) -> Result<()> {
            Ok(())
        }
        fn needs_update(&self, _ctx: &BootContext<'_>) -> Result<bool> {
            Ok(true)
        }
        fn update(&mut self, _ctx: &BootContext<'_>) -> Result<()> {
            Ok(())
        }
        fn install_kernel(&mut self, _ctx: &BootContext<'_>, _kernel: &Kernel) -> Result<()> {
            Ok(())
        }
        fn remove_kernel(&mut self, _ctx: &BootContext<'_>, _kernel: &Kernel) -> Result<()> {
            Ok(())
        }
        fn set_default_kernel(
            &mut self,
            _ctx: &BootContext<'_>,
            _kernel: Option<&Kernel>,
        ) -> Result<()> {
            Ok(())
        }
        fn get_default_kernel(&self, _ctx: &BootContext<'_>) -> Result<Option<String>> {
            Ok(None)
        }
        fn remove(&mut self, _ctx: &BootContext<'_>) -> Result<()> {
            Ok(())
        }
        fn destroy(&mut self) {}
        fn get_capabilities(&self, _ctx: &BootContext<'_>) -> Capabilities {
            self.caps
        }
        fn get_kernel_destination(&self) -> Option<&str> {
            None
        }
    }

    #[test]
    fn selects_first_matching_backend_in_priority_order() {
        let stub = FakeSystemStub::new("/sys");
        let root = RootDeviceInfo::default();
        let ctx = BootContext {
            stub: &stub,
            prefix: Utf8Path::new("/"),
            boot_dir: Utf8Path::new("/boot"),
            boot_device: None,
            root_device: &root,
            cmdline: "",
            freestanding_initrds: &[],
        };
        let mut known: Vec<Box<dyn BootLoader>> = vec![
            Box::new(StubLoader {
                caps: Capabilities::LEGACY | Capabilities::GPT,
            }),
            Box::new(StubLoader {
                caps: Capabilities::UEFI | Capabilities::GPT,
            }),
        ];
        let idx = select_bootloader(&known, Capabilities::UEFI | Capabilities::GPT, &ctx).unwrap();
        assert_eq!(
            known[idx].get_capabilities(&ctx),
            Capabilities::UEFI | Capabilities::GPT
        );
    }

    #[test]
    fn errors_when_nothing_matches() {
        let stub = FakeSystemStub::new("/sys");
        let root = RootDeviceInfo::default();
        let ctx = BootContext {
            stub: &stub,
            prefix: Utf8Path::new("/"),
            boot_dir: Utf8Path::new("/boot"),
            boot_device: None,
            root_device: &root,
            cmdline: "",
            freestanding_initrds: &[],
        };
        let known: Vec<Box<dyn BootLoader>> = vec![Box::new(StubLoader {
            caps: Capabilities::LEGACY,
        })];
        assert!(select_bootloader(&known, Capabilities::UEFI, &ctx).is_err());
    }
}
