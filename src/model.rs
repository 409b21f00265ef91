/*
 * Copyright (C) 2020 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

//! Data types shared by every component: the capability bitset, the
//! `SystemConfig` produced by the Host Inspector, and the `Kernel` record
//! that the Kernel Reconciler and bootloader backends operate on.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;

/// A capability mask describing either what a host *wants* from a
/// bootloader or what a bootloader backend *provides*. Extensible bitset,
/// kept as a thin newtype over `u32` rather than pulling in a bitflags
/// dependency for five fixed flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub(crate) struct Capabilities(u32);

impl Capabilities {
    pub(crate) const NONE: Capabilities = Capabilities(0);
    pub(crate) const GPT: Capabilities = Capabilities(1 << 0);
    pub(crate) const LEGACY: Capabilities = Capabilities(1 << 1);
    pub(crate) const UEFI: Capabilities = Capabilities(1 << 2);
    pub(crate) const EXTFS: Capabilities = Capabilities(1 << 3);
    pub(crate) const FATFS: Capabilities = Capabilities(1 << 4);

    /// `self` is a superset of `other` iff all bits wanted by `other` are
    /// present in `self` — this is the Selector's match rule.
    pub(crate) fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;
    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}

impl BitOrAssign for Capabilities {
    fn bitor_assign(&mut self, rhs: Capabilities) {
        self.0 |= rhs.0;
    }
}

/// Record describing the root filesystem's block device, as probed by the
/// (out-of-scope) block-device helper layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct RootDeviceInfo {
    pub(crate) uuid: String,
    pub(crate) part_uuid: Option<String>,
    pub(crate) luks_uuid: Option<String>,
}

/// Immutable system configuration, produced once by the Host Inspector and
/// discarded wholesale (never mutated in place) on prefix change.
#[derive(Clone, Debug)]
pub(crate) struct SystemConfig {
    pub(crate) prefix: PathBuf,
    pub(crate) boot_device: Option<PathBuf>,
    pub(crate) root_device: RootDeviceInfo,
    pub(crate) wanted_boot_mask: Capabilities,
    /// Whether this configuration describes an offline image tree rather
    /// than a live, mounted host.
    pub(crate) image_mode: bool,
}

impl SystemConfig {
    /// A `SystemConfig` is sane iff its root device was found. `boot_device`
    /// may legitimately be absent (image-mode inspection), but `root_device`
    /// is the unconditional requirement in every mode.
    pub(crate) fn is_sane(&self) -> bool {
        !self.root_device.uuid.is_empty()
    }
}

/// Metadata describing a kernel (opaque identity fields: the core
/// only ever compares these, it never interprets them).
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct KernelMeta {
    pub(crate) ktype: String,
    pub(crate) version: String,
    pub(crate) release: u64,
    /// User-visible identifier and default-comparison key.
    pub(crate) bpath: String,
    pub(crate) cmdline: String,
}

/// Where the kernel blob currently lives, on the *source* filesystem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct KernelSource {
    pub(crate) path: PathBuf,
}

/// Where the kernel (and its initrd, if any) should be addressed from
/// *inside* bootloader configuration.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub(crate) struct KernelTarget {
    /// Short filename used inside legacy bootloader stanzas.
    pub(crate) legacy_path: String,
    pub(crate) initrd_path: Option<String>,
}

/// A single discovered kernel. Two kernels are "the same installed kernel"
/// iff `(ktype, version, release)` are all equal — see [`Kernel::same_as`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Kernel {
    pub(crate) meta: KernelMeta,
    pub(crate) source: KernelSource,
    pub(crate) target: KernelTarget,
}

impl Kernel {
    pub(crate) fn same_as(&self, other: &Kernel) -> bool {
        self.meta.ktype == other.meta.ktype
            && self.meta.version == other.meta.version
            && self.meta.release == other.meta.release
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.meta.bpath)
    }
}

/// An ordered sequence of (borrowed) kernels. The array does not own, and
/// does not free, the kernels it references.
pub(crate) type KernelArray<'a> = Vec<&'a Kernel>;

/// Full total order for sorting: `release` descending, then `version`
/// descending, then `ktype` ascending. This resolves the open question in
/// the original design, where sorting only by `release` left equal-release
/// kernels in unstable order (see DESIGN.md).
fn kernel_sort_key(k: &Kernel) -> (std::cmp::Reverse<u64>, std::cmp::Reverse<&str>, &str) {
    (
        std::cmp::Reverse(k.meta.release),
        std::cmp::Reverse(k.meta.version.as_str()),
        k.meta.ktype.as_str(),
    )
}

pub(crate) fn sort_kernels(kernels: &mut KernelArray<'_>) {
    kernels.sort_by(|a, b| kernel_sort_key(a).cmp(&kernel_sort_key(b)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk(ktype: &str, version: &str, release: u64) -> Kernel {
        Kernel {
            meta: KernelMeta {
                ktype: ktype.into(),
                version: version.into(),
                release,
                bpath: format!("{ktype}-{version}-{release}"),
                cmdline: String::new(),
            },
            source: KernelSource {
                path: PathBuf::from(format!("/usr/lib/kernel/{ktype}-{version}-{release}")),
            },
            target: KernelTarget::default(),
        }
    }

    #[test]
    fn same_as_matches_identity_triple() {
        let a = mk("org.kernel", "5.10.0", 100);
        let b = mk("org.kernel", "5.10.0", 100);
        let c = mk("org.kernel", "5.10.0", 101);
        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
    }

    #[test]
    fn sort_is_deterministic_on_equal_release() {
        let k1 = mk("org.kernel", "5.10.0", 100);
        let k2 = mk("org.kernel", "5.9.0", 100);
        let k3 = mk("org.kernel", "6.0.0", 200);
        let mut arr: KernelArray = vec![&k1, &k2, &k3];
        sort_kernels(&mut arr);
        assert_eq!(arr[0].meta.version, "6.0.0");
        assert_eq!(arr[1].meta.version, "5.10.0");
        assert_eq!(arr[2].meta.version, "5.9.0");
    }

    #[test]
    fn capabilities_superset_match() {
        let wanted = Capabilities::UEFI | Capabilities::GPT | Capabilities::FATFS;
        let provided = Capabilities::UEFI | Capabilities::GPT | Capabilities::FATFS | Capabilities::EXTFS;
        assert!(provided.contains(wanted));
    }
}
