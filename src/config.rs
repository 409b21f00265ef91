//! Compile-time path and naming conventions shared across the crate.

/// Directory (relative to the prefix) that kernels are discovered in.
pub(crate) const KERNEL_DIRECTORY: &str = "usr/lib/kernel";

/// Directory (relative to the prefix) holding freestanding initramfs images.
pub(crate) const INITRD_DIRECTORY: &str = "usr/lib/initrd-freestanding";

/// Directory (relative to the prefix) the boot partition is expected at.
pub(crate) const BOOT_DIRECTORY: &str = "boot";

/// Vendor-visible prefix used by some backends for on-disk label naming.
#[allow(dead_code)]
pub(crate) const VENDOR_PREFIX: &str = "org.bootctld";

/// Key prefix applied to freestanding initramfs entries in the map.
pub(crate) const FREESTANDING_PREFIX: &str = "freestanding-";
