/*!
**Boot** **c**on**t**ro**l** **d**aemon.

Orchestrates kernel, freestanding-initramfs and bootloader-backend state on a
Linux host: inspects the platform to decide a boot topology, mounts the boot
partition safely around mutating operations, and drives one of several
bootloader backends through a uniform lifecycle contract.
!*/

#![deny(unused_must_use)]
// The style lints are more annoying than useful
#![allow(clippy::style)]

mod backends;
mod blockdev;
mod bootloader;
mod bootman;
mod cli;
mod cmdline;
mod config;
mod files;
mod initrd;
mod kernels;
mod model;
mod mount;
mod reconcile;
mod sysconfig;
mod sysstub;

pub fn run<T>(args: impl IntoIterator<Item = T>) -> anyhow::Result<()>
where
    T: Into<std::ffi::OsString> + Clone,
{
    use clap::Parser;
    let cli_opts = cli::Cli::parse_from(args);
    cli_opts.run()
}
