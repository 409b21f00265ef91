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

use clap::{crate_name, Parser};

/// Binary entrypoint.
fn main() {
    let exit_code = run_cli();
    std::process::exit(exit_code);
}

/// CLI logic.
fn run_cli() -> i32 {
    let args: Vec<_> = std::env::args().collect();
    let cli_opts = cli::Cli::parse_from(&args);

    env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .format_module_path(false)
        .filter(Some(crate_name!()), cli_opts.loglevel())
        .init();

    log::trace!("executing cli");

    match cli_opts.run() {
        Ok(_) => libc::EXIT_SUCCESS,
        Err(e) => {
            // Use the alternative formatter to get everything on a single line... it reads better.
            eprintln!("error: {:#}", e);
            libc::EXIT_FAILURE
        }
    }
}
