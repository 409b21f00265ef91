/*
 * Copyright (C) 2020 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

//! Boot Manager Facade's command-line front end.
//! One unified tool, dispatching straight into [`crate::bootman::BootManager`].

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use log::LevelFilter;

use crate::bootman::{BootManager, ModifyBootloaderFlags};

/// Top-level CLI, parsed once in `main`.
#[derive(Debug, Parser)]
#[clap(name = "bootctld", about = "Boot manager: kernel, initramfs and bootloader orchestration", version)]
pub(crate) struct Cli {
    /// Root to operate against.
    #[clap(short = 'p', long, global = true, default_value = "/")]
    path: Utf8PathBuf,

    /// Treat `path` as a disk image root rather than a live host.
    #[clap(long, global = true)]
    image: bool,

    /// Verbosity level (higher is more verbose).
    #[clap(short = 'v', action = clap::ArgAction::Count, global = true)]
    verbosity: u8,

    #[clap(subcommand)]
    cmd: Verb,
}

#[derive(Debug, Subcommand)]
enum Verb {
    /// Install, update and/or remove the selected bootloader backend.
    UpdateBootloader(UpdateBootloaderOpts),
    /// Stage a discovered kernel onto the boot device and queue it with the backend.
    InstallKernel(KernelOpts),
    /// Unstage a previously installed kernel and unqueue it from the backend.
    RemoveKernel(KernelOpts),
    /// Mark a previously installed kernel as the default to boot.
    SetDefaultKernel(KernelOpts),
    /// List every discovered kernel, most recent first.
    ListKernels,
}

#[derive(Debug, clap::Args)]
struct UpdateBootloaderOpts {
    /// Install the bootloader if it is not already installed.
    #[clap(long)]
    install: bool,
    /// Update an already-installed bootloader.
    #[clap(long)]
    update: bool,
    /// Remove the installed bootloader before any install/update.
    #[clap(long)]
    remove: bool,
    /// Skip the backend's own needs-install/needs-update check and act unconditionally.
    #[clap(long)]
    no_check: bool,
}

#[derive(Debug, clap::Args)]
struct KernelOpts {
    /// Kernel identifier, as printed by `list-kernels` (its `target.legacy_path`).
    bpath: String,
}

impl Cli {
    pub(crate) fn loglevel(&self) -> LevelFilter {
        match self.verbosity {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    pub(crate) fn run(self) -> Result<()> {
        let path = self.path.clone();
        let mut mgr = BootManager::new(&path, self.image)
            .with_context(|| format!("initializing boot manager at {path}"))?;
        set_running_kernel(&mut mgr);

        match self.cmd {
            Verb::UpdateBootloader(opts) => {
                let flags = ModifyBootloaderFlags {
                    install: opts.install,
                    remove: opts.remove,
                    update: opts.update,
                    no_check: opts.no_check,
                };
                mgr.modify_bootloader(flags)
                    .context("updating bootloader")?;
                mgr.sync_freestanding_initrds()
                    .context("syncing freestanding initrds")?;
            }
            Verb::InstallKernel(opts) => {
                let kernel = mgr.find_kernel(&opts.bpath)?;
                mgr.install_kernel(&kernel).context("installing kernel")?;
            }
            Verb::RemoveKernel(opts) => {
                let kernel = mgr.find_kernel(&opts.bpath)?;
                mgr.remove_kernel(&kernel).context("removing kernel")?;
            }
            Verb::SetDefaultKernel(opts) => {
                let kernel = mgr.find_kernel(&opts.bpath)?;
                mgr.set_default_kernel(&kernel)
                    .context("setting default kernel")?;
            }
            Verb::ListKernels => {
                for line in mgr.list_kernels().context("listing kernels")? {
                    println!("{line}");
                }
            }
        }
        Ok(())
    }
}

/// Best-effort: tell the facade which kernel this process is currently
/// running under, so `list-kernels` can annotate it. Unavailable/unparseable
/// `uname` output is not fatal (mirrors `boot_manager_set_uname`'s soft-fail).
fn set_running_kernel(mgr: &mut BootManager) {
    match rustix::system::uname().release().to_str() {
        Ok(release) => {
            mgr.set_uname(release);
        }
        Err(_) => log::debug!("uname release string was not valid UTF-8"),
    }
}
