//! Injectable system-call stub layer.
//!
//! The Host Inspector and Boot Mount Broker never call `mount(2)`,
//! `umount(2)`, or probe `/sys` directly — they go through this trait, the
//! Rust equivalent of the C `system_stub` indirection, so that neither ever
//! touches production system calls directly. Tests substitute
//! [`FakeSystemStub`] to drive every branch of the inspector and broker
//! without touching the host.

use std::cell::RefCell;
use std::collections::HashMap;
use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

pub(crate) trait SystemStub {
    fn is_mounted(&self, path: &Utf8Path) -> Result<bool>;
    fn mount(&self, device: &Utf8Path, target: &Utf8Path, fstype: &str) -> Result<()>;
    fn umount(&self, target: &Utf8Path) -> Result<()>;
    fn run(&self, cmd: &mut Command) -> Result<()>;
    fn sysfs_path(&self) -> Utf8PathBuf;
    fn mountpoint_for_device(&self, device: &Utf8Path) -> Result<Option<Utf8PathBuf>>;
}

/// Production implementation, backed by `/proc/self/mountinfo`, `mount(2)`
/// via the `mount` binary (matching `bootupd`'s convention of shelling out
/// rather than calling `libmount` directly), and real `/sys`.
#[derive(Default)]
pub(crate) struct RealSystemStub;

impl SystemStub for RealSystemStub {
    fn is_mounted(&self, path: &Utf8Path) -> Result<bool> {
        let mounts = std::fs::read_to_string("/proc/self/mountinfo")
            .context("reading /proc/self/mountinfo")?;
        Ok(mounts
            .lines()
            .filter_map(|l| l.split_whitespace().nth(4))
            .any(|mp| mp == path.as_str()))
    }

    fn mount(&self, device: &Utf8Path, target: &Utf8Path, fstype: &str) -> Result<()> {
        let mut cmd = Command::new("mount");
        cmd.args(["-t", fstype]).arg(device).arg(target);
        self.run(&mut cmd)
            .with_context(|| format!("mounting {device} at {target}"))
    }

    fn umount(&self, target: &Utf8Path) -> Result<()> {
        let mut cmd = Command::new("umount");
        cmd.arg(target);
        self.run(&mut cmd)
    }

    fn run(&self, cmd: &mut Command) -> Result<()> {
        let status = cmd
            .status()
            .with_context(|| format!("running {:?}", cmd))?;
        if !status.success() {
            anyhow::bail!("command {:?} exited: {}", cmd, status);
        }
        Ok(())
    }

    fn sysfs_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from("/sys")
    }

    fn mountpoint_for_device(&self, device: &Utf8Path) -> Result<Option<Utf8PathBuf>> {
        let mounts = std::fs::read_to_string("/proc/self/mountinfo")
            .context("reading /proc/self/mountinfo")?;
        for line in mounts.lines() {
            let mut fields = line.split_whitespace();
            let mountpoint = fields.nth(4);
            // mountinfo lines have a "- fstype source options" tail after a
            // lone "-" separator; the source is the device path we match on.
            if let Some(dash_pos) = line.find(" - ") {
                let tail = &line[dash_pos + 3..];
                let mut tail_fields = tail.split_whitespace();
                let _fstype = tail_fields.next();
                let source = tail_fields.next();
                if source == Some(device.as_str()) {
                    if let Some(mp) = mountpoint {
                        return Ok(Some(Utf8PathBuf::from(mp)));
                    }
                }
            }
        }
        Ok(None)
    }
}

/// In-memory fake used by tests.
#[derive(Default)]
pub(crate) struct FakeSystemStub {
    pub(crate) mounted_paths: RefCell<HashMap<Utf8PathBuf, Utf8PathBuf>>,
    pub(crate) device_mountpoints: RefCell<HashMap<Utf8PathBuf, Utf8PathBuf>>,
    pub(crate) sysfs_root: RefCell<Utf8PathBuf>,
    pub(crate) mount_calls: RefCell<Vec<(Utf8PathBuf, Utf8PathBuf)>>,
    pub(crate) umount_calls: RefCell<Vec<Utf8PathBuf>>,
}

impl FakeSystemStub {
    pub(crate) fn new(sysfs_root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            sysfs_root: RefCell::new(sysfs_root.into()),
            ..Default::default()
        }
    }
}

impl SystemStub for FakeSystemStub {
    fn is_mounted(&self, path: &Utf8Path) -> Result<bool> {
        Ok(self.mounted_paths.borrow().contains_key(path))
    }

    fn mount(&self, device: &Utf8Path, target: &Utf8Path, _fstype: &str) -> Result<()> {
        self.mounted_paths
            .borrow_mut()
            .insert(target.to_owned(), device.to_owned());
        self.mount_calls
            .borrow_mut()
            .push((device.to_owned(), target.to_owned()));
        Ok(())
    }

    fn umount(&self, target: &Utf8Path) -> Result<()> {
        self.mounted_paths.borrow_mut().remove(target);
        self.umount_calls.borrow_mut().push(target.to_owned());
        Ok(())
    }

    fn run(&self, _cmd: &mut Command) -> Result<()> {
        Ok(())
    }

    fn sysfs_path(&self) -> Utf8PathBuf {
        self.sysfs_root.borrow().clone()
    }

    fn mountpoint_for_device(&self, device: &Utf8Path) -> Result<Option<Utf8PathBuf>> {
        Ok(self.device_mountpoints.borrow().get(device).cloned())
    }
}
