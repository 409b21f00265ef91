/*
 * Copyright (C) 2020 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

//! Kernel discovery: enumerates per-kernel directories under the kernel root.
//!
//! Kernels live one-per-directory under `usr/lib/kernel`, named
//! `<ktype>-<version>-<release>` (e.g. `org.bootctld.native-5.10.0-100`),
//! each holding a `vmlinuz` blob and an optional `initrd`/`cmdline`
//! fragment. This is deliberately a simplified scheme (per
//! `blsforme`'s directory-per-version discovery,
//! `examples/other_examples/..__blsforme-src-kernel.rs.rs`) rather than a
//! reproduction of any one distribution's real kernel-install layout.

use anyhow::Result;
use camino::Utf8Path;

use crate::files;
use crate::model::{Kernel, KernelMeta, KernelSource, KernelTarget};

/// Walk `kernel_dir` and return every kernel it contains. `global_cmdline`
/// is appended after any kernel-specific `cmdline` fragment.
pub(crate) fn discover_kernels(kernel_dir: &Utf8Path, global_cmdline: &str) -> Result<Vec<Kernel>> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(kernel_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let Some(kernel) = parse_kernel_dir(kernel_dir, &name, global_cmdline)? else {
            log::debug!("skipping {name}: not a recognized kernel directory");
            continue;
        };
        out.push(kernel);
    }
    Ok(out)
}

fn parse_kernel_dir(
    kernel_dir: &Utf8Path,
    name: &str,
    global_cmdline: &str,
) -> Result<Option<Kernel>> {
    let mut parts = name.rsplitn(3, '-');
    let (Some(release_str), Some(version), Some(ktype)) = (parts.next(), parts.next(), parts.next())
    else {
        return Ok(None);
    };
    let Ok(release) = release_str.parse::<u64>() else {
        return Ok(None);
    };

    let this_dir = kernel_dir.join(name);
    let vmlinuz = this_dir.join("vmlinuz");
    if !vmlinuz.as_std_path().is_file() {
        return Ok(None);
    }

    let has_initrd = this_dir.join("initrd").as_std_path().is_file();
    let extra_cmdline = files::file_get_text(this_dir.join("cmdline").as_std_path())?
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let cmdline = match extra_cmdline {
        Some(extra) if !global_cmdline.is_empty() => format!("{extra} {global_cmdline}"),
        Some(extra) => extra,
        None => global_cmdline.to_string(),
    };

    Ok(Some(Kernel {
        meta: KernelMeta {
            ktype: ktype.to_string(),
            version: version.to_string(),
            release,
            bpath: name.to_string(),
            cmdline,
        },
        source: KernelSource {
            path: vmlinuz.into_std_path_buf(),
        },
        target: KernelTarget {
            legacy_path: name.to_string(),
            initrd_path: has_initrd.then(|| format!("{name}.initrd")),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn write_kernel(kernel_dir: &Utf8Path, dirname: &str, with_initrd: bool) {
        let dir = kernel_dir.join(dirname);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("vmlinuz"), b"fake-kernel").unwrap();
        if with_initrd {
            std::fs::write(dir.join("initrd"), b"fake-initrd").unwrap();
        }
    }

    #[test]
    fn discovers_kernels_and_parses_identity_fields() {
        let td = tempfile::tempdir().unwrap();
        let kernel_dir = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
        write_kernel(&kernel_dir, "org.bootctld.native-5.10.0-100", true);
        write_kernel(&kernel_dir, "org.bootctld.native-5.9.0-90", false);

        let mut kernels = discover_kernels(&kernel_dir, "console=ttyS0").unwrap();
        kernels.sort_by(|a, b| a.meta.release.cmp(&b.meta.release));

        assert_eq!(kernels.len(), 2);
        assert_eq!(kernels[0].meta.ktype, "org.bootctld.native");
        assert_eq!(kernels[0].meta.version, "5.9.0");
        assert_eq!(kernels[0].meta.release, 90);
        assert_eq!(kernels[0].target.initrd_path, None);
        assert_eq!(kernels[1].meta.release, 100);
        assert_eq!(
            kernels[1].target.initrd_path.as_deref(),
            Some("org.bootctld.native-5.10.0-100.initrd")
        );
        assert!(kernels[1].meta.cmdline.contains("console=ttyS0"));
    }

    #[test]
    fn per_kernel_cmdline_fragment_precedes_global_cmdline() {
        let td = tempfile::tempdir().unwrap();
        let kernel_dir = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
        write_kernel(&kernel_dir, "org.bootctld.native-5.10.0-100", false);
        std::fs::write(
            kernel_dir.join("org.bootctld.native-5.10.0-100/cmdline"),
            "nomodeset\n",
        )
        .unwrap();

        let kernels = discover_kernels(&kernel_dir, "quiet").unwrap();
        assert_eq!(kernels[0].meta.cmdline, "nomodeset quiet");
    }

    #[test]
    fn missing_kernel_directory_yields_empty_list() {
        let kernel_dir = Utf8PathBuf::from("/does/not/exist/kernel/dir");
        assert_eq!(discover_kernels(&kernel_dir, "").unwrap().len(), 0);
    }

    #[test]
    fn directories_without_a_vmlinuz_blob_are_skipped() {
        let td = tempfile::tempdir().unwrap();
        let kernel_dir = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(kernel_dir.join("org.bootctld.native-5.10.0-100")).unwrap();
        assert_eq!(discover_kernels(&kernel_dir, "").unwrap().len(), 0);
    }
}
