/*
 * Copyright (C) 2020 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

//! Kernel command-line aggregator: reads the fixed-priority
//! set of `cmdline` fragment files under a prefix and joins them into the
//! single string every backend appends after `root=...`.

use camino::Utf8Path;

use crate::files;

/// Fragment files consulted in order; later files are appended after
/// earlier ones, space-separated. Both are optional.
const CMDLINE_FILES: &[&str] = &["etc/kernel/cmdline", "usr/lib/kernel/cmdline"];

/// Read and join every fragment file found under `prefix`. Missing files
/// are skipped silently; an empty result is a legitimate cmdline (some
/// systems add nothing beyond `root=`).
pub(crate) fn parse_cmdline_files(prefix: &Utf8Path) -> String {
    let mut parts = Vec::new();
    for rel in CMDLINE_FILES {
        let path = prefix.join(rel);
        if let Ok(Some(text)) = files::file_get_text(path.as_std_path()) {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                parts.push(trimmed.to_string());
            }
        }
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_fragments_in_priority_order() {
        let td = tempfile::tempdir().unwrap();
        let prefix = Utf8Path::from_path(td.path()).unwrap();
        std::fs::create_dir_all(prefix.join("etc/kernel")).unwrap();
        std::fs::create_dir_all(prefix.join("usr/lib/kernel")).unwrap();
        std::fs::write(prefix.join("etc/kernel/cmdline"), "quiet splash\n").unwrap();
        std::fs::write(prefix.join("usr/lib/kernel/cmdline"), "console=ttyS0\n").unwrap();
        assert_eq!(parse_cmdline_files(prefix), "quiet splash console=ttyS0");
    }

    #[test]
    fn missing_files_yield_empty_cmdline() {
        let td = tempfile::tempdir().unwrap();
        let prefix = Utf8Path::from_path(td.path()).unwrap();
        assert_eq!(parse_cmdline_files(prefix), "");
    }
}
