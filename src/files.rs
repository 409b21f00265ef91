/*
 * Copyright (C) 2020 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

//! File helpers shared by the bootloader backends: atomic copy, content
//! comparison (so config writers can skip a no-op write+sync), and small
//! text read/write wrappers. Grounded on the `CommandRunExt`/`cmd_output`
//! idiom in `util.rs`, generalized from `openat`/`std::fs` directly since
//! these helpers operate on absolute, already-resolved paths rather than
//! directory-relative ones.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use fn_error_context::context;

/// Copy `src` to `dest` via a temporary file in `dest`'s directory, then
/// rename into place, so a reader never observes a partially-written file.
#[context("Copying {} to {}", src.display(), dest.display())]
pub(crate) fn copy_file_atomic(src: &Path, dest: &Path, mode: u32) -> Result<()> {
    let dest_dir = dest
        .parent()
        .ok_or_else(|| anyhow::anyhow!("destination has no parent directory"))?;
    mkdir_p(dest_dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".bootctld-tmp-")
        .tempfile_in(dest_dir)
        .context("creating temporary file")?;
    let mut src_f = fs::File::open(src).context("opening source")?;
    std::io::copy(&mut src_f, &mut tmp).context("copying contents")?;
    tmp.flush()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(mode))
            .context("setting permissions")?;
    }
    tmp.persist(dest)
        .map_err(|e| anyhow::anyhow!("persisting temporary file: {e}"))?;
    Ok(())
}

/// `true` iff `a` and `b` both exist and have byte-identical contents.
/// Used to elide redundant config writes (and the `sync(2)` that follows
/// them), mirroring `cbm_files_match`.
pub(crate) fn files_match(a: &Path, b: &Path) -> bool {
    match (fs::read(a), fs::read(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Read `path` as UTF-8 text, returning `None` if it doesn't exist.
pub(crate) fn file_get_text(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

/// Write `text` to `path`, creating parent directories as needed.
#[context("Writing {}", path.display())]
pub(crate) fn file_set_text(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        mkdir_p(parent)?;
    }
    fs::write(path, text).context("writing file")
}

/// Recursively create `path` if it doesn't already exist, tolerating
/// "already exists" races the way `nc_mkdir_p` does.
pub(crate) fn mkdir_p(path: &Path) -> Result<()> {
    match fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e).with_context(|| format!("creating directory {}", path.display())),
    }
}

/// Force pending writes to stable storage, mirroring `cbm_sync`'s blanket
/// `sync(2)` call after a config file is rewritten.
pub(crate) fn sync_filesystems() {
    // SAFETY: sync(2) takes no arguments and cannot fail.
    unsafe { libc::sync() };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_atomically_and_preserves_contents() {
        let td = tempfile::tempdir().unwrap();
        let src = td.path().join("src.txt");
        fs::write(&src, b"hello world").unwrap();
        let dest = td.path().join("nested").join("dest.txt");
        copy_file_atomic(&src, &dest, 0o644).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"hello world");
    }

    #[test]
    fn files_match_detects_equal_and_differing_contents() {
        let td = tempfile::tempdir().unwrap();
        let a = td.path().join("a");
        let b = td.path().join("b");
        fs::write(&a, b"same").unwrap();
        fs::write(&b, b"same").unwrap();
        assert!(files_match(&a, &b));
        fs::write(&b, b"different").unwrap();
        assert!(!files_match(&a, &b));
    }

    #[test]
    fn file_get_text_returns_none_for_missing_file() {
        let td = tempfile::tempdir().unwrap();
        let missing = td.path().join("nope.txt");
        assert_eq!(file_get_text(&missing).unwrap(), None);
    }

    #[test]
    fn file_set_text_creates_parent_directories() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("a").join("b").join("c.txt");
        file_set_text(&path, "contents").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "contents");
    }
}
