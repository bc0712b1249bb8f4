//! The input scanner: turns a heterogeneous input list into a
//! deterministic stream of writer calls.
//!
//! Inputs are classified by content, not by name: a regular file opening
//! with the newc magic is a skeleton archive, any other regular file is a
//! hostfiles list, and a directory is enumerated (ASCII-sorted, hidden
//! and editor-backup names skipped) and its children classified the same
//! way. After all inputs, the kernel-module tree is appended, filtered
//! against an optional whitelist.
//!
//! The emission order is the stability guarantee the checksum writer
//! depends on: reordering anything here changes every digest.

use std::ffi::OsStr;
use std::fs;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tracing::debug;

use crate::cpio::MAGIC;
use crate::error::{Error, Result};
use crate::utils::{DirCache, filter_fnmatch, fnmatch, load_file, walk_preorder};
use crate::writer::Writer;

/// Where kernel modules live inside the appliance.
const APPLIANCE_MODULES_DIR: &str = "/lib/modules";

/// Assembles the appliance: scans `inputs`, appends the kernel modules
/// from `modpath`, and finalises the writer.
pub fn build_appliance(
    inputs: &[std::path::PathBuf],
    whitelist: Option<&Path>,
    modpath: &Path,
    writer: &mut dyn Writer,
) -> Result<()> {
    let mut cache = DirCache::new();
    for input in inputs {
        visit_input(input, writer, &mut cache)?;
    }

    // The module walk emits paths under /lib/modules/<version>; the
    // parent directory entry has to exist first.
    writer.add_path(Path::new(APPLIANCE_MODULES_DIR))?;
    add_kernel_modules(whitelist, modpath, writer)?;

    writer.finish()
}

/// Classifies and processes one input.
fn visit_input(path: &Path, writer: &mut dyn Writer, cache: &mut DirCache) -> Result<()> {
    debug!(input = %path.display(), "visiting");
    let meta = fs::metadata(path).map_err(Error::io("stat", path))?;

    if meta.is_dir() {
        let mut names: Vec<_> = fs::read_dir(path)
            .map_err(Error::io("opendir", path))?
            .map(|entry| entry.map(|e| e.file_name()))
            .collect::<std::io::Result<_>>()
            .map_err(Error::io("readdir", path))?;
        names.sort_unstable_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

        for name in names {
            let bytes = name.as_bytes();
            // Hidden files and editor backups are not inputs.
            if bytes.first() == Some(&b'.') || bytes.last() == Some(&b'~') {
                continue;
            }
            visit_input(&path.join(name), writer, cache)?;
        }
        Ok(())
    } else if meta.is_file() {
        if starts_with_cpio_magic(path)? {
            debug!(input = %path.display(), "skeleton archive");
            writer.add_archive(path)
        } else {
            write_hostfiles(path, writer, cache)
        }
    } else {
        Err(Error::BadInput {
            path: path.to_owned(),
        })
    }
}

/// `true` if the file begins with the newc magic. A file shorter than
/// the magic cannot be an archive.
fn starts_with_cpio_magic(path: &Path) -> Result<bool> {
    let mut file = fs::File::open(path).map_err(Error::io("open", path))?;
    let mut head = [0u8; 6];
    let mut got = 0;
    while got < head.len() {
        let n = file
            .read(&mut head[got..])
            .map_err(Error::io("read", path))?;
        if n == 0 {
            return Ok(false);
        }
        got += n;
    }
    Ok(&head == MAGIC)
}

/// Resolves a hostfiles list: one directive per line, expanded against
/// the host filesystem. Missing literals and empty wildcard expansions
/// are silently dropped: the list is a best-effort superset.
fn write_hostfiles(list: &Path, writer: &mut dyn Writer, cache: &mut DirCache) -> Result<()> {
    debug!(list = %list.display(), "hostfiles list");

    for line in load_file(list)? {
        // Lists are often produced relative to a build root, so a
        // leading "." is noise.
        let directive = line.strip_prefix('.').unwrap_or(&line);

        if directive.contains('*') || directive.contains('?') {
            let (dirname, pattern) = match directive.rsplit_once('/') {
                Some(split) => split,
                None => {
                    debug!(directive, "wildcard without a directory part, ignored");
                    continue;
                }
            };
            let dir = if dirname.is_empty() {
                Path::new("/")
            } else {
                Path::new(dirname)
            };

            let names = cache.entries(dir)?;
            for name in filter_fnmatch(&names, pattern, libc::FNM_NOESCAPE)? {
                let path = dir.join(&name);
                debug!(path = %path.display(), pattern, "including host file");
                writer.add_path(&path)?;
            }
        } else if let Ok(meta) = fs::symlink_metadata(directive) {
            debug!(path = directive, "including host file");
            writer.add_entry(Path::new(directive), &meta)?;
        }
    }
    Ok(())
}

/// `true` for `.ko` and `.ko.<compression>` basenames.
fn is_module_name(name: &OsStr) -> bool {
    let bytes = name.as_bytes();
    bytes.ends_with(b".ko") || bytes.windows(4).any(|w| w == b".ko.")
}

/// Emits everything under `modpath` in sorted pre-order. `.ko` files are
/// filtered against the whitelist when one is configured; directories and
/// support files (`modules.dep`, firmware maps, ...) always go in.
fn add_kernel_modules(
    whitelist: Option<&Path>,
    modpath: &Path,
    writer: &mut dyn Writer,
) -> Result<()> {
    let patterns = whitelist.map(load_file).transpose()?;

    walk_preorder(modpath, &mut |path, meta| {
        let name = path.file_name().unwrap_or(path.as_os_str());

        if !meta.is_dir() && is_module_name(name) {
            if let Some(patterns) = &patterns {
                for pattern in patterns {
                    if fnmatch(pattern, name, libc::FNM_NOESCAPE)? {
                        debug!(
                            module = %name.to_string_lossy(),
                            pattern,
                            "including kernel module"
                        );
                        return writer.add_entry(path, meta);
                    }
                }
                return Ok(()); // module not on the whitelist
            }
            debug!(module = %name.to_string_lossy(), "including kernel module");
        }
        writer.add_entry(path, meta)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::Metadata;
    use std::path::PathBuf;

    /// A writer that records the calls it receives.
    #[derive(Debug, Default)]
    struct Recording {
        events: Vec<String>,
    }

    impl Writer for Recording {
        fn add_entry(&mut self, path: &Path, _meta: &Metadata) -> Result<()> {
            self.events.push(format!("entry {}", path.display()));
            Ok(())
        }

        fn add_archive(&mut self, path: &Path) -> Result<()> {
            self.events.push(format!("archive {}", path.display()));
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.events.push("finish".to_owned());
            Ok(())
        }
    }

    fn rel(events: &[String], root: &Path) -> Vec<String> {
        events
            .iter()
            .map(|e| e.replace(&root.display().to_string(), ""))
            .collect()
    }

    #[test]
    fn classifies_by_magic_not_name() {
        let dir = tempfile::tempdir().unwrap();
        let skeleton = dir.path().join("base.img");
        fs::write(&skeleton, b"070701then-anything").unwrap();
        let hostfiles = dir.path().join("hostfiles.cpio"); // misleading name
        fs::write(&hostfiles, b"/no/such/path\n").unwrap();
        let tiny = dir.path().join("tiny");
        fs::write(&tiny, b"0707").unwrap(); // shorter than the magic

        let mut w = Recording::default();
        let mut cache = DirCache::new();
        visit_input(&skeleton, &mut w, &mut cache).unwrap();
        visit_input(&hostfiles, &mut w, &mut cache).unwrap();
        visit_input(&tiny, &mut w, &mut cache).unwrap();

        assert_eq!(w.events, vec![format!("archive {}", skeleton.display())]);
    }

    #[test]
    fn directory_inputs_recurse_sorted_and_skip_noise() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = dir.path().join("d");
        fs::create_dir(&inputs).unwrap();
        fs::write(inputs.join("b.cpio"), b"070701").unwrap();
        fs::write(inputs.join("a.cpio"), b"070701").unwrap();
        fs::write(inputs.join(".hidden"), b"070701").unwrap();
        fs::write(inputs.join("backup~"), b"070701").unwrap();

        let mut w = Recording::default();
        visit_input(&inputs, &mut w, &mut DirCache::new()).unwrap();

        assert_eq!(
            rel(&w.events, &inputs),
            vec!["archive /a.cpio", "archive /b.cpio"]
        );
    }

    #[test]
    fn non_file_input_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("fifo");
        nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::from_bits_truncate(0o644)).unwrap();

        let mut w = Recording::default();
        let err = visit_input(&fifo, &mut w, &mut DirCache::new()).unwrap_err();
        assert!(matches!(err, Error::BadInput { .. }));
    }

    #[test]
    fn hostfile_wildcards_expand_and_literals_may_vanish() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("usr/lib");
        fs::create_dir_all(&lib).unwrap();
        fs::write(lib.join("ld-2.17.so"), b"x").unwrap();
        fs::write(lib.join("ld-linux-x86-64.so.2"), b"x").unwrap();
        fs::write(lib.join("libc.so.6"), b"x").unwrap();

        let list = dir.path().join("hostfiles");
        let content = format!(
            ".{lib}/ld-*.so*\n\
             {lib}/libc.so.6\n\
             {lib}/does-not-exist\n\
             {lib}/no-match-?.so\n",
            lib = lib.display()
        );
        fs::write(&list, content).unwrap();

        let mut w = Recording::default();
        write_hostfiles(&list, &mut w, &mut DirCache::new()).unwrap();

        let events = rel(&w.events, dir.path());
        // Both wildcard matches (in directory order), then the literal;
        // missing literals and empty wildcards contribute nothing.
        assert_eq!(events.len(), 3);
        assert!(events.contains(&"entry /usr/lib/ld-2.17.so".to_owned()));
        assert!(events.contains(&"entry /usr/lib/ld-linux-x86-64.so.2".to_owned()));
        assert_eq!(events[2], "entry /usr/lib/libc.so.6");
    }

    #[test]
    fn module_walk_respects_whitelist() {
        let dir = tempfile::tempdir().unwrap();
        let modpath = dir.path().join("5.14.0");
        fs::create_dir_all(modpath.join("kernel")).unwrap();
        fs::write(modpath.join("kernel/virtio_blk.ko"), b"m").unwrap();
        fs::write(modpath.join("kernel/floppy.ko"), b"m").unwrap();
        fs::write(modpath.join("kernel/ext4.ko.xz"), b"m").unwrap();
        fs::write(modpath.join("modules.dep"), b"").unwrap();

        let whitelist = dir.path().join("whitelist");
        fs::write(&whitelist, "virtio*\next4*\n").unwrap();

        let mut w = Recording::default();
        add_kernel_modules(Some(&whitelist), &modpath, &mut w).unwrap();

        let events = rel(&w.events, dir.path());
        assert_eq!(
            events,
            vec![
                "entry /5.14.0",
                "entry /5.14.0/kernel",
                "entry /5.14.0/kernel/ext4.ko.xz",
                "entry /5.14.0/kernel/virtio_blk.ko",
                "entry /5.14.0/modules.dep",
            ]
        );
    }

    #[test]
    fn module_walk_without_whitelist_takes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let modpath = dir.path().join("m");
        fs::create_dir(&modpath).unwrap();
        fs::write(modpath.join("floppy.ko"), b"m").unwrap();

        let mut w = Recording::default();
        add_kernel_modules(None, &modpath, &mut w).unwrap();
        assert_eq!(w.events.len(), 2);
    }

    #[test]
    fn module_names() {
        assert!(is_module_name(OsStr::new("virtio.ko")));
        assert!(is_module_name(OsStr::new("ext4.ko.xz")));
        assert!(is_module_name(OsStr::new("ext4.ko.gz")));
        assert!(!is_module_name(OsStr::new("modules.dep")));
        assert!(!is_module_name(OsStr::new("vmlinuz")));
    }
}
