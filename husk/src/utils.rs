//! Filesystem and string helpers shared across the builder.

use std::collections::HashMap;
use std::ffi::{CString, OsStr, OsString};
use std::fs;
use std::io::{BufRead, BufReader};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Directory listings memoised by path.
///
/// Hostfile wildcard expansion hits the same parent directories over and
/// over; reading each directory once is a significant win. Entries are
/// shared read-only; the host filesystem is assumed stable for the
/// duration of a build, so the cache is never invalidated.
#[derive(Debug, Default)]
pub struct DirCache {
    dirs: HashMap<PathBuf, Arc<Vec<OsString>>>,
}

impl DirCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry names of `dir`, reading it at most once.
    ///
    /// A directory that cannot be opened yields an empty list; a read
    /// error part-way through is a real failure.
    pub fn entries(&mut self, dir: &Path) -> Result<Arc<Vec<OsString>>> {
        if let Some(names) = self.dirs.get(dir) {
            return Ok(Arc::clone(names));
        }

        let mut names = Vec::new();
        if let Ok(iter) = fs::read_dir(dir) {
            for entry in iter {
                let entry = entry.map_err(Error::io("readdir", dir))?;
                names.push(entry.file_name());
            }
        }

        let names = Arc::new(names);
        self.dirs.insert(dir.to_owned(), Arc::clone(&names));
        Ok(names)
    }
}

/// Shell-style wildcard match via `fnmatch(3)`.
///
/// Returns `Ok(true)` on match, `Ok(false)` on `FNM_NOMATCH`, and an error
/// for any other return value: the libc contract allows nothing else, so
/// anything else is an internal error worth surfacing loudly.
pub fn fnmatch(pattern: &str, name: &OsStr, flags: i32) -> Result<bool> {
    let c_pattern = CString::new(pattern.as_bytes()).map_err(|_| Error::PatternMatch {
        pattern: pattern.to_owned(),
        code: -1,
    })?;
    let c_name = CString::new(name.as_bytes()).map_err(|_| Error::PatternMatch {
        pattern: pattern.to_owned(),
        code: -1,
    })?;

    // SAFETY: both arguments are valid NUL-terminated strings.
    #[allow(unsafe_code)]
    let r = unsafe { libc::fnmatch(c_pattern.as_ptr(), c_name.as_ptr(), flags) };
    match r {
        0 => Ok(true),
        libc::FNM_NOMATCH => Ok(false),
        code => Err(Error::PatternMatch {
            pattern: pattern.to_owned(),
            code,
        }),
    }
}

/// Keeps the names matching `pattern`.
pub fn filter_fnmatch(names: &[OsString], pattern: &str, flags: i32) -> Result<Vec<OsString>> {
    let mut out = Vec::new();
    for name in names {
        if fnmatch(pattern, name, flags)? {
            out.push(name.clone());
        }
    }
    Ok(out)
}

/// Keeps the names that do NOT contain `needle`.
pub fn filter_not_substring(names: &[OsString], needle: &str) -> Vec<OsString> {
    names
        .iter()
        .filter(|n| !n.to_string_lossy().contains(needle))
        .cloned()
        .collect()
}

/// Keeps the names for which `keep` returns true.
pub fn filter<F: FnMut(&OsStr) -> bool>(names: &[OsString], mut keep: F) -> Vec<OsString> {
    names.iter().filter(|n| keep(n)).cloned().collect()
}

/// Reads a file into a vector of lines, trailing newlines stripped.
pub fn load_file(path: &Path) -> Result<Vec<String>> {
    let file = fs::File::open(path).map_err(Error::io("open", path))?;
    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        lines.push(line.map_err(Error::io("read", path))?);
    }
    Ok(lines)
}

/// `true` iff `path` exists and is a directory (follows symlinks).
pub fn isdir(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}

/// `true` iff `path` exists and is a regular file (follows symlinks).
pub fn isfile(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

/// Walks `root` depth-first in pre-order, children ASCII-sorted, calling
/// `visit` for every entry including `root` itself.
///
/// The walk is physical: symlinks are reported, never followed (except
/// that `root` itself is resolved so a symlinked module path works).
pub fn walk_preorder<F>(root: &Path, visit: &mut F) -> Result<()>
where
    F: FnMut(&Path, &fs::Metadata) -> Result<()>,
{
    let meta = fs::metadata(root).map_err(Error::io("stat", root))?;
    visit(root, &meta)?;
    if meta.is_dir() {
        walk_children(root, visit)?;
    }
    Ok(())
}

fn walk_children<F>(dir: &Path, visit: &mut F) -> Result<()>
where
    F: FnMut(&Path, &fs::Metadata) -> Result<()>,
{
    let mut names: Vec<OsString> = Vec::new();
    for entry in fs::read_dir(dir).map_err(Error::io("opendir", dir))? {
        let entry = entry.map_err(Error::io("readdir", dir))?;
        names.push(entry.file_name());
    }
    names.sort_unstable_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

    for name in names {
        let path = dir.join(&name);
        let meta = fs::symlink_metadata(&path).map_err(Error::io("lstat", &path))?;
        let is_dir = meta.is_dir();
        visit(&path, &meta)?;
        if is_dir {
            walk_children(&path, visit)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::ffi::OsStringExt;

    #[test]
    fn fnmatch_wildcards() {
        assert!(fnmatch("vmlinuz-*", OsStr::new("vmlinuz-5.14.0"), 0).unwrap());
        assert!(fnmatch("ld-*.so", OsStr::new("ld-2.17.so"), libc::FNM_NOESCAPE).unwrap());
        assert!(!fnmatch("*.ko", OsStr::new("modules.dep"), 0).unwrap());
        // FNM_NOESCAPE: a backslash in the pattern is a literal character.
        assert!(fnmatch("a\\*", OsStr::new("a\\b"), libc::FNM_NOESCAPE).unwrap());
        assert!(!fnmatch("a\\*", OsStr::new("ab"), libc::FNM_NOESCAPE).unwrap());
    }

    #[test]
    fn filters() {
        let names: Vec<OsString> = ["vmlinuz-5.14.0.x86_64", "vmlinuz-5.14.0.x86_64.xen", "config"]
            .iter()
            .map(OsString::from)
            .collect();

        let matched = filter_fnmatch(&names, "vmlinuz-*", libc::FNM_NOESCAPE).unwrap();
        assert_eq!(matched.len(), 2);

        let no_xen = filter_not_substring(&matched, "xen");
        assert_eq!(no_xen, vec![OsString::from("vmlinuz-5.14.0.x86_64")]);

        let all = filter(&names, |n| !n.is_empty());
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn dir_cache_reads_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"").unwrap();

        let mut cache = DirCache::new();
        let first = cache.entries(dir.path()).unwrap();
        assert_eq!(first.len(), 1);

        // A file created after the first read must not show up: the
        // listing is memoised.
        fs::write(dir.path().join("b"), b"").unwrap();
        let second = cache.entries(dir.path()).unwrap();
        assert_eq!(second.len(), 1);

        // Unreadable directories yield an empty list, not an error.
        let missing = cache.entries(Path::new("/nonexistent-husk-test")).unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn load_file_strips_newlines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lines");
        fs::write(&path, "one\ntwo\n\nthree\n").unwrap();
        let lines = load_file(&path).unwrap();
        assert_eq!(lines, vec!["one", "two", "", "three"]);
    }

    #[test]
    fn walk_is_sorted_preorder() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("b/z"), b"").unwrap();
        fs::write(dir.path().join("b/a"), b"").unwrap();
        fs::write(dir.path().join("c"), b"").unwrap();
        fs::write(dir.path().join("a"), b"").unwrap();

        let mut seen = Vec::new();
        walk_preorder(dir.path(), &mut |path, _| {
            seen.push(path.strip_prefix(dir.path()).unwrap().to_owned());
            Ok(())
        })
        .unwrap();

        let expected: Vec<PathBuf> = ["", "a", "b", "b/a", "b/z", "c"]
            .iter()
            .map(PathBuf::from)
            .collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn walk_handles_non_utf8_names() {
        let dir = tempfile::tempdir().unwrap();
        let weird = OsString::from_vec(vec![b'f', 0xff, b'o']);
        fs::write(dir.path().join(&weird), b"").unwrap();

        let mut count = 0;
        walk_preorder(dir.path(), &mut |_, _| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 2);
    }
}
