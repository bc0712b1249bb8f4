//! The checksum writer: a stable fingerprint of a would-be appliance.
//!
//! Lets callers decide whether a rebuild would produce a different
//! appliance without actually rebuilding it. One fingerprint line per
//! entry; the lines are sorted (emission order depends on readdir order,
//! which is not stable across hosts) and hashed with SHA-256.

use std::fs::Metadata;
use std::io::Write as _;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::unistd::Uid;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::writer::Writer;

/// Collects fingerprint lines and emits a single SHA-256 hex digest.
pub struct ChecksumWriter {
    lines: Vec<String>,
    out: Box<dyn std::io::Write>,
    finished: bool,
}

impl std::fmt::Debug for ChecksumWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChecksumWriter")
            .field("lines", &self.lines.len())
            .finish()
    }
}

impl ChecksumWriter {
    /// Creates a writer whose digest covers the package version, host
    /// CPU, module path and effective uid; any of those changing must
    /// change the appliance.
    pub fn new(hostcpu: &str, modpath: &Path, out: Box<dyn std::io::Write>) -> Self {
        let header = format!(
            "husk {} {} {} {}",
            env!("CARGO_PKG_VERSION"),
            hostcpu,
            modpath.display(),
            Uid::effective(),
        );
        Self {
            lines: vec![header],
            out,
            finished: false,
        }
    }
}

/// One fingerprint line.
///
/// Regular files carry times and size. Directories, specials and symlinks
/// do not: publicly writable directories such as `/tmp` have unstable
/// times, and only ownership and mode matter for them.
fn fingerprint(path: &Path, meta: &Metadata) -> String {
    if meta.file_type().is_file() {
        format!(
            "{} {} {} {} {} {} {:o}",
            path.display(),
            meta.ctime(),
            meta.mtime(),
            meta.uid(),
            meta.gid(),
            meta.len(),
            meta.mode(),
        )
    } else {
        format!(
            "{} {} {} {:o}",
            path.display(),
            meta.uid(),
            meta.gid(),
            meta.mode(),
        )
    }
}

impl Writer for ChecksumWriter {
    fn add_entry(&mut self, path: &Path, meta: &Metadata) -> Result<()> {
        if self.finished {
            return Err(Error::WriterClosed);
        }
        self.lines.push(fingerprint(path, meta));
        Ok(())
    }

    /// A skeleton archive contributes the fingerprint of the archive file
    /// itself.
    fn add_archive(&mut self, path: &Path) -> Result<()> {
        self.add_path(path)
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Err(Error::WriterClosed);
        }
        self.finished = true;

        self.lines.sort_unstable();
        let mut hasher = Sha256::new();
        for line in &self.lines {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }

        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }

        writeln!(self.out, "{hex}")
            .map_err(Error::io("write", PathBuf::from("checksum output")))?;
        self.out
            .flush()
            .map_err(Error::io("flush", PathBuf::from("checksum output")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::{Arc, Mutex};

    /// A Write sink the test can inspect after the writer is dropped.
    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn digest_of(paths: &[&Path]) -> String {
        let sink = Sink::default();
        let mut w = ChecksumWriter::new("x86_64", Path::new("/lib/modules/test"), {
            Box::new(sink.clone())
        });
        for p in paths {
            w.add_path(p).unwrap();
        }
        w.finish().unwrap();
        String::from_utf8(sink.0.lock().unwrap().clone()).unwrap()
    }

    #[test]
    fn digest_is_stable_and_orderless() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"alpha").unwrap();
        fs::write(&b, b"beta").unwrap();

        let d1 = digest_of(&[&a, &b]);
        let d2 = digest_of(&[&b, &a]);
        assert_eq!(d1, d2);
        assert_eq!(d1.trim_end().len(), 64);
        assert!(d1.trim_end().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn atime_does_not_change_regular_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("f");
        fs::write(&f, b"data").unwrap();

        let before = fingerprint(&f, &fs::symlink_metadata(&f).unwrap());
        // Reading the file updates atime (where the filesystem tracks it)
        // but must not perturb the fingerprint.
        let _ = fs::read(&f).unwrap();
        let after = fingerprint(&f, &fs::symlink_metadata(&f).unwrap());
        assert_eq!(before, after);
    }

    #[test]
    fn mtime_changes_regular_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("f");
        fs::write(&f, b"data").unwrap();
        let meta = fs::symlink_metadata(&f).unwrap();
        let line = fingerprint(&f, &meta);
        assert!(line.contains(&meta.mtime().to_string()));
        assert!(line.ends_with(&format!("{:o}", meta.mode())));
    }

    #[test]
    fn directories_omit_times_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let meta = fs::symlink_metadata(dir.path()).unwrap();
        let line = fingerprint(dir.path(), &meta);
        // path + uid + gid + mode only
        assert_eq!(line.split_whitespace().count(), 4);
    }
}
