//! The sink abstraction all output formats implement.
//!
//! The input scanner drives exactly one writer per build, sequentially,
//! and closes it with [`Writer::finish`]. Writers own their output file
//! descriptors for that whole span.

use std::fs::{self, Metadata};
use std::path::Path;

use crate::error::{Error, Result};

/// A sink for appliance filesystem entries.
///
/// Paths handed to a writer are absolute, carry no trailing slash, and
/// name the appliance-internal location (which for host files is the same
/// as the host location).
pub trait Writer {
    /// `lstat`s `path` and emits it.
    fn add_path(&mut self, path: &Path) -> Result<()> {
        let meta = fs::symlink_metadata(path).map_err(Error::io("lstat", path))?;
        self.add_entry(path, &meta)
    }

    /// Emits one filesystem entry using the provided metadata.
    fn add_entry(&mut self, path: &Path, meta: &Metadata) -> Result<()>;

    /// Consumes a newc cpio archive and grafts its contents in.
    fn add_archive(&mut self, path: &Path) -> Result<()>;

    /// Flushes, closes and finalises the output artifact(s).
    fn finish(&mut self) -> Result<()>;
}
