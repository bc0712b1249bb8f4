//! Error types for ext2 image operations.

use crate::sys;

/// Errors returned by ext2 image operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A libext2fs function returned a non-zero error code.
    #[error("{op}: libext2fs error {code:#x}")]
    Ext2fs {
        /// Name of the libext2fs operation that failed.
        op: &'static str,
        /// The raw `errcode_t` value.
        code: i64,
    },

    /// A path or name contained an interior NUL byte.
    #[error("interior NUL byte in path: {0}")]
    InvalidPath(String),

    /// `ext2fs_file_write` wrote fewer bytes than requested. The file API
    /// cannot do partial writes, so this indicates a full filesystem.
    #[error("short write: requested {requested} bytes, wrote {written}")]
    ShortWrite {
        /// Bytes the caller asked to write.
        requested: usize,
        /// Bytes the library reported written.
        written: usize,
    },
}

impl Error {
    /// `true` if this is the "directory has no room for another entry"
    /// condition, which callers recover from via `expand_dir`.
    pub fn is_dir_no_space(&self) -> bool {
        matches!(self, Self::Ext2fs { code, .. } if *code == sys::EXT2_ET_DIR_NO_SPACE)
    }
}

/// Convenience alias for `std::result::Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
