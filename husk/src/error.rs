//! Error types for appliance builds.
//!
//! The build has no recoverable failure paths: every error propagates to
//! the driver, which prints a path-qualified diagnostic and exits non-zero.

use std::io;
use std::path::PathBuf;

/// Alias for `Result<T, husk::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while assembling an appliance.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An I/O operation on a named path failed.
    #[error("{op}: {}: {source}", path.display())]
    Io {
        /// The operation that failed (`open`, `read`, `readlink`, ...).
        op: &'static str,
        /// The path involved.
        path: PathBuf,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A regular file changed size between stat and body copy.
    #[error("{}: file has changed size while copying", path.display())]
    SizeChanged {
        /// The file that drifted.
        path: PathBuf,
    },

    /// An input is neither a regular file nor a directory.
    #[error("{}: input is not a regular file or directory", path.display())]
    BadInput {
        /// The offending input path.
        path: PathBuf,
    },

    /// An archive uses the old portable ASCII cpio format.
    #[error("{}: old cpio format not supported, use newc (-H newc)", path.display())]
    OldCpioFormat {
        /// The archive path.
        path: PathBuf,
    },

    /// An archive does not carry the newc magic.
    #[error("{}: not a newc cpio archive", path.display())]
    NotCpio {
        /// The archive path.
        path: PathBuf,
    },

    /// `fnmatch(3)` returned something other than match / no-match.
    #[error("fnmatch({pattern:?}): unexpected return value {code}")]
    PatternMatch {
        /// The pattern handed to `fnmatch`.
        pattern: String,
        /// The unexpected return code.
        code: i32,
    },

    /// The image has too few free blocks for a scheduled file body.
    #[error(
        "{}: needed {needed_blocks} blocks ({block_size} bytes each) \
         for {size} bytes, available only {available}",
        path.display()
    )]
    NoSpace {
        /// Source file being copied in.
        path: PathBuf,
        /// Blocks the body needs.
        needed_blocks: u64,
        /// Filesystem block size.
        block_size: u32,
        /// Body size in bytes.
        size: u64,
        /// Free blocks remaining.
        available: u64,
    },

    /// The device backing the image is (nearly) full.
    #[error("{}: not enough free space on backing device", device.display())]
    DeviceFull {
        /// The backing device or image path.
        device: PathBuf,
    },

    /// A path's parent directory was never created in the image.
    #[error("parent directory not found in image: {}", path.display())]
    ParentNotFound {
        /// The directory that failed to resolve.
        path: PathBuf,
        /// The library error.
        #[source]
        source: husk_e2fs::Error,
    },

    /// `mke2fs` exited unsuccessfully.
    #[error("mke2fs on {} failed with {status}", path.display())]
    Mke2fs {
        /// The image being formatted.
        path: PathBuf,
        /// The child exit status.
        status: std::process::ExitStatus,
    },

    /// No bootable kernel with a module directory could be found.
    #[error(
        "failed to find a suitable kernel in {} (modules in {}); if this is a \
         Xen guest with only domU kernels installed, install a fullvirt \
         kernel for appliance use",
        kernel_dir.display(),
        modules_dir.display()
    )]
    NoKernel {
        /// Directory that was searched for kernels.
        kernel_dir: PathBuf,
        /// Directory that was searched for module trees.
        modules_dir: PathBuf,
    },

    /// An environment override named a kernel that is not a regular file.
    #[error("{}: not a regular file (check $HUSK_KERNEL)", path.display())]
    KernelNotFile {
        /// The override path.
        path: PathBuf,
    },

    /// An environment override named a module path that is not a directory.
    #[error("{}: not a directory (check $HUSK_MODULES)", path.display())]
    ModulesNotDir {
        /// The override path.
        path: PathBuf,
    },

    /// No module directory could be derived for an overridden kernel.
    #[error(
        "{}: cannot derive the module path; set $HUSK_MODULES or unset \
         $HUSK_KERNEL to autoselect a kernel",
        kernel.display()
    )]
    NoModpath {
        /// The kernel whose module path is unknown.
        kernel: PathBuf,
    },

    /// A writer operation arrived after `finish`.
    #[error("writer used after finish")]
    WriterClosed,

    /// An error from the ext2 library layer.
    #[error(transparent)]
    Ext2(#[from] husk_e2fs::Error),
}

impl Error {
    /// Wraps an [`io::Error`] with the operation and path that produced it.
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { op, path, source }
    }
}
