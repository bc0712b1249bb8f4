//! Narrow safe interface over [`libext2fs`] for populating ext2 images.
//!
//! The appliance builder only ever drives a small slice of libext2fs:
//! opening an image read-write, allocating and linking inodes, expanding
//! directories that fill up, writing file bodies, and keeping the
//! allocation bitmaps honest. This crate binds exactly that slice:
//! hand-curated declarations in [`sys`], and a safe wrapper ([`Ext2Fs`])
//! that confines all `unsafe` interactions.
//!
//! The on-disk format itself (bitmap management, directory expansion,
//! block mapping) stays inside the library; nothing here reimplements it.
//!
//! [`libext2fs`]: https://e2fsprogs.sourceforge.net/

mod error;
mod fs;
pub mod sys;

pub use error::{Error, Result};
pub use fs::{Ext2Fs, FileKind, Ino, ROOT_INO};
pub use sys::ext2_inode;
