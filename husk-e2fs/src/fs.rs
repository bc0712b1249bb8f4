//! Safe wrapper over the [`sys`] declarations.
//!
//! All `unsafe` interactions with libext2fs are confined to this module.
//! [`Ext2Fs`] owns the filesystem handle from `open` until `close` (or
//! drop), matching the builder's writer lifetime.

#![allow(unsafe_code)]

use std::ffi::{CStr, CString, c_int, c_void};
use std::path::{Path, PathBuf};
use std::ptr;

use crate::error::{Error, Result};
use crate::sys;

/// Inode number on the ext2 filesystem.
pub type Ino = sys::ext2_ino_t;

/// The root directory inode.
pub const ROOT_INO: Ino = sys::EXT2_ROOT_INO;

/// Directory-entry file type, as recorded by `ext2fs_link`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Regular file.
    RegFile,
    /// Directory.
    Dir,
    /// Character device.
    Chrdev,
    /// Block device.
    Blkdev,
    /// Named pipe.
    Fifo,
    /// Unix socket.
    Sock,
    /// Symbolic link.
    Symlink,
}

impl FileKind {
    fn ft(self) -> c_int {
        match self {
            Self::RegFile => sys::EXT2_FT_REG_FILE,
            Self::Dir => sys::EXT2_FT_DIR,
            Self::Chrdev => sys::EXT2_FT_CHRDEV,
            Self::Blkdev => sys::EXT2_FT_BLKDEV,
            Self::Fifo => sys::EXT2_FT_FIFO,
            Self::Sock => sys::EXT2_FT_SOCK,
            Self::Symlink => sys::EXT2_FT_SYMLINK,
        }
    }
}

/// Checks a libext2fs `errcode_t`, converting non-zero values to
/// [`Error::Ext2fs`].
fn check(op: &'static str, code: sys::errcode_t) -> Result<()> {
    if code != 0 {
        Err(Error::Ext2fs {
            op,
            code: code as i64,
        })
    } else {
        Ok(())
    }
}

/// Converts a path or entry name to a [`CString`].
fn to_cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::InvalidPath(s.to_owned()))
}

/// An open, writable ext2 filesystem image.
pub struct Ext2Fs {
    fs: sys::ext2_filsys,
}

impl std::fmt::Debug for Ext2Fs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ext2Fs")
            .field("device", &self.device_name())
            .finish()
    }
}

impl Ext2Fs {
    /// Opens `image` read-write (64-bit aware).
    pub fn open(image: &Path) -> Result<Self> {
        let name = image
            .to_str()
            .ok_or_else(|| Error::InvalidPath(image.display().to_string()))
            .and_then(to_cstring)?;
        let mut fs: sys::ext2_filsys = ptr::null_mut();
        let flags = (sys::EXT2_FLAG_RW | sys::EXT2_FLAG_64BITS) as c_int;
        unsafe {
            check(
                "ext2fs_open",
                sys::ext2fs_open(name.as_ptr(), flags, 0, 0, sys::unix_io_manager, &mut fs),
            )?;
        }
        Ok(Self { fs })
    }

    /// Reads the inode and block bitmaps. Must be called once after
    /// [`open`](Self::open), before any allocation.
    pub fn read_bitmaps(&mut self) -> Result<()> {
        unsafe { check("ext2fs_read_bitmaps", sys::ext2fs_read_bitmaps(self.fs)) }
    }

    /// Flushes everything and closes the image.
    pub fn close(mut self) -> Result<()> {
        let fs = std::mem::replace(&mut self.fs, ptr::null_mut());
        unsafe { check("ext2fs_close", sys::ext2fs_close(fs)) }
    }

    /// Filesystem block size in bytes.
    pub fn blocksize(&self) -> u32 {
        unsafe { (*self.fs).blocksize }
    }

    /// Number of free blocks according to the superblock.
    pub fn free_blocks(&self) -> u64 {
        unsafe { sys::ext2fs_free_blocks_count((*self.fs).super_) }
    }

    /// The backing image path, as recorded by the library.
    pub fn device_name(&self) -> Option<PathBuf> {
        unsafe {
            let p = (*self.fs).device_name;
            if p.is_null() {
                return None;
            }
            CStr::from_ptr(p).to_str().ok().map(PathBuf::from)
        }
    }

    /// Resolves `path` (no leading slash, relative to the root directory)
    /// to an inode number.
    pub fn namei(&self, path: &str) -> Result<Ino> {
        let name = to_cstring(path)?;
        let mut ino: Ino = 0;
        unsafe {
            check(
                "ext2fs_namei",
                sys::ext2fs_namei(self.fs, ROOT_INO, ROOT_INO, name.as_ptr(), &mut ino),
            )?;
        }
        Ok(ino)
    }

    /// Looks `name` up in directory `dir`. Returns `None` when the entry
    /// does not exist; any other failure is an error.
    pub fn lookup(&self, dir: Ino, name: &str) -> Result<Option<Ino>> {
        let cname = to_cstring(name)?;
        let mut ino: Ino = 0;
        let code = unsafe {
            sys::ext2fs_lookup(
                self.fs,
                dir,
                cname.as_ptr(),
                name.len() as c_int,
                ptr::null_mut(),
                &mut ino,
            )
        };
        if code == sys::EXT2_ET_FILE_NOT_FOUND {
            return Ok(None);
        }
        check("ext2fs_lookup", code)?;
        Ok(Some(ino))
    }

    /// Reads inode `ino`.
    pub fn read_inode(&self, ino: Ino) -> Result<sys::ext2_inode> {
        let mut inode = sys::ext2_inode::default();
        unsafe {
            check(
                "ext2fs_read_inode",
                sys::ext2fs_read_inode(self.fs, ino, &mut inode),
            )?;
        }
        Ok(inode)
    }

    /// Writes inode `ino` back.
    pub fn write_inode(&mut self, ino: Ino, inode: &sys::ext2_inode) -> Result<()> {
        let mut copy = *inode;
        unsafe {
            check(
                "ext2fs_write_inode",
                sys::ext2fs_write_inode(self.fs, ino, &mut copy),
            )
        }
    }

    /// Allocates a fresh inode number near directory `dir`.
    pub fn new_inode(&mut self, dir: Ino, mode: u32) -> Result<Ino> {
        let mut ino: Ino = 0;
        unsafe {
            check(
                "ext2fs_new_inode",
                sys::ext2fs_new_inode(self.fs, dir, mode as c_int, ptr::null_mut(), &mut ino),
            )?;
        }
        Ok(ino)
    }

    /// Writes a brand-new inode (also initialises extra inode fields).
    pub fn write_new_inode(&mut self, ino: Ino, inode: &sys::ext2_inode) -> Result<()> {
        let mut copy = *inode;
        unsafe {
            check(
                "ext2fs_write_new_inode",
                sys::ext2fs_write_new_inode(self.fs, ino, &mut copy),
            )
        }
    }

    /// Creates directory `name` under `parent`, using preallocated inode
    /// `ino`. Fails with a `dir_no_space` error when `parent` is full; the
    /// caller is expected to [`expand_dir`](Self::expand_dir) and retry.
    pub fn mkdir(&mut self, parent: Ino, ino: Ino, name: &str) -> Result<()> {
        let cname = to_cstring(name)?;
        unsafe {
            check(
                "ext2fs_mkdir",
                sys::ext2fs_mkdir(self.fs, parent, ino, cname.as_ptr()),
            )
        }
    }

    /// Links inode `ino` into directory `dir` as `name`. Fails with a
    /// `dir_no_space` error when `dir` is full.
    pub fn link(&mut self, dir: Ino, name: &str, ino: Ino, kind: FileKind) -> Result<()> {
        let cname = to_cstring(name)?;
        unsafe {
            check(
                "ext2fs_link",
                sys::ext2fs_link(self.fs, dir, cname.as_ptr(), ino, kind.ft()),
            )
        }
    }

    /// Removes the directory entry `name` from `dir`.
    pub fn unlink(&mut self, dir: Ino, name: &str) -> Result<()> {
        let cname = to_cstring(name)?;
        unsafe {
            check(
                "ext2fs_unlink",
                sys::ext2fs_unlink(self.fs, dir, cname.as_ptr(), 0, 0),
            )
        }
    }

    /// Grows directory `dir` by one block.
    pub fn expand_dir(&mut self, dir: Ino) -> Result<()> {
        unsafe { check("ext2fs_expand_dir", sys::ext2fs_expand_dir(self.fs, dir)) }
    }

    /// Updates the inode allocation statistics: `inuse` is `+1` on
    /// allocation, `-1` on release; `is_dir` flags directory inodes.
    pub fn inode_alloc_stats(&mut self, ino: Ino, inuse: i32, is_dir: bool) {
        unsafe {
            sys::ext2fs_inode_alloc_stats2(self.fs, ino, inuse, c_int::from(is_dir));
        }
    }

    /// Marks every data block of `inode` free in the block bitmap. Used
    /// when the last link to a file is removed.
    pub fn release_blocks(&mut self, ino: Ino, inode: &sys::ext2_inode) -> Result<()> {
        let mut copy = *inode;
        unsafe {
            if sys::ext2fs_inode_has_valid_blocks(&mut copy) == 0 {
                return Ok(());
            }
            check(
                "ext2fs_block_iterate",
                sys::ext2fs_block_iterate(
                    self.fs,
                    ino,
                    sys::BLOCK_FLAG_READ_ONLY,
                    ptr::null_mut(),
                    Some(release_block),
                    ptr::null_mut(),
                ),
            )
        }
    }

    /// Writes `data` as the entire body of inode `ino` and updates the
    /// inode's size field. The underlying file API cannot do partial
    /// writes, so the whole body goes down in a single call.
    pub fn write_file_data(&mut self, ino: Ino, data: &[u8]) -> Result<()> {
        let mut file: sys::ext2_file_t = ptr::null_mut();
        unsafe {
            check(
                "ext2fs_file_open2",
                sys::ext2fs_file_open2(
                    self.fs,
                    ino,
                    ptr::null_mut(),
                    sys::EXT2_FILE_WRITE,
                    &mut file,
                ),
            )?;

            let mut written: u32 = 0;
            let code = sys::ext2fs_file_write(
                file,
                data.as_ptr().cast::<c_void>(),
                data.len() as u32,
                &mut written,
            );
            if code != 0 {
                let _ = sys::ext2fs_file_close(file);
                return check("ext2fs_file_write", code);
            }
            if written as usize != data.len() {
                let _ = sys::ext2fs_file_close(file);
                return Err(Error::ShortWrite {
                    requested: data.len(),
                    written: written as usize,
                });
            }

            check("ext2fs_file_flush", sys::ext2fs_file_flush(file))?;
            check("ext2fs_file_close", sys::ext2fs_file_close(file))?;
        }

        // Record the true byte size in the inode.
        let mut inode = self.read_inode(ino)?;
        inode.i_size = data.len() as u32;
        self.write_inode(ino, &inode)
    }
}

impl Drop for Ext2Fs {
    fn drop(&mut self) {
        if !self.fs.is_null() {
            // Best-effort flush on an abandoned handle.
            unsafe {
                let _ = sys::ext2fs_close(self.fs);
            }
        }
    }
}

/// `ext2fs_block_iterate` callback: return each visited block to the free
/// pool.
unsafe extern "C" fn release_block(
    fs: sys::ext2_filsys,
    blocknr: *mut sys::blk_t,
    _blockcnt: c_int,
    _priv_data: *mut c_void,
) -> c_int {
    unsafe {
        sys::ext2fs_block_alloc_stats2(fs, u64::from(*blocknr), -1);
    }
    0
}
