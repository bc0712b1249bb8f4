//! Hand-curated FFI declarations for [`libext2fs`].
//!
//! Only the entry points the appliance builder drives are declared here.
//! Signatures, structure layouts, and constants follow the e2fsprogs
//! headers:
//!
//!   - `lib/ext2fs/ext2fs.h`   (library API, `struct_ext2_filsys`)
//!   - `lib/ext2fs/ext2_fs.h`  (on-disk inode layout)
//!   - `lib/ext2fs/ext2_err.h` (generated error codes)
//!   - `lib/et/com_err.h`      (`errcode_t`)
//!
//! Reference: e2fsprogs v1.47: <https://github.com/tytso/e2fsprogs>
//!
//! [`libext2fs`]: https://e2fsprogs.sourceforge.net/

// sys module: unsafe FFI, non-idiomatic C naming.
#![allow(
    unsafe_code,
    missing_docs,
    missing_debug_implementations,
    non_camel_case_types,
    non_upper_case_globals,
    non_snake_case,
    clippy::missing_safety_doc,
    clippy::unreadable_literal
)]

use core::ffi::{c_char, c_int, c_uint, c_void};

// ---------------------------------------------------------------------------
// Primitive type aliases
// ---------------------------------------------------------------------------

/// Error code returned by libext2fs functions. Zero means success.
pub type errcode_t = core::ffi::c_long;

/// Inode number (32-bit).
pub type ext2_ino_t = u32;

/// Block number (32-bit, legacy).
pub type blk_t = u32;

/// Block number (64-bit).
pub type blk64_t = u64;

/// Opaque I/O manager. `struct struct_io_manager *`.
pub type io_manager = *mut c_void;

/// Opaque open-file handle. `struct ext2_file *`.
pub type ext2_file_t = *mut c_void;

/// Opaque superblock. Only ever passed back into the library
/// (`ext2fs_free_blocks_count`), never dereferenced from Rust.
pub type ext2_super_block = c_void;

/// Filesystem handle. `struct struct_ext2_filsys *`.
pub type ext2_filsys = *mut struct_ext2_filsys;

/// Leading fields of `struct struct_ext2_filsys`.
///
/// This is a prefix declaration: the real structure is much larger, but the
/// library allocates it, and Rust only reads `device_name`, `super_` and
/// `blocksize`. These leading members have kept the same layout across every
/// e2fsprogs release with a stable soname.
#[repr(C)]
pub struct struct_ext2_filsys {
    pub magic: errcode_t,
    pub io: *mut c_void,
    pub flags: c_int,
    pub device_name: *mut c_char,
    pub super_: *mut ext2_super_block,
    pub blocksize: c_uint,
}

/// The ext2 inode structure (128 bytes, on-disk layout).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ext2_inode {
    pub i_mode: u16,
    pub i_uid: u16,
    pub i_size: u32,
    pub i_atime: u32,
    pub i_ctime: u32,
    pub i_mtime: u32,
    pub i_dtime: u32,
    pub i_gid: u16,
    pub i_links_count: u16,
    pub i_blocks: u32,
    pub i_flags: u32,
    pub osd1: u32,
    pub i_block: [u32; 15],
    pub i_generation: u32,
    pub i_file_acl: u32,
    pub i_size_high: u32,
    pub i_faddr: u32,
    pub osd2: [u8; 12],
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Root directory inode number.
pub const EXT2_ROOT_INO: ext2_ino_t = 2;

// Filesystem open flags.
pub const EXT2_FLAG_RW: u32 = 0x01;
pub const EXT2_FLAG_64BITS: u32 = 0x20000;

// File open flags for `ext2fs_file_open2`.
pub const EXT2_FILE_WRITE: c_int = 0x0001;

// File type constants for `ext2fs_link`.
pub const EXT2_FT_UNKNOWN: c_int = 0;
pub const EXT2_FT_REG_FILE: c_int = 1;
pub const EXT2_FT_DIR: c_int = 2;
pub const EXT2_FT_CHRDEV: c_int = 3;
pub const EXT2_FT_BLKDEV: c_int = 4;
pub const EXT2_FT_FIFO: c_int = 5;
pub const EXT2_FT_SOCK: c_int = 6;
pub const EXT2_FT_SYMLINK: c_int = 7;

// Block iterator flags.
pub const BLOCK_FLAG_READ_ONLY: c_int = 8;

// Error codes from the generated `ext2_err.h` table (base 2133571328).
pub const EXT2_ET_DIR_NO_SPACE: errcode_t = 2133571366;
pub const EXT2_ET_FILE_NOT_FOUND: errcode_t = 2133571404;

// ---------------------------------------------------------------------------
// Extern functions (libext2fs)
// ---------------------------------------------------------------------------

unsafe extern "C" {
    /// The Unix file-backed I/O manager.
    pub static unix_io_manager: io_manager;

    // --- Filesystem lifecycle ---

    /// Opens an existing ext2/3/4 filesystem image.
    pub fn ext2fs_open(
        name: *const c_char,
        flags: c_int,
        superblock: c_int,
        block_size: c_uint,
        manager: io_manager,
        ret_fs: *mut ext2_filsys,
    ) -> errcode_t;

    /// Flushes and closes the filesystem, freeing all resources.
    pub fn ext2fs_close(fs: ext2_filsys) -> errcode_t;

    /// Reads the inode and block allocation bitmaps into memory.
    pub fn ext2fs_read_bitmaps(fs: ext2_filsys) -> errcode_t;

    /// Free block count from the superblock (64-bit aware).
    pub fn ext2fs_free_blocks_count(super_: *mut ext2_super_block) -> blk64_t;

    // --- Name resolution ---

    /// Resolves a path (relative to `cwd`) to an inode number. Does not
    /// follow a symlink in the final component.
    pub fn ext2fs_namei(
        fs: ext2_filsys,
        root: ext2_ino_t,
        cwd: ext2_ino_t,
        name: *const c_char,
        inode: *mut ext2_ino_t,
    ) -> errcode_t;

    /// Looks up a single directory entry by name.
    pub fn ext2fs_lookup(
        fs: ext2_filsys,
        dir: ext2_ino_t,
        name: *const c_char,
        namelen: c_int,
        buf: *mut c_char,
        inode: *mut ext2_ino_t,
    ) -> errcode_t;

    // --- Inode operations ---

    /// Allocates a new inode number near `dir`.
    pub fn ext2fs_new_inode(
        fs: ext2_filsys,
        dir: ext2_ino_t,
        mode: c_int,
        map: *mut c_void,
        ret: *mut ext2_ino_t,
    ) -> errcode_t;

    /// Writes a brand-new inode to the filesystem.
    pub fn ext2fs_write_new_inode(
        fs: ext2_filsys,
        ino: ext2_ino_t,
        inode: *mut ext2_inode,
    ) -> errcode_t;

    /// Reads an inode from the filesystem.
    pub fn ext2fs_read_inode(
        fs: ext2_filsys,
        ino: ext2_ino_t,
        inode: *mut ext2_inode,
    ) -> errcode_t;

    /// Writes an inode to the filesystem.
    pub fn ext2fs_write_inode(
        fs: ext2_filsys,
        ino: ext2_ino_t,
        inode: *mut ext2_inode,
    ) -> errcode_t;

    /// `true` if the inode addresses data blocks through `i_block`.
    pub fn ext2fs_inode_has_valid_blocks(inode: *mut ext2_inode) -> c_int;

    /// Updates inode allocation statistics and bitmaps.
    pub fn ext2fs_inode_alloc_stats2(
        fs: ext2_filsys,
        ino: ext2_ino_t,
        inuse: c_int,
        isdir: c_int,
    );

    // --- Directory operations ---

    /// Creates a directory `name` under `parent` using preallocated `inum`.
    pub fn ext2fs_mkdir(
        fs: ext2_filsys,
        parent: ext2_ino_t,
        inum: ext2_ino_t,
        name: *const c_char,
    ) -> errcode_t;

    /// Links an inode into a directory.
    pub fn ext2fs_link(
        fs: ext2_filsys,
        dir: ext2_ino_t,
        name: *const c_char,
        ino: ext2_ino_t,
        flags: c_int,
    ) -> errcode_t;

    /// Removes a directory entry by name (and/or inode number).
    pub fn ext2fs_unlink(
        fs: ext2_filsys,
        dir: ext2_ino_t,
        name: *const c_char,
        ino: ext2_ino_t,
        flags: c_int,
    ) -> errcode_t;

    /// Grows a directory by one block.
    pub fn ext2fs_expand_dir(fs: ext2_filsys, dir: ext2_ino_t) -> errcode_t;

    // --- Block operations ---

    /// Updates block allocation statistics and bitmaps.
    pub fn ext2fs_block_alloc_stats2(fs: ext2_filsys, blk: blk64_t, inuse: c_int);

    /// Iterates over every block of an inode, calling `func` for each.
    pub fn ext2fs_block_iterate(
        fs: ext2_filsys,
        ino: ext2_ino_t,
        flags: c_int,
        block_buf: *mut c_char,
        func: Option<
            unsafe extern "C" fn(ext2_filsys, *mut blk_t, c_int, *mut c_void) -> c_int,
        >,
        priv_data: *mut c_void,
    ) -> errcode_t;

    // --- File I/O ---

    /// Opens an inode for file-style I/O.
    pub fn ext2fs_file_open2(
        fs: ext2_filsys,
        ino: ext2_ino_t,
        inode: *mut ext2_inode,
        flags: c_int,
        ret: *mut ext2_file_t,
    ) -> errcode_t;

    /// Writes to an open file. Cannot do partial writes: the caller must
    /// hand over the entire body in one call.
    pub fn ext2fs_file_write(
        file: ext2_file_t,
        buf: *const c_void,
        nbytes: c_uint,
        written: *mut c_uint,
    ) -> errcode_t;

    /// Flushes buffered file data to the image.
    pub fn ext2fs_file_flush(file: ext2_file_t) -> errcode_t;

    /// Closes an open file handle.
    pub fn ext2fs_file_close(file: ext2_file_t) -> errcode_t;
}
