//! The ext2 writer: builds a sparse filesystem image plus a mini-initrd.
//!
//! The image is created with the external `mke2fs` and then populated
//! through the narrow `husk-e2fs` interface: inode allocation, directory
//! linking, and whole-body file writes. Nothing here touches the on-disk
//! format directly.

use std::fs::{self, File, Metadata};
use std::io::{Seek, SeekFrom, Write as _};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use husk_e2fs::{Ext2Fs, FileKind, Ino, ROOT_INO, ext2_inode};
use nix::sys::stat::{major, minor};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::initrd;
use crate::writer::Writer;

/// Appliance image size. Fixed: the filesystem is sparse, so unused
/// space costs nothing on the host.
pub const DEFAULT_IMAGE_SIZE: u64 = 1 << 30;

/// Writes appliance entries into an ext2 filesystem image.
#[derive(Debug)]
pub struct Ext2Writer {
    fs: Option<Ext2Fs>,
    appliance: PathBuf,
}

impl Ext2Writer {
    /// Builds the mini-initrd, creates and formats the sparse image, and
    /// opens it for population.
    pub fn create(
        appliance: &Path,
        initrd_path: &Path,
        modpath: &Path,
        init_bin: &[u8],
        image_size: u64,
        verbose_mkfs: bool,
    ) -> Result<Self> {
        initrd::build(modpath, initrd_path, init_bin)?;

        debug!(appliance = %appliance.display(), size = image_size, "creating appliance image");
        let mut image = File::create(appliance).map_err(Error::io("open", appliance))?;
        image
            .seek(SeekFrom::Start(image_size - 1))
            .and_then(|_| image.write_all(&[0]))
            .map_err(Error::io("write", appliance))?;
        drop(image);

        let mut mkfs = Command::new("mke2fs");
        mkfs.args(["-t", "ext2", "-F"]);
        if !verbose_mkfs {
            mkfs.arg("-q");
        }
        let status = mkfs
            .arg(appliance)
            .status()
            .map_err(Error::io("exec mke2fs", appliance))?;
        if !status.success() {
            return Err(Error::Mke2fs {
                path: appliance.to_owned(),
                status,
            });
        }

        let mut fs = Ext2Fs::open(appliance)?;
        fs.read_bitmaps()?;
        Ok(Self {
            fs: Some(fs),
            appliance: appliance.to_owned(),
        })
    }

    pub(crate) fn fs_mut(&mut self) -> Result<&mut Ext2Fs> {
        self.fs.as_mut().ok_or(Error::WriterClosed)
    }

    /// Resolves the parent directory of an appliance path.
    ///
    /// Returns `None` for the root path (which always exists), otherwise
    /// the parent inode and the entry basename. With `host_parent` set,
    /// a parent that is a host symlink to a directory is first resolved
    /// to its absolute target, because the library's path resolver does not
    /// follow symlinks in containing directories.
    fn resolve_parent(&mut self, dest: &str, host_parent: bool) -> Result<Option<(Ino, String)>> {
        assert!(
            !dest.is_empty() && dest.starts_with('/'),
            "appliance path must be absolute: {dest:?}"
        );
        assert!(
            dest.len() == 1 || !dest.ends_with('/'),
            "appliance path must not end in a slash: {dest:?}"
        );
        if dest == "/" {
            return Ok(None);
        }

        let (dirname, basename) = match split_dest(dest) {
            Some(split) => split,
            None => return Ok(None),
        };
        if dirname == "/" {
            return Ok(Some((ROOT_INO, basename.to_owned())));
        }

        let mut dirname = dirname.to_owned();
        if host_parent {
            let parent = Path::new(&dirname);
            let is_symlinked_dir = fs::symlink_metadata(parent)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false)
                && fs::metadata(parent).map(|m| m.is_dir()).unwrap_or(false);
            if is_symlinked_dir {
                let resolved =
                    fs::canonicalize(parent).map_err(Error::io("realpath", parent))?;
                dirname = resolved.to_str().map(str::to_owned).ok_or_else(|| {
                    husk_e2fs::Error::InvalidPath(resolved.display().to_string())
                })?;
            }
        }

        let relative = dirname.trim_start_matches('/');
        let dir_ino = self
            .fs_mut()?
            .namei(relative)
            .map_err(|source| Error::ParentNotFound {
                path: PathBuf::from(&dirname),
                source,
            })?;
        Ok(Some((dir_ino, basename.to_owned())))
    }

    /// Removes any existing entry `basename` in `dir` so the incoming
    /// entry can take its place. Existing directories are left alone:
    /// what overwriting a directory should mean is unclear, so it is
    /// deliberately a no-op.
    pub(crate) fn clean_path(&mut self, dir: Ino, basename: &str, is_dir: bool) -> Result<()> {
        let fs = self.fs_mut()?;
        let ino = match fs.lookup(dir, basename)? {
            Some(ino) => ino,
            None => return Ok(()),
        };
        if is_dir {
            return Ok(());
        }

        let mut inode = fs.read_inode(ino)?;
        inode.i_links_count = inode.i_links_count.saturating_sub(1);
        fs.write_inode(ino, &inode)?;
        fs.unlink(dir, basename)?;

        if inode.i_links_count == 0 {
            inode.i_dtime = unix_now();
            fs.write_inode(ino, &inode)?;
            fs.release_blocks(ino, &inode)?;
            fs.inode_alloc_stats(ino, -1, false);
        }
        Ok(())
    }

    /// Links `ino` into `dir`, growing the directory when it fills up.
    pub(crate) fn link_into(
        &mut self,
        dir: Ino,
        basename: &str,
        ino: Ino,
        kind: FileKind,
    ) -> Result<()> {
        let fs = self.fs_mut()?;
        loop {
            match fs.link(dir, basename, ino, kind) {
                Err(err) if err.is_dir_no_space() => fs.expand_dir(dir)?,
                other => return Ok(other?),
            }
        }
    }

    /// Allocates and links an inode with no data blocks. Device numbers
    /// go into the first block pointer, encoded the way the kernel packs
    /// them.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn empty_inode(
        &mut self,
        dir: Ino,
        basename: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        times: (u32, u32, u32),
        rdev: (u32, u32),
        kind: FileKind,
    ) -> Result<Ino> {
        let ino = self.fs_mut()?.new_inode(dir, mode)?;

        let mut inode = ext2_inode {
            i_mode: mode as u16,
            i_uid: uid as u16,
            i_gid: gid as u16,
            i_links_count: 1,
            i_ctime: times.0,
            i_atime: times.1,
            i_mtime: times.2,
            ..ext2_inode::default()
        };
        inode.i_block[0] = encode_devnum(rdev.0, rdev.1);

        self.fs_mut()?.write_new_inode(ino, &inode)?;
        self.link_into(dir, basename, ino, kind)?;
        self.fs_mut()?.inode_alloc_stats(ino, 1, false);
        Ok(ino)
    }

    /// Creates directory `basename` in `dir` unless it already exists,
    /// then stamps the requested ownership, permissions and times onto
    /// its inode.
    pub(crate) fn make_dir(
        &mut self,
        dir: Ino,
        basename: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        times: (u32, u32, u32),
    ) -> Result<()> {
        let mode = libc::S_IFDIR | (mode & 0o3777);
        let fs = self.fs_mut()?;

        // Re-adding an existing directory is legitimate; skip it.
        if fs.lookup(dir, basename)?.is_some() {
            return Ok(());
        }

        let ino = fs.new_inode(dir, mode)?;
        loop {
            match fs.mkdir(dir, ino, basename) {
                Err(err) if err.is_dir_no_space() => fs.expand_dir(dir)?,
                Err(err) => return Err(err.into()),
                Ok(()) => break,
            }
        }

        let mut inode = fs.read_inode(ino)?;
        inode.i_mode = mode as u16;
        inode.i_uid = uid as u16;
        inode.i_gid = gid as u16;
        inode.i_ctime = times.0;
        inode.i_atime = times.1;
        inode.i_mtime = times.2;
        fs.write_inode(ino, &inode)?;
        Ok(())
    }

    /// Writes a file body in one call and records its size.
    pub(crate) fn write_body(&mut self, ino: Ino, data: &[u8]) -> Result<()> {
        Ok(self.fs_mut()?.write_file_data(ino, data)?)
    }

    /// Fails early when the image or its backing device cannot take a
    /// body of `size` bytes.
    fn ensure_space(&mut self, src: &Path, size: u64) -> Result<()> {
        let fs = self.fs_mut()?;

        if let Some(device) = fs.device_name()
            && let Ok(vfs) = nix::sys::statvfs::statvfs(&device)
        {
            let space = vfs.blocks_available() * vfs.block_size();
            let estimate = 128 * 1024 + 2 * size;
            if space < estimate {
                return Err(Error::DeviceFull { device });
            }
        }

        let block_size = fs.blocksize();
        let needed = size.div_ceil(u64::from(block_size));
        let available = fs.free_blocks();
        if needed > available {
            return Err(Error::NoSpace {
                path: src.to_owned(),
                needed_blocks: needed,
                block_size,
                size,
                available,
            });
        }
        Ok(())
    }

    /// Copies one host filesystem entry into the image.
    fn add_host_entry(&mut self, src: &Path, meta: &Metadata) -> Result<()> {
        let dest = src
            .to_str()
            .ok_or_else(|| husk_e2fs::Error::InvalidPath(src.display().to_string()))?
            .to_owned();
        trace!(dest = %dest, mode = meta.mode(), "ext2 entry");

        let file_type = meta.file_type();
        if file_type.is_file() {
            self.ensure_space(src, meta.len())?;
        }

        let (dir, base) = match self.resolve_parent(&dest, true)? {
            Some(parent) => parent,
            None => return Ok(()), // the root always exists
        };
        self.clean_path(dir, &base, file_type.is_dir())?;

        let times = (
            meta.ctime() as u32,
            meta.atime() as u32,
            meta.mtime() as u32,
        );
        let (uid, gid, mode) = (meta.uid(), meta.gid(), meta.mode());

        if file_type.is_file() {
            let ino = self.empty_inode(
                dir,
                &base,
                mode,
                uid,
                gid,
                times,
                (0, 0),
                FileKind::RegFile,
            )?;
            if meta.len() > 0 {
                // Unreadable host files are skipped with a warning: some
                // distros ship non-world-readable files and the appliance
                // is still usable without them.
                match fs::read(src) {
                    Ok(body) => self.write_body(ino, &body)?,
                    Err(err) => warn!(path = %src.display(), %err, "skipping unreadable file"),
                }
            }
        } else if file_type.is_symlink() {
            let ino = self.empty_inode(
                dir,
                &base,
                mode,
                uid,
                gid,
                times,
                (0, 0),
                FileKind::Symlink,
            )?;
            let target = fs::read_link(src).map_err(Error::io("readlink", src))?;
            self.write_body(ino, target.as_os_str().as_encoded_bytes())?;
        } else if file_type.is_dir() {
            self.make_dir(dir, &base, mode, uid, gid, times)?;
        } else {
            let kind = if file_type.is_block_device() {
                FileKind::Blkdev
            } else if file_type.is_char_device() {
                FileKind::Chrdev
            } else if file_type.is_fifo() {
                FileKind::Fifo
            } else {
                FileKind::Sock
            };
            let rdev = (major(meta.rdev()) as u32, minor(meta.rdev()) as u32);
            self.empty_inode(dir, &base, mode, uid, gid, times, rdev, kind)?;
        }
        Ok(())
    }

    /// Resolves the parent of a path coming out of a cpio archive.
    /// Archive names never involve host symlinks.
    pub(crate) fn resolve_archive_parent(&mut self, dest: &str) -> Result<Option<(Ino, String)>> {
        self.resolve_parent(dest, false)
    }
}

impl Writer for Ext2Writer {
    fn add_entry(&mut self, path: &Path, meta: &Metadata) -> Result<()> {
        self.add_host_entry(path, meta)
    }

    fn add_archive(&mut self, path: &Path) -> Result<()> {
        self.graft_cpio(path)
    }

    fn finish(&mut self) -> Result<()> {
        let fs = self.fs.take().ok_or(Error::WriterClosed)?;
        debug!(appliance = %self.appliance.display(), "closing appliance image");
        fs.close()?;
        Ok(())
    }
}

/// Splits an absolute appliance path into (dirname, basename).
/// `"/foo"` splits to `("/", "foo")`; the root itself yields `None`.
fn split_dest(dest: &str) -> Option<(&str, &str)> {
    let idx = dest.rfind('/')?;
    let basename = &dest[idx + 1..];
    if basename.is_empty() {
        return None;
    }
    let dirname = if idx == 0 { "/" } else { &dest[..idx] };
    Some((dirname, basename))
}

/// Kernel-style packing of `(major, minor)` into a single u32.
fn encode_devnum(major: u32, minor: u32) -> u32 {
    (minor & 0xff) | (major << 8) | ((minor & !0xff) << 12)
}

/// Seconds since the epoch, clamped into the ext2 timestamp field.
fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_paths() {
        assert_eq!(split_dest("/foo"), Some(("/", "foo")));
        assert_eq!(split_dest("/foo/bar"), Some(("/foo", "bar")));
        assert_eq!(split_dest("/lib/modules/5.14.0"), Some(("/lib/modules", "5.14.0")));
        assert_eq!(split_dest("/"), None);
    }

    #[test]
    fn device_number_encoding() {
        assert_eq!(encode_devnum(0, 0), 0);
        // /dev/sda is 8:0, /dev/sda1 is 8:1.
        assert_eq!(encode_devnum(8, 0), 0x0800);
        assert_eq!(encode_devnum(8, 1), 0x0801);
        // Minors above 255 spill into the high bits.
        assert_eq!(encode_devnum(8, 256), (256 << 12) | 0x0800);
        assert_eq!(encode_devnum(8, 257), (256 << 12) | 0x0801);
    }
}
