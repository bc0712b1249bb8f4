//! The newc cpio format: stream writer and record primitives.
//!
//! This is the format the Linux kernel unpacks as an initramfs, so only
//! the narrow subset the kernel reads matters: `070701` records with
//! 8-digit uppercase-hex fields, 4-byte alignment, a `TRAILER!!!` record,
//! and padding of the whole stream to a 512-byte boundary.
//!
//! Hard links are not deduplicated on emit: every appearance writes its
//! own record, which the kernel unpacker tolerates.

use std::fs::{self, File, Metadata};
use std::io::{Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::sys::stat::{major, minor};
use tracing::trace;

use crate::error::{Error, Result};
use crate::utils::walk_preorder;
use crate::writer::Writer;

/// Magic number introducing every newc record.
pub(crate) const MAGIC: &[u8; 6] = b"070701";

/// Magic of the old portable ASCII format, which is not supported.
pub(crate) const OLD_MAGIC: &[u8; 6] = b"070707";

/// Name of the end-of-archive record.
pub(crate) const TRAILER: &str = "TRAILER!!!";

/// Header length: magic plus thirteen 8-digit hex fields.
pub(crate) const HEADER_LEN: usize = 6 + 13 * 8;

/// Copy buffer for file bodies.
const BUFFER_SIZE: usize = 64 * 1024;

/// Bytes needed to pad `len` up to a 4-byte boundary.
pub(crate) fn padding(len: u64) -> u64 {
    ((len + 3) & !3) - len
}

/// Numeric fields of one newc record.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct RecordHeader {
    pub ino: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub mtime: u32,
    pub body_len: u32,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub rdev_major: u32,
    pub rdev_minor: u32,
    pub name_len: u32,
}

impl RecordHeader {
    /// Renders the 110-byte ASCII header. The checksum field is always
    /// zero (the kernel never checks it).
    fn render(&self) -> String {
        format!(
            "070701{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}",
            self.ino,
            self.mode,
            self.uid,
            self.gid,
            self.nlink,
            self.mtime,
            self.body_len,
            self.dev_major,
            self.dev_minor,
            self.rdev_major,
            self.rdev_minor,
            self.name_len,
            0,
        )
    }

    /// Parses a 110-byte header. Rejects the old `070707` format and
    /// anything that is not newc at all.
    pub(crate) fn parse(raw: &[u8; HEADER_LEN], archive: &Path) -> Result<Self> {
        if &raw[..6] == OLD_MAGIC {
            return Err(Error::OldCpioFormat {
                path: archive.to_owned(),
            });
        }
        if &raw[..6] != MAGIC {
            return Err(Error::NotCpio {
                path: archive.to_owned(),
            });
        }

        let mut fields = [0u32; 13];
        for (i, field) in fields.iter_mut().enumerate() {
            let chunk = &raw[6 + i * 8..6 + (i + 1) * 8];
            let text = std::str::from_utf8(chunk).map_err(|_| Error::NotCpio {
                path: archive.to_owned(),
            })?;
            *field = u32::from_str_radix(text, 16).map_err(|_| Error::NotCpio {
                path: archive.to_owned(),
            })?;
        }

        Ok(Self {
            ino: fields[0],
            mode: fields[1],
            uid: fields[2],
            gid: fields[3],
            nlink: fields[4],
            mtime: fields[5],
            body_len: fields[6],
            dev_major: fields[7],
            dev_minor: fields[8],
            rdev_major: fields[9],
            rdev_minor: fields[10],
            name_len: fields[11],
        })
    }
}

/// What follows the name field of a record.
enum Body<'a> {
    None,
    /// Regular-file body copied from the host; must still be `len` bytes.
    HostFile { src: &'a Path, len: u64 },
    /// Symlink target bytes.
    Link(Vec<u8>),
}

/// Writes a concatenated newc stream to a single output file.
#[derive(Debug)]
pub struct CpioWriter {
    out: File,
    out_path: PathBuf,
    offset: u64,
    finished: bool,
}

impl CpioWriter {
    /// Creates (or truncates) the output archive.
    pub fn create(path: &Path) -> Result<Self> {
        let out = File::create(path).map_err(Error::io("open", path))?;
        Ok(Self {
            out,
            out_path: path.to_owned(),
            offset: 0,
            finished: false,
        })
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.out
            .write_all(buf)
            .map_err(Error::io("write", &self.out_path))?;
        self.offset += buf.len() as u64;
        Ok(())
    }

    fn write_padding(&mut self, len: u64) -> Result<()> {
        const ZEROS: [u8; 512] = [0; 512];
        let mut left = len;
        while left > 0 {
            let n = left.min(ZEROS.len() as u64) as usize;
            self.write(&ZEROS[..n])?;
            left -= n as u64;
        }
        Ok(())
    }

    /// Appends one record. `name` is the archive-internal name, no
    /// leading slash, without its NUL terminator.
    fn append_record(&mut self, name: &[u8], header: RecordHeader, body: Body<'_>) -> Result<()> {
        let name_len = name.len() as u64 + 1;
        let header = RecordHeader {
            name_len: name_len as u32,
            ..header
        };

        self.write(header.render().as_bytes())?;
        self.write(name)?;
        self.write(&[0])?;
        self.write_padding(padding(HEADER_LEN as u64 + name_len))?;

        match body {
            Body::None => {}
            Body::HostFile { src, len } => {
                self.copy_body(src, len)?;
                self.write_padding(padding(len))?;
            }
            Body::Link(target) => {
                let len = target.len() as u64;
                self.write(&target)?;
                self.write_padding(padding(len))?;
            }
        }
        Ok(())
    }

    /// Copies exactly `len` bytes of `src` into the stream; the file
    /// changing size underneath us is a hard failure.
    fn copy_body(&mut self, src: &Path, len: u64) -> Result<()> {
        let mut file = File::open(src).map_err(Error::io("open", src))?;
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut count: u64 = 0;
        loop {
            let n = file.read(&mut buf).map_err(Error::io("read", src))?;
            if n == 0 {
                break;
            }
            self.write(&buf[..n])?;
            count += n as u64;
            if count > len {
                return Err(Error::SizeChanged {
                    path: src.to_owned(),
                });
            }
        }
        if count != len {
            return Err(Error::SizeChanged {
                path: src.to_owned(),
            });
        }
        Ok(())
    }

    /// Appends one filesystem entry under the given archive name.
    fn append_named(&mut self, name: &[u8], src: &Path, meta: &Metadata) -> Result<()> {
        trace!(name = %String::from_utf8_lossy(name), mode = meta.mode(), "cpio entry");

        let file_type = meta.file_type();
        let body = if file_type.is_file() {
            Body::HostFile {
                src,
                len: meta.len(),
            }
        } else if file_type.is_symlink() {
            let target = fs::read_link(src).map_err(Error::io("readlink", src))?;
            let bytes = target.as_os_str().as_bytes().to_vec();
            if bytes.len() as u64 != meta.len() {
                return Err(Error::SizeChanged {
                    path: src.to_owned(),
                });
            }
            Body::Link(bytes)
        } else {
            Body::None
        };

        let body_len = match &body {
            Body::None => 0,
            Body::HostFile { len, .. } => *len as u32,
            Body::Link(t) => t.len() as u32,
        };

        let header = RecordHeader {
            ino: meta.ino() as u32,
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            nlink: meta.nlink() as u32,
            mtime: meta.mtime() as u32,
            body_len,
            dev_major: major(meta.dev()) as u32,
            dev_minor: minor(meta.dev()) as u32,
            rdev_major: major(meta.rdev()) as u32,
            rdev_minor: minor(meta.rdev()) as u32,
            name_len: 0,
        };
        self.append_record(name, header, body)
    }

    /// Appends the `TRAILER!!!` record and pads the stream to a 512-byte
    /// boundary.
    fn append_trailer(&mut self) -> Result<()> {
        let header = RecordHeader {
            nlink: 1,
            ..RecordHeader::default()
        };
        self.append_record(TRAILER.as_bytes(), header, Body::None)?;
        self.write_padding(((self.offset + 511) & !511) - self.offset)?;
        debug_assert_eq!(self.offset % 512, 0);
        Ok(())
    }
}

impl Writer for CpioWriter {
    fn add_entry(&mut self, path: &Path, meta: &Metadata) -> Result<()> {
        if self.finished {
            return Err(Error::WriterClosed);
        }
        self.append_named(archive_name(path), path, meta)
    }

    /// A skeleton archive is already newc: splice its bytes straight in.
    /// Its own trailer is harmless; the kernel reads concatenated
    /// archives.
    fn add_archive(&mut self, path: &Path) -> Result<()> {
        if self.finished {
            return Err(Error::WriterClosed);
        }
        let mut file = File::open(path).map_err(Error::io("open", path))?;
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let n = file.read(&mut buf).map_err(Error::io("read", path))?;
            if n == 0 {
                return Ok(());
            }
            self.write(&buf[..n])?;
        }
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Err(Error::WriterClosed);
        }
        self.finished = true;
        self.append_trailer()?;
        self.out
            .flush()
            .map_err(Error::io("close", &self.out_path))
    }
}

/// Archive name for an appliance path: leading `/` dropped, the root
/// itself becomes `.`.
fn archive_name(path: &Path) -> &[u8] {
    let bytes = path.as_os_str().as_bytes();
    let stripped = bytes.strip_prefix(b"/").unwrap_or(bytes);
    if stripped.is_empty() { b"." } else { stripped }
}

/// Packs the contents of `root` into a fresh newc archive at `out`, names
/// relative to `root` (the root directory itself becomes `.`). Used for
/// the mini-initrd.
pub fn archive_dir(root: &Path, out: &Path) -> Result<()> {
    let mut writer = CpioWriter::create(out)?;
    walk_preorder(root, &mut |path, meta| {
        let rel = path.strip_prefix(root).unwrap_or(path);
        let name = if rel.as_os_str().is_empty() {
            b".".to_vec()
        } else {
            rel.as_os_str().as_bytes().to_vec()
        };
        writer.append_named(&name, path, meta)
    })?;
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn build_sample(dir: &Path) -> Vec<u8> {
        let tree = dir.join("tree");
        fs::create_dir(&tree).unwrap();
        fs::create_dir(tree.join("etc")).unwrap();
        fs::write(tree.join("etc/hosts"), b"127.0.0.1 localhost\n").unwrap();
        symlink("hosts", tree.join("etc/hosts.bak")).unwrap();

        let out = dir.join("out.cpio");
        let mut w = CpioWriter::create(&out).unwrap();
        for p in ["/etc", "/etc/hosts", "/etc/hosts.bak"] {
            let full = tree.join(&p[1..]);
            let meta = fs::symlink_metadata(&full).unwrap();
            w.append_named(p[1..].as_bytes(), &full, &meta).unwrap();
        }
        w.finish().unwrap();
        fs::read(out).unwrap()
    }

    /// Walk the raw stream record by record, returning (offset, header,
    /// name) triples.
    fn scan(data: &[u8]) -> Vec<(u64, RecordHeader, String)> {
        let mut records = Vec::new();
        let mut pos = 0usize;
        loop {
            let raw: &[u8; HEADER_LEN] = data[pos..pos + HEADER_LEN].try_into().unwrap();
            let h = RecordHeader::parse(raw, Path::new("mem")).unwrap();
            let name_start = pos + HEADER_LEN;
            let name =
                String::from_utf8(data[name_start..name_start + h.name_len as usize - 1].to_vec())
                    .unwrap();
            records.push((pos as u64, h, name.clone()));
            if name == TRAILER {
                return records;
            }
            let mut next = name_start as u64 + u64::from(h.name_len);
            next += padding(HEADER_LEN as u64 + u64::from(h.name_len));
            next += u64::from(h.body_len) + padding(u64::from(h.body_len));
            pos = next as usize;
        }
    }

    #[test]
    fn stream_layout() {
        let dir = tempfile::tempdir().unwrap();
        let data = build_sample(dir.path());

        assert!(data.starts_with(MAGIC));
        assert_eq!(data.len() % 512, 0);

        let records = scan(&data);
        assert_eq!(records.len(), 4);
        // Every header starts on a 4-byte boundary.
        for (offset, _, _) in &records {
            assert_eq!(offset % 4, 0);
        }

        let (_, hosts, name) = &records[1];
        assert_eq!(name, "etc/hosts");
        assert_eq!(hosts.body_len, 20);
        assert_eq!(hosts.nlink, 1);

        let (_, link, name) = &records[2];
        assert_eq!(name, "etc/hosts.bak");
        assert_eq!(link.body_len, 5); // "hosts"

        let (_, trailer, name) = &records[3];
        assert_eq!(name, TRAILER);
        assert_eq!(trailer.nlink, 1);
        assert_eq!(trailer.body_len, 0);
    }

    #[test]
    fn root_becomes_dot() {
        assert_eq!(archive_name(Path::new("/")), b".");
        assert_eq!(archive_name(Path::new("/etc/hosts")), b"etc/hosts");
        assert_eq!(archive_name(Path::new("relative")), b"relative");
    }

    #[test]
    fn body_drift_detected() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("f");
        fs::write(&f, b"0123456789").unwrap();
        let meta = fs::symlink_metadata(&f).unwrap();

        // Shrink after stat.
        fs::write(&f, b"0123").unwrap();

        let out = dir.path().join("out.cpio");
        let mut w = CpioWriter::create(&out).unwrap();
        let err = w.append_named(b"f", &f, &meta).unwrap_err();
        assert!(matches!(err, Error::SizeChanged { .. }));
    }

    #[test]
    fn archive_dir_packs_flat_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("scratch");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("modules"), b"virtio.ko\n").unwrap();
        fs::write(root.join("init"), b"\x7fELF").unwrap();

        let out = dir.path().join("initrd");
        archive_dir(&root, &out).unwrap();

        let data = fs::read(out).unwrap();
        let names: Vec<String> = scan(&data).into_iter().map(|(_, _, n)| n).collect();
        assert_eq!(names, vec![".", "init", "modules", TRAILER]);
    }

    #[test]
    fn rejects_old_format() {
        let mut raw = [b'0'; HEADER_LEN];
        raw[..6].copy_from_slice(OLD_MAGIC);
        let err = RecordHeader::parse(&raw, Path::new("x")).unwrap_err();
        assert!(matches!(err, Error::OldCpioFormat { .. }));
    }
}
