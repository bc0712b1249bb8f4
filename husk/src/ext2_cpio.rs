//! Unpacking a newc cpio skeleton into the ext2 image.
//!
//! This mirrors what the kernel's `init/initramfs.c` does with an
//! initramfs, except the destination is the ext2 appliance: the
//! cpio-based skeleton and the host-file supplement merge into a single
//! filesystem. The stream is assumed uncompressed.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use husk_e2fs::{FileKind, Ino};
use tracing::trace;

use crate::cpio::{HEADER_LEN, RecordHeader, TRAILER};
use crate::error::{Error, Result};
use crate::ext2::Ext2Writer;

/// Name-field length on disk: the name plus its NUL, aligned so the body
/// starts on a 4-byte boundary (the header is 110 bytes, hence the +2).
fn name_field_len(name_len: u32) -> u64 {
    u64::from((name_len + 1) & !3) + 2
}

/// Longest name or symlink target the reader will accept.
const SANE_PATH_MAX: u32 = 4096;

/// Hard-link identity in a newc stream: the inode number alone is only
/// unique per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LinkKey {
    cpio_ino: u32,
    dev_major: u32,
    dev_minor: u32,
}

impl LinkKey {
    fn of(header: &RecordHeader) -> Self {
        Self {
            cpio_ino: header.ino,
            dev_major: header.dev_major,
            dev_minor: header.dev_minor,
        }
    }
}

/// How a record relates to previously seen hard links.
#[derive(Debug, PartialEq, Eq)]
enum LinkStatus {
    /// nlink < 2: not a hard link at all.
    NotLink,
    /// First appearance of a multiply-linked inode: create it, then
    /// record it.
    FirstSeen,
    /// Subsequent appearance: link to the inode created earlier.
    Resolved(Ino),
}

/// Mapping from cpio link identity to the real ext2 inode. Insertion-only
/// within one archive; cleared at the trailer.
#[derive(Debug, Default)]
struct LinkTable {
    records: Vec<(LinkKey, Ino)>,
}

impl LinkTable {
    fn status(&self, header: &RecordHeader) -> LinkStatus {
        if header.nlink < 2 {
            return LinkStatus::NotLink;
        }
        let key = LinkKey::of(header);
        match self.records.iter().find(|(k, _)| *k == key) {
            Some((_, real)) => LinkStatus::Resolved(*real),
            None => LinkStatus::FirstSeen,
        }
    }

    fn insert(&mut self, header: &RecordHeader, real: Ino) {
        self.records.push((LinkKey::of(header), real));
    }

    fn clear(&mut self) {
        self.records.clear();
    }
}

/// Strips the leading `./` or `/` from an archive member name. An empty
/// result means the record refers to the root directory and is skipped.
fn sanitize_name(name: &str) -> Option<&str> {
    let name = name.strip_prefix('.').unwrap_or(name);
    let name = name.strip_prefix('/').unwrap_or(name);
    if name.is_empty() { None } else { Some(name) }
}

impl Ext2Writer {
    /// Parses the newc stream at `archive` and creates every member in
    /// the image, recovering hard-link identity across records.
    pub(crate) fn graft_cpio(&mut self, archive: &Path) -> Result<()> {
        let file = File::open(archive).map_err(Error::io("open", archive))?;
        let mut reader = BufReader::new(file);
        let mut links = LinkTable::default();
        let mut curr: u64 = 0;

        loop {
            // Synchronise with the next header, skipping inter-record
            // zero padding.
            let mut head = [0u8; 4];
            match reader.read_exact(&mut head) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => {
                    return Err(Error::Io {
                        op: "read",
                        path: archive.to_owned(),
                        source: err,
                    });
                }
            }
            curr += 4;
            if head == [0; 4] {
                continue;
            }

            let mut raw = [0u8; HEADER_LEN];
            raw[..4].copy_from_slice(&head);
            reader
                .read_exact(&mut raw[4..])
                .map_err(Error::io("read", archive))?;
            curr += (HEADER_LEN - 4) as u64;

            let header = RecordHeader::parse(&raw, archive)?;
            let next_header = (curr + name_field_len(header.name_len) + u64::from(header.body_len))
                .next_multiple_of(4);

            if header.name_len == 0 || header.name_len > SANE_PATH_MAX {
                skip_to(&mut reader, &mut curr, next_header, archive)?;
                continue;
            }

            let mut name_buf = vec![0u8; name_field_len(header.name_len) as usize];
            reader
                .read_exact(&mut name_buf)
                .map_err(Error::io("read", archive))?;
            curr += name_buf.len() as u64;

            let name = match std::str::from_utf8(&name_buf[..header.name_len as usize - 1]) {
                Ok(name) => name,
                Err(_) => {
                    skip_to(&mut reader, &mut curr, next_header, archive)?;
                    continue;
                }
            };
            trace!(name, mode = header.mode, "cpio record");

            if name == TRAILER {
                links.clear();
                skip_to(&mut reader, &mut curr, next_header, archive)?;
                continue;
            }

            if let Some(member) = sanitize_name(name) {
                self.create_member(
                    archive,
                    &mut reader,
                    &mut curr,
                    &header,
                    member,
                    &mut links,
                )?;
            }
            skip_to(&mut reader, &mut curr, next_header, archive)?;
        }
        Ok(())
    }

    /// Creates one archive member in the image.
    fn create_member(
        &mut self,
        archive: &Path,
        reader: &mut BufReader<File>,
        curr: &mut u64,
        header: &RecordHeader,
        member: &str,
        links: &mut LinkTable,
    ) -> Result<()> {
        let fmt = header.mode & libc::S_IFMT;
        let is_symlink = fmt == libc::S_IFLNK;
        let is_regular = fmt == libc::S_IFREG;
        let is_dir = fmt == libc::S_IFDIR;

        // Only regular files and symlinks carry bodies, and symlink
        // targets must be path-sized.
        if is_symlink && (header.body_len == 0 || header.body_len > SANE_PATH_MAX) {
            return Ok(());
        }
        if !is_regular && !is_symlink && header.body_len > 0 {
            return Ok(());
        }

        let dest = format!("/{member}");
        let (dir, base) = match self.resolve_archive_parent(&dest)? {
            Some(parent) => parent,
            None => return Ok(()),
        };
        self.clean_path(dir, &base, is_dir)?;

        let times = (header.mtime, header.mtime, header.mtime);
        let (mode, uid, gid) = (header.mode, header.uid, header.gid);

        if is_regular {
            let ino = match links.status(header) {
                LinkStatus::Resolved(real) => {
                    // A later appearance of a hard link: no new inode.
                    self.link_into(dir, &base, real, FileKind::RegFile)?;
                    real
                }
                status => {
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
                    if status == LinkStatus::FirstSeen {
                        links.insert(header, ino);
                    }
                    ino
                }
            };
            if header.body_len > 0 {
                let body = read_body(reader, curr, header.body_len, archive)?;
                self.write_body(ino, &body)?;
            }
        } else if is_symlink {
            let ino =
                self.empty_inode(dir, &base, mode, uid, gid, times, (0, 0), FileKind::Symlink)?;
            let body = read_body(reader, curr, header.body_len, archive)?;
            self.write_body(ino, &body)?;
        } else if is_dir {
            self.make_dir(dir, &base, mode, uid, gid, times)?;
        } else {
            // Specials with nlink >= 2 are skipped, exactly like the
            // kernel's unpacker.
            if links.status(header) != LinkStatus::NotLink {
                return Ok(());
            }
            let kind = match fmt {
                libc::S_IFBLK => FileKind::Blkdev,
                libc::S_IFCHR => FileKind::Chrdev,
                libc::S_IFIFO => FileKind::Fifo,
                _ => FileKind::Sock,
            };
            self.empty_inode(
                dir,
                &base,
                mode,
                uid,
                gid,
                times,
                (header.rdev_major, header.rdev_minor),
                kind,
            )?;
        }
        Ok(())
    }
}

/// Reads a record body of known length.
fn read_body(
    reader: &mut BufReader<File>,
    curr: &mut u64,
    len: u32,
    archive: &Path,
) -> Result<Vec<u8>> {
    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .map_err(Error::io("read", archive))?;
    *curr += u64::from(len);
    Ok(body)
}

/// Seeks forward to the next record header.
fn skip_to(
    reader: &mut BufReader<File>,
    curr: &mut u64,
    next_header: u64,
    archive: &Path,
) -> Result<()> {
    if next_header > *curr {
        reader
            .seek_relative((next_header - *curr) as i64)
            .map_err(Error::io("seek", archive))?;
        *curr = next_header;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_field_alignment() {
        // Header is 110 bytes; the name field must land the body on a
        // 4-byte boundary.
        for name_len in 1..64u32 {
            let total = HEADER_LEN as u64 + name_field_len(name_len);
            assert_eq!(total % 4, 0, "name_len={name_len}");
            assert!(name_field_len(name_len) >= u64::from(name_len));
        }
    }

    #[test]
    fn sanitize_strips_prefixes() {
        assert_eq!(sanitize_name("./bin/ls"), Some("bin/ls"));
        assert_eq!(sanitize_name("/bin/ls"), Some("bin/ls"));
        assert_eq!(sanitize_name("bin/ls"), Some("bin/ls"));
        assert_eq!(sanitize_name("."), None);
        assert_eq!(sanitize_name("/"), None);
        assert_eq!(sanitize_name(""), None);
    }

    fn reg_header(ino: u32, nlink: u32) -> RecordHeader {
        RecordHeader {
            ino,
            nlink,
            dev_major: 8,
            dev_minor: 1,
            mode: libc::S_IFREG | 0o755,
            ..RecordHeader::default()
        }
    }

    #[test]
    fn three_way_hard_links_resolve_to_one_inode() {
        let mut links = LinkTable::default();
        let header = reg_header(42, 3);

        assert_eq!(links.status(&header), LinkStatus::FirstSeen);
        links.insert(&header, 1234);
        assert_eq!(links.status(&header), LinkStatus::Resolved(1234));
        assert_eq!(links.status(&header), LinkStatus::Resolved(1234));

        // Same inode number on a different device is a different file.
        let other_dev = RecordHeader {
            dev_minor: 2,
            ..header
        };
        assert_eq!(links.status(&other_dev), LinkStatus::FirstSeen);

        // nlink == 1 never consults the table.
        assert_eq!(links.status(&reg_header(42, 1)), LinkStatus::NotLink);

        // The trailer clears link identity between concatenated archives.
        links.clear();
        assert_eq!(links.status(&header), LinkStatus::FirstSeen);
    }
}
