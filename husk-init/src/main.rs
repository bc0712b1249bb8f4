//! husk-init: PID 1 of the mini-initrd that boots the ext2 appliance.
//!
//! There is no shell in the mini-initrd, so everything happens in this
//! one program: load the kernel modules listed in `/modules` (order was
//! fixed at build time), find the root block device, mount it, reclaim
//! the initramfs memory, and chroot into the appliance's own `/init`.
#![allow(unsafe_code, clippy::print_stderr)]

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("husk-init only runs inside a Linux initramfs");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
fn main() {
    if let Err(e) = boot::run() {
        eprintln!("husk-init: fatal: {e}");
        std::process::exit(1);
    }
}

#[cfg(target_os = "linux")]
mod boot {
    use std::fs::{self, File};
    use std::io::{self, BufRead, BufReader};
    use std::os::unix::fs::{FileExt, MetadataExt};
    use std::os::unix::process::CommandExt;
    use std::process::Command;
    use std::time::Duration;

    use nix::mount::{MsFlags, mount, umount};
    use nix::sys::stat::{Mode, SFlag, makedev, mknod};
    use nix::unistd::chroot;

    /// Maximum time to wait for the root device (seconds). Slow machines
    /// with hundreds of disks really can take minutes. The actual wait
    /// is roughly double: the delay doubles until it reaches this cap.
    const MAX_ROOT_WAIT: u64 = 300;

    /// Byte offset of the filesystem UUID inside the image: the ext2
    /// superblock starts at 1024 and holds `s_uuid` at offset 0x68.
    const SUPERBLOCK_UUID_OFFSET: u64 = 0x468;

    /// How the kernel command line names the root filesystem.
    #[derive(Debug, PartialEq, Eq)]
    enum RootSpec {
        /// `root=/dev/<name>`: a block device name under `/sys/block`.
        Device(String),
        /// `root=UUID=<uuid>`: search every block device's superblock.
        Uuid([u8; 16]),
    }

    /// Entry point: returns only on failure.
    pub(crate) fn run() -> io::Result<()> {
        mount_proc();
        eprintln!("husk-init: ext2 mini initrd starting up: {}", env!("CARGO_PKG_VERSION"));

        let cmdline = read_cmdline();
        let quiet = cmdline.split_whitespace().any(|w| w == "quiet");
        if !quiet {
            eprintln!("husk-init: cmdline: {cmdline}");
            print_uptime();
        }

        for dir in ["/dev", "/root", "/sys"] {
            let _ = fs::create_dir(dir);
        }

        if !quiet {
            eprintln!("husk-init: mounting /sys");
        }
        mount(
            Some("sysfs"),
            "/sys",
            Some("sysfs"),
            MsFlags::empty(),
            None::<&str>,
        )
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("mount /sys: {e}")))?;

        load_modules(quiet)?;

        let spec = parse_root_spec(&cmdline);
        let dax = matches!(&spec, Some(RootSpec::Device(name)) if name.starts_with("pmem"));
        let (major, minor) = find_root(spec, quiet)?;

        umount("/sys").map_err(|e| io::Error::new(io::ErrorKind::Other, format!("umount /sys: {e}")))?;

        if !quiet {
            eprintln!("husk-init: creating /dev/root as block special {major}:{minor}");
        }
        mknod(
            "/dev/root",
            SFlag::S_IFBLK,
            Mode::from_bits_truncate(0o700),
            makedev(u64::from(major), u64::from(minor)),
        )
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("mknod /dev/root: {e}")))?;

        let options = if dax { "dax" } else { "" };
        if !quiet {
            eprintln!("husk-init: mounting new root on /root ({options})");
        }
        mount(
            Some("/dev/root"),
            "/root",
            Some("ext2"),
            MsFlags::MS_NOATIME,
            Some(options),
        )
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("mount /root: {e}")))?;

        if !quiet {
            eprintln!("husk-init: deleting initramfs files");
        }
        delete_initramfs_files();

        // pivot_root does not work from an initramfs; chroot does.
        if !quiet {
            eprintln!("husk-init: chroot");
        }
        chroot("/root")
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("chroot /root: {e}")))?;
        std::env::set_current_dir("/")?;

        let err = Command::new("/init").arg0("init").exec();
        eprintln!("husk-init: execl /init: {err}");

        // The appliance's own init failed to start; dump enough state
        // for a post-mortem before giving up.
        for dir in ["/", "/bin", "/lib", "/lib64"] {
            show_directory(dir);
        }
        Err(err)
    }

    /// Mounts `/proc` unless something already did.
    fn mount_proc() {
        if fs::metadata("/proc/uptime").is_ok() {
            return;
        }
        let _ = fs::create_dir("/proc");
        if let Err(e) = mount(
            Some("proc"),
            "/proc",
            Some("proc"),
            MsFlags::empty(),
            None::<&str>,
        ) {
            // Non-fatal: only the uptime banner suffers.
            eprintln!("husk-init: mount /proc: {e}");
        }
    }

    fn print_uptime() {
        if let Ok(uptime) = fs::read_to_string("/proc/uptime") {
            eprint!("husk-init: uptime: {uptime}");
        }
    }

    fn read_cmdline() -> String {
        match fs::read_to_string("/proc/cmdline") {
            Ok(s) => s.trim_end_matches('\n').to_owned(),
            Err(e) => {
                eprintln!("husk-init: /proc/cmdline: {e}");
                String::new()
            }
        }
    }

    /// Loads every module listed in `/modules`, in the order the initrd
    /// builder fixed. The manifest can name modules that were never
    /// installed; those are skipped with a warning.
    fn load_modules(quiet: bool) -> io::Result<()> {
        let manifest = File::open("/modules").map_err(|e| {
            io::Error::new(io::ErrorKind::NotFound, format!("open /modules: {e}"))
        })?;
        for line in BufReader::new(manifest).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            if fs::metadata(format!("/{line}")).is_ok() {
                insmod(&format!("/{line}"), quiet);
            } else {
                eprintln!("husk-init: skipped {line}, module is missing");
            }
        }
        Ok(())
    }

    /// Loads one module image with the `init_module` syscall. Failures
    /// are reported but tolerated: a module may merely lack its device.
    fn insmod(path: &str, quiet: bool) {
        if !quiet {
            eprintln!("husk-init: insmod {path}");
        }
        let image = match fs::read(path) {
            Ok(image) => image,
            Err(e) => {
                eprintln!("husk-init: insmod: read {path}: {e}");
                return;
            }
        };
        // SAFETY: the buffer outlives the call; params is a valid empty
        // C string.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_init_module,
                image.as_ptr(),
                image.len() as libc::c_ulong,
                c"".as_ptr(),
            )
        };
        if ret != 0 {
            let errno = io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or_default();
            eprintln!("husk-init: insmod {path}: {}", moderror(errno));
        }
    }

    /// Error-string translation as done by module-init-tools' insmod.
    fn moderror(errno: i32) -> &'static str {
        match errno {
            libc::ENOEXEC => "Invalid module format",
            libc::ENOENT => "Unknown symbol in module",
            libc::ESRCH => "Module has wrong symbol version",
            libc::EINVAL => "Invalid parameters",
            _ => "Unknown error loading module",
        }
    }

    /// Picks the `root=` directive out of the kernel command line.
    fn parse_root_spec(cmdline: &str) -> Option<RootSpec> {
        let value = cmdline
            .split_whitespace()
            .find_map(|word| word.strip_prefix("root="))?;
        if let Some(uuid) = value.strip_prefix("UUID=") {
            return parse_uuid(uuid).map(RootSpec::Uuid);
        }
        let name = value.strip_prefix("/dev/").unwrap_or(value);
        Some(RootSpec::Device(name.to_owned()))
    }

    /// Parses a filesystem UUID into raw bytes. Hyphens are accepted
    /// anywhere; exactly 32 hex digits must remain.
    fn parse_uuid(text: &str) -> Option<[u8; 16]> {
        let mut nybbles = Vec::with_capacity(32);
        for c in text.chars() {
            if c == '-' {
                continue;
            }
            nybbles.push(c.to_digit(16)? as u8);
        }
        if nybbles.len() != 32 {
            return None;
        }
        let mut uuid = [0u8; 16];
        for (i, pair) in nybbles.chunks_exact(2).enumerate() {
            uuid[i] = (pair[0] << 4) | pair[1];
        }
        Some(uuid)
    }

    /// Parses a sysfs `dev` file (`"major:minor\n"`).
    fn parse_devnum(text: &str) -> Option<(u32, u32)> {
        let (major, minor) = text.trim_end().split_once(':')?;
        Some((major.parse().ok()?, minor.parse().ok()?))
    }

    /// Resolves the root device to `(major, minor)`.
    ///
    /// With a spec from the command line, polls with exponentially
    /// doubling delay (devices appear asynchronously after their driver
    /// loads). With none, falls back to a one-shot probe of the usual
    /// virtio/scsi/ide device names.
    fn find_root(spec: Option<RootSpec>, quiet: bool) -> io::Result<(u32, u32)> {
        match spec {
            Some(spec) => {
                let mut delay_ns: u64 = 250_000;
                let mut hinted = false;
                while delay_ns <= MAX_ROOT_WAIT * 1_000_000_000 {
                    if let Some(found) = try_root(&spec, quiet) {
                        return Ok(found);
                    }
                    if delay_ns > 1_000_000_000 {
                        eprintln!("husk-init: waiting another {delay_ns} ns for the root device");
                        if !hinted {
                            eprintln!(
                                "This usually means your kernel does not support virtio, or \
                                 some kernel modules failed to load (see messages above)."
                            );
                            hinted = true;
                        }
                    }
                    std::thread::sleep(Duration::from_nanos(delay_ns));
                    delay_ns *= 2;
                }
                Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "no ext2 root device found (timed out)",
                ))
            }
            None => probe_blocks(quiet).ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "no ext2 root device found")
            }),
        }
    }

    /// One resolution attempt for a command-line root spec.
    fn try_root(spec: &RootSpec, quiet: bool) -> Option<(u32, u32)> {
        match spec {
            RootSpec::Device(name) => {
                let path = format!("/sys/block/{name}/dev");
                let devnum = parse_devnum(&fs::read_to_string(&path).ok()?)?;
                if !quiet {
                    eprintln!("husk-init: picked {path} as root device");
                }
                Some(devnum)
            }
            RootSpec::Uuid(target) => scan_for_uuid(target, quiet),
        }
    }

    /// Scans every block device for a superblock UUID matching `target`.
    fn scan_for_uuid(target: &[u8; 16], quiet: bool) -> Option<(u32, u32)> {
        for entry in fs::read_dir("/sys/block").ok()?.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let text = match fs::read_to_string(format!("/sys/block/{name}/dev")) {
                Ok(text) => text,
                Err(_) => continue,
            };
            let Some((major, minor)) = parse_devnum(&text) else {
                continue;
            };
            if let Some(uuid) = read_device_uuid(&name, major, minor)
                && uuid == *target
            {
                if !quiet {
                    eprintln!("husk-init: {name} carries the requested root UUID");
                }
                return Some((major, minor));
            }
        }
        None
    }

    /// Reads the 16 UUID bytes from a device's superblock, through a
    /// short-lived node under `/dev`. A fresh per-device name is used so
    /// a failed open never leaves a stale node behind for the next
    /// iteration.
    fn read_device_uuid(name: &str, major: u32, minor: u32) -> Option<[u8; 16]> {
        let node = format!("/dev/disk-{name}");
        mknod(
            node.as_str(),
            SFlag::S_IFBLK,
            Mode::from_bits_truncate(0o700),
            makedev(u64::from(major), u64::from(minor)),
        )
        .ok()?;

        let uuid = File::open(&node).ok().and_then(|file| {
            let mut buf = [0u8; 16];
            file.read_exact_at(&mut buf, SUPERBLOCK_UUID_OFFSET).ok()?;
            Some(buf)
        });
        let _ = fs::remove_file(&node);
        uuid
    }

    /// One-shot sysfs probe when the command line does not name a root:
    /// virtio, scsi and ide disks, highest letter first.
    fn probe_blocks(quiet: bool) -> Option<(u32, u32)> {
        for class in ['v', 's', 'h'] {
            for letter in ('a'..='z').rev() {
                let path = format!("/sys/block/{class}d{letter}/dev");
                if let Ok(text) = fs::read_to_string(&path)
                    && let Some(devnum) = parse_devnum(&text)
                {
                    if !quiet {
                        eprintln!("husk-init: picked {path} as root device");
                    }
                    return Some(devnum);
                }
            }
        }
        None
    }

    /// Unlinks the regular files in `/` to give their memory back before
    /// the chroot. Directories stay: they cost almost nothing and some
    /// are mountpoints, `/root` included.
    fn delete_initramfs_files() {
        let entries = match fs::read_dir("/") {
            Ok(entries) => entries,
            Err(e) => {
                eprintln!("husk-init: opendir /: {e}");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if let Ok(meta) = fs::symlink_metadata(&path)
                && meta.is_file()
                && let Err(e) = fs::remove_file(&path)
            {
                eprintln!("husk-init: unlink {}: {e}", path.display());
            }
        }
    }

    /// Post-mortem helper: lists a directory to stderr.
    fn show_directory(dir: &str) {
        eprintln!("husk-init: debug: listing directory {dir}");
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                eprintln!("  {dir}: {e}");
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            match fs::symlink_metadata(entry.path()) {
                Ok(meta) => {
                    eprint!(
                        "  {:>8} {:o} {:>9} {}:{} {}",
                        meta.ino(),
                        meta.mode(),
                        meta.size(),
                        meta.uid(),
                        meta.gid(),
                        name.to_string_lossy()
                    );
                    if meta.file_type().is_symlink() {
                        if let Ok(target) = fs::read_link(entry.path()) {
                            eprint!(" -> {}", target.display());
                        }
                    }
                    eprintln!();
                }
                Err(e) => eprintln!("  ? {} ({e})", name.to_string_lossy()),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn root_device_specs() {
            assert_eq!(
                parse_root_spec("console=ttyS0 root=/dev/vda quiet"),
                Some(RootSpec::Device("vda".to_owned()))
            );
            assert_eq!(
                parse_root_spec("root=sdb"),
                Some(RootSpec::Device("sdb".to_owned()))
            );
            assert_eq!(parse_root_spec("console=ttyS0 quiet"), None);
        }

        #[test]
        fn uuid_specs_accept_hyphens_anywhere() {
            let spec = parse_root_spec("root=UUID=01234567-89ab-cdef-0123-456789abcdef");
            let Some(RootSpec::Uuid(uuid)) = spec else {
                panic!("expected a UUID spec, got {spec:?}");
            };
            assert_eq!(uuid[0], 0x01);
            assert_eq!(uuid[15], 0xef);

            // Unhyphenated and oddly hyphenated forms parse identically.
            assert_eq!(
                parse_uuid("0123456789abcdef0123456789abcdef"),
                parse_uuid("01-23-45-67-89abcdef0123456789abcdef")
            );

            assert_eq!(parse_uuid("not-a-uuid"), None);
            assert_eq!(parse_uuid("0123"), None);
        }

        #[test]
        fn devnum_lines() {
            assert_eq!(parse_devnum("8:1\n"), Some((8, 1)));
            assert_eq!(parse_devnum("253:0"), Some((253, 0)));
            assert_eq!(parse_devnum("garbage"), None);
        }

        #[test]
        fn pmem_root_implies_dax() {
            let spec = parse_root_spec("root=/dev/pmem0");
            assert!(matches!(&spec, Some(RootSpec::Device(n)) if n.starts_with("pmem")));
        }
    }
}
