//! Host-kernel selection.
//!
//! Picks the newest installed kernel whose modules exist on disk, makes
//! the chosen image available at the output path (symlink by default,
//! copy on request), and reports the matching module directory.

use std::env;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::utils::{DirCache, filter, filter_fnmatch, filter_not_substring, isdir, isfile};
use crate::vercmp::sort_reverse_version;

/// Directory containing candidate kernels.
pub const DEFAULT_KERNEL_DIR: &str = "/boot";

/// Directory containing per-version module trees.
pub const DEFAULT_MODULES_DIR: &str = "/lib/modules";

/// Environment override naming an exact kernel image.
const KERNEL_ENV: &str = "HUSK_KERNEL";

/// Environment override naming the matching module directory.
const MODULES_ENV: &str = "HUSK_MODULES";

/// Chooses a kernel and the matching module directory.
#[derive(Debug)]
pub struct KernelSelector {
    kernel_dir: PathBuf,
    modules_dir: PathBuf,
    hostcpu: String,
    copy_kernel: bool,
}

impl KernelSelector {
    /// Selector over the standard `/boot` and `/lib/modules`.
    pub fn new(hostcpu: &str, copy_kernel: bool) -> Self {
        Self {
            kernel_dir: PathBuf::from(DEFAULT_KERNEL_DIR),
            modules_dir: PathBuf::from(DEFAULT_MODULES_DIR),
            hostcpu: hostcpu.to_owned(),
            copy_kernel,
        }
    }

    /// Overrides the search directories.
    pub fn with_dirs(mut self, kernel_dir: &Path, modules_dir: &Path) -> Self {
        self.kernel_dir = kernel_dir.to_owned();
        self.modules_dir = modules_dir.to_owned();
        self
    }

    /// Picks a kernel, publishes it at `output` when given, and returns
    /// the module directory path.
    ///
    /// `$HUSK_KERNEL` (and optionally `$HUSK_MODULES`) short-circuit the
    /// search entirely.
    pub fn select(&self, cache: &mut DirCache, output: Option<&Path>) -> Result<PathBuf> {
        if let Some(kernel) = env::var_os(KERNEL_ENV) {
            return self.select_from_env(&PathBuf::from(kernel), output);
        }

        let all = cache.entries(&self.kernel_dir)?;

        // Prefer kernels tagged for this CPU; on x86 accept any i?86 tag.
        let cpu = &self.hostcpu;
        let pattern = if cpu.len() == 4 && cpu.starts_with('i') && cpu.ends_with("86") {
            "vmlinuz-*.i?86*".to_owned()
        } else {
            format!("vmlinuz-*.{cpu}*")
        };

        let mut candidates = self.viable(&all, &pattern)?;
        if candidates.is_empty() {
            // Some distros do not append the arch to the kernel name.
            candidates = self.viable(&all, "vmlinuz-*")?;
        }
        if candidates.is_empty() {
            return Err(Error::NoKernel {
                kernel_dir: self.kernel_dir.clone(),
                modules_dir: self.modules_dir.clone(),
            });
        }

        sort_reverse_version(&mut candidates);
        let chosen = &candidates[0];
        debug!(kernel = %chosen.to_string_lossy(), "picked kernel");

        if let Some(output) = output {
            self.copy_or_symlink(&self.kernel_dir.join(chosen), output)?;
        }
        Ok(self.modpath_for(chosen))
    }

    /// Filters the kernel-directory listing down to bootable candidates.
    fn viable(
        &self,
        names: &[std::ffi::OsString],
        pattern: &str,
    ) -> Result<Vec<std::ffi::OsString>> {
        let matched = filter_fnmatch(names, pattern, libc::FNM_NOESCAPE)?;
        let no_xen = filter_not_substring(&matched, "xen");
        Ok(filter(&no_xen, |name| {
            let modpath = self.modpath_for(name);
            let ok = isdir(&modpath);
            if !ok {
                debug!(
                    kernel = %name.to_string_lossy(),
                    modpath = %modpath.display(),
                    "ignoring kernel without module directory"
                );
            }
            ok
        }))
    }

    /// Kernel selected via environment variables.
    fn select_from_env(&self, kernel: &Path, output: Option<&Path>) -> Result<PathBuf> {
        debug!(kernel = %kernel.display(), "kernel forced by environment");
        if !isfile(kernel) {
            return Err(Error::KernelNotFile {
                path: kernel.to_owned(),
            });
        }

        let modpath = match env::var_os(MODULES_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => {
                let name = kernel.file_name().unwrap_or(kernel.as_os_str());
                if !name.as_bytes().starts_with(b"vmlinuz-") {
                    return Err(Error::NoModpath {
                        kernel: kernel.to_owned(),
                    });
                }
                self.modpath_for(name)
            }
        };

        if !isdir(&modpath) {
            return Err(Error::ModulesNotDir { path: modpath });
        }
        if let Some(output) = output {
            self.copy_or_symlink(kernel, output)?;
        }
        Ok(modpath)
    }

    /// Module directory for a kernel basename: `/lib/modules/<name minus
    /// "vmlinuz-">`, or the version string embedded in the image when
    /// that directory does not exist.
    fn modpath_for(&self, kernel_name: &OsStr) -> PathBuf {
        let rest = kernel_name
            .as_bytes()
            .strip_prefix(b"vmlinuz-")
            .unwrap_or(kernel_name.as_bytes());
        let modpath = self.modules_dir.join(OsStr::from_bytes(rest));
        if isdir(&modpath) {
            return modpath;
        }
        match kernel_version_from_image(&self.kernel_dir.join(kernel_name)) {
            Some(version) => self.modules_dir.join(version),
            None => modpath,
        }
    }

    fn copy_or_symlink(&self, from: &Path, to: &Path) -> Result<()> {
        debug!(
            from = %from.display(),
            to = %to.display(),
            copy = self.copy_kernel,
            "publishing kernel"
        );
        if self.copy_kernel {
            fs::copy(from, to).map_err(Error::io("copy", from))?;
        } else {
            std::os::unix::fs::symlink(from, to).map_err(Error::io("symlink", to))?;
        }
        Ok(())
    }
}

/// Extracts the version string embedded in a Linux/x86 boot image.
///
/// Layout (see the `file(1)` magic database):
/// offset 514 holds the literal `HdrS`, offset 526 a little-endian offset
/// whose target (plus 0x200) is the NUL-terminated version banner; the
/// version proper is its first whitespace-delimited token.
fn kernel_version_from_image(path: &Path) -> Option<String> {
    let mut file = File::open(path).ok()?;

    let mut magic = [0u8; 4];
    file.seek(SeekFrom::Start(514)).ok()?;
    file.read_exact(&mut magic).ok()?;
    if &magic != b"HdrS" {
        return None;
    }
    if read_leshort(&mut file, 518)? < 0x1ff {
        return None;
    }

    let offset = read_leshort(&mut file, 526)?;
    file.seek(SeekFrom::Start(u64::from(offset) + 0x200)).ok()?;
    let mut banner = [0u8; 132];
    let n = file.read(&mut banner).ok()?;

    let banner = &banner[..n];
    let end = banner
        .iter()
        .position(|&b| b == 0 || b == b' ' || b == b'\t' || b == b'\n')
        .unwrap_or(banner.len());
    if end == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&banner[..end]).into_owned())
}

/// Reads an unsigned little-endian short at `offset`.
fn read_leshort(file: &mut File, offset: u64) -> Option<u16> {
    let mut buf = [0u8; 2];
    file.seek(SeekFrom::Start(offset)).ok()?;
    file.read_exact(&mut buf).ok()?;
    Some(u16::from_le_bytes(buf))
}
