//! Build a bootable appliance on the fly from a "supermin" skeleton.
//!
//! A skeleton describes which host files the final appliance must
//! contain, by literal path or by wildcard. This crate resolves those
//! descriptors, assembles a root filesystem image, selects a matching
//! host kernel, and emits artifacts ready to boot under a hypervisor:
//!
//! - a newc cpio archive ([`CpioWriter`]), bootable directly as an
//!   initramfs;
//! - a sparse ext2 image plus a mini-initrd ([`Ext2Writer`]), for
//!   appliances too large to unpack into RAM;
//! - a stable content checksum ([`ChecksumWriter`]), so callers can tell
//!   whether a rebuild would change anything without rebuilding.
//!
//! The input scanner ([`build_appliance`]) drives whichever writer the
//! caller selected; the init program that boots the ext2 appliance lives
//! in the `husk-init` crate and is embedded into the mini-initrd as a
//! data blob.

mod appliance;
mod checksum;
mod cpio;
mod error;
mod ext2;
mod ext2_cpio;
mod initrd;
mod kernel;
mod utils;
mod vercmp;
mod writer;

pub use appliance::build_appliance;
pub use checksum::ChecksumWriter;
pub use cpio::CpioWriter;
pub use error::{Error, Result};
pub use ext2::{DEFAULT_IMAGE_SIZE, Ext2Writer};
pub use kernel::{DEFAULT_KERNEL_DIR, DEFAULT_MODULES_DIR, KernelSelector};
pub use utils::DirCache;
pub use writer::Writer;
