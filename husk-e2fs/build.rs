//! Build script for husk-e2fs.
//!
//! Configures dynamic linking against the system `libext2fs` (e2fsprogs).
//!
//! # Environment variables
//!
//! - `HUSK_E2FS_LIB_DIR`: extra directory to search for `libext2fs.so`.
//!   Useful when e2fsprogs is installed in a non-default prefix.

// Build scripts legitimately use expect/panic for unrecoverable failures.
#![allow(clippy::expect_used, missing_docs)]

use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=HUSK_E2FS_LIB_DIR");

    // docs.rs: no native libs available, and none are needed to build docs.
    if env::var("DOCS_RS").is_ok() {
        return;
    }

    if let Ok(dir) = env::var("HUSK_E2FS_LIB_DIR") {
        println!("cargo:rustc-link-search=native={dir}");
    }
    println!("cargo:rustc-link-lib=dylib=ext2fs");
    println!("cargo:rustc-link-lib=dylib=com_err");
}
