//! End-to-end: skeleton archive in, bootable cpio out.

use std::fs;
use std::path::Path;

use husk::{CpioWriter, Writer, build_appliance};

/// Minimal hand-rolled newc record stream: `/etc` and `/etc/hosts`
/// (24-byte body), no trailer padding games.
fn skeleton_bytes() -> Vec<u8> {
    fn record(name: &str, mode: u32, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(
            format!(
                "070701{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}",
                1,
                mode,
                0,
                0,
                1,
                0,
                body.len(),
                0,
                0,
                0,
                0,
                name.len() + 1,
                0
            )
            .as_bytes(),
        );
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(body);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    let mut data = Vec::new();
    data.extend(record("etc", 0o040_755, b""));
    data.extend(record("etc/hosts", 0o100_644, b"127.0.0.1 localhost host\n"));
    data.extend(record("TRAILER!!!", 0, b""));
    while data.len() % 512 != 0 {
        data.push(0);
    }
    data
}

#[test]
fn skeleton_passes_through_byte_identical() {
    // The scanner emits a literal "/lib/modules" entry, so this test
    // needs a host that has one.
    if !Path::new("/lib/modules").is_dir() {
        eprintln!("skipping: host has no /lib/modules");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let skeleton_path = dir.path().join("base.cpio");
    let skeleton = skeleton_bytes();
    fs::write(&skeleton_path, &skeleton).unwrap();

    // An empty module directory: the walk emits just the directory.
    let modpath = dir.path().join("modules");
    fs::create_dir(&modpath).unwrap();

    let out = dir.path().join("initrd");
    let mut writer = CpioWriter::create(&out).unwrap();
    build_appliance(
        &[skeleton_path],
        None,
        &modpath,
        &mut writer as &mut dyn Writer,
    )
    .unwrap();

    let data = fs::read(&out).unwrap();
    // The skeleton is spliced in unchanged at the front...
    assert!(data.starts_with(&skeleton));
    // ...followed by appended entries and a final trailer, padded out.
    assert_eq!(data.len() % 512, 0);
    assert!(data.len() > skeleton.len());
    let appended = &data[skeleton.len()..];
    let text = String::from_utf8_lossy(appended);
    assert!(text.contains("lib/modules"));
    assert!(text.contains("TRAILER!!!"));
}

#[test]
fn empty_directory_input_emits_nothing() {
    if !Path::new("/lib/modules").is_dir() {
        eprintln!("skipping: host has no /lib/modules");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let empty = dir.path().join("inputs");
    fs::create_dir(&empty).unwrap();
    let modpath = dir.path().join("modules");
    fs::create_dir(&modpath).unwrap();

    let out = dir.path().join("initrd");
    let mut writer = CpioWriter::create(&out).unwrap();
    build_appliance(&[empty], None, &modpath, &mut writer as &mut dyn Writer).unwrap();

    let data = fs::read(&out).unwrap();
    // Only /lib/modules, the module-path walk of an empty directory, and
    // the trailer.
    let text = String::from_utf8_lossy(&data);
    assert!(!text.contains("etc"));
    assert!(text.contains("lib/modules"));
}
