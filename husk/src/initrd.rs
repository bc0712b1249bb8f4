//! The mini-initrd: just enough to insmod our way to an ext2 root.
//!
//! The ext2 appliance cannot be mounted until the drivers for its block
//! device are loaded, so the builder packs a tiny cpio holding the init
//! program, the boot-critical kernel modules, and a `modules` manifest
//! fixing their load order.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::DfsPostOrder;
use tracing::{debug, warn};

use crate::cpio::archive_dir;
use crate::error::{Error, Result};
use crate::utils::{fnmatch, load_file};

/// Module wildcards considered for the mini-initrd: only what is needed
/// to find a device with an ext2 filesystem on it.
const BOOT_MODULE_PATTERNS: &[&str] = &[
    "ext2.ko*",
    "ext4.ko*", // CONFIG_EXT4_USE_FOR_EXT23=y might be set
    "virtio*.ko*",
    "ide*.ko*",
    "libata*.ko*",
    "piix*.ko*",
    "scsi_transport_spi.ko*",
    "scsi_mod.ko*",
    "sd_mod.ko*",
    "sym53c8xx.ko*",
    "ata_piix.ko*",
    "sr_mod.ko*",
    "mbcache.ko*",
    "crc*.ko*",
    "libcrc*.ko*",
    "ibmvscsic.ko*",
];

/// The module dependency graph read from `modules.dep`.
///
/// A synthetic root node depends on every boot-critical module; a
/// post-order walk from it yields a valid load order (dependency before
/// dependent). Nodes are marked at discovery, so a cycle (never expected
/// in a real `modules.dep`) cannot hang the traversal.
#[derive(Debug)]
pub(crate) struct ModuleGraph {
    graph: DiGraph<String, ()>,
    root: NodeIndex,
}

impl ModuleGraph {
    /// Parses `modules.dep` lines (`name: dep1 dep2 ...`).
    pub(crate) fn parse(lines: &[String]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index: HashMap<String, NodeIndex> = HashMap::new();
        let root = graph.add_node(String::new());

        let mut node = |graph: &mut DiGraph<String, ()>, name: &str| {
            *index
                .entry(name.to_owned())
                .or_insert_with(|| graph.add_node(name.to_owned()))
        };

        for line in lines {
            let (name, deps) = match line.split_once(':') {
                Some(split) => split,
                None => continue,
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let from = node(&mut graph, name);
            for dep in deps.split_whitespace() {
                let to = node(&mut graph, dep);
                graph.update_edge(from, to, ());
            }
        }

        // Wire the synthetic root to every module whose basename matches
        // a boot-critical pattern.
        for target in graph.node_indices().collect::<Vec<_>>() {
            if target == root {
                continue;
            }
            let name = graph[target].clone();
            let base = basename(&name);
            for pattern in BOOT_MODULE_PATTERNS {
                if fnmatch(pattern, OsStr::new(base), libc::FNM_PATHNAME)? {
                    debug!(module = %name, pattern, "boot-critical module");
                    graph.update_edge(root, target, ());
                    break;
                }
            }
        }

        Ok(Self { graph, root })
    }

    /// Module paths in load order: every dependency precedes its
    /// dependents.
    pub(crate) fn load_order(&self) -> Vec<&str> {
        let mut order = Vec::new();
        let mut dfs = DfsPostOrder::new(&self.graph, self.root);
        while let Some(node) = dfs.next(&self.graph) {
            if node != self.root {
                order.push(self.graph[node].as_str());
            }
        }
        order
    }
}

/// Last path component of a `modules.dep` module name.
fn basename(name: &str) -> &str {
    name.rsplit_once('/').map_or(name, |(_, b)| b)
}

/// Builds the mini-initrd at `initrd`: boot-critical modules from
/// `modpath`, a `modules` manifest in load order, and `init` (the program
/// bytes in `init_bin`) at the archive root.
pub fn build(modpath: &Path, initrd: &Path, init_bin: &[u8]) -> Result<()> {
    let deps_path = modpath.join("modules.dep");
    let graph = ModuleGraph::parse(&load_file(&deps_path)?)?;
    let order = graph.load_order();
    debug!(modules = order.len(), initrd = %initrd.display(), "building mini-initrd");

    let scratch = tempfile::Builder::new()
        .prefix("husk-initrd.")
        .tempdir()
        .map_err(Error::io("mkdtemp", std::env::temp_dir()))?;

    let manifest_path = scratch.path().join("modules");
    let mut manifest = fs::File::create(&manifest_path)
        .map_err(Error::io("open", &manifest_path))?;

    for module in &order {
        let base = basename(module);
        let src = modpath.join(module);
        // modules.dep can name modules that were never installed; the
        // init skips manifest entries it cannot read, so follow suit here
        // rather than failing the build.
        if let Err(err) = fs::copy(&src, scratch.path().join(base)) {
            warn!(module = %src.display(), %err, "cannot copy module into mini-initrd");
        }
        writeln!(manifest, "{base}").map_err(Error::io("write", &manifest_path))?;
    }
    drop(manifest);

    // The init program, shipped as a data blob.
    let init_path = scratch.path().join("init");
    let mut init = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o755)
        .open(&init_path)
        .map_err(Error::io("open", &init_path))?;
    init.write_all(init_bin)
        .map_err(Error::io("write", &init_path))?;
    drop(init);

    archive_dir(scratch.path(), initrd)
    // scratch is removed recursively on drop.
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_owned).collect()
    }

    #[test]
    fn dependencies_precede_dependents() {
        let graph = ModuleGraph::parse(&lines(
            "kernel/drivers/block/virtio_blk.ko: kernel/drivers/virtio/virtio.ko kernel/drivers/virtio/virtio_ring.ko\n\
             kernel/drivers/virtio/virtio.ko:\n\
             kernel/drivers/virtio/virtio_ring.ko: kernel/drivers/virtio/virtio.ko\n\
             kernel/fs/nfs/nfs.ko: kernel/net/sunrpc/sunrpc.ko\n",
        ))
        .unwrap();

        let order = graph.load_order();
        let pos = |name: &str| {
            order
                .iter()
                .position(|m| basename(m) == name)
                .unwrap_or_else(|| panic!("{name} missing from {order:?}"))
        };

        assert!(pos("virtio.ko") < pos("virtio_blk.ko"));
        assert!(pos("virtio_ring.ko") < pos("virtio_blk.ko"));
        assert!(pos("virtio.ko") < pos("virtio_ring.ko"));
        // nfs is not boot-critical and unreachable from the root.
        assert!(!order.iter().any(|m| basename(m) == "nfs.ko"));
    }

    #[test]
    fn cycles_do_not_hang() {
        let graph = ModuleGraph::parse(&lines(
            "ext2.ko: a.ko\n\
             a.ko: b.ko\n\
             b.ko: a.ko\n",
        ))
        .unwrap();

        let order = graph.load_order();
        assert_eq!(order.len(), 3);
        let pos = |name: &str| order.iter().position(|m| *m == name).unwrap();
        assert!(pos("ext2.ko") > pos("a.ko"));
        assert!(pos("ext2.ko") > pos("b.ko"));
    }

    #[test]
    fn compressed_module_names_match() {
        let graph = ModuleGraph::parse(&lines(
            "kernel/fs/ext4/ext4.ko.xz: kernel/fs/mbcache.ko.xz\n\
             kernel/fs/mbcache.ko.xz:\n",
        ))
        .unwrap();
        let order = graph.load_order();
        assert_eq!(order.len(), 2);
        assert_eq!(basename(order[1]), "ext4.ko.xz");
    }

    #[test]
    fn builds_archive_with_manifest_and_init() {
        let dir = tempfile::tempdir().unwrap();
        let modpath = dir.path().join("modules");
        fs::create_dir(&modpath).unwrap();
        fs::create_dir_all(modpath.join("kernel/fs/ext2")).unwrap();
        fs::write(modpath.join("kernel/fs/ext2/ext2.ko"), b"module").unwrap();
        fs::write(
            modpath.join("modules.dep"),
            "kernel/fs/ext2/ext2.ko:\nkernel/fs/missing.ko:\n",
        )
        .unwrap();

        let initrd = dir.path().join("initrd");
        build(&modpath, &initrd, b"#!init").unwrap();

        let data = fs::read(&initrd).unwrap();
        assert!(data.starts_with(b"070701"));
        assert_eq!(data.len() % 512, 0);
        let text = String::from_utf8_lossy(&data);
        assert!(text.contains("ext2.ko"));
        assert!(text.contains("init"));
        assert!(text.contains("TRAILER!!!"));
    }
}
