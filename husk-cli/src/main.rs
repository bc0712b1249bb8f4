//! CLI for the husk appliance builder.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use husk::{
    ChecksumWriter, CpioWriter, DEFAULT_IMAGE_SIZE, DirCache, Ext2Writer, KernelSelector, Writer,
    build_appliance,
};
use tracing::info;

/// Default location of the init program embedded into the ext2
/// mini-initrd; `$HUSK_INIT` or `--init-binary` override it.
const DEFAULT_INIT_BINARY: &str = "/usr/libexec/husk-init";

#[derive(Parser)]
#[command(
    name = "husk",
    version,
    about = "Build a bootable appliance on the fly from a supermin skeleton"
)]
struct Cli {
    /// Output format.
    #[arg(short = 'f', long, value_enum, default_value = "cpio")]
    format: Format,

    /// Write outputs as <DIR>/kernel, <DIR>/initrd, <DIR>/appliance.
    #[arg(short = 'o', long = "output-dir", value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Write the kernel to this path (overrides -o).
    #[arg(long, value_name = "PATH")]
    output_kernel: Option<PathBuf>,

    /// Write the initrd to this path (overrides -o).
    #[arg(long, value_name = "PATH")]
    output_initrd: Option<PathBuf>,

    /// Write the ext2 appliance image to this path (overrides -o).
    #[arg(long, value_name = "PATH")]
    output_appliance: Option<PathBuf>,

    /// Kernel module whitelist: shell patterns, one per line.
    #[arg(short = 'k', long, value_name = "FILE")]
    kmods: Option<PathBuf>,

    /// Host CPU type used to match kernel names.
    #[arg(long, default_value = std::env::consts::ARCH)]
    host_cpu: String,

    /// Copy the chosen kernel instead of symlinking to it.
    #[arg(long)]
    copy_kernel: bool,

    /// Init program embedded into the ext2 mini-initrd.
    #[arg(long, env = "HUSK_INIT", default_value = DEFAULT_INIT_BINARY, value_name = "PATH")]
    init_binary: PathBuf,

    /// More log output (repeat for more).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Skeleton archives, hostfiles lists, or directories of either.
    #[arg(required = true, value_name = "INPUT")]
    inputs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// A single newc cpio initramfs.
    Cpio,
    /// A sparse ext2 image plus a mini-initrd.
    Ext2,
    /// A SHA-256 fingerprint of what a build would contain.
    Checksum,
}

/// Resolved output paths; `None` when the format does not produce that
/// artifact.
struct Outputs {
    kernel: Option<PathBuf>,
    initrd: Option<PathBuf>,
    appliance: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = cli.run() {
        eprintln!("husk: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default = match verbose {
        0 => "husk=info,husk_cli=info",
        1 => "husk=debug,husk_cli=debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

impl Cli {
    fn run(self) -> Result<()> {
        let outputs = self.resolve_outputs()?;

        // Stale artifacts must never survive a failed build.
        for path in [&outputs.kernel, &outputs.initrd, &outputs.appliance]
            .into_iter()
            .flatten()
        {
            let _ = fs::remove_file(path);
        }

        let mut cache = DirCache::new();
        let selector = KernelSelector::new(&self.host_cpu, self.copy_kernel);
        let modpath = selector
            .select(&mut cache, outputs.kernel.as_deref())
            .context("selecting a kernel")?;
        info!(modpath = %modpath.display(), "selected kernel modules");

        let mut writer: Box<dyn Writer> = match self.format {
            Format::Cpio => {
                let initrd = outputs.initrd.as_deref().context("initrd output path")?;
                Box::new(CpioWriter::create(initrd)?)
            }
            Format::Ext2 => {
                let initrd = outputs.initrd.as_deref().context("initrd output path")?;
                let appliance = outputs
                    .appliance
                    .as_deref()
                    .context("appliance output path")?;
                let init_bin = fs::read(&self.init_binary).with_context(|| {
                    format!("reading init program {}", self.init_binary.display())
                })?;
                Box::new(Ext2Writer::create(
                    appliance,
                    initrd,
                    &modpath,
                    &init_bin,
                    DEFAULT_IMAGE_SIZE,
                    self.verbose >= 2,
                )?)
            }
            Format::Checksum => Box::new(ChecksumWriter::new(
                &self.host_cpu,
                &modpath,
                Box::new(std::io::stdout()),
            )),
        };

        build_appliance(
            &self.inputs,
            self.kmods.as_deref(),
            &modpath,
            writer.as_mut(),
        )?;
        info!("appliance complete");
        Ok(())
    }

    fn resolve_outputs(&self) -> Result<Outputs> {
        let (kernel, initrd, appliance) = match self.format {
            Format::Cpio => (true, true, false),
            Format::Ext2 => (true, true, true),
            Format::Checksum => (false, false, false),
        };
        Ok(Outputs {
            kernel: self
                .output_path(kernel, self.output_kernel.as_deref(), "kernel")?,
            initrd: self
                .output_path(initrd, self.output_initrd.as_deref(), "initrd")?,
            appliance: self.output_path(
                appliance,
                self.output_appliance.as_deref(),
                "appliance",
            )?,
        })
    }

    fn output_path(
        &self,
        needed: bool,
        explicit: Option<&Path>,
        name: &str,
    ) -> Result<Option<PathBuf>> {
        if !needed {
            return Ok(None);
        }
        if let Some(path) = explicit {
            return Ok(Some(path.to_owned()));
        }
        match &self.output_dir {
            Some(dir) => Ok(Some(dir.join(name))),
            None => bail!("no {name} output path: use -o <dir> or --output-{name}"),
        }
    }
}
