use clap::Parser;
use env_logger::Env;
use ion_image::{ImageOptions, SystemHost, assemble};
use log::{LevelFilter, error};
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

/// Assemble a bootable GPT/FAT32 disk image for the Ion bootloader.
///
/// Needs root for losetup and mount.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// UEFI bootloader executable, installed as /EFI/BOOT/BOOTX64.EFI.
    #[arg(long)]
    bootloader: PathBuf,
    /// Kernel ELF, installed under --kernel-dir.
    #[arg(long)]
    kernel: PathBuf,
    /// Boot configuration; a single-entry one is generated if omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(short, long, default_value = "ion.img")]
    output: PathBuf,
    #[arg(long, default_value_t = ImageOptions::DEFAULT_SIZE / (1024 * 1024))]
    size_mib: u64,
    #[arg(long, default_value_t = ImageOptions::DEFAULT_FIRST_SECTOR)]
    first_sector: u64,
    /// File name of the configuration in the partition root.
    #[arg(long, default_value = "ion.cfg")]
    config_name: String,
    #[arg(long, default_value = "boot")]
    kernel_dir: String,
    /// Mount point used while copying files (default: <output>.mnt).
    #[arg(long)]
    mount_dir: Option<PathBuf>,
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn options(self) -> ImageOptions {
        let mut opts = ImageOptions::new(self.bootloader, self.kernel, self.output);
        opts.config = self.config;
        opts.size = self.size_mib * 1024 * 1024;
        opts.first_sector = self.first_sector;
        opts.config_name = self.config_name;
        opts.kernel_dir = self.kernel_dir;
        opts.mount_dir = self.mount_dir;
        opts
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    if cli.verbose {
        logger.filter_level(LevelFilter::Debug);
    }
    logger.init();

    match assemble(&SystemHost, &cli.options()) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            let mut source = e.source();
            while let Some(cause) = source {
                error!("  caused by: {cause}");
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}
