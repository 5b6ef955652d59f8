//! # Ion Disk Image Assembler
//!
//! Turns a bootloader executable, a kernel ELF and a boot configuration into a
//! GPT disk image with a single FAT32 EFI system partition:
//!
//! ```text
//! sector 0      GPT header + table
//! sector 2048   ESP (FAT32, label ION)
//!                 /EFI/BOOT/BOOTX64.EFI   bootloader
//!                 /ion.cfg                configuration
//!                 /boot/<kernel>          kernel
//! last 33       backup GPT
//! ```
//!
//! Partitioning and formatting are delegated to `sgdisk`, `losetup`,
//! `mkfs.fat` and `mount`, all reached through [`Host`].

mod guards;
mod host;

pub use guards::{LoopDevice, Mount, PartialImage};
pub use host::{Host, SystemHost};

use ion_boot::config::{ConfigError, IonConfig};
use ion_layout::{LayoutError, verify_elf};
use log::{info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const SECTOR_SIZE: u64 = 512;

/// Sectors taken by the backup GPT header and table at the end of the disk.
const BACKUP_GPT_SECTORS: u64 = 33;

/// Fixed identifiers so two runs over the same inputs yield the same table.
pub const DISK_GUID: &str = "49d3e1a6-0c3f-4b5e-9a57-6f6e5f2e1d01";
pub const PARTITION_GUID: &str = "49d3e1a6-0c3f-4b5e-9a57-6f6e5f2e1d02";
pub const VOLUME_ID: &str = "494f4e31";
pub const VOLUME_LABEL: &str = "ION";

/// GPT type code for an EFI system partition.
const ESP_TYPE: &str = "ef00";

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Could not run {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} failed ({}): {stderr}", exit_status(.code))]
    Tool {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("Kernel does not match the Ion layout")]
    Layout(#[from] LayoutError),
    #[error("Invalid boot configuration")]
    Config(#[from] ConfigError),
    #[error("{0}: configuration is not UTF-8")]
    ConfigEncoding(PathBuf),
    #[error("Image of {size} bytes is too small for the partition layout")]
    TooSmall { size: u64 },
    #[error("losetup did not report a loop device")]
    NoLoopDevice,
}

#[allow(clippy::ref_option)]
fn exit_status(code: &Option<i32>) -> String {
    code.map_or_else(|| "killed by signal".to_owned(), |c| format!("exit code {c}"))
}

impl ImageError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_owned(),
            source,
        }
    }
}

/// Inputs and geometry of one image.
#[derive(Debug, Clone)]
pub struct ImageOptions {
    pub bootloader: PathBuf,
    pub kernel: PathBuf,
    /// Configuration file to install; a single entry booting the kernel is
    /// generated when `None`.
    pub config: Option<PathBuf>,
    pub output: PathBuf,
    /// Total image size in bytes.
    pub size: u64,
    /// First sector of the EFI system partition.
    pub first_sector: u64,
    /// Name of the configuration file in the partition root.
    pub config_name: String,
    /// Directory in the partition the kernel is copied to.
    pub kernel_dir: String,
    /// Where the partition is mounted while files are copied; `<output>.mnt`
    /// when `None`.
    pub mount_dir: Option<PathBuf>,
}

impl ImageOptions {
    pub const DEFAULT_SIZE: u64 = 64 * 1024 * 1024;
    pub const DEFAULT_FIRST_SECTOR: u64 = 2048;

    #[must_use]
    pub fn new(bootloader: PathBuf, kernel: PathBuf, output: PathBuf) -> Self {
        Self {
            bootloader,
            kernel,
            config: None,
            output,
            size: Self::DEFAULT_SIZE,
            first_sector: Self::DEFAULT_FIRST_SECTOR,
            config_name: "ion.cfg".to_owned(),
            kernel_dir: "boot".to_owned(),
            mount_dir: None,
        }
    }

    fn mount_dir(&self) -> PathBuf {
        self.mount_dir.clone().unwrap_or_else(|| {
            let mut name = self.output.as_os_str().to_owned();
            name.push(".mnt");
            PathBuf::from(name)
        })
    }

    /// Last usable sector of the partition (inclusive).
    fn last_sector(&self) -> Result<u64, ImageError> {
        let sectors = self.size / SECTOR_SIZE;
        sectors
            .checked_sub(BACKUP_GPT_SECTORS + 1)
            .filter(|&last| last > self.first_sector)
            .ok_or(ImageError::TooSmall { size: self.size })
    }
}

/// The configuration installed when none is given.
#[must_use]
pub fn default_config(kernel_dir: &str, kernel_name: &str) -> String {
    format!(
        "TIMEOUT=0\n\n:Ion\nPROTOCOL=stivale2\nKERNEL_PATH=boot:///{kernel_dir}/{kernel_name}\n"
    )
}

/// The file name a path ends in, or `kernel` if it has none.
fn file_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| "kernel".to_owned(), |n| n.to_string_lossy().into_owned())
}

/// Check the kernel and configuration before any host state is touched.
///
/// Returns the configuration text to install.
fn check_inputs(opts: &ImageOptions, kernel_name: &str) -> Result<String, ImageError> {
    let kernel = fs::read(&opts.kernel).map_err(|e| ImageError::io(&opts.kernel, e))?;
    let segments = verify_elf(&kernel)?;
    info!(
        "Kernel {} verified ({} segments)",
        opts.kernel.display(),
        segments.segments().len()
    );

    let text = match &opts.config {
        Some(path) => {
            let bytes = fs::read(path).map_err(|e| ImageError::io(path, e))?;
            String::from_utf8(bytes).map_err(|_| ImageError::ConfigEncoding(path.clone()))?
        }
        None => default_config(&opts.kernel_dir, kernel_name),
    };
    let config = IonConfig::parse(&text)?;

    let installed = format!("{}\\{kernel_name}", opts.kernel_dir.replace('/', "\\"));
    match config.default_entry().and_then(|e| e.path.as_ref()) {
        Some(uri) if uri.path == installed => {}
        Some(uri) => warn!(
            "Configuration boots {} but the kernel is installed as {installed}",
            uri.path
        ),
        None => warn!("Configuration has no default entry with a kernel path"),
    }
    Ok(text)
}

fn copy(from: &Path, to: &Path) -> Result<(), ImageError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| ImageError::io(parent, e))?;
    }
    fs::copy(from, to).map_err(|e| ImageError::io(from, e))?;
    Ok(())
}

/// Build the image described by `opts` and return its path.
///
/// An existing image at `opts.output` is removed before the inputs are
/// checked, so a failed rebuild never leaves the previous image looking
/// current. Nothing is left behind on failure: the loop device is detached,
/// the partition unmounted and the unfinished image removed.
///
/// # Errors
/// Invalid inputs are reported before any host tool runs; after that the
/// first failing step aborts the pipeline.
pub fn assemble<H: Host + ?Sized>(host: &H, opts: &ImageOptions) -> Result<PathBuf, ImageError> {
    let kernel_name = file_name(&opts.kernel);
    let last = opts.last_sector()?;
    match fs::remove_file(&opts.output) {
        Ok(()) => info!("Removed previous {}", opts.output.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(ImageError::io(&opts.output, e)),
    }
    let config = check_inputs(opts, &kernel_name)?;

    let image = PartialImage::create(&opts.output, opts.size)?;
    let partial = image.path().display().to_string();

    info!("Partitioning {partial}");
    host.run(
        "sgdisk",
        &[
            "--clear".into(),
            format!("--disk-guid={DISK_GUID}"),
            format!("--new=1:{}:{last}", opts.first_sector),
            format!("--typecode=1:{ESP_TYPE}"),
            format!("--partition-guid=1:{PARTITION_GUID}"),
            format!("--change-name=1:{VOLUME_LABEL}"),
            partial.clone(),
        ],
    )?;

    let offset = opts.first_sector * SECTOR_SIZE;
    let len = (last + 1 - opts.first_sector) * SECTOR_SIZE;
    let device = LoopDevice::attach(host, image.path(), offset, len)?;

    info!("Formatting {}", device.device());
    host.run(
        "mkfs.fat",
        &[
            "-F".into(),
            "32".into(),
            "-i".into(),
            VOLUME_ID.into(),
            "-n".into(),
            VOLUME_LABEL.into(),
            device.device().to_owned(),
        ],
    )?;

    let mount = Mount::new(host, device.device(), &opts.mount_dir())?;
    let root = mount.dir();

    info!("Installing files");
    copy(&opts.bootloader, &root.join("EFI").join("BOOT").join("BOOTX64.EFI"))?;
    let config_path = root.join(&opts.config_name);
    fs::write(&config_path, config).map_err(|e| ImageError::io(&config_path, e))?;
    copy(&opts.kernel, &root.join(&opts.kernel_dir).join(&kernel_name))?;

    host.run("sync", &[])?;
    mount.unmount()?;
    device.detach()?;

    let output = image.commit()?;
    info!("Wrote {}", output.display());
    Ok(output)
}
