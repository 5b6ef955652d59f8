//! Scoped host resources.
//!
//! Each guard releases what it holds when dropped, so every exit path of the
//! pipeline (including `?` and panics) cleans up. Declared in the order
//! [`PartialImage`], [`LoopDevice`], [`Mount`], they drop in reverse: unmount,
//! then detach, then remove the unfinished image.
//!
//! The explicit `unmount`/`detach`/`commit` methods release early and report
//! errors. Only a successful release disarms the guard; after a failed one
//! the drop still tries again.

use crate::ImageError;
use crate::host::Host;
use log::{debug, warn};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// An image file under construction at `<output>.partial`.
#[derive(Debug)]
pub struct PartialImage {
    partial: PathBuf,
    output: PathBuf,
    done: bool,
}

impl PartialImage {
    /// Create a zero-filled file of `size` bytes next to `output`.
    ///
    /// # Errors
    /// Fails if the file cannot be created or sized.
    pub fn create(output: &Path, size: u64) -> Result<Self, ImageError> {
        let mut name = output.as_os_str().to_owned();
        name.push(".partial");
        let partial = PathBuf::from(name);

        let file = File::create(&partial).map_err(|e| ImageError::io(&partial, e))?;
        let guard = Self {
            partial,
            output: output.to_owned(),
            done: false,
        };
        file.set_len(size)
            .map_err(|e| ImageError::io(&guard.partial, e))?;
        debug!("Created {} ({size} bytes)", guard.partial.display());
        Ok(guard)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.partial
    }

    /// Move the finished image into place.
    ///
    /// # Errors
    /// Fails if the rename fails; the partial file is then removed on drop.
    pub fn commit(mut self) -> Result<PathBuf, ImageError> {
        fs::rename(&self.partial, &self.output).map_err(|e| ImageError::io(&self.output, e))?;
        self.done = true;
        Ok(self.output.clone())
    }
}

impl Drop for PartialImage {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = fs::remove_file(&self.partial) {
                warn!("Could not remove {}: {e}", self.partial.display());
            }
        }
    }
}

/// A loop device bound to a byte range of a file.
pub struct LoopDevice<'h, H: Host + ?Sized> {
    host: &'h H,
    device: String,
    attached: bool,
}

impl<'h, H: Host + ?Sized> LoopDevice<'h, H> {
    /// `losetup --find --show --offset <offset> --sizelimit <len> <file>`
    ///
    /// # Errors
    /// Fails if `losetup` fails or does not print a device.
    pub fn attach(host: &'h H, file: &Path, offset: u64, len: u64) -> Result<Self, ImageError> {
        let out = host.run(
            "losetup",
            &[
                "--find".into(),
                "--show".into(),
                "--offset".into(),
                offset.to_string(),
                "--sizelimit".into(),
                len.to_string(),
                file.display().to_string(),
            ],
        )?;
        let device = out.trim().to_owned();
        if device.is_empty() {
            return Err(ImageError::NoLoopDevice);
        }
        debug!("Attached {device}");
        Ok(Self {
            host,
            device,
            attached: true,
        })
    }

    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }

    /// # Errors
    /// Fails if `losetup --detach` fails; the device is then still attached
    /// and the drop retries.
    pub fn detach(mut self) -> Result<(), ImageError> {
        self.host.run("losetup", &["--detach".into(), self.device.clone()])?;
        self.attached = false;
        Ok(())
    }
}

impl<H: Host + ?Sized> Drop for LoopDevice<'_, H> {
    fn drop(&mut self) {
        if self.attached {
            if let Err(e) = self.host.run("losetup", &["--detach".into(), self.device.clone()]) {
                warn!("Could not detach {}: {e}", self.device);
            }
        }
    }
}

/// A filesystem mounted at a directory this guard created.
pub struct Mount<'h, H: Host + ?Sized> {
    host: &'h H,
    dir: PathBuf,
    mounted: bool,
}

impl<'h, H: Host + ?Sized> Mount<'h, H> {
    /// Create `dir` and mount `device` on it.
    ///
    /// # Errors
    /// Fails if the directory cannot be created or `mount` fails; the
    /// directory is removed again in that case.
    pub fn new(host: &'h H, device: &str, dir: &Path) -> Result<Self, ImageError> {
        fs::create_dir_all(dir).map_err(|e| ImageError::io(dir, e))?;
        if let Err(e) = host.run("mount", &[device.to_owned(), dir.display().to_string()]) {
            let _ = fs::remove_dir(dir);
            return Err(e);
        }
        Ok(Self {
            host,
            dir: dir.to_owned(),
            mounted: true,
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// # Errors
    /// Fails if `umount` fails; the filesystem is then still mounted and the
    /// drop retries.
    pub fn unmount(mut self) -> Result<(), ImageError> {
        self.host.run("umount", &[self.dir.display().to_string()])?;
        self.mounted = false;
        remove_mount_point(&self.dir);
        Ok(())
    }
}

impl<H: Host + ?Sized> Drop for Mount<'_, H> {
    fn drop(&mut self) {
        if self.mounted {
            match self.host.run("umount", &[self.dir.display().to_string()]) {
                Ok(_) => remove_mount_point(&self.dir),
                Err(e) => warn!("Could not unmount {}: {e}", self.dir.display()),
            }
        }
    }
}

/// Only an empty directory is removed, so a failed unmount never deletes
/// files through a still-mounted filesystem.
fn remove_mount_point(dir: &Path) {
    if let Err(e) = fs::remove_dir(dir) {
        debug!("Leaving mount point {}: {e}", dir.display());
    }
}
