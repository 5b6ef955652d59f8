//! Running host tools.

use crate::ImageError;
use log::debug;
use std::process::Command;

/// Runs external programs on behalf of the pipeline.
///
/// Every side effect outside the image's own files goes through here, so a
/// test can record what would have happened and inject failures.
pub trait Host {
    /// Run `program` with `args` to completion and return its standard
    /// output.
    ///
    /// # Errors
    /// [`ImageError::Spawn`] if it cannot be started, [`ImageError::Tool`]
    /// if it exits unsuccessfully.
    fn run(&self, program: &str, args: &[String]) -> Result<String, ImageError>;
}

/// The real machine.
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemHost;

impl Host for SystemHost {
    fn run(&self, program: &str, args: &[String]) -> Result<String, ImageError> {
        debug!("$ {program} {}", args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| ImageError::Spawn {
                program: program.to_owned(),
                source,
            })?;
        if !output.status.success() {
            return Err(ImageError::Tool {
                program: program.to_owned(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
