//! # Boot Configuration
//!
//! The bootloader reads the first of [`CONFIG_PATHS`] that exists on the boot
//! volume. The format is line based:
//!
//! ```text
//! TIMEOUT=3
//!
//! :Ion test kernel
//! PROTOCOL=stivale2
//! KERNEL_PATH=boot:///boot/kernel
//! KERNEL_CMDLINE=console=debug
//! ```
//!
//! Keys before the first `:name` line are global; keys after it belong to
//! that entry. Lines without `=` and unknown keys are ignored.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use log::{debug, warn};

/// Where the configuration file is looked for, in order (UEFI separators).
pub const CONFIG_PATHS: &[&str] = &["boot\\ion.cfg", "ion.cfg"];

/// Boot menu timeout when the file does not set a usable one.
pub const DEFAULT_TIMEOUT: usize = 5;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum BootProtocol {
    #[default]
    Stivale2,
    Stivale,
    Multiboot,
    Multiboot2,
    Linux,
}

impl BootProtocol {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "stivale2" => Self::Stivale2,
            "stivale" | "stivale1" => Self::Stivale,
            "multiboot" | "multiboot1" => Self::Multiboot,
            "multiboot2" => Self::Multiboot2,
            "linux" => Self::Linux,
            _ => return None,
        })
    }
}

/// One `:name` section.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct ConfigEntry {
    pub name: String,
    pub protocol: BootProtocol,
    /// Kernel location; `None` until a path key is seen.
    pub path: Option<Uri>,
    pub cmdline: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IonConfig {
    /// Boot menu timeout in seconds, `0` to boot the first entry at once.
    pub timeout: usize,
    pub entries: Vec<ConfigEntry>,
}

impl Default for IonConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("line {line}: unknown boot protocol {value:?}")]
    InvalidProtocol { line: usize, value: String },
    #[error("line {line}: invalid kernel path")]
    InvalidPath {
        line: usize,
        #[source]
        source: UriParseError,
    },
}

impl IonConfig {
    /// Parse a configuration file.
    ///
    /// # Errors
    /// Fails on an unknown protocol name or a kernel path that is not a
    /// valid [`Uri`].
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.trim_end_matches('\r');

            if let Some(name) = line.strip_prefix(':') {
                config.entries.push(ConfigEntry {
                    name: name.to_string(),
                    ..ConfigEntry::default()
                });
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };

            match config.entries.last_mut() {
                Some(entry) => match key {
                    "PROTOCOL" | "KERNEL_PROTOCOL" | "PROTO" => {
                        entry.protocol = BootProtocol::from_name(value).ok_or_else(|| {
                            ConfigError::InvalidProtocol {
                                line: line_no,
                                value: value.to_string(),
                            }
                        })?;
                    }
                    "CMDLINE" | "KERNEL_CMDLINE" => entry.cmdline = value.to_string(),
                    "PATH" | "KERNEL_PATH" => {
                        let uri = Uri::parse(value).map_err(|source| ConfigError::InvalidPath {
                            line: line_no,
                            source,
                        })?;
                        entry.path = Some(uri);
                    }
                    _ => debug!("line {line_no}: ignoring entry key {key}"),
                },
                None if key == "TIMEOUT" => {
                    config.timeout = value.parse().unwrap_or_else(|_| {
                        if value == "no" {
                            0
                        } else {
                            warn!("line {line_no}: bad TIMEOUT {value:?}, using {DEFAULT_TIMEOUT}");
                            DEFAULT_TIMEOUT
                        }
                    });
                }
                None => debug!("line {line_no}: ignoring global key {key}"),
            }
        }

        Ok(config)
    }

    /// The entry booted when the menu times out.
    #[must_use]
    pub fn default_entry(&self) -> Option<&ConfigEntry> {
        self.entries.first()
    }
}

/// Storage a [`Uri`] refers to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Resource {
    /// The volume the bootloader was loaded from.
    Boot,
    Hdd,
    Odd,
    Guid,
    Uuid,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum UriParseError {
    #[error("missing resource before \"://\"")]
    MissingResource,
    #[error("expected resource://[partition]/path")]
    InvalidSyntax,
    #[error("partition is not a number in 0..256")]
    InvalidPartition,
    #[error("unsupported resource")]
    UnsupportedResource,
}

/// A `resource://[partition]/path` reference to a file.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Uri {
    pub resource: Resource,
    /// `None` selects the resource's default partition.
    pub partition: Option<u8>,
    /// File path with UEFI `\` separators and no leading separator.
    pub path: String,
}

impl Uri {
    /// # Errors
    /// See [`UriParseError`]. The retired `bios` resource is reported as
    /// [`UriParseError::UnsupportedResource`].
    pub fn parse(uri: &str) -> Result<Self, UriParseError> {
        let (resource, root) = uri.split_once(':').ok_or(UriParseError::InvalidSyntax)?;
        if resource.is_empty() {
            return Err(UriParseError::MissingResource);
        }
        let rest = root.strip_prefix("//").ok_or(UriParseError::InvalidSyntax)?;

        let mut parts = rest.split('/');
        let partition = match parts.next() {
            Some("") => None,
            Some(n) => Some(n.parse::<u8>().map_err(|_| UriParseError::InvalidPartition)?),
            None => return Err(UriParseError::InvalidSyntax),
        };
        let components: Vec<&str> = parts.collect();
        if components.is_empty() || components.iter().any(|c| c.is_empty()) {
            return Err(UriParseError::InvalidSyntax);
        }

        let resource = match resource {
            "boot" => Resource::Boot,
            "hdd" => Resource::Hdd,
            "odd" => Resource::Odd,
            "guid" => Resource::Guid,
            "uuid" => Resource::Uuid,
            _ => return Err(UriParseError::UnsupportedResource),
        };

        Ok(Self {
            resource,
            partition,
            path: components.join("\\"),
        })
    }
}
