//! Configuration loading using Figment.
//!
//! Configuration is layered from:
//! 1. `config/pixx.toml` (or an explicit path)
//! 2. Environment variables prefixed with `PIXX_`, sections separated by a
//!    double underscore: `PIXX_APPLICATION__LOG_LEVEL=debug`,
//!    `PIXX_LINK__COMMIT_MODE=at_vertical_sync`
//!
//! Every section has defaults, so a missing file yields a usable
//! configuration with no persona profiles.
//!
//! # Example
//! ```no_run
//! use pixx_sched::config::PixxConfig;
//! use pixx_sched::persona::PersonaKind;
//!
//! # fn main() -> pixx_sched::error::Result<()> {
//! let config = PixxConfig::load()?;
//! config.validate()?;
//! let persona = config.persona(PersonaKind::ViewPixx)?;
//! println!("{} has {} bytes of RAM", persona.kind(), persona.ram_size());
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::path::Path;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{PixxError, Result};
use crate::logging::{self, OutputFormat};
use crate::persona::{Persona, PersonaKind};
use crate::registers::CommitMode;
use crate::subsystem::SubsystemKind;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/pixx.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PixxConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Link behavior
    #[serde(default)]
    pub link: LinkConfig,
    /// Persona profiles
    #[serde(default)]
    pub personas: Vec<PersonaConfig>,
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

/// Link behavior shared by every persona.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Commit mode used when schedules start and stop
    #[serde(default)]
    pub commit_mode: CommitMode,
}

/// One persona profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    /// Persona identity
    pub kind: PersonaKind,
    /// Device RAM size in bytes
    pub ram_size: u32,
    /// Subsystems present; all of them when omitted
    #[serde(default = "all_subsystems")]
    pub subsystems: Vec<SubsystemKind>,
    /// Whether this profile may be opened
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_name() -> String {
    "pixx_sched".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn all_subsystems() -> Vec<SubsystemKind> {
    SubsystemKind::ALL.to_vec()
}

fn default_enabled() -> bool {
    true
}

impl PixxConfig {
    /// Load configuration from `config/pixx.toml` and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PIXX_").split("__"))
            .extract()
            .map_err(|e| PixxError::Config {
                message: e.to_string(),
            })
    }

    /// Check values serde cannot check.
    pub fn validate(&self) -> Result<()> {
        logging::parse_log_level(&self.application.log_level)?;

        let mut seen = HashSet::new();
        for profile in &self.personas {
            if !seen.insert(profile.kind) {
                return Err(PixxError::Config {
                    message: format!("Duplicate persona profile: {}", profile.kind),
                });
            }
            if profile.ram_size == 0 || profile.ram_size % 2 != 0 {
                return Err(PixxError::Config {
                    message: format!(
                        "Invalid ram_size {:#x} for {}. Must be even and non-zero",
                        profile.ram_size, profile.kind
                    ),
                });
            }
        }

        Ok(())
    }

    /// Enabled persona profiles.
    pub fn enabled_personas(&self) -> Vec<&PersonaConfig> {
        self.personas.iter().filter(|p| p.enabled).collect()
    }

    /// Build the persona described by the enabled profile for `kind`.
    pub fn persona(&self, kind: PersonaKind) -> Result<Persona> {
        let profile = self
            .personas
            .iter()
            .find(|p| p.kind == kind && p.enabled)
            .ok_or_else(|| PixxError::Config {
                message: format!("No enabled persona profile for {}", kind),
            })?;
        Persona::new(kind, profile.ram_size, profile.subsystems.iter().copied())
    }
}
