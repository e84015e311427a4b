//! Persona identities reachable over a shared link.
//!
//! One physical link can expose several logical devices (a controller box,
//! the display it drives, a projector controller). Each of them is a
//! [`PersonaKind`] with its own register file and RAM. A [`Persona`] adds the
//! per-unit facts the engine needs: RAM size and which subsystems exist.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PixxError, Result};
use crate::subsystem::SubsystemKind;

/// Closed set of device identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaKind {
    /// DATAPixx I/O controller
    DataPixx,
    /// VIEWPixx display (all variants share one persona)
    ViewPixx,
    /// PROPixx projector controller
    ProPixxCtrl,
    /// PROPixx projector
    ProPixx,
    /// DATAPixx2 I/O controller
    DataPixx2,
}

impl PersonaKind {
    /// Every persona kind, in link id order.
    pub const ALL: [PersonaKind; 5] = [
        Self::DataPixx,
        Self::ViewPixx,
        Self::ProPixxCtrl,
        Self::ProPixx,
        Self::DataPixx2,
    ];

    /// Numeric id the persona reports in its device id register.
    pub fn link_id(self) -> u8 {
        match self {
            Self::DataPixx => 10,
            Self::ViewPixx => 20,
            Self::ProPixxCtrl => 30,
            Self::ProPixx => 40,
            Self::DataPixx2 => 50,
        }
    }

    /// Persona reporting `id`, if any.
    pub fn from_link_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.link_id() == id)
    }

    /// Product name.
    pub fn name(self) -> &'static str {
        match self {
            Self::DataPixx => "DATAPixx",
            Self::ViewPixx => "VIEWPixx",
            Self::ProPixxCtrl => "PROPixx Ctrl",
            Self::ProPixx => "PROPixx",
            Self::DataPixx2 => "DATAPixx2",
        }
    }
}

impl fmt::Display for PersonaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A persona together with its RAM size and subsystem set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persona {
    kind: PersonaKind,
    ram_size: u32,
    subsystems: Vec<SubsystemKind>,
}

impl Persona {
    /// Describe a persona.
    ///
    /// # Errors
    ///
    /// Returns [`PixxError::InvalidSize`] if `ram_size` is zero or odd.
    pub fn new(
        kind: PersonaKind,
        ram_size: u32,
        subsystems: impl IntoIterator<Item = SubsystemKind>,
    ) -> Result<Self> {
        if ram_size == 0 || ram_size % 2 != 0 {
            return Err(PixxError::InvalidSize {
                size: ram_size,
                reason: "device RAM size must be even and non-zero".to_string(),
            });
        }

        let mut subsystems: Vec<SubsystemKind> = subsystems.into_iter().collect();
        subsystems.sort();
        subsystems.dedup();

        Ok(Self {
            kind,
            ram_size,
            subsystems,
        })
    }

    /// Describe a persona that carries every subsystem kind.
    pub fn with_all_subsystems(kind: PersonaKind, ram_size: u32) -> Result<Self> {
        Self::new(kind, ram_size, SubsystemKind::ALL)
    }

    /// Persona identity.
    pub fn kind(&self) -> PersonaKind {
        self.kind
    }

    /// Device RAM size in bytes.
    pub fn ram_size(&self) -> u32 {
        self.ram_size
    }

    /// Subsystems present on this persona.
    pub fn subsystems(&self) -> &[SubsystemKind] {
        &self.subsystems
    }

    /// Check whether a subsystem is present.
    pub fn supports(&self, kind: SubsystemKind) -> bool {
        self.subsystems.contains(&kind)
    }
}
