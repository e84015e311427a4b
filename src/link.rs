//! Transport interface consumed by the engine.
//!
//! Framing, USB transfers and timeouts belong to the transport. The engine
//! only needs three primitives: write a region, read a region, and select
//! which persona subsequent transfers address.

use bytes::Bytes;

use crate::error::LinkError;
use crate::persona::PersonaKind;
use crate::registers::CommitMode;

/// Addressable region on the device side of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// Register file starting at a byte offset
    Registers {
        /// Byte offset in the register file
        offset: u16,
        /// When the device should apply a write
        mode: CommitMode,
    },
    /// Device RAM starting at a byte address
    Ram {
        /// Byte address
        addr: u32,
    },
}

impl Region {
    /// Register region applied immediately.
    pub fn registers(offset: u16) -> Self {
        Self::Registers {
            offset,
            mode: CommitMode::Immediate,
        }
    }

    /// Register region with an explicit commit mode.
    pub fn registers_with(offset: u16, mode: CommitMode) -> Self {
        Self::Registers { offset, mode }
    }

    /// RAM region.
    pub fn ram(addr: u32) -> Self {
        Self::Ram { addr }
    }
}

/// One physical link to a device exposing one or more personas.
///
/// Implementations are blocking: each call returns once the round trip has
/// completed or the transport's own timeout fired.
pub trait Link {
    /// Write `bytes` to `region` of the currently selected persona.
    fn write(&mut self, region: Region, bytes: &[u8]) -> Result<(), LinkError>;

    /// Read `len` bytes from `region` of the currently selected persona.
    fn read(&mut self, region: Region, len: usize) -> Result<Bytes, LinkError>;

    /// Route subsequent transfers to `persona`.
    fn select_persona(&mut self, persona: PersonaKind) -> Result<(), LinkError>;
}

impl<L: Link + ?Sized> Link for Box<L> {
    fn write(&mut self, region: Region, bytes: &[u8]) -> Result<(), LinkError> {
        (**self).write(region, bytes)
    }

    fn read(&mut self, region: Region, len: usize) -> Result<Bytes, LinkError> {
        (**self).read(region, len)
    }

    fn select_persona(&mut self, persona: PersonaKind) -> Result<(), LinkError> {
        (**self).select_persona(persona)
    }
}
