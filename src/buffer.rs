//! Ring buffer address model.
//!
//! A schedule streams samples between its subsystem and a window of device
//! RAM `[base, base + size)`. The cursor is where the device reads next (sinks)
//! or writes next (sources) and wraps back to `base` at the end of the window.
//!
//! [`RingBufferDescriptor`] is a plain value. Every mutation validates first
//! and returns a new descriptor, so a rejected change leaves the previous one
//! untouched; the controller only stages registers once validation passed.

use crate::error::{PixxError, Result};

/// Base, size and cursor of a schedule's RAM window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingBufferDescriptor {
    base: u32,
    size: u32,
    cursor: u32,
    ram_size: u32,
}

impl RingBufferDescriptor {
    /// Unconfigured descriptor (size zero) for a device with `ram_size` bytes.
    pub fn new(ram_size: u32) -> Self {
        Self {
            base: 0,
            size: 0,
            cursor: 0,
            ram_size,
        }
    }

    /// Window start address.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Window size in bytes; zero until configured.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Cursor as last staged by the host.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// Device RAM size the window is checked against.
    pub fn ram_size(&self) -> u32 {
        self.ram_size
    }

    /// One past the last byte of the window.
    pub fn end(&self) -> u64 {
        u64::from(self.base) + u64::from(self.size)
    }

    /// Check if the window has a non-zero size.
    pub fn is_configured(&self) -> bool {
        self.size > 0
    }

    /// Check if `addr` lies inside the window.
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && u64::from(addr) < self.end()
    }

    fn check_base(&self, addr: u32, size: u32) -> Result<()> {
        if addr % 2 != 0 {
            return Err(PixxError::InvalidAddress {
                addr,
                reason: "buffer base must be even".to_string(),
            });
        }
        if addr >= self.ram_size || u64::from(addr) + u64::from(size) > u64::from(self.ram_size)
        {
            return Err(PixxError::InvalidAddress {
                addr,
                reason: format!(
                    "buffer [{:#x}, {:#x}) exceeds device RAM of {:#x} bytes",
                    addr,
                    u64::from(addr) + u64::from(size),
                    self.ram_size
                ),
            });
        }
        Ok(())
    }

    fn check_size(&self, base: u32, size: u32) -> Result<()> {
        if size == 0 || size % 2 != 0 {
            return Err(PixxError::InvalidSize {
                size,
                reason: "buffer size must be even and non-zero".to_string(),
            });
        }
        if u64::from(base) + u64::from(size) > u64::from(self.ram_size) {
            return Err(PixxError::InvalidSize {
                size,
                reason: format!(
                    "buffer at {:#x} would end past device RAM of {:#x} bytes",
                    base, self.ram_size
                ),
            });
        }
        Ok(())
    }

    /// Move the window start. The cursor returns to the new base.
    ///
    /// # Errors
    ///
    /// [`PixxError::InvalidAddress`] if `addr` is odd or the window with the
    /// current size would leave device RAM.
    pub fn with_base(&self, addr: u32) -> Result<Self> {
        self.check_base(addr, self.size)?;
        Ok(Self {
            base: addr,
            cursor: addr,
            ..*self
        })
    }

    /// Resize the window. A cursor still inside the new window is kept.
    ///
    /// # Errors
    ///
    /// [`PixxError::InvalidSize`] if `bytes` is zero, odd, or the window would
    /// leave device RAM.
    pub fn with_size(&self, bytes: u32) -> Result<Self> {
        self.check_size(self.base, bytes)?;
        let mut next = Self {
            size: bytes,
            ..*self
        };
        if !next.contains(next.cursor) {
            next.cursor = next.base;
        }
        Ok(next)
    }

    /// Set base and size together, validating both before changing anything.
    pub fn with_buffer(&self, addr: u32, bytes: u32) -> Result<Self> {
        self.check_base(addr, 0)?;
        self.check_size(addr, bytes)?;
        Ok(Self {
            base: addr,
            size: bytes,
            cursor: addr,
            ram_size: self.ram_size,
        })
    }

    /// Place the cursor inside the window.
    ///
    /// # Errors
    ///
    /// [`PixxError::InvalidAddress`] if `addr` is odd or outside the window.
    pub fn with_cursor(&self, addr: u32) -> Result<Self> {
        if addr % 2 != 0 {
            return Err(PixxError::InvalidAddress {
                addr,
                reason: "buffer cursor must be even".to_string(),
            });
        }
        if !self.contains(addr) {
            return Err(PixxError::InvalidAddress {
                addr,
                reason: format!(
                    "cursor outside buffer [{:#x}, {:#x})",
                    self.base,
                    self.end()
                ),
            });
        }
        Ok(Self {
            cursor: addr,
            ..*self
        })
    }

    /// Cursor after moving `bytes` forward with wraparound.
    ///
    /// Returns the current cursor unchanged for an unconfigured window.
    pub fn advance(&self, bytes: u64) -> u32 {
        if self.size == 0 {
            return self.cursor;
        }
        let offset = u64::from(self.cursor.saturating_sub(self.base)) % u64::from(self.size);
        let wrapped = (offset + bytes) % u64::from(self.size);
        // wrapped < size, so base + wrapped < end <= ram_size
        self.base + wrapped as u32
    }

    /// Descriptor built from raw register values, without validation.
    pub(crate) fn from_raw(base: u32, size: u32, cursor: u32, ram_size: u32) -> Self {
        Self {
            base,
            size,
            cursor,
            ram_size,
        }
    }
}
