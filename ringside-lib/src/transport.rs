//! Hardware transport abstraction for the optical links.
//!
//! The frontend never talks to an adapter library directly, it goes
//! through these traits. The real adapter binding lives outside of
//! this crate; the [emulator](crate::emulator) implements the same
//! traits and carries the full pipeline in software.

use std::sync::Arc;

use crate::errors::TransportError;

/// One optical-link adapter. `open` may block for as long as the
/// underlying driver pleases - the board driver runs it on a helper
/// thread and applies its own timeout.
pub trait OpticalTransport: Send + Sync {
  fn open(&self, link : u8, board : u8) -> Result<Arc<dyn DeviceHandle>, TransportError>;
}

/// An open connection to a single board on a daisy chain.
///
/// Handles are shared between the owning thread and the periodic
/// monitor; implementations must serialize access internally. Only
/// read-only status registers may be touched from a second thread.
pub trait DeviceHandle: Send + Sync {
  /// Read a single 32 bit register
  fn read32(&self, addr : u32) -> Result<u32, TransportError>;

  /// Write a single 32 bit register
  fn write32(&self, addr : u32, value : u32) -> Result<(), TransportError>;

  /// Block transfer from a hardware FIFO. Reads at most `max_words`
  /// 32 bit words into `out` and returns the number of bytes read.
  fn block_read(&self, addr : u32, out : &mut [u8], max_words : usize) -> Result<usize, TransportError>;

  /// Release the connection. Further calls will fail with
  /// `TransportError::NotConnected`.
  fn close(&self);
}
