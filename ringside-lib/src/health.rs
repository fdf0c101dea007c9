//! Per-board health records for the periodic monitor feed.

use std::fmt;

use crate::constants::{BOARD_BUFFER_DEPTH,
                       N_CHANNELS};

/// One health reading per board per monitor cycle
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BoardHealth {
  pub module_id       : u8,
  /// Events in the hardware buffer
  pub stored_events   : u32,
  /// Busy towards the trigger distributor (derived, see
  /// [`derive_busy`])
  pub busy            : bool,
  /// Ring buffer fill in bytes
  pub ring_fill_bytes : usize,
  /// Complete events waiting in the ring
  pub ring_events     : usize,
  pub pll_locked      : bool,
  /// Raw per-channel temperature readings
  pub temperatures    : [u32; N_CHANNELS],
}

impl BoardHealth {
  pub fn new(module_id : u8) -> Self {
    Self {
      module_id,
      stored_events   : 0,
      busy            : false,
      ring_fill_bytes : 0,
      ring_events     : 0,
      pll_locked      : true,
      temperatures    : [0; N_CHANNELS],
    }
  }
}

impl fmt::Display for BoardHealth {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<BoardHealth : module {} stored {} busy {} ring {}B/{}ev pll {}>",
           self.module_id, self.stored_events, self.busy,
           self.ring_fill_bytes, self.ring_events, self.pll_locked)
  }
}

/// There is no register flagging the busy output, so it is deduced
/// from the buffer occupancy and the almost-full watermark: with the
/// watermark at zero the busy line only asserts once every hardware
/// buffer is in use.
pub fn derive_busy(stored : u32, almost_full : u32) -> bool {
  if almost_full == 0 {
    stored == BOARD_BUFFER_DEPTH
  } else {
    stored >= almost_full
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn busy_with_zero_watermark_means_all_buffers_used() {
    assert!(!derive_busy(1023, 0));
    assert!(derive_busy(BOARD_BUFFER_DEPTH, 0));
  }

  #[test]
  fn busy_with_watermark_is_a_threshold() {
    assert!(!derive_busy(511, 512));
    assert!(derive_busy(512, 512));
    assert!(derive_busy(800, 512));
  }
}
