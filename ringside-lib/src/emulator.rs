//! Software emulation of the optical transport.
//!
//! The frontend is designed so that it compiles and runs without an
//! actual adapter in the host. The emulator answers register reads
//! with sensible values (PLL locked, calibration done, expected
//! firmware revisions) and serves queued event records through the
//! block transfer path, so the whole pipeline from link reader to
//! merge stage can be exercised in software.
//!
//! Tests inject events with [`EmulatedDevice::push_event`] and bend
//! individual registers with [`EmulatedDevice::override_reg`].

use std::collections::{HashMap,
                       VecDeque};
use std::sync::{Arc,
                Mutex};
use std::sync::atomic::{AtomicBool,
                        Ordering};
use std::thread;
use std::time::Duration;

use crate::constants::{EXPECTED_AMC_FW_REV,
                       EXPECTED_BOARD_TYPE,
                       EXPECTED_ROC_FW_REV,
                       EVENT_HEADER_WORDS,
                       SIZEOF_U32,
                       TIMESTAMP_MASK};
use crate::errors::TransportError;
use crate::registers::*;
use crate::transport::{DeviceHandle,
                       OpticalTransport};

/// Compose a well formed event record for the emulated boards.
///
/// The first word carries the 0xA tag and the total length in words,
/// the fourth word the 31 bit trigger timestamp with the encoding
/// variant flag in the top bit. The payload is a filler pattern.
pub fn compose_record(timestamp : u32, payload_words : usize, zle : bool) -> Vec<u8> {
  let total_words = EVENT_HEADER_WORDS + payload_words;
  let mut words   = Vec::<u32>::with_capacity(total_words);
  words.push(0xA0000000 | (total_words as u32 & 0x0FFFFFFF));
  words.push(0xFF);
  words.push(0);
  let flag = if zle { 0x80000000 } else { 0 };
  words.push(flag | (timestamp & TIMESTAMP_MASK));
  for k in 0..payload_words {
    words.push(0xBEEF0000 | k as u32);
  }
  let mut stream = Vec::<u8>::with_capacity(total_words * SIZEOF_U32);
  for w in words {
    stream.extend_from_slice(&w.to_le_bytes());
  }
  stream
}

/// One emulated board on a daisy chain
pub struct EmulatedDevice {
  regs       : Mutex<HashMap<u32, u32>>,
  events     : Mutex<VecDeque<Vec<u8>>>,
  /// bytes of the event currently served through block transfers
  in_flight  : Mutex<Vec<u8>>,
  pll_locked : AtomicBool,
  closed     : AtomicBool,
}

impl EmulatedDevice {
  fn new() -> Self {
    Self {
      regs       : Mutex::new(HashMap::new()),
      events     : Mutex::new(VecDeque::new()),
      in_flight  : Mutex::new(Vec::new()),
      pll_locked : AtomicBool::new(true),
      closed     : AtomicBool::new(false),
    }
  }

  /// Queue an event record for readout
  pub fn push_event(&self, record : Vec<u8>) {
    self.events.lock().unwrap().push_back(record);
  }

  /// Number of queued (not yet transferred) events
  pub fn n_events(&self) -> usize {
    self.events.lock().unwrap().len()
  }

  /// Pin a register to a fixed value, e.g. a wrong board type
  pub fn override_reg(&self, addr : u32, value : u32) {
    self.regs.lock().unwrap().insert(addr, value);
  }

  /// Drop the PLL lock. A read of the readout-status register
  /// re-arms it, like on the hardware.
  pub fn unlock_pll(&self) {
    self.pll_locked.store(false, Ordering::SeqCst);
  }

  fn check_open(&self) -> Result<(), TransportError> {
    if self.closed.load(Ordering::SeqCst) {
      return Err(TransportError::NotConnected);
    }
    Ok(())
  }
}

impl DeviceHandle for EmulatedDevice {
  fn read32(&self, addr : u32) -> Result<u32, TransportError> {
    self.check_open()?;
    if let Some(value) = self.regs.lock().unwrap().get(&addr) {
      return Ok(*value);
    }
    let value = match addr {
      ACQUISITION_STATUS => {
        let mut status = 0u32;
        if self.pll_locked.load(Ordering::SeqCst) {
          status |= ACQ_STATUS_PLL_LOCKED;
        }
        // take the locks one at a time, the readout path holds them
        // in in_flight -> events order
        let has_in_flight = !self.in_flight.lock().unwrap().is_empty();
        let has_queued    = !self.events.lock().unwrap().is_empty();
        if has_in_flight || has_queued {
          status |= ACQ_STATUS_EVENT_READY;
        }
        status
      }
      EVENT_SIZE => {
        let mut in_flight = self.in_flight.lock().unwrap();
        if in_flight.is_empty() {
          match self.events.lock().unwrap().pop_front() {
            None     => (),
            Some(ev) => *in_flight = ev,
          }
        }
        (in_flight.len() / SIZEOF_U32) as u32
      }
      EVENT_STORED => {
        let pending = if self.in_flight.lock().unwrap().is_empty() {0} else {1};
        self.events.lock().unwrap().len() as u32 + pending
      }
      READOUT_STATUS => {
        // the read clears the loss latch
        self.pll_locked.store(true, Ordering::SeqCst);
        0
      }
      BOARD_INFO        => EXPECTED_BOARD_TYPE,
      ROC_FPGA_FW_REV   => EXPECTED_ROC_FW_REV,
      BOARD_FAILURE_STATUS => 0,
      _ => {
        if (addr & 0xF0FF) == CHANNEL_STATUS {
          CHANNEL_STATUS_CALIBRATED
        } else if (addr & 0xF0FF) == CHANNEL_FPGA_FW_REV {
          EXPECTED_AMC_FW_REV
        } else if (addr & 0xF0FF) == CHANNEL_TEMPERATURE {
          40 + ((addr >> 8) & 0xF)
        } else {
          0
        }
      }
    };
    Ok(value)
  }

  fn write32(&self, addr : u32, value : u32) -> Result<(), TransportError> {
    self.check_open()?;
    // a soft reset does not wipe the emulated event queue, so tests
    // can stage events before the run transition configures boards
    self.regs.lock().unwrap().insert(addr, value);
    Ok(())
  }

  fn block_read(&self, addr : u32, out : &mut [u8], max_words : usize) -> Result<usize, TransportError> {
    self.check_open()?;
    if addr != EVENT_READOUT_BUFFER {
      return Err(TransportError::ReadError);
    }
    let mut in_flight = self.in_flight.lock().unwrap();
    if in_flight.is_empty() {
      match self.events.lock().unwrap().pop_front() {
        None     => return Ok(0),
        Some(ev) => *in_flight = ev,
      }
    }
    let n_bytes = std::cmp::min(max_words * SIZEOF_U32,
                                std::cmp::min(out.len(), in_flight.len()));
    out[..n_bytes].copy_from_slice(&in_flight[..n_bytes]);
    in_flight.drain(..n_bytes);
    Ok(n_bytes)
  }

  fn close(&self) {
    self.closed.store(true, Ordering::SeqCst);
  }
}

/// Emulated optical-link adapter holding one device per chain slot
pub struct EmulatedTransport {
  devices    : Mutex<HashMap<(u8, u8), Arc<EmulatedDevice>>>,
  open_delay : Mutex<Duration>,
  dead_slots : Mutex<Vec<(u8, u8)>>,
}

impl EmulatedTransport {
  pub fn new() -> Self {
    Self {
      devices    : Mutex::new(HashMap::new()),
      open_delay : Mutex::new(Duration::from_millis(0)),
      dead_slots : Mutex::new(Vec::new()),
    }
  }

  /// Delay every open call, to exercise the connect timeout
  pub fn set_open_delay(&self, delay : Duration) {
    *self.open_delay.lock().unwrap() = delay;
  }

  /// Mark a chain slot as unreachable
  pub fn kill_slot(&self, link : u8, board : u8) {
    self.dead_slots.lock().unwrap().push((link, board));
  }

  /// The device behind a chain slot, creating it if necessary.
  /// Used by tests to stage events before or during a run.
  pub fn device(&self, link : u8, board : u8) -> Arc<EmulatedDevice> {
    let mut devices = self.devices.lock().unwrap();
    devices.entry((link, board))
           .or_insert_with(|| Arc::new(EmulatedDevice::new()))
           .clone()
  }
}

impl Default for EmulatedTransport {
  fn default() -> Self {
    Self::new()
  }
}

impl OpticalTransport for EmulatedTransport {
  fn open(&self, link : u8, board : u8) -> Result<Arc<dyn DeviceHandle>, TransportError> {
    let delay = *self.open_delay.lock().unwrap();
    if !delay.is_zero() {
      thread::sleep(delay);
    }
    if self.dead_slots.lock().unwrap().contains(&(link, board)) {
      return Err(TransportError::OpenFailed);
    }
    let device = self.device(link, board);
    device.closed.store(false, Ordering::SeqCst);
    Ok(device)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::constants::MAX_BLT_READ_BYTES;

  #[test]
  fn record_roundtrip_through_block_read() {
    let transport = EmulatedTransport::new();
    let device    = transport.device(0, 0);
    let record    = compose_record(0x1234, 10, false);
    let rec_len   = record.len();
    device.push_event(record);

    let handle = transport.open(0, 0).unwrap();
    let status = handle.read32(ACQUISITION_STATUS).unwrap();
    assert!(status & ACQ_STATUS_EVENT_READY != 0);
    let n_words = handle.read32(EVENT_SIZE).unwrap() as usize;
    assert_eq!(n_words * SIZEOF_U32, rec_len);

    let mut buffer = vec![0u8; rec_len];
    let mut done   = 0usize;
    while done < rec_len {
      let n = handle.block_read(EVENT_READOUT_BUFFER,
                                &mut buffer[done..],
                                MAX_BLT_READ_BYTES / SIZEOF_U32).unwrap();
      done += n;
    }
    assert_eq!(done, rec_len);
    let word0 = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
    assert_eq!(word0 >> 28, 0xA);
    // board drained
    assert_eq!(handle.read32(EVENT_SIZE).unwrap(), 0);
  }

  #[test]
  fn pll_relatches_on_status_read() {
    let transport = EmulatedTransport::new();
    let device    = transport.device(1, 0);
    let handle    = transport.open(1, 0).unwrap();
    device.unlock_pll();
    assert!(handle.read32(ACQUISITION_STATUS).unwrap() & ACQ_STATUS_PLL_LOCKED == 0);
    handle.read32(READOUT_STATUS).unwrap();
    assert!(handle.read32(ACQUISITION_STATUS).unwrap() & ACQ_STATUS_PLL_LOCKED != 0);
  }
}
