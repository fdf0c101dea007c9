//! Driver for a single digitizer board on a daisy chain.
//!
//! The driver owns the device handle and the per-board configuration
//! and exposes exactly the operations the acquisition pipeline needs:
//! connect/disconnect, the configuration push, run start/stop, the
//! event poll and the block-transfer readout into a ring buffer slot.
//!
//! Ownership follows the run state: outside of a run the run
//! controller holds the boards, during a run each board has moved
//! into the link reader thread of its link.

use std::fmt;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration,
                Instant};

use crate::constants::*;
use crate::errors::{BoardError,
                    ConnectError,
                    TransportError};
use crate::registers::*;
use crate::settings::BoardSettings;
use crate::transport::{DeviceHandle,
                       OpticalTransport};

/// Connection / run state of one board
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum BoardState {
  Disconnected,
  /// connected, not taking data
  Idle,
  Running,
  Error,
}

impl fmt::Display for BoardState {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = match self {
      BoardState::Disconnected => "Disconnected",
      BoardState::Idle         => "Idle",
      BoardState::Running      => "Running",
      BoardState::Error        => "Error",
    };
    write!(f, "<BoardState : {}>", repr)
  }
}

/// Data format variant the board is configured for
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum DataFormat {
  Raw,
  Zle,
}

/// Read-only view on a board for the periodic monitor.
///
/// Carries a clone of the device handle; the monitor restricts
/// itself to read-only status registers.
pub struct MonitorTap {
  pub module_id   : u8,
  pub device      : Arc<dyn DeviceHandle>,
  pub has_zle     : bool,
}

pub struct Board {
  frontend_index   : u8,
  link             : u8,
  board            : u8,
  module_id        : u8,
  transport        : Arc<dyn OpticalTransport>,
  device           : Option<Arc<dyn DeviceHandle>>,
  state            : BoardState,
  settings         : BoardSettings,
  settings_version : u32,
  data_format      : DataFormat,
  last_sw_trigger  : Instant,
}

impl Board {
  pub fn new(frontend_index : u8,
             link           : u8,
             board          : u8,
             module_id      : u8,
             settings       : BoardSettings,
             transport      : Arc<dyn OpticalTransport>) -> Self {
    Self {
      frontend_index,
      link,
      board,
      module_id,
      transport,
      device           : None,
      state            : BoardState::Disconnected,
      settings,
      settings_version : 0,
      data_format      : DataFormat::Raw,
      last_sw_trigger  : Instant::now(),
    }
  }

  /// Short identifier carrying index, link and chain position
  pub fn name(&self) -> String {
    format!("F{:02}L{:02}B{:02}", self.frontend_index, self.link, self.board)
  }

  pub fn module_id(&self) -> u8 {
    self.module_id
  }

  pub fn link(&self) -> u8 {
    self.link
  }

  /// Position on the daisy chain of its link
  pub fn chain_pos(&self) -> u8 {
    self.board
  }

  pub fn is_enabled(&self) -> bool {
    self.settings.enable
  }

  pub fn is_connected(&self) -> bool {
    self.device.is_some()
  }

  pub fn is_running(&self) -> bool {
    self.state == BoardState::Running
  }

  pub fn state(&self) -> BoardState {
    self.state
  }

  pub fn data_format(&self) -> DataFormat {
    self.data_format
  }

  pub fn settings(&self) -> &BoardSettings {
    &self.settings
  }

  /// Swap in a fresh settings snapshot (at Arming). Bumps the
  /// settings version so a later configure pass picks it up.
  pub fn update_settings(&mut self, settings : BoardSettings) {
    self.settings          = settings;
    self.settings_version += 1;
    debug!("Settings of board {} are now at version {}",
           self.module_id, self.settings_version);
  }

  fn device(&self) -> Result<&Arc<dyn DeviceHandle>, BoardError> {
    self.device.as_ref().ok_or(BoardError::NotConnected)
  }

  /// Open the optical connection.
  ///
  /// The underlying open call hangs notoriously, so it runs on a
  /// helper thread; if it does not come back within
  /// `per_attempt_timeout` the attempt counts as failed and the
  /// helper is abandoned. After a successful open the board type
  /// register is checked against the expected constant and the
  /// connection is closed again on a mismatch.
  pub fn connect(&mut self,
                 attempts            : usize,
                 per_attempt_timeout : Duration) -> Result<(), ConnectError> {
    if self.is_connected() {
      error!("Board {} already connected", self.module_id);
      return Err(ConnectError::AlreadyConnected);
    }
    let mut last_error = ConnectError::Timeout;
    for attempt in 0..attempts {
      let transport = Arc::clone(&self.transport);
      let link      = self.link;
      let board     = self.board;
      let (tx, rx)  = mpsc::channel::<Result<Arc<dyn DeviceHandle>, TransportError>>();
      let _helper = thread::Builder::new()
        .name(format!("connect-{}", self.name()))
        .spawn(move || {
          let result = transport.open(link, board);
          // the receiver may be gone when we timed out, that is fine
          let _ = tx.send(result);
        })
        .expect("Failed to spawn the connect helper thread!");
      match rx.recv_timeout(per_attempt_timeout) {
        Err(_) => {
          error!("Open attempt #{} for board {} ({}) timed out after {:?}",
                 attempt + 1, self.module_id, self.name(), per_attempt_timeout);
          last_error = ConnectError::Timeout;
          continue;
        }
        Ok(Err(err)) => {
          error!("Open attempt #{} for board {} ({}) failed! {}",
                 attempt + 1, self.module_id, self.name(), err);
          last_error = ConnectError::Transport;
          continue;
        }
        Ok(Ok(device)) => {
          // board type check before we accept the handle
          match device.read32(BOARD_INFO) {
            Err(err) => {
              error!("Can not read board info register for board {}! {}",
                     self.module_id, err);
              device.close();
              last_error = ConnectError::Transport;
              continue;
            }
            Ok(info) => {
              if info & 0xFF != EXPECTED_BOARD_TYPE {
                error!("Board {} reports type 0x{:x}, expected 0x{:x}! Disconnecting it.",
                       self.module_id, info & 0xFF, EXPECTED_BOARD_TYPE);
                device.close();
                return Err(ConnectError::BoardMismatch);
              }
              info!("Board {} ({}) connected!", self.module_id, self.name());
              self.device = Some(device);
              self.state  = BoardState::Idle;
              return Ok(());
            }
          }
        }
      }
    }
    Err(last_error)
  }

  pub fn disconnect(&mut self) {
    match self.device.take() {
      None => {
        warn!("Board {} already disconnected", self.module_id);
      }
      Some(device) => {
        if self.state == BoardState::Running {
          warn!("Disconnecting board {} while it is running!", self.module_id);
        }
        device.close();
        self.state = BoardState::Disconnected;
      }
    }
  }

  /// One register read. Also available to external callers for
  /// debugging purposes.
  pub fn read_register(&self, addr : u32) -> Result<u32, BoardError> {
    let value = self.device()?.read32(addr)?;
    Ok(value)
  }

  /// One register write
  pub fn write_register(&self, addr : u32, value : u32) -> Result<(), BoardError> {
    self.device()?.write32(addr, value)?;
    Ok(())
  }

  /// Number of events in the hardware buffer
  pub fn poll_stored_events(&self) -> Result<u32, BoardError> {
    self.read_register(EVENT_STORED)
  }

  /// Event ready bit of the acquisition status register
  pub fn check_event_available(&self) -> Result<bool, BoardError> {
    let status = self.read_register(ACQUISITION_STATUS)?;
    Ok(status & ACQ_STATUS_EVENT_READY != 0)
  }

  /// Check the PLL lock bit. A lost lock is latched by the hardware;
  /// reading the readout status register clears the latch, so we
  /// retry once after such a clearing read before giving up.
  pub fn verify_pll_locked(&self) -> Result<bool, BoardError> {
    let status = self.read_register(ACQUISITION_STATUS)?;
    if status & ACQ_STATUS_PLL_LOCKED != 0 {
      return Ok(true);
    }
    warn!("Board {} lost the PLL lock sometime in the past (status 0x{:x})",
          self.module_id, status);
    self.read_register(READOUT_STATUS)?;
    thread::sleep(Duration::from_micros(100));
    let status = self.read_register(ACQUISITION_STATUS)?;
    Ok(status & ACQ_STATUS_PLL_LOCKED != 0)
  }

  /// Set the run bit in the acquisition control register
  pub fn start(&mut self) -> Result<(), BoardError> {
    if self.state == BoardState::Running {
      error!("Board {} already started", self.module_id);
      return Err(BoardError::AlreadyRunning);
    }
    let reg = self.read_register(ACQUISITION_CONTROL)?;
    self.write_register(ACQUISITION_CONTROL, reg | ACQ_CTL_RUN_BIT)?;
    self.state = BoardState::Running;
    Ok(())
  }

  /// Clear the run bit in the acquisition control register
  pub fn stop(&mut self) -> Result<(), BoardError> {
    if self.state != BoardState::Running {
      error!("Board {} already stopped", self.module_id);
      return Err(BoardError::NotRunning);
    }
    let reg = self.read_register(ACQUISITION_CONTROL)?;
    self.write_register(ACQUISITION_CONTROL, reg & !ACQ_CTL_RUN_BIT)?;
    self.state = BoardState::Idle;
    Ok(())
  }

  /// Fire a single software trigger
  pub fn issue_software_trigger(&mut self) -> Result<(), BoardError> {
    self.write_register(SW_TRIGGER, 0x1)?;
    self.last_sw_trigger = Instant::now();
    Ok(())
  }

  /// Fire a software trigger when the board paces itself and the
  /// configured interval has elapsed
  pub fn issue_sw_trigger_if_needed(&mut self) -> Result<(), BoardError> {
    if self.settings.sw_trig_rate_hz > 0.0 {
      let interval = 1.0 / self.settings.sw_trig_rate_hz;
      if self.last_sw_trigger.elapsed().as_secs_f32() > interval {
        self.issue_software_trigger()?;
      }
    }
    Ok(())
  }

  /// Drain one hardware event into a ring buffer slot.
  ///
  /// Block transfers of at most `MAX_BLT_READ_BYTES` until the event
  /// size register is exhausted for the current event. Returns the
  /// number of bytes written into the slot.
  pub fn read_event(&self, slot : &mut [u8]) -> Result<usize, BoardError> {
    let device         = self.device()?;
    let size_words     = device.read32(EVENT_SIZE)? as usize;
    let mut remaining  = size_words * SIZEOF_U32;
    let mut bytes_read = 0usize;
    if remaining > slot.len() {
      error!("Board {} reports an event of {} bytes, slot holds {}!",
             self.module_id, remaining, slot.len());
      return Err(BoardError::Transport);
    }
    while remaining > 0 {
      let chunk = std::cmp::min(remaining, MAX_BLT_READ_BYTES);
      let n = device.block_read(EVENT_READOUT_BUFFER,
                                &mut slot[bytes_read..bytes_read + chunk],
                                chunk / SIZEOF_U32)?;
      if n == 0 {
        break;
      }
      bytes_read += n;
      remaining  -= n;
    }
    trace!("Read {} bytes from board {}", bytes_read, self.module_id);
    Ok(bytes_read)
  }

  /// Hand out a monitor view. Only valid while connected.
  pub fn monitor_tap(&self) -> Option<MonitorTap> {
    self.device.as_ref().map(|device| MonitorTap {
      module_id : self.module_id,
      device    : Arc::clone(device),
      has_zle   : self.settings.has_zle_firmware,
    })
  }

  /// Push the full acquisition configuration to the hardware.
  ///
  /// Performs, in order: soft reset and PLL relock delay, front
  /// panel I/O defaults then the configured values, firmware
  /// revision checks (non-fatal), channel mask check (fatal),
  /// the board level registers, the per-channel registers, the DAC
  /// settle, the ADC calibration and the final PLL verification.
  /// The caller passes a fresh settings snapshot beforehand via
  /// `update_settings` - the parameter store may have been touched
  /// since connect.
  pub fn configure_for_acquisition(&mut self) -> Result<(), BoardError> {
    if !self.is_connected() {
      error!("Board {} disconnected", self.module_id);
      return Err(BoardError::NotConnected);
    }
    if self.state == BoardState::Running {
      error!("Board {} already started", self.module_id);
      return Err(BoardError::AlreadyRunning);
    }
    let cfg = self.settings.clone();

    // board reset, then the PLL needs time to relock
    self.write_register(SW_RESET, 0x1)?;
    thread::sleep(Duration::from_millis(PLL_RELOCK_MS));

    // front panel I/O - defaults first, the configured values after
    // a settle
    self.write_register(FP_IO_CONTROL, 0x00000000)?;
    thread::sleep(Duration::from_millis(DAC_SETTLE_MS));
    self.write_register(FP_IO_CONTROL, cfg.fp_io_ctrl)?;
    self.write_register(FP_LVDS_IO_CTRL, cfg.fp_lvds_io_ctrl)?;

    self.check_firmware_revisions()?;

    match self.read_register(BOARD_FAILURE_STATUS) {
      Err(err)   => warn!("Can not read the failure status register! {}", err),
      Ok(status) => {
        if status != 0 {
          warn!("Board {} failure status reads 0x{:x}", self.module_id, status);
        }
      }
    }

    // A firmware bug makes the board misbehave with an all-zero
    // channel mask (bogus stored-event counts, dead event-ready
    // bit). Refuse to start.
    if cfg.channel_mask == 0 {
      error!("Channel mask of board {} is 0 (all channels disabled), refusing to configure!",
             self.module_id);
      return Err(BoardError::ChannelMaskZero);
    }

    self.write_register(ACQUISITION_CONTROL, cfg.acq_mode)?;
    if cfg.has_zle_firmware {
      self.write_register(BOARD_CONFIG, 0)?;
      self.write_register(ZLE_RECORD_LENGTH, cfg.record_length)?;
      self.write_register(ZLE_PRE_TRIGGER_SETTING, cfg.pre_trigger)?;
    } else {
      self.write_register(BOARD_CONFIG, cfg.board_config)?;
      self.write_register(RAW_BUFFER_ORGANIZATION, cfg.buffer_organization)?;
      self.write_register(RAW_CUSTOM_SIZE, cfg.record_length)?;
      self.write_register(RAW_POST_TRIGGER_SETTING, cfg.post_trigger)?;
      self.write_register(RAW_ALMOST_FULL_LEVEL, cfg.almost_full)?;
    }
    self.write_register(CHANNEL_EN_MASK, cfg.channel_mask)?;
    self.write_register(TRIG_SRCE_EN_MASK, cfg.trigger_source)?;
    self.write_register(FP_TRIGGER_OUT_EN_MASK, cfg.trigger_output)?;
    self.write_register(MONITOR_MODE, 0x3)?;  // buffer occupancy mode
    self.write_register(BLT_EVENT_NB, 0x1)?;

    self.data_format = if cfg.has_zle_firmware && cfg.enable_zle {
      DataFormat::Zle
    } else {
      DataFormat::Raw
    };

    self.write_channel_registers(&cfg)?;

    // settle after changing the DAC offsets before calibrating
    thread::sleep(Duration::from_millis(DAC_SETTLE_MS));
    self.run_adc_calibration(&cfg)?;

    // final check - the board is of no use without a locked clock
    let status = self.read_register(ACQUISITION_STATUS)?;
    info!("Board {} ({}) configured, acquisition status 0x{:x}",
          self.module_id, self.name(), status);
    if status & ACQ_STATUS_PLL_LOCKED == 0 {
      error!("Board {} (link {} chain pos {}) not initialized properly, acq status 0x{:x}",
             self.module_id, self.link, self.board, status);
      return Err(BoardError::HardwareInit);
    }
    Ok(())
  }

  /// All channels must agree on the AMC firmware revision and the
  /// AMC and ROC revisions should match the expected constants.
  /// Mismatches are logged but do not stop the configuration.
  fn check_firmware_revisions(&self) -> Result<(), BoardError> {
    let mut version   = 0u32;
    let mut prev_chan = 0u32;
    for ch in 0..N_CHANNELS {
      version = self.read_register(channel_reg(CHANNEL_FPGA_FW_REV, ch))?;
      if ch != 0 && version != prev_chan {
        error!("Channels of board {} have different AMC firmware! (0x{:08x} vs 0x{:08x})",
               self.module_id, version, prev_chan);
      }
      prev_chan = version;
    }
    if version != EXPECTED_AMC_FW_REV {
      error!("Incorrect AMC firmware version on board {}: 0x{:08x}, 0x{:08x} expected",
             self.module_id, version, EXPECTED_AMC_FW_REV);
    }
    let roc = self.read_register(ROC_FPGA_FW_REV)?;
    if roc != EXPECTED_ROC_FW_REV {
      error!("Incorrect ROC firmware version on board {}: 0x{:08x}, 0x{:08x} expected",
             self.module_id, roc, EXPECTED_ROC_FW_REV);
    }
    Ok(())
  }

  fn write_channel_registers(&self, cfg : &BoardSettings) -> Result<(), BoardError> {
    for ch in 0..N_CHANNELS {
      if cfg.has_zle_firmware {
        self.write_register(channel_reg(ZLE_CHANNEL_THRESHOLD, ch),
                            cfg.selftrigger_threshold[ch])?;
        self.write_register(channel_reg(ZLE_ZS_NSAMP_BEFORE, ch),
                            cfg.zle_bins_before[ch])?;
        self.write_register(channel_reg(ZLE_ZS_NSAMP_AFTER, ch),
                            cfg.zle_bins_after[ch])?;
        self.write_register(channel_reg(ZLE_ZS_BASELINE, ch),
                            cfg.zle_baseline[ch])?;
        // signed threshold goes to the register in sign-magnitude
        let threshold = cfg.zle_signed_threshold[ch];
        let encoded   = if threshold >= 0 {
          threshold as u32
        } else {
          0x80000000 | (-threshold) as u32
        };
        self.write_register(channel_reg(ZLE_ZS_THRESHOLD, ch), encoded)?;
        // The input control register selects ZLE operation and the
        // trigger polarity. Raw firmware keeps the polarity in the
        // board configuration; under ZLE firmware that bit does not
        // apply, so it is translated here.
        // raw: board config bit 6, 0 => positive pulses
        // zle: input control bit 8, 1 => positive pulses
        let neg_pulses = (cfg.board_config >> BOARD_CONFIG_POLARITY_BIT) & 0x1 == 1;
        let mut input_control = 0u32;
        if !neg_pulses {
          input_control |= 1 << INPUT_CONTROL_POLARITY_BIT;
        }
        if !cfg.enable_zle {
          input_control |= 1 << INPUT_CONTROL_ZLE_OFF_BIT;
        }
        self.write_register(channel_reg(ZLE_INPUT_CONTROL, ch), input_control)?;
      } else {
        self.write_register(channel_reg(RAW_CHANNEL_THRESHOLD, ch),
                            cfg.selftrigger_threshold[ch])?;
      }
      self.write_register(channel_reg(CHANNEL_DAC, ch), cfg.dac[ch])?;
      let range = if cfg.dynamic_range_2v[ch] { 0 } else { 1 };
      self.write_register(channel_reg(CHANNEL_DYNAMIC_RANGE, ch), range)?;
    }
    // the trigger logic registers exist once per channel pair
    for pair in 0..N_CHANNELS / 2 {
      self.write_register(channel_reg(SELFTRIGGER_LOGIC, pair * 2),
                          cfg.selftrigger_logic[pair])?;
    }
    Ok(())
  }

  /// Toggle the calibration bit and wait for the per-channel done
  /// bits with a fixed deadline per channel. In dual edge sampling
  /// mode the even channels are disabled first and skipped.
  fn run_adc_calibration(&self, cfg : &BoardSettings) -> Result<(), BoardError> {
    let des_mode = (cfg.board_config >> BOARD_CONFIG_DES_BIT) & 0x1 == 1;
    if des_mode {
      let mut mask = self.read_register(CHANNEL_EN_MASK)?;
      for ch in (0..N_CHANNELS).step_by(2) {
        mask &= !(1 << ch);
      }
      self.write_register(CHANNEL_EN_MASK, mask)?;
    }

    let mut calib = self.read_register(ADC_CALIBRATION)?;
    calib &= !ADC_CALIB_START_BIT;
    self.write_register(ADC_CALIBRATION, calib)?;
    calib |= ADC_CALIB_START_BIT;
    self.write_register(ADC_CALIBRATION, calib)?;

    for ch in 0..N_CHANNELS {
      if des_mode && ch % 2 == 0 {
        continue;
      }
      let addr     = channel_reg(CHANNEL_STATUS, ch);
      let deadline = Instant::now() + Duration::from_secs(ADC_CALIB_DEADLINE_S);
      loop {
        let status = self.read_register(addr)?;
        if status & CHANNEL_STATUS_CALIBRATED != 0 {
          break;
        }
        if Instant::now() >= deadline {
          warn!("ADC calibration of board {} channel {} did not finish within {}s!",
                self.module_id, ch, ADC_CALIB_DEADLINE_S);
          break;
        }
        debug!("Waiting for the ADC calibration of board {} channel {}...",
               self.module_id, ch);
        thread::sleep(Duration::from_millis(50));
      }
    }

    calib &= !ADC_CALIB_START_BIT;
    self.write_register(ADC_CALIBRATION, calib)?;
    Ok(())
  }
}

impl fmt::Display for Board {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<Board : {} module {} {}>", self.name(), self.module_id, self.state)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::emulator::{compose_record,
                        EmulatedTransport};
  use crate::ring_buffer::event_ring;
  use crate::constants::RING_CAPACITY_BYTES;

  const CONNECT_TIMEOUT : Duration = Duration::from_millis(200);

  fn test_board(transport : &Arc<EmulatedTransport>, link : u8, pos : u8) -> Board {
    let transport : Arc<dyn OpticalTransport> = Arc::clone(transport) as Arc<dyn OpticalTransport>;
    Board::new(0, link, pos, link * 8 + pos, BoardSettings::new(), transport)
  }

  #[test]
  fn connect_and_disconnect() {
    let transport = Arc::new(EmulatedTransport::new());
    let mut board = test_board(&transport, 0, 0);
    assert!(!board.is_connected());
    board.connect(2, CONNECT_TIMEOUT).expect("connect failed");
    assert!(board.is_connected());
    assert_eq!(board.state(), BoardState::Idle);
    assert_eq!(board.connect(2, CONNECT_TIMEOUT).unwrap_err(),
               ConnectError::AlreadyConnected);
    board.disconnect();
    assert_eq!(board.state(), BoardState::Disconnected);
  }

  #[test]
  fn connect_times_out_on_hanging_open() {
    let transport = Arc::new(EmulatedTransport::new());
    transport.set_open_delay(Duration::from_millis(300));
    let mut board = test_board(&transport, 0, 0);
    let started   = Instant::now();
    assert_eq!(board.connect(2, Duration::from_millis(30)).unwrap_err(),
               ConnectError::Timeout);
    // two attempts, each bounded - nowhere near the 600ms two full
    // opens would take
    assert!(started.elapsed() < Duration::from_millis(250));
    assert!(!board.is_connected());
  }

  #[test]
  fn connect_rejects_wrong_board_type() {
    let transport = Arc::new(EmulatedTransport::new());
    transport.device(0, 0).override_reg(BOARD_INFO, 0x05);
    let mut board = test_board(&transport, 0, 0);
    assert_eq!(board.connect(2, CONNECT_TIMEOUT).unwrap_err(),
               ConnectError::BoardMismatch);
    assert!(!board.is_connected());
  }

  #[test]
  fn connect_reports_dead_slot() {
    let transport = Arc::new(EmulatedTransport::new());
    transport.kill_slot(0, 1);
    let mut board = test_board(&transport, 0, 1);
    assert_eq!(board.connect(2, CONNECT_TIMEOUT).unwrap_err(),
               ConnectError::Transport);
  }

  #[test]
  fn configure_happy_path() {
    let transport = Arc::new(EmulatedTransport::new());
    let mut board = test_board(&transport, 0, 0);
    board.connect(2, CONNECT_TIMEOUT).expect("connect failed");
    board.configure_for_acquisition().expect("configure failed");
    assert_eq!(board.data_format(), DataFormat::Raw);
    board.start().expect("start failed");
    assert!(board.is_running());
    board.stop().expect("stop failed");
    assert_eq!(board.state(), BoardState::Idle);
  }

  #[test]
  fn configure_refuses_zero_channel_mask() {
    let transport = Arc::new(EmulatedTransport::new());
    let mut board = test_board(&transport, 0, 0);
    let mut settings = BoardSettings::new();
    settings.channel_mask = 0;
    board.update_settings(settings);
    board.connect(2, CONNECT_TIMEOUT).expect("connect failed");
    assert_eq!(board.configure_for_acquisition().unwrap_err(),
               BoardError::ChannelMaskZero);
  }

  #[test]
  fn configure_fails_without_pll_lock() {
    let transport = Arc::new(EmulatedTransport::new());
    let device    = transport.device(0, 0);
    let mut board = test_board(&transport, 0, 0);
    board.connect(2, CONNECT_TIMEOUT).expect("connect failed");
    // pin the status register so the final check sees no lock
    device.override_reg(ACQUISITION_STATUS, 0);
    assert_eq!(board.configure_for_acquisition().unwrap_err(),
               BoardError::HardwareInit);
  }

  #[test]
  fn zle_settings_select_the_zle_format() {
    let transport = Arc::new(EmulatedTransport::new());
    let mut board = test_board(&transport, 0, 0);
    let mut settings = BoardSettings::new();
    settings.has_zle_firmware = true;
    settings.enable_zle       = true;
    board.update_settings(settings);
    board.connect(2, CONNECT_TIMEOUT).expect("connect failed");
    board.configure_for_acquisition().expect("configure failed");
    assert_eq!(board.data_format(), DataFormat::Zle);
  }

  #[test]
  fn read_event_drains_the_board_into_a_slot() {
    let transport = Arc::new(EmulatedTransport::new());
    let device    = transport.device(0, 0);
    let mut board = test_board(&transport, 0, 0);
    board.connect(2, CONNECT_TIMEOUT).expect("connect failed");

    // an event spanning several block transfers
    let record = compose_record(0x1234, 20000, false);
    device.push_event(record.clone());
    assert!(board.check_event_available().unwrap());

    let (mut producer, mut consumer, _monitor) = event_ring(RING_CAPACITY_BYTES);
    let n_bytes;
    {
      let slot = producer.reserve(Duration::from_millis(100)).expect("no slot");
      n_bytes  = board.read_event(slot).expect("readout failed");
    }
    assert_eq!(n_bytes, record.len());
    producer.commit(n_bytes).expect("commit failed");

    let stored = consumer.peek(Duration::from_millis(100)).expect("no event");
    assert_eq!(&stored[..n_bytes], record.as_slice());
    assert!(!board.check_event_available().unwrap());
  }

  #[test]
  fn pll_verify_retries_after_clearing_read() {
    let transport = Arc::new(EmulatedTransport::new());
    let device    = transport.device(0, 0);
    let mut board = test_board(&transport, 0, 0);
    board.connect(2, CONNECT_TIMEOUT).expect("connect failed");
    device.unlock_pll();
    // the emulator re-arms the lock on the clearing read, like the
    // hardware does when the loss was transient
    assert!(board.verify_pll_locked().expect("register trouble"));
  }
}
