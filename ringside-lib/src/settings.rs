//! Aggregate settings for the frontend.
//!
//! One .toml file configures the whole process; it is the read side
//! of the parameter store. The per-board sections hold everything
//! `Board::configure_for_acquisition` pushes to the hardware, the
//! top level holds the process wide knobs of the merge stage and the
//! run controller.
//!
//! The file is re-read at every run start, so configuration touched
//! between runs takes effect at the next BeginRun.

use std::fmt;
use std::fs;

use crate::constants::{DRAIN_DEADLINE_S,
                       N_CHANNELS,
                       TRIGGER_BOX_BUDGET_MS,
                       TRIGGER_BOX_RETRY_MS};
use crate::errors::SettingsError;

/// Per-board hardware configuration.
///
/// The zle_* blocks and `pre_trigger` only matter under ZLE
/// firmware, `buffer_organization`, `post_trigger` and `almost_full`
/// only under raw firmware. Both variants share `record_length`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BoardSettings {
  /// Include this board in the readout
  pub enable                : bool,
  /// Selects the firmware variant register layout
  pub has_zle_firmware      : bool,
  /// Acquisition-mode register value
  pub acq_mode              : u32,
  /// Board-configuration register (polarity bit, ZLE bit, DES bit)
  pub board_config          : u32,
  pub buffer_organization   : u32,
  /// Samples per event
  pub record_length         : u32,
  pub pre_trigger           : u32,
  pub post_trigger          : u32,
  /// Must not be zero
  pub channel_mask          : u32,
  pub trigger_source        : u32,
  pub trigger_output        : u32,
  pub fp_io_ctrl            : u32,
  pub fp_lvds_io_ctrl       : u32,
  pub enable_zle            : bool,
  /// Busy watermark; 0 means busy only when all buffers are used
  pub almost_full           : u32,
  pub selftrigger_threshold : [u32; N_CHANNELS],
  pub selftrigger_logic     : [u32; N_CHANNELS / 2],
  /// Signed; encoded sign-magnitude at the register
  pub zle_signed_threshold  : [i32; N_CHANNELS],
  pub zle_bins_before       : [u32; N_CHANNELS],
  pub zle_bins_after        : [u32; N_CHANNELS],
  pub zle_baseline          : [u32; N_CHANNELS],
  /// DC offset
  pub dac                   : [u32; N_CHANNELS],
  /// 2V input range, otherwise 0.5V
  pub dynamic_range_2v      : [bool; N_CHANNELS],
  /// 0 disables the self-paced software trigger
  pub sw_trig_rate_hz       : f32,
}

impl BoardSettings {
  pub fn new() -> Self {
    Self {
      enable                : true,
      has_zle_firmware      : false,
      acq_mode              : 3,
      board_config          : 16,
      buffer_organization   : 10,
      record_length         : 625,
      pre_trigger           : 200,
      post_trigger          : 576,
      channel_mask          : 255,
      trigger_source        : 0x40000000,
      trigger_output        : 0x40000000,
      fp_io_ctrl            : 0x104,
      fp_lvds_io_ctrl       : 0x22,
      enable_zle            : false,
      almost_full           : 512,
      selftrigger_threshold : [3870; N_CHANNELS],
      selftrigger_logic     : [2; N_CHANNELS / 2],
      zle_signed_threshold  : [-3895; N_CHANNELS],
      zle_bins_before       : [5; N_CHANNELS],
      zle_bins_after        : [5; N_CHANNELS],
      zle_baseline          : [0x2000; N_CHANNELS],
      dac                   : [10000; N_CHANNELS],
      dynamic_range_2v      : [true; N_CHANNELS],
      sw_trig_rate_hz       : 0.0,
    }
  }
}

impl Default for BoardSettings {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for BoardSettings {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp = toml::to_string(self).unwrap_or(
      String::from("-- SERIALIZATION ERROR! --"));
    write!(f, "<BoardSettings :\n{}>", disp)
  }
}

/// Addresses and budgets for the external trigger box
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TriggerBoxSettings {
  /// Use the trigger box at all. Requires merging.
  pub enable_trigger_box : bool,
  /// Subscribe address of the data plane (one record per trigger)
  pub data_address       : String,
  /// Address taking the out-of-band start/stop commands
  pub ctrl_address       : String,
  /// Budget for one record per merged event (ms)
  pub recv_budget_ms     : u64,
  /// Wait between receive attempts (ms)
  pub retry_wait_ms      : u64,
}

impl TriggerBoxSettings {
  pub fn new() -> Self {
    Self {
      enable_trigger_box : false,
      data_address       : String::from("tcp://trigger-box:5555"),
      ctrl_address       : String::from("tcp://trigger-box:5556"),
      recv_budget_ms     : TRIGGER_BOX_BUDGET_MS,
      retry_wait_ms      : TRIGGER_BOX_RETRY_MS,
    }
  }
}

impl Default for TriggerBoxSettings {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for TriggerBoxSettings {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp = toml::to_string(self).unwrap_or(
      String::from("-- SERIALIZATION ERROR! --"));
    write!(f, "<TriggerBoxSettings :\n{}>", disp)
  }
}

/// The health feed of the periodic monitor
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MonitorSettings {
  /// Seconds between health records, 0 disables the monitor
  pub moni_interval_sec : u64,
  /// PUB address the health records go out on
  pub health_pub_address : String,
}

impl MonitorSettings {
  pub fn new() -> Self {
    Self {
      moni_interval_sec  : 1,
      health_pub_address : String::from("tcp://0.0.0.0:42150"),
    }
  }
}

impl Default for MonitorSettings {
  fn default() -> Self {
    Self::new()
  }
}

/// Process wide settings
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FrontendSettings {
  /// Index of this frontend process, for multi-host setups
  pub frontend_index                 : u8,
  /// Optical links controlled by this frontend
  pub n_links                        : u8,
  /// Daisy-chained boards per link
  pub boards_per_link                : u8,
  /// End the run after this many seconds
  pub runtime_sec                    : u64,
  /// One merged event takes one record per connected board;
  /// otherwise any single board's record makes an event
  pub merge_data_from_boards         : bool,
  /// Emit merged events missing some boards instead of waiting
  pub write_partially_merged_events  : bool,
  /// Drain the ring buffers before completing a stop
  pub flush_buffers_at_end_of_run    : bool,
  /// Matching window for the merge stage, in 8ns clock ticks
  pub ts_match_thresh_ticks          : u32,
  /// Deadline for the end-of-run drain (s)
  pub drain_timeout_sec              : u64,
  pub connect_attempts               : usize,
  pub connect_timeout_sec            : u64,
  /// PUB address merged events go out on
  pub sink_pub_address               : String,
  pub trigger_box                    : TriggerBoxSettings,
  pub monitor                        : MonitorSettings,
  /// One entry per chain slot, enumerated link by link
  pub boards                         : Vec<BoardSettings>,
}

impl FrontendSettings {
  pub fn new() -> Self {
    Self {
      frontend_index                : 0,
      n_links                       : 1,
      boards_per_link               : 1,
      runtime_sec                   : 0,
      merge_data_from_boards        : true,
      write_partially_merged_events : false,
      flush_buffers_at_end_of_run   : true,
      ts_match_thresh_ticks         : 50,
      drain_timeout_sec             : DRAIN_DEADLINE_S,
      connect_attempts              : 2,
      connect_timeout_sec           : 5,
      sink_pub_address              : String::from("tcp://0.0.0.0:42100"),
      trigger_box                   : TriggerBoxSettings::new(),
      monitor                       : MonitorSettings::new(),
      boards                        : vec![BoardSettings::new()],
    }
  }

  pub fn n_boards(&self) -> usize {
    self.n_links as usize * self.boards_per_link as usize
  }

  /// Sanity checks which have to hold before we touch any hardware
  pub fn validate(&self) -> Result<(), SettingsError> {
    if self.trigger_box.enable_trigger_box && !self.merge_data_from_boards {
      error!("Invalid setup - you must merge data from all boards if running with the trigger box!");
      return Err(SettingsError::InvalidCombination);
    }
    if self.boards.len() != self.n_boards() {
      error!("Expected {} board sections ({} links x {} boards), found {}!",
             self.n_boards(), self.n_links, self.boards_per_link, self.boards.len());
      return Err(SettingsError::InvalidCombination);
    }
    Ok(())
  }

  pub fn from_toml(filename : &str) -> Result<Self, SettingsError> {
    let content = match fs::read_to_string(filename) {
      Err(err) => {
        error!("Unable to read settings file {}! {}", filename, err);
        return Err(SettingsError::FileNotReadable);
      }
      Ok(content) => content,
    };
    match toml::from_str::<FrontendSettings>(&content) {
      Err(err) => {
        error!("Unable to parse settings file {}! {}", filename, err);
        Err(SettingsError::ParseError)
      }
      Ok(settings) => Ok(settings),
    }
  }

  pub fn to_toml(&self, filename : &str) -> Result<(), SettingsError> {
    let content = match toml::to_string_pretty(self) {
      Err(err) => {
        error!("Unable to serialize settings! {}", err);
        return Err(SettingsError::SerializationError);
      }
      Ok(content) => content,
    };
    match fs::write(filename, content) {
      Err(err) => {
        error!("Unable to write settings file {}! {}", filename, err);
        Err(SettingsError::FileNotReadable)
      }
      Ok(_) => Ok(()),
    }
  }
}

impl Default for FrontendSettings {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for FrontendSettings {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp = toml::to_string(self).unwrap_or(
      String::from("-- SERIALIZATION ERROR! --"));
    write!(f, "<FrontendSettings :\n{}>", disp)
  }
}
