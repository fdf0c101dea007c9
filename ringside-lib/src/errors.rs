//! Specific error types
//!
//!

use std::error::Error;
use std::fmt;

////////////////////////////////////////

/// Register I/O or block transfer trouble on the optical link
#[derive(Debug, Copy, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum TransportError {
  OpenFailed,
  NotConnected,
  ReadError,
  WriteError,
}

impl fmt::Display for TransportError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp = serde_json::to_string(self).unwrap_or(
      String::from("Error: cannot unwrap this TransportError"));
    write!(f, "<TransportError : {}>", disp)
  }
}

impl Error for TransportError {
}

////////////////////////////////////////

/// Outcome of a failed connection attempt
#[derive(Debug, Copy, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum ConnectError {
  AlreadyConnected,
  Timeout,
  Transport,
  BoardMismatch,
}

impl fmt::Display for ConnectError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp = serde_json::to_string(self).unwrap_or(
      String::from("Error: cannot unwrap this ConnectError"));
    write!(f, "<ConnectError : {}>", disp)
  }
}

impl Error for ConnectError {
}

////////////////////////////////////////

/// Errors of the board driver while configuring or reading out
#[derive(Debug, Copy, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum BoardError {
  NotConnected,
  AlreadyRunning,
  NotRunning,
  SettingsMissing,
  ChannelMaskZero,
  HardwareInit,
  Transport,
}

impl fmt::Display for BoardError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp = serde_json::to_string(self).unwrap_or(
      String::from("Error: cannot unwrap this BoardError"));
    write!(f, "<BoardError : {}>", disp)
  }
}

impl Error for BoardError {
}

impl From<TransportError> for BoardError {
  fn from(_ : TransportError) -> Self {
    BoardError::Transport
  }
}

////////////////////////////////////////

/// Bounded waits on the ring buffer can expire
#[derive(Debug, Copy, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum RingBufferError {
  TimedOut,
  EventTooLarge,
  ConsumeBeyondWrite,
}

impl fmt::Display for RingBufferError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp = serde_json::to_string(self).unwrap_or(
      String::from("Error: cannot unwrap this RingBufferError"));
    write!(f, "<RingBufferError : {}>", disp)
  }
}

impl Error for RingBufferError {
}

////////////////////////////////////////

/// Malformed event records surfacing in the merge stage
#[derive(Debug, Copy, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum RecordError {
  BadTag,
  TooShort,
  SizeMismatch,
}

impl fmt::Display for RecordError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp = serde_json::to_string(self).unwrap_or(
      String::from("Error: cannot unwrap this RecordError"));
    write!(f, "<RecordError : {}>", disp)
  }
}

impl Error for RecordError {
}

////////////////////////////////////////

/// Trouble with the trigger box sockets
#[derive(Debug, Copy, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum TriggerBoxError {
  SocketSetup,
  SendFailed,
  NoRecord,
}

impl fmt::Display for TriggerBoxError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp = serde_json::to_string(self).unwrap_or(
      String::from("Error: cannot unwrap this TriggerBoxError"));
    write!(f, "<TriggerBoxError : {}>", disp)
  }
}

impl Error for TriggerBoxError {
}

////////////////////////////////////////

/// Settings file problems. The underlying parser error gets logged
/// where it occurs, these variants classify it for the exit code.
#[derive(Debug, Copy, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum SettingsError {
  FileNotReadable,
  ParseError,
  SerializationError,
  InvalidCombination,
}

impl fmt::Display for SettingsError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp = serde_json::to_string(self).unwrap_or(
      String::from("Error: cannot unwrap this SettingsError"));
    write!(f, "<SettingsError : {}>", disp)
  }
}

impl Error for SettingsError {
}

////////////////////////////////////////

/// Run transition failures of the run controller
#[derive(Debug, Copy, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum RunControlError {
  NotIdle,
  NotRunning,
  NotPaused,
  HardwareInit,
  UnexpectedBoardCount,
  PLLNotLocked,
  TriggerBoxSetup,
}

impl fmt::Display for RunControlError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp = serde_json::to_string(self).unwrap_or(
      String::from("Error: cannot unwrap this RunControlError"));
    write!(f, "<RunControlError : {}>", disp)
  }
}

impl Error for RunControlError {
}
