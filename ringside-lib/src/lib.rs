//! ringside-lib - acquisition library for the ringside frontend
//!
//! Everything the frontend binary needs to talk to a daisy chain of
//! waveform digitizers on optical links: the register map, the board
//! driver, the per-board SPSC ring buffers, timestamp arithmetic for
//! the merge stage, the trigger box client and the settings.
//!
//! The hardware transport is abstracted behind a trait so that the
//! whole pipeline runs against the software emulator when no optical
//! adapter is present.

#[macro_use] extern crate log;

pub mod constants;
pub mod registers;
pub mod errors;
pub mod transport;
pub mod emulator;
pub mod ring_buffer;
pub mod timestamp;
pub mod event;
pub mod board;
pub mod trigger_box;
pub mod settings;
pub mod run_context;
pub mod health;

use std::io::Write;

use colored::{Colorize, ColoredString};
use log::Level;

/// Make sure the loglevel is in color, even though not using pretty_env_logger
pub fn color_log(level : &Level) -> ColoredString {
  match level {
    Level::Error => String::from(" ERROR!").red(),
    Level::Warn  => String::from(" WARN  ").yellow(),
    Level::Info  => String::from(" Info  ").green(),
    Level::Debug => String::from(" debug ").blue(),
    Level::Trace => String::from(" trace ").cyan(),
  }
}

/// Set up the env_logger with our format. RUST_LOG controls the level.
pub fn init_env_logger() {
  env_logger::Builder::from_default_env()
    .format(|buf, record| {
      writeln!(buf, "[{}] {} > {}",
               record.target(),
               color_log(&record.level()),
               record.args())
    })
    .init();
}
