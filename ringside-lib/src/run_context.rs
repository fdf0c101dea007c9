//! Shared run state.
//!
//! One `RunContext` exists per run and brackets Arming to Idle. It
//! replaces a zoo of process-global flags with an explicitly owned
//! struct the controller hands (as an Arc) to every reader thread;
//! everything on it is atomic, there is no lock.

use std::fmt;
use std::sync::atomic::{AtomicBool,
                        AtomicI32,
                        AtomicU32,
                        Ordering};

pub struct RunContext {
  /// Readers loop while this is set; clearing it cancels them
  /// cooperatively within one pass.
  run_active          : AtomicBool,
  /// Suppresses new reads but keeps the readers alive for the drain
  stop_pending        : AtomicBool,
  /// Tells the readers to stop their boards (they own the register
  /// space during a run) and then idle
  stop_boards_pending : AtomicBool,
  /// The merge stage requests a stop exactly once per run
  stop_requested      : AtomicBool,
  /// Worst status any reader thread reported
  worst_reader_status : AtomicI32,
  run_id              : AtomicU32,
}

impl RunContext {
  pub fn new(run_id : u32) -> Self {
    Self {
      run_active          : AtomicBool::new(false),
      stop_pending        : AtomicBool::new(false),
      stop_boards_pending : AtomicBool::new(false),
      stop_requested      : AtomicBool::new(false),
      worst_reader_status : AtomicI32::new(0),
      run_id              : AtomicU32::new(run_id),
    }
  }

  pub fn run_id(&self) -> u32 {
    self.run_id.load(Ordering::Relaxed)
  }

  pub fn is_run_active(&self) -> bool {
    self.run_active.load(Ordering::SeqCst)
  }

  pub fn set_run_active(&self, active : bool) {
    self.run_active.store(active, Ordering::SeqCst);
  }

  pub fn is_stop_pending(&self) -> bool {
    self.stop_pending.load(Ordering::SeqCst)
  }

  pub fn set_stop_pending(&self, pending : bool) {
    self.stop_pending.store(pending, Ordering::SeqCst);
  }

  pub fn request_board_stop(&self) {
    self.stop_boards_pending.store(true, Ordering::SeqCst);
  }

  pub fn should_stop_boards(&self) -> bool {
    self.stop_boards_pending.load(Ordering::SeqCst)
  }

  /// Request a run stop. Returns true for the first caller only -
  /// re-entry is suppressed until the transition completes and the
  /// context is retired with the run.
  pub fn request_stop(&self) -> bool {
    !self.stop_requested.swap(true, Ordering::SeqCst)
  }

  pub fn is_stop_requested(&self) -> bool {
    self.stop_requested.load(Ordering::SeqCst)
  }

  /// Reader threads report their exit status here; the most negative
  /// one survives.
  pub fn note_reader_status(&self, status : i32) {
    self.worst_reader_status.fetch_min(status, Ordering::SeqCst);
  }

  pub fn worst_reader_status(&self) -> i32 {
    self.worst_reader_status.load(Ordering::SeqCst)
  }
}

impl fmt::Display for RunContext {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = String::from("<RunContext:");
    repr += &(format!("\n  run id       : {}", self.run_id()));
    repr += &(format!("\n  run active   : {}", self.is_run_active()));
    repr += &(format!("\n  stop pending : {}", self.is_stop_pending()));
    repr += &(format!("\n  stop request : {}", self.is_stop_requested()));
    repr += &(format!("\n  worst reader : {}>", self.worst_reader_status()));
    write!(f, "{}", repr)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stop_request_is_single_shot() {
    let ctx = RunContext::new(7);
    assert!(ctx.request_stop());
    assert!(!ctx.request_stop());
    assert!(ctx.is_stop_requested());
  }

  #[test]
  fn worst_reader_status_survives() {
    let ctx = RunContext::new(0);
    ctx.note_reader_status(0);
    ctx.note_reader_status(-1);
    ctx.note_reader_status(0);
    assert_eq!(ctx.worst_reader_status(), -1);
  }
}
