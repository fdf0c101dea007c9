//! ringside-fe - frontend process for multi-board waveform
//! digitizer readout.
//!
//! The binary wires together the pieces from ringside-lib: it
//! connects the boards, spawns one pinned reader thread per optical
//! link and the periodic monitor, and runs the merge/poll stage and
//! the run state machine on the main thread.

#[macro_use] extern crate log;

pub mod sink;
pub mod merge;
pub mod run_control;
pub mod threads;
