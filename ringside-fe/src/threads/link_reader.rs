//! One reader thread per optical link.
//!
//! The thread owns the boards of its link (they move in at spawn and
//! move back out through the join) and produces into each board's
//! ring buffer. It never talks to the merge stage.
//!
//! Backpressure: above the high-water mark of a ring the board is
//! skipped for the pass, its hardware buffer fills up and the board
//! asserts busy to the trigger distributor - better there than
//! overrunning the ring.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ringside_lib::board::Board;
use ringside_lib::constants::{RESERVE_TIMEOUT_MS,
                              RING_HIGH_WATER};
use ringside_lib::ring_buffer::RingProducer;
use ringside_lib::run_context::RunContext;

/// A board moved into its reader thread, paired with the write side
/// of its ring
pub struct ReaderBoard {
  pub board : Board,
  pub ring  : RingProducer,
}

/// Pin the current thread to a core besides the main thread's
fn pin_to_core(link : u8) {
  match core_affinity::get_core_ids() {
    None => {
      warn!("Can not query the core ids, reader for link {} stays unpinned!", link);
    }
    Some(core_ids) => {
      if core_ids.len() < 2 {
        warn!("Only {} cores, reader for link {} stays unpinned!", core_ids.len(), link);
        return;
      }
      // spread the readers over all cores except core 0 where the
      // main thread resides
      let index = 1 + (link as usize % (core_ids.len() - 1));
      if core_affinity::set_for_current(core_ids[index]) {
        info!("Reader for link {} pinned to core {}", link, index);
      } else {
        warn!("Pinning reader for link {} to core {} failed!", link, index);
      }
    }
  }
}

/// Reader loop for one link. Returns the boards and a status code,
/// 0 for a clean exit, -1 after a readout error.
pub fn link_reader(link   : u8,
                   mut boards : Vec<ReaderBoard>,
                   ctx    : Arc<RunContext>) -> (Vec<Board>, i32) {
  println!("==> Started reader thread for link {}", link);
  pin_to_core(link);

  let mut status         = 0i32;
  let mut boards_stopped = false;
  let reserve_timeout    = Duration::from_millis(RESERVE_TIMEOUT_MS);

  'main: loop {
    // a deferred stop without a trigger box stops the boards first;
    // their register space belongs to this thread, so we do it here
    if ctx.should_stop_boards() && !boards_stopped {
      for rb in boards.iter_mut() {
        if rb.board.is_running() {
          match rb.board.stop() {
            Err(err) => error!("Can not stop board {}! {}", rb.board.module_id(), err),
            Ok(_)    => info!("Stopped board {}", rb.board.module_id()),
          }
        }
      }
      boards_stopped = true;
    }

    if ctx.is_stop_pending() || boards_stopped {
      // no new reads, but stay alive for the drain
      if !ctx.is_run_active() {
        break;
      }
      thread::sleep(Duration::from_millis(1));
      continue;
    }

    for rb in boards.iter_mut() {
      if let Err(err) = rb.board.issue_sw_trigger_if_needed() {
        error!("Software trigger for board {} failed! {}", rb.board.module_id(), err);
      }

      // ring almost full - let the hardware buffer take the load
      // and raise busy instead
      let high_water = (rb.ring.capacity() as f32 * RING_HIGH_WATER) as usize;
      if rb.ring.fill_level_bytes() > high_water {
        continue;
      }

      match rb.board.check_event_available() {
        Err(err) => {
          error!("Event poll on board {} failed! {}", rb.board.module_id(), err);
          error!("Exiting thread for link {} with error", link);
          status = -1;
          break 'main;
        }
        Ok(false) => (),
        Ok(true)  => {
          let n_bytes;
          {
            let slot = match rb.ring.reserve(reserve_timeout) {
              Err(err) => {
                error!("Got a write slot timeout for link {} (module {}). Is the ring buffer full? {}",
                       link, rb.board.module_id(), err);
                error!("Exiting thread for link {} with error", link);
                status = -1;
                break 'main;
              }
              Ok(slot) => slot,
            };
            n_bytes = match rb.board.read_event(slot) {
              Err(err) => {
                error!("Readout routine error on link {} (module {})! {}",
                       link, rb.board.module_id(), err);
                error!("Exiting thread for link {} with error", link);
                status = -1;
                break 'main;
              }
              Ok(n_bytes) => n_bytes,
            };
          }
          if n_bytes > 0 {
            if let Err(err) = rb.ring.commit(n_bytes) {
              error!("Can not commit {} bytes for module {}! {}",
                     n_bytes, rb.board.module_id(), err);
              status = -1;
              break 'main;
            }
          }
        }
      }
      // don't hammer the optical bus
      thread::sleep(Duration::from_micros(1));
    }

    if !ctx.is_run_active() {
      break;
    }
  }

  ctx.note_reader_status(status);
  println!("==> Exiting reader thread for link {}, status {}", link, status);
  (boards.into_iter().map(|rb| rb.board).collect(), status)
}
