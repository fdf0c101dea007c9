//! The periodic monitor.
//!
//! Once per second (configurable) it walks all connected boards and
//! reads the stored-event count, the almost-full watermark, the ring
//! fill level and the PLL lock bit, derives the busy flag and ships
//! a [`BoardHealth`] record per board over a channel to whoever
//! publishes the health feed.
//!
//! The monitor only touches read-only status registers; the device
//! handles are shared with whichever thread owns the board at the
//! time.

use std::sync::{Arc,
                Mutex};
use std::sync::atomic::{AtomicBool,
                        Ordering};
use std::thread;
use std::time::{Duration,
                Instant};

use crossbeam_channel::Sender;

use ringside_lib::board::MonitorTap;
use ringside_lib::constants::N_CHANNELS;
use ringside_lib::health::{derive_busy,
                           BoardHealth};
use ringside_lib::registers::*;
use ringside_lib::ring_buffer::RingMonitor;

/// A monitor view on one board. The run controller swaps the ring
/// handle in at BeginRun and out at EndRun.
pub struct HealthTap {
  pub moni : MonitorTap,
  pub ring : Option<RingMonitor>,
}

fn read_health(tap : &HealthTap, pll_alarm : &AtomicBool) -> BoardHealth {
  let mut health = BoardHealth::new(tap.moni.module_id);

  match tap.moni.device.read32(EVENT_STORED) {
    Err(err)   => warn!("Can not read the stored-event count of board {}! {}",
                        tap.moni.module_id, err),
    Ok(stored) => health.stored_events = stored,
  }

  // no almost-full watermark register under ZLE firmware; busy then
  // means every hardware buffer is in use
  let mut almost_full = 0u32;
  if !tap.moni.has_zle {
    match tap.moni.device.read32(RAW_ALMOST_FULL_LEVEL) {
      Err(err) => warn!("Can not read the almost-full level of board {}! {}",
                       tap.moni.module_id, err),
      Ok(level) => almost_full = level,
    }
  }
  health.busy = derive_busy(health.stored_events, almost_full);

  if let Some(ring) = &tap.ring {
    health.ring_fill_bytes = ring.fill_level_bytes();
    health.ring_events     = ring.event_count();
  }

  match tap.moni.device.read32(ACQUISITION_STATUS) {
    Err(err) => {
      warn!("Can not read the acquisition status of board {}! {}",
            tap.moni.module_id, err);
      health.pll_locked = false;
    }
    Ok(status) => {
      health.pll_locked = status & ACQ_STATUS_PLL_LOCKED != 0;
      if !health.pll_locked {
        error!("Board {} lost the PLL lock! (status 0x{:x})",
               tap.moni.module_id, status);
        pll_alarm.store(true, Ordering::SeqCst);
        // the clearing read re-arms the hardware latch, the next
        // good reading re-arms the alarm flag
        let _ = tap.moni.device.read32(READOUT_STATUS);
      } else {
        pll_alarm.store(false, Ordering::SeqCst);
      }
    }
  }

  for ch in 0..N_CHANNELS {
    match tap.moni.device.read32(channel_reg(CHANNEL_TEMPERATURE, ch)) {
      Err(_)     => (),
      Ok(value)  => health.temperatures[ch] = value,
    }
  }
  health
}

/// Monitor thread. Lives from startup to process exit; the taps
/// vector is shared with the run controller which updates the ring
/// handles at the run transitions.
pub fn monitor_boards(taps          : Arc<Mutex<Vec<HealthTap>>>,
                      health_sender : Sender<BoardHealth>,
                      pll_alarm     : Arc<AtomicBool>,
                      shutdown      : Arc<AtomicBool>,
                      interval_sec  : u64) {
  if interval_sec == 0 {
    info!("Monitor interval is 0, monitoring disabled!");
    return;
  }
  println!("==> Started monitoring thread!");
  let interval  = Duration::from_secs(interval_sec);
  let mut timer = Instant::now();
  loop {
    if shutdown.load(Ordering::SeqCst) {
      println!("==> Stopping monitoring thread, shutdown signal received!");
      break;
    }
    if timer.elapsed() >= interval {
      match taps.lock() {
        Err(err) => {
          error!("Can not acquire the lock on the monitor taps! {}", err);
        }
        Ok(taps) => {
          for tap in taps.iter() {
            let health = read_health(tap, &pll_alarm);
            match health_sender.try_send(health) {
              Err(err) => error!("Issue sending BoardHealth {:?}", err),
              Ok(_)    => trace!("Sent BoardHealth successfully!"),
            }
          }
        }
      }
      timer = Instant::now();
    }
    thread::sleep(Duration::from_millis(100));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ringside_lib::emulator::{compose_record,
                               EmulatedTransport};
  use ringside_lib::transport::OpticalTransport;

  #[test]
  fn health_reading_from_an_emulated_board() {
    let transport = EmulatedTransport::new();
    let device    = transport.device(0, 0);
    device.push_event(compose_record(0x10, 8, false));
    device.override_reg(RAW_ALMOST_FULL_LEVEL, 1);
    let handle = transport.open(0, 0).unwrap();
    let tap = HealthTap {
      moni : MonitorTap {
        module_id : 5,
        device    : handle,
        has_zle   : false,
      },
      ring : None,
    };
    let alarm  = AtomicBool::new(false);
    let health = read_health(&tap, &alarm);
    assert_eq!(health.module_id, 5);
    assert_eq!(health.stored_events, 1);
    // one stored event is at the almost-full watermark of 1
    assert!(health.busy);
    assert!(health.pll_locked);
    assert!(!alarm.load(Ordering::SeqCst));
  }

  #[test]
  fn pll_loss_latches_the_alarm() {
    let transport = EmulatedTransport::new();
    let device    = transport.device(0, 0);
    let handle    = transport.open(0, 0).unwrap();
    let tap = HealthTap {
      moni : MonitorTap {
        module_id : 0,
        device    : handle,
        has_zle   : false,
      },
      ring : None,
    };
    let alarm = AtomicBool::new(false);
    device.unlock_pll();
    let health = read_health(&tap, &alarm);
    assert!(!health.pll_locked);
    assert!(alarm.load(Ordering::SeqCst));
    // the clearing read re-armed the lock, a good reading re-arms
    // the alarm
    let health = read_health(&tap, &alarm);
    assert!(health.pll_locked);
    assert!(!alarm.load(Ordering::SeqCst));
  }
}
