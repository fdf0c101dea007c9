//! Client for the external trigger distribution box.
//!
//! The box publishes one opaque record per physical trigger on a
//! PUB socket; we subscribe with a non-blocking socket and poll with
//! a bounded retry per merged event. Its control plane takes two
//! imperative commands, start and stop, on a separate address -
//! those are only ever sent by the run controller.
//!
//! The transport buffers the last record of a previous run, so the
//! first record received after a run start is junk and gets dropped.

use std::thread;
use std::time::{Duration,
                Instant};

use crate::errors::TriggerBoxError;
use crate::settings::TriggerBoxSettings;

/// Anything that serves one trigger record per merged event. The
/// merge stage works against this trait so it can be exercised
/// without a socket.
pub trait TriggerFeed {
  /// One record within the given budget, or None
  fn next_record(&mut self, budget : Duration) -> Option<Vec<u8>>;

  /// A new run begins; the next received record is junk
  fn mark_run_start(&mut self);
}

pub struct TriggerBoxClient {
  subscriber : zmq::Socket,
  control    : zmq::Socket,
  settings   : TriggerBoxSettings,
  drop_next  : bool,
}

impl TriggerBoxClient {
  pub fn new(settings : &TriggerBoxSettings) -> Result<Self, TriggerBoxError> {
    let ctx = zmq::Context::new();
    let subscriber = match ctx.socket(zmq::SUB) {
      Err(err) => {
        error!("Unable to create SUB socket! {}", err);
        return Err(TriggerBoxError::SocketSetup);
      }
      Ok(socket) => socket,
    };
    if let Err(err) = subscriber.connect(&settings.data_address) {
      error!("Can not connect to trigger box at {}! {}", settings.data_address, err);
      return Err(TriggerBoxError::SocketSetup);
    }
    if let Err(err) = subscriber.set_subscribe(b"") {
      error!("Unable to subscribe! {}", err);
      return Err(TriggerBoxError::SocketSetup);
    }
    let control = match ctx.socket(zmq::PUSH) {
      Err(err) => {
        error!("Unable to create PUSH socket! {}", err);
        return Err(TriggerBoxError::SocketSetup);
      }
      Ok(socket) => socket,
    };
    // commands must not block the run transition forever
    if let Err(err) = control.set_sndtimeo(1000) {
      warn!("Can not set a send timeout on the control socket! {}", err);
    }
    if let Err(err) = control.connect(&settings.ctrl_address) {
      error!("Can not connect to trigger box control at {}! {}",
             settings.ctrl_address, err);
      return Err(TriggerBoxError::SocketSetup);
    }
    info!("Subscribed to the trigger box at {}", settings.data_address);
    Ok(Self {
      subscriber,
      control,
      settings  : settings.clone(),
      drop_next : true,
    })
  }

  /// Tell the box to start publishing trigger records
  pub fn send_start(&self) -> Result<(), TriggerBoxError> {
    match self.control.send("start", 0) {
      Err(err) => {
        error!("Unable to send start command to the trigger box! {}", err);
        Err(TriggerBoxError::SendFailed)
      }
      Ok(_) => {
        info!("Started trigger box run");
        Ok(())
      }
    }
  }

  /// Tell the box to stop publishing trigger records
  pub fn send_stop(&self) -> Result<(), TriggerBoxError> {
    match self.control.send("stop", 0) {
      Err(err) => {
        error!("Unable to send stop command to the trigger box! {}", err);
        Err(TriggerBoxError::SendFailed)
      }
      Ok(_) => {
        info!("Stopped trigger box run");
        Ok(())
      }
    }
  }

  fn try_recv(&self) -> Option<Vec<u8>> {
    match self.subscriber.recv_bytes(zmq::DONTWAIT) {
      Err(_)     => None,
      Ok(record) => Some(record),
    }
  }

  /// Throw away whatever is still queued on the data plane. Returns
  /// the number of discarded records.
  pub fn drain(&self) -> usize {
    let mut n_extra = 0usize;
    while self.try_recv().is_some() {
      n_extra += 1;
    }
    if n_extra > 0 {
      info!("Records left over from the trigger box: {}", n_extra);
    }
    n_extra
  }
}

impl TriggerFeed for TriggerBoxClient {
  /// Receive one record with a bounded retry. The socket itself
  /// never blocks; between attempts we sleep for the configured
  /// retry interval until the budget is spent.
  fn next_record(&mut self, budget : Duration) -> Option<Vec<u8>> {
    let deadline   = Instant::now() + budget;
    let retry_wait = Duration::from_millis(self.settings.retry_wait_ms);
    loop {
      match self.try_recv() {
        Some(record) => {
          if self.drop_next {
            self.drop_next = false;
            debug!("Flushed first record from the trigger box");
            continue;
          }
          return Some(record);
        }
        None => {
          if Instant::now() >= deadline {
            return None;
          }
          thread::sleep(retry_wait);
        }
      }
    }
  }

  fn mark_run_start(&mut self) {
    self.drop_next = true;
  }
}
