//! Downstream event sink.
//!
//! The core only needs three calls: open an event, append named
//! sub-records, close the event. How the merged event is framed
//! downstream is not our business; the PUB sink ships the
//! sub-records as zmq multipart messages, the memory sink collects
//! them for the tests.

pub trait EventSink {
  fn begin_event(&mut self);
  fn add_subrecord(&mut self, name : &str, bytes : &[u8]);
  /// Close the event and hand it downstream. Returns its total
  /// payload size in bytes.
  fn end_event(&mut self) -> usize;
  /// Payload bytes accumulated in the open event
  fn current_size(&self) -> usize;
}

/// Publishes merged events on a PUB socket, one multipart message
/// per event: a leading "RSEV" frame, then alternating name and
/// payload frames in board order.
pub struct PubSink {
  socket        : zmq::Socket,
  frames        : Vec<(String, Vec<u8>)>,
  current_bytes : usize,
  n_events      : usize,
}

impl PubSink {
  pub fn new(address : &str) -> Self {
    let ctx    = zmq::Context::new();
    let socket = ctx.socket(zmq::PUB).expect("Unable to create 0MQ PUB socket!");
    socket.bind(address).expect("Unable to bind to (PUB) socket!");
    info!("Publishing merged events on {}", address);
    Self {
      socket,
      frames        : Vec::new(),
      current_bytes : 0,
      n_events      : 0,
    }
  }

  pub fn n_events(&self) -> usize {
    self.n_events
  }
}

impl EventSink for PubSink {
  fn begin_event(&mut self) {
    self.frames.clear();
    self.current_bytes = 0;
  }

  fn add_subrecord(&mut self, name : &str, bytes : &[u8]) {
    self.current_bytes += bytes.len();
    self.frames.push((String::from(name), bytes.to_vec()));
  }

  fn end_event(&mut self) -> usize {
    let mut parts = Vec::<Vec<u8>>::with_capacity(1 + 2 * self.frames.len());
    parts.push(b"RSEV".to_vec());
    for (name, payload) in self.frames.drain(..) {
      parts.push(name.into_bytes());
      parts.push(payload);
    }
    match self.socket.send_multipart(parts, 0) {
      Err(err) => error!("Merged event sending failed! Err {}", err),
      Ok(_)    => debug!("Merged event sent!"),
    }
    self.n_events += 1;
    let size = self.current_bytes;
    self.current_bytes = 0;
    size
  }

  fn current_size(&self) -> usize {
    self.current_bytes
  }
}

/// Collects merged events in memory, for tests
#[derive(Default)]
pub struct MemorySink {
  pub events    : Vec<Vec<(String, Vec<u8>)>>,
  current       : Vec<(String, Vec<u8>)>,
  current_bytes : usize,
}

impl MemorySink {
  pub fn new() -> Self {
    Self::default()
  }
}

impl EventSink for MemorySink {
  fn begin_event(&mut self) {
    self.current.clear();
    self.current_bytes = 0;
  }

  fn add_subrecord(&mut self, name : &str, bytes : &[u8]) {
    self.current_bytes += bytes.len();
    self.current.push((String::from(name), bytes.to_vec()));
  }

  fn end_event(&mut self) -> usize {
    self.events.push(std::mem::take(&mut self.current));
    let size = self.current_bytes;
    self.current_bytes = 0;
    size
  }

  fn current_size(&self) -> usize {
    self.current_bytes
  }
}
