//! Single-producer single-consumer byte rings, one per board.
//!
//! The producer is the link reader thread draining the board, the
//! consumer is the merge stage on the main thread. Between them sits
//! a power-of-two byte buffer with absolute (monotonically growing)
//! read and write indices; the index difference is the fill level.
//!
//! A write slot is always contiguous and large enough for one
//! maximum-size event. When the remaining space before the physical
//! end of the buffer is too small for that, the producer skips ahead
//! to the next capacity boundary and records the skip in `wrap_mark`;
//! the consumer jumps over the padding when its read index reaches
//! the mark.
//!
//! The event count is incremented on commit and decremented on
//! consume with sequentially consistent ordering, so a positive count
//! implies the committed bytes are visible to the consumer. No mutex
//! anywhere.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize,
                        Ordering};
use std::thread;
use std::time::{Duration,
                Instant};

use crate::constants::MAX_EVENT_BYTES;
use crate::errors::RingBufferError;

/// Sentinel for "no pending wrap"
const NO_WRAP : usize = usize::MAX;

/// Sleep quantum inside the bounded waits
const WAIT_SLICE : Duration = Duration::from_micros(100);

struct RingInner {
  buffer      : UnsafeCell<Box<[u8]>>,
  capacity    : usize,
  mask        : usize,
  wp          : AtomicUsize,
  rp          : AtomicUsize,
  wrap_mark   : AtomicUsize,
  event_count : AtomicUsize,
}

// The buffer is only written through the single RingProducer and only
// read behind the committed write index, see reserve/commit/peek.
unsafe impl Sync for RingInner {}
unsafe impl Send for RingInner {}

impl RingInner {
  fn fill_level_bytes(&self) -> usize {
    let wp = self.wp.load(Ordering::Acquire);
    let rp = self.rp.load(Ordering::Acquire);
    wp - rp
  }
}

/// Create a ring with the given capacity (bytes, power of two, at
/// least two maximum-size events) and hand out the three endpoints.
pub fn event_ring(capacity : usize) -> (RingProducer, RingConsumer, RingMonitor) {
  assert!(capacity.is_power_of_two(),
          "ring capacity must be a power of two");
  assert!(capacity >= 2 * MAX_EVENT_BYTES,
          "ring capacity must hold at least 2 events");
  let inner = Arc::new(RingInner {
    buffer      : UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
    capacity,
    mask        : capacity - 1,
    wp          : AtomicUsize::new(0),
    rp          : AtomicUsize::new(0),
    wrap_mark   : AtomicUsize::new(NO_WRAP),
    event_count : AtomicUsize::new(0),
  });
  (RingProducer { inner : Arc::clone(&inner), pending : None },
   RingConsumer { inner : Arc::clone(&inner) },
   RingMonitor  { inner })
}

/// Write side, owned by exactly one link reader thread
pub struct RingProducer {
  inner   : Arc<RingInner>,
  /// absolute start index of the reserved but uncommitted slot
  pending : Option<usize>,
}

impl RingProducer {
  /// Wait for a contiguous write slot of `MAX_EVENT_BYTES`.
  ///
  /// Never overwrites unread bytes. Returns `TimedOut` when the
  /// consumer does not free enough space within `timeout`.
  pub fn reserve(&mut self, timeout : Duration) -> Result<&mut [u8], RingBufferError> {
    let deadline = Instant::now() + timeout;
    let wp       = self.inner.wp.load(Ordering::Relaxed);
    let offset   = wp & self.inner.mask;
    let pad      = if self.inner.capacity - offset < MAX_EVENT_BYTES {
      self.inner.capacity - offset
    } else {
      0
    };
    let start = wp + pad;
    loop {
      let rp = self.inner.rp.load(Ordering::Acquire);
      if start + MAX_EVENT_BYTES - rp <= self.inner.capacity {
        break;
      }
      if Instant::now() >= deadline {
        return Err(RingBufferError::TimedOut);
      }
      thread::sleep(WAIT_SLICE);
    }
    if pad > 0 {
      self.inner.wrap_mark.store(wp, Ordering::Release);
    }
    self.pending = Some(start);
    let begin = start & self.inner.mask;
    unsafe {
      let buffer = &mut *self.inner.buffer.get();
      Ok(&mut buffer[begin..begin + MAX_EVENT_BYTES])
    }
  }

  /// Publish `n_bytes` of the reserved slot as one complete event
  pub fn commit(&mut self, n_bytes : usize) -> Result<(), RingBufferError> {
    if n_bytes > MAX_EVENT_BYTES {
      return Err(RingBufferError::EventTooLarge);
    }
    match self.pending.take() {
      None => {
        warn!("Commit without a reserved slot, ignoring!");
        Ok(())
      }
      Some(start) => {
        self.inner.wp.store(start + n_bytes, Ordering::Release);
        self.inner.event_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
      }
    }
  }

  pub fn fill_level_bytes(&self) -> usize {
    self.inner.fill_level_bytes()
  }

  pub fn capacity(&self) -> usize {
    self.inner.capacity
  }
}

/// Read side, owned by the merge stage
pub struct RingConsumer {
  inner : Arc<RingInner>,
}

impl RingConsumer {
  /// Wait for the oldest complete event and return the committed
  /// contiguous bytes starting at it. The caller reads the event
  /// length from the record header and `consume`s exactly that much.
  pub fn peek(&mut self, timeout : Duration) -> Result<&[u8], RingBufferError> {
    let deadline = Instant::now() + timeout;
    while self.inner.event_count.load(Ordering::SeqCst) == 0 {
      if Instant::now() >= deadline {
        return Err(RingBufferError::TimedOut);
      }
      thread::sleep(WAIT_SLICE);
    }
    let mut rp = self.inner.rp.load(Ordering::Relaxed);
    if rp == self.inner.wrap_mark.load(Ordering::Acquire) {
      rp += self.inner.capacity - (rp & self.inner.mask);
      self.inner.wrap_mark.store(NO_WRAP, Ordering::Release);
      self.inner.rp.store(rp, Ordering::Release);
    }
    let wp    = self.inner.wp.load(Ordering::Acquire);
    let begin = rp & self.inner.mask;
    let avail = std::cmp::min(wp - rp, self.inner.capacity - begin);
    unsafe {
      let buffer = &*self.inner.buffer.get();
      Ok(&buffer[begin..begin + avail])
    }
  }

  /// Release one event of `n_bytes`
  pub fn consume(&mut self, n_bytes : usize) -> Result<(), RingBufferError> {
    let rp = self.inner.rp.load(Ordering::Relaxed);
    let wp = self.inner.wp.load(Ordering::Acquire);
    if rp + n_bytes > wp {
      return Err(RingBufferError::ConsumeBeyondWrite);
    }
    self.inner.rp.store(rp + n_bytes, Ordering::Release);
    self.inner.event_count.fetch_sub(1, Ordering::SeqCst);
    Ok(())
  }

  pub fn event_count(&self) -> usize {
    self.inner.event_count.load(Ordering::SeqCst)
  }

  pub fn fill_level_bytes(&self) -> usize {
    self.inner.fill_level_bytes()
  }
}

/// Shared read-only view for the periodic monitor
#[derive(Clone)]
pub struct RingMonitor {
  inner : Arc<RingInner>,
}

impl RingMonitor {
  pub fn fill_level_bytes(&self) -> usize {
    self.inner.fill_level_bytes()
  }

  pub fn event_count(&self) -> usize {
    self.inner.event_count.load(Ordering::SeqCst)
  }

  pub fn capacity(&self) -> usize {
    self.inner.capacity
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::constants::SIZEOF_U32;
  use crate::emulator::compose_record;
  use crate::event::parse_header;

  const TIMEOUT : Duration = Duration::from_millis(20);

  fn commit_record(producer : &mut RingProducer, timestamp : u32, payload_words : usize) {
    let record = compose_record(timestamp, payload_words, false);
    let slot   = producer.reserve(TIMEOUT).expect("no slot");
    slot[..record.len()].copy_from_slice(&record);
    producer.commit(record.len()).expect("commit failed");
  }

  #[test]
  fn fifo_order_and_event_count() {
    let (mut producer, mut consumer, monitor) = event_ring(2 * MAX_EVENT_BYTES);
    for ts in [0x10u32, 0x30, 0x50] {
      commit_record(&mut producer, ts, 16);
    }
    assert_eq!(monitor.event_count(), 3);
    for ts in [0x10u32, 0x30, 0x50] {
      let n_bytes;
      {
        let bytes  = consumer.peek(TIMEOUT).expect("no event");
        let header = parse_header(bytes).expect("bad header");
        assert_eq!(header.timestamp, ts);
        n_bytes = header.size_words as usize * SIZEOF_U32;
      }
      consumer.consume(n_bytes).expect("consume failed");
    }
    assert_eq!(monitor.event_count(), 0);
    assert_eq!(monitor.fill_level_bytes(), 0);
  }

  #[test]
  fn peek_times_out_on_empty_ring() {
    let (_producer, mut consumer, _monitor) = event_ring(2 * MAX_EVENT_BYTES);
    assert_eq!(consumer.peek(Duration::from_millis(5)).unwrap_err(),
               RingBufferError::TimedOut);
  }

  #[test]
  fn reserve_times_out_when_full() {
    let (mut producer, _consumer, _monitor) = event_ring(2 * MAX_EVENT_BYTES);
    for _ in 0..2 {
      let slot = producer.reserve(TIMEOUT).expect("no slot");
      let n    = slot.len();
      producer.commit(n).expect("commit failed");
    }
    assert_eq!(producer.reserve(Duration::from_millis(5)).unwrap_err(),
               RingBufferError::TimedOut);
  }

  #[test]
  fn wrap_keeps_slots_contiguous() {
    let (mut producer, mut consumer, monitor) = event_ring(2 * MAX_EVENT_BYTES);
    // run enough events through the ring to wrap several times
    for ts in 0..600u32 {
      commit_record(&mut producer, ts, 1024);
      let n_bytes;
      {
        let bytes  = consumer.peek(TIMEOUT).expect("no event");
        let header = parse_header(bytes).expect("bad header");
        assert_eq!(header.timestamp, ts);
        n_bytes = header.size_words as usize * SIZEOF_U32;
        assert!(bytes.len() >= n_bytes);
      }
      consumer.consume(n_bytes).expect("consume failed");
    }
    assert_eq!(monitor.event_count(), 0);
  }

  #[test]
  fn producer_and_consumer_on_separate_threads() {
    let (mut producer, mut consumer, monitor) = event_ring(2 * MAX_EVENT_BYTES);
    let n_events = 200u32;
    let handle = std::thread::spawn(move || {
      for ts in 0..n_events {
        let record = compose_record(ts, 64, false);
        let slot   = producer.reserve(Duration::from_secs(1)).expect("no slot");
        slot[..record.len()].copy_from_slice(&record);
        producer.commit(record.len()).expect("commit failed");
      }
    });
    let mut expected = 0u32;
    while expected < n_events {
      let n_bytes;
      {
        let bytes  = consumer.peek(Duration::from_secs(1)).expect("no event");
        let header = parse_header(bytes).expect("bad header");
        assert_eq!(header.timestamp, expected);
        n_bytes = header.size_words as usize * SIZEOF_U32;
      }
      consumer.consume(n_bytes).expect("consume failed");
      expected += 1;
    }
    handle.join().expect("producer panicked");
    assert_eq!(monitor.event_count(), 0);
  }
}
