//! The merge / poll stage.
//!
//! Runs on the main thread. Every cycle it decides whether a merged
//! event is ready (one record per connected board, or any record in
//! degraded mode), picks the reference timestamp (the trigger box
//! record's if the box is in use, the earliest board head otherwise,
//! with the 31 bit rollover accounted for), and assembles one
//! downstream event from each board whose head record falls within
//! the matching window.
//!
//! Matching happens on peeked headers first - when a full merge is
//! required and some board misses the window, nothing is consumed
//! and the records wait for the next cycle.

use std::time::Duration;

use ringside_lib::constants::{MERGED_EVENT_BUDGET_BYTES,
                              PEEK_TIMEOUT_MS,
                              SIZEOF_U32};
use ringside_lib::event::{clamp_record,
                          parse_header,
                          word3_timestamp,
                          RecordHeader};
use ringside_lib::ring_buffer::RingConsumer;
use ringside_lib::run_context::RunContext;
use ringside_lib::timestamp::{delta,
                              earliest};
use ringside_lib::trigger_box::TriggerFeed;

use crate::sink::EventSink;

/// Merge policy, frozen from the settings at BeginRun
#[derive(Debug, Clone)]
pub struct MergeConfig {
  pub merge_across_boards   : bool,
  pub use_trigger_box       : bool,
  pub accept_partial_merges : bool,
  /// matching window in 8ns clock ticks
  pub ts_match_window       : u32,
  /// budget for one trigger box record
  pub trigger_box_budget    : Duration,
}

/// Consumer end of one board's ring plus what the framing needs
pub struct BoardTap {
  pub module_id : u8,
  pub ring      : RingConsumer,
  /// encoding variant of this board's records
  pub zle       : bool,
}

impl BoardTap {
  fn subrecord_name(&self) -> String {
    if self.zle {
      format!("ZL{:02}", self.module_id)
    } else {
      format!("W2{:02}", self.module_id)
    }
  }
}

/// What one poll cycle did
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum PollOutcome {
  /// readiness not met, nothing touched
  NotReady,
  /// a merged event went to the sink (total payload bytes)
  EventWritten(usize),
  /// boards outside the window and partial merges disallowed;
  /// nothing consumed
  Abandoned,
  /// protocol violation or missing mandatory trigger box record -
  /// the run has to stop
  StopRun,
}

/// Counters for the periodic statistics printout
#[derive(Debug, Default, Clone)]
pub struct MergeStats {
  pub n_events_built      : usize,
  pub n_records_merged    : usize,
  pub n_cycles_abandoned  : usize,
  pub n_oversize_clamped  : usize,
}

impl MergeStats {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn print(&self) {
    println!("[MERGE] ==> Built {} merged events", self.n_events_built);
    println!("[MERGE] ==> Merged {} board records", self.n_records_merged);
    println!("[MERGE] ==> Abandoned {} cycles (partial merges disallowed)", self.n_cycles_abandoned);
    if self.n_oversize_clamped > 0 {
      println!("[MERGE] ==> Clamped {} oversize records!", self.n_oversize_clamped);
    }
  }
}

fn peek_timeout() -> Duration {
  Duration::from_millis(PEEK_TIMEOUT_MS)
}

/// Peek the head record of every tap. An empty ring or a record
/// without the proper tag after a positive readiness check is a
/// protocol violation; the caller stops the run then.
fn peek_heads(taps : &mut [BoardTap]) -> Result<Vec<RecordHeader>, u8> {
  let mut heads = Vec::<RecordHeader>::with_capacity(taps.len());
  for tap in taps.iter_mut() {
    let module_id = tap.module_id;
    match tap.ring.peek(peek_timeout()) {
      Err(err) => {
        error!("No event in the ring for module {} after a positive readiness check! {}",
               module_id, err);
        return Err(module_id);
      }
      Ok(bytes) => {
        match parse_header(bytes) {
          Err(err) => {
            error!("Incorrect header for module {}! {}", module_id, err);
            return Err(module_id);
          }
          Ok(header) => heads.push(header),
        }
      }
    }
  }
  Ok(heads)
}

/// Move the head record of `tap` into the open sink event, clamping
/// it if it busts the remaining event budget.
fn write_head_record(tap   : &mut BoardTap,
                     sink  : &mut dyn EventSink,
                     stats : &mut MergeStats) -> Result<(), ()> {
  let name = tap.subrecord_name();
  let n_bytes;
  {
    let bytes = match tap.ring.peek(peek_timeout()) {
      Err(err) => {
        error!("Lost the head record of module {}! {}", tap.module_id, err);
        return Err(());
      }
      Ok(bytes) => bytes,
    };
    let header = match parse_header(bytes) {
      Err(err) => {
        error!("Incorrect header for module {}! {}", tap.module_id, err);
        return Err(());
      }
      Ok(header) => header,
    };
    n_bytes = header.size_bytes();
    let record = &bytes[..n_bytes];
    let budget_words = MERGED_EVENT_BUDGET_BYTES.saturating_sub(sink.current_size())
                       / SIZEOF_U32;
    match clamp_record(record, budget_words, tap.zle) {
      None => {
        sink.add_subrecord(&name, record);
      }
      Some(clamped) => {
        error!("Event from module {} with {} words is bigger than the remaining budget of {} words, truncating!",
               tap.module_id, header.size_words, budget_words);
        stats.n_oversize_clamped += 1;
        sink.add_subrecord(&name, &clamped);
      }
    }
  }
  if let Err(err) = tap.ring.consume(n_bytes) {
    error!("Can not consume the head record of module {}! {}", tap.module_id, err);
    return Err(());
  }
  stats.n_records_merged += 1;
  Ok(())
}

/// One poll cycle. Consumes at most one record per board.
pub fn poll_cycle(taps  : &mut [BoardTap],
                  feed  : Option<&mut dyn TriggerFeed>,
                  sink  : &mut dyn EventSink,
                  cfg   : &MergeConfig,
                  ctx   : &RunContext,
                  stats : &mut MergeStats) -> PollOutcome {
  // readiness
  let mut winner : Option<usize> = None;
  if cfg.merge_across_boards {
    for tap in taps.iter() {
      if tap.ring.event_count() == 0 {
        return PollOutcome::NotReady;
      }
    }
  } else {
    let mut max_events = 0usize;
    for (k, tap) in taps.iter().enumerate() {
      let n_events = tap.ring.event_count();
      if n_events > max_events {
        max_events = n_events;
        winner     = Some(k);
      }
    }
    if winner.is_none() {
      return PollOutcome::NotReady;
    }
  }

  // the trigger box record is mandatory when the box is in use
  let mut box_record : Option<Vec<u8>> = None;
  if cfg.use_trigger_box {
    let record = match feed {
      None       => None,
      Some(feed) => feed.next_record(cfg.trigger_box_budget),
    };
    match record {
      Some(record) => box_record = Some(record),
      None => {
        if ctx.request_stop() {
          error!("Did not receive a trigger box record within {:?}! Stopping run.",
                 cfg.trigger_box_budget);
        }
        return PollOutcome::StopRun;
      }
    }
  }

  if !cfg.merge_across_boards {
    // degraded mode - serve the board with the fattest backlog
    let tap = &mut taps[winner.unwrap()];
    sink.begin_event();
    if let Some(record) = box_record {
      sink.add_subrecord("TB00", &record);
    }
    if write_head_record(tap, sink, stats).is_err() {
      ctx.request_stop();
      return PollOutcome::StopRun;
    }
    let size = sink.end_event();
    stats.n_events_built += 1;
    return PollOutcome::EventWritten(size);
  }

  // merge mode - match on peeked headers first
  let heads = match peek_heads(taps) {
    Err(_)    => {
      ctx.request_stop();
      return PollOutcome::StopRun;
    }
    Ok(heads) => heads,
  };
  let reference = match box_record.as_ref().and_then(|r| word3_timestamp(r)) {
    Some(ts) => ts,
    None => {
      let stamps : Vec<u32> = heads.iter().map(|h| h.timestamp).collect();
      match earliest(&stamps) {
        // taps can not be empty here, readiness saw events
        None     => return PollOutcome::NotReady,
        Some(ts) => ts,
      }
    }
  };
  let matched : Vec<bool> = heads.iter()
                                 .map(|h| delta(h.timestamp, reference) <= cfg.ts_match_window)
                                 .collect();
  let n_matched = matched.iter().filter(|&&m| m).count();
  if n_matched < taps.len() && !cfg.accept_partial_merges {
    debug!("Only {}/{} boards within {} ticks of 0x{:08x}, leaving the records in their rings",
           n_matched, taps.len(), cfg.ts_match_window, reference);
    stats.n_cycles_abandoned += 1;
    return PollOutcome::Abandoned;
  }

  sink.begin_event();
  if let Some(record) = box_record {
    sink.add_subrecord("TB00", &record);
  }
  for (k, tap) in taps.iter_mut().enumerate() {
    if !matched[k] {
      continue;
    }
    if write_head_record(tap, sink, stats).is_err() {
      ctx.request_stop();
      return PollOutcome::StopRun;
    }
  }
  let size = sink.end_event();
  stats.n_events_built += 1;
  PollOutcome::EventWritten(size)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::VecDeque;

  use ringside_lib::constants::MAX_EVENT_BYTES;
  use ringside_lib::emulator::compose_record;
  use ringside_lib::ring_buffer::{event_ring,
                                  RingProducer};

  use crate::sink::MemorySink;

  struct StubFeed {
    records   : VecDeque<Vec<u8>>,
    drop_next : bool,
  }

  impl StubFeed {
    fn with_records(records : Vec<Vec<u8>>) -> Self {
      Self {
        records   : records.into(),
        drop_next : false,
      }
    }
  }

  impl TriggerFeed for StubFeed {
    fn next_record(&mut self, _budget : Duration) -> Option<Vec<u8>> {
      loop {
        match self.records.pop_front() {
          None => return None,
          Some(record) => {
            if self.drop_next {
              self.drop_next = false;
              continue;
            }
            return Some(record);
          }
        }
      }
    }

    fn mark_run_start(&mut self) {
      self.drop_next = true;
    }
  }

  fn merge_config(merge : bool, window : u32) -> MergeConfig {
    MergeConfig {
      merge_across_boards   : merge,
      use_trigger_box       : false,
      accept_partial_merges : false,
      ts_match_window       : window,
      trigger_box_budget    : Duration::from_millis(5),
    }
  }

  fn tap_with_producer(module_id : u8, zle : bool) -> (BoardTap, RingProducer) {
    let (producer, consumer, _monitor) = event_ring(2 * MAX_EVENT_BYTES);
    (BoardTap { module_id, ring : consumer, zle }, producer)
  }

  fn push_record(producer : &mut RingProducer, timestamp : u32) {
    let record = compose_record(timestamp, 16, false);
    let slot   = producer.reserve(Duration::from_millis(50)).expect("no slot");
    slot[..record.len()].copy_from_slice(&record);
    producer.commit(record.len()).expect("commit failed");
  }

  fn record_timestamp(bytes : &[u8]) -> u32 {
    word3_timestamp(bytes).expect("record too short")
  }

  #[test]
  fn single_board_unmerged_readout() {
    // 1 board, merging off, no trigger box: every record becomes
    // one merged event named by the module id
    let (tap, mut producer) = tap_with_producer(3, false);
    let mut taps = vec![tap];
    for ts in [0x10u32, 0x30, 0x50] {
      push_record(&mut producer, ts);
    }
    let cfg   = merge_config(false, 50);
    let ctx   = RunContext::new(1);
    let mut sink  = MemorySink::new();
    let mut stats = MergeStats::new();
    for _ in 0..3 {
      let outcome = poll_cycle(&mut taps, None, &mut sink, &cfg, &ctx, &mut stats);
      assert!(matches!(outcome, PollOutcome::EventWritten(_)));
    }
    assert_eq!(poll_cycle(&mut taps, None, &mut sink, &cfg, &ctx, &mut stats),
               PollOutcome::NotReady);
    assert_eq!(sink.events.len(), 3);
    for (k, ts) in [0x10u32, 0x30, 0x50].iter().enumerate() {
      assert_eq!(sink.events[k].len(), 1);
      assert_eq!(sink.events[k][0].0, "W203");
      assert_eq!(record_timestamp(&sink.events[k][0].1), *ts);
    }
  }

  #[test]
  fn two_boards_merge_in_lockstep() {
    let (tap_a, mut producer_a) = tap_with_producer(0, false);
    let (tap_b, mut producer_b) = tap_with_producer(1, false);
    let mut taps = vec![tap_a, tap_b];
    for ts in [0x100u32, 0x200] {
      push_record(&mut producer_a, ts);
    }
    for ts in [0x110u32, 0x205] {
      push_record(&mut producer_b, ts);
    }
    let cfg   = merge_config(true, 50);
    let ctx   = RunContext::new(1);
    let mut sink  = MemorySink::new();
    let mut stats = MergeStats::new();
    for _ in 0..2 {
      let outcome = poll_cycle(&mut taps, None, &mut sink, &cfg, &ctx, &mut stats);
      assert!(matches!(outcome, PollOutcome::EventWritten(_)));
    }
    assert_eq!(sink.events.len(), 2);
    // both events carry one sub-record per board
    assert_eq!(sink.events[0].len(), 2);
    assert_eq!(record_timestamp(&sink.events[0][0].1), 0x100);
    assert_eq!(record_timestamp(&sink.events[0][1].1), 0x110);
    assert_eq!(sink.events[1].len(), 2);
    assert_eq!(record_timestamp(&sink.events[1][0].1), 0x200);
    assert_eq!(record_timestamp(&sink.events[1][1].1), 0x205);
    // both rings fully consumed
    assert_eq!(taps[0].ring.event_count(), 0);
    assert_eq!(taps[1].ring.event_count(), 0);
    assert_eq!(stats.n_records_merged, 4);
  }

  #[test]
  fn merge_across_the_timestamp_rollover() {
    let (tap_a, mut producer_a) = tap_with_producer(0, false);
    let (tap_b, mut producer_b) = tap_with_producer(1, false);
    let mut taps = vec![tap_a, tap_b];
    push_record(&mut producer_a, 0x7FFFFFF0);
    push_record(&mut producer_b, 0x00000010);
    let cfg   = merge_config(true, 50);
    let ctx   = RunContext::new(1);
    let mut sink  = MemorySink::new();
    let mut stats = MergeStats::new();
    let outcome = poll_cycle(&mut taps, None, &mut sink, &cfg, &ctx, &mut stats);
    assert!(matches!(outcome, PollOutcome::EventWritten(_)));
    // the pre-rollover stamp is the reference and the post-rollover
    // record is 0x20 ticks later, well within the window
    assert_eq!(sink.events[0].len(), 2);
    assert_eq!(record_timestamp(&sink.events[0][0].1), 0x7FFFFFF0);
    assert_eq!(record_timestamp(&sink.events[0][1].1), 0x00000010);
  }

  #[test]
  fn disallowed_partial_merge_leaves_records_in_place() {
    let (tap_a, mut producer_a) = tap_with_producer(0, false);
    let (tap_b, mut producer_b) = tap_with_producer(1, false);
    let mut taps = vec![tap_a, tap_b];
    push_record(&mut producer_a, 0x1000);
    push_record(&mut producer_b, 0x2000);
    let cfg   = merge_config(true, 50);
    let ctx   = RunContext::new(1);
    let mut sink  = MemorySink::new();
    let mut stats = MergeStats::new();
    assert_eq!(poll_cycle(&mut taps, None, &mut sink, &cfg, &ctx, &mut stats),
               PollOutcome::Abandoned);
    assert_eq!(sink.events.len(), 0);
    assert_eq!(taps[0].ring.event_count(), 1);
    assert_eq!(taps[1].ring.event_count(), 1);
    assert_eq!(stats.n_cycles_abandoned, 1);
  }

  #[test]
  fn partial_merge_when_allowed() {
    let (tap_a, mut producer_a) = tap_with_producer(0, false);
    let (tap_b, mut producer_b) = tap_with_producer(1, false);
    let mut taps = vec![tap_a, tap_b];
    push_record(&mut producer_a, 0x1000);
    push_record(&mut producer_b, 0x2000);
    let mut cfg = merge_config(true, 50);
    cfg.accept_partial_merges = true;
    let ctx   = RunContext::new(1);
    let mut sink  = MemorySink::new();
    let mut stats = MergeStats::new();
    let outcome = poll_cycle(&mut taps, None, &mut sink, &cfg, &ctx, &mut stats);
    assert!(matches!(outcome, PollOutcome::EventWritten(_)));
    // only the earlier record went out, the other one stayed
    assert_eq!(sink.events[0].len(), 1);
    assert_eq!(record_timestamp(&sink.events[0][0].1), 0x1000);
    assert_eq!(taps[0].ring.event_count(), 0);
    assert_eq!(taps[1].ring.event_count(), 1);
  }

  #[test]
  fn first_trigger_box_record_is_dropped() {
    let (tap, mut producer) = tap_with_producer(0, false);
    let mut taps = vec![tap];
    push_record(&mut producer, 0x0100);
    push_record(&mut producer, 0x0120);
    let mut feed = StubFeed::with_records(vec![
      compose_record(0xAAAA, 4, false),
      compose_record(0x0100, 4, false),
      compose_record(0x0120, 4, false),
    ]);
    feed.mark_run_start();
    let mut cfg = merge_config(true, 50);
    cfg.use_trigger_box = true;
    let ctx   = RunContext::new(1);
    let mut sink  = MemorySink::new();
    let mut stats = MergeStats::new();
    let outcome = poll_cycle(&mut taps, Some(&mut feed), &mut sink, &cfg, &ctx, &mut stats);
    assert!(matches!(outcome, PollOutcome::EventWritten(_)));
    // the 0xAAAA record was junk from before the run start
    assert_eq!(sink.events[0].len(), 2);
    assert_eq!(sink.events[0][0].0, "TB00");
    assert_eq!(record_timestamp(&sink.events[0][0].1), 0x0100);
    assert_eq!(record_timestamp(&sink.events[0][1].1), 0x0100);
  }

  #[test]
  fn missing_mandatory_box_record_stops_the_run_once() {
    let (tap, mut producer) = tap_with_producer(0, false);
    let mut taps = vec![tap];
    push_record(&mut producer, 0x0100);
    let mut feed = StubFeed::with_records(vec![]);
    let mut cfg = merge_config(true, 50);
    cfg.use_trigger_box = true;
    let ctx   = RunContext::new(1);
    let mut sink  = MemorySink::new();
    let mut stats = MergeStats::new();
    assert_eq!(poll_cycle(&mut taps, Some(&mut feed), &mut sink, &cfg, &ctx, &mut stats),
               PollOutcome::StopRun);
    assert!(ctx.is_stop_requested());
    // the stop request fired exactly once
    assert!(!ctx.request_stop());
  }

  #[test]
  fn garbage_in_the_ring_is_a_protocol_violation() {
    let (tap, mut producer) = tap_with_producer(0, false);
    let mut taps = vec![tap];
    {
      let slot = producer.reserve(Duration::from_millis(50)).expect("no slot");
      slot[..16].copy_from_slice(&[0xBB; 16]);
    }
    producer.commit(16).expect("commit failed");
    let cfg   = merge_config(true, 50);
    let ctx   = RunContext::new(1);
    let mut sink  = MemorySink::new();
    let mut stats = MergeStats::new();
    assert_eq!(poll_cycle(&mut taps, None, &mut sink, &cfg, &ctx, &mut stats),
               PollOutcome::StopRun);
    assert!(ctx.is_stop_requested());
  }
}
