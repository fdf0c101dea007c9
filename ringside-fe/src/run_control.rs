//! The run state machine.
//!
//! Owns the boards between runs, builds the rings and spawns the
//! reader threads at BeginRun, joins everything back together at the
//! end. The deferred stop is modelled as explicit Draining state
//! with a single deadline rather than a callback: `end_run` enters
//! the drain, keeps polling the merge stage until the rings are
//! empty (or no further merge is possible, or the deadline lapses)
//! and then completes the transition.
//!
//! Reader threads and ring buffers exist exactly while the state is
//! Running or Draining; the trigger box publishes only in Running.

use std::fmt;
use std::sync::{Arc,
                Mutex};
use std::thread;
use std::time::{Duration,
                Instant};

use ringside_lib::board::{Board,
                          DataFormat};
use ringside_lib::constants::{RING_CAPACITY_BYTES,
                              SLEEP_BETWEEN_CONNECTS_MS};
use ringside_lib::errors::{ConnectError,
                           RunControlError};
use ringside_lib::ring_buffer::{event_ring,
                                RingProducer};
use ringside_lib::run_context::RunContext;
use ringside_lib::settings::FrontendSettings;
use ringside_lib::transport::OpticalTransport;
use ringside_lib::trigger_box::{TriggerBoxClient,
                                TriggerFeed};

use crate::merge::{poll_cycle,
                   BoardTap,
                   MergeConfig,
                   MergeStats,
                   PollOutcome};
use crate::sink::EventSink;
use crate::threads::{link_reader,
                     HealthTap,
                     ReaderBoard};

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum RunState {
  Idle,
  Arming,
  Running,
  Draining,
  Paused,
  Stopping,
}

impl fmt::Display for RunState {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = match self {
      RunState::Idle     => "Idle",
      RunState::Arming   => "Arming",
      RunState::Running  => "Running",
      RunState::Draining => "Draining",
      RunState::Paused   => "Paused",
      RunState::Stopping => "Stopping",
    };
    write!(f, "<RunState : {}>", repr)
  }
}

type ReaderHandle = thread::JoinHandle<(Vec<Board>, i32)>;

pub struct RunController {
  settings       : FrontendSettings,
  transport      : Arc<dyn OpticalTransport>,
  /// boards at home; during a run only the unconnected ones stay
  boards         : Vec<Board>,
  taps           : Vec<BoardTap>,
  reader_handles : Vec<ReaderHandle>,
  ctx            : Arc<RunContext>,
  state          : RunState,
  trigger_box    : Option<TriggerBoxClient>,
  merge_cfg      : MergeConfig,
  stats          : MergeStats,
  health_taps    : Arc<Mutex<Vec<HealthTap>>>,
}

impl RunController {
  pub fn new(settings : FrontendSettings, transport : Arc<dyn OpticalTransport>) -> Self {
    let merge_cfg = MergeConfig {
      merge_across_boards   : settings.merge_data_from_boards,
      use_trigger_box       : settings.trigger_box.enable_trigger_box,
      accept_partial_merges : settings.write_partially_merged_events,
      ts_match_window       : settings.ts_match_thresh_ticks,
      trigger_box_budget    : Duration::from_millis(settings.trigger_box.recv_budget_ms),
    };
    Self {
      settings,
      transport,
      boards         : Vec::new(),
      taps           : Vec::new(),
      reader_handles : Vec::new(),
      ctx            : Arc::new(RunContext::new(0)),
      state          : RunState::Idle,
      trigger_box    : None,
      merge_cfg,
      stats          : MergeStats::new(),
      health_taps    : Arc::new(Mutex::new(Vec::new())),
    }
  }

  pub fn state(&self) -> RunState {
    self.state
  }

  pub fn run_id(&self) -> u32 {
    self.ctx.run_id()
  }

  pub fn n_active_rings(&self) -> usize {
    self.taps.len()
  }

  pub fn stats(&self) -> &MergeStats {
    &self.stats
  }

  /// The merge stage asked for a stop (protocol violation or a
  /// missing mandatory trigger box record)
  pub fn stop_was_requested(&self) -> bool {
    self.ctx.is_stop_requested()
  }

  /// Shared taps vector for the monitor thread
  pub fn health_taps(&self) -> Arc<Mutex<Vec<HealthTap>>> {
    Arc::clone(&self.health_taps)
  }

  /// Reset the shared health taps to empty; no run is active yet
  /// right after (re)connecting the boards.
  fn publish_health_taps(&self) {
    match self.health_taps.lock() {
      Err(err)     => error!("Can not update the monitor taps! {}", err),
      Ok(mut refs) => refs.clear(),
    }
  }

  /// Create all boards and connect the enabled ones. Fails when
  /// fewer boards came up than the settings enable, or when the
  /// initial configuration push fails.
  pub fn setup_boards(&mut self) -> Result<(), RunControlError> {
    let n_links         = self.settings.n_links;
    let boards_per_link = self.settings.boards_per_link;
    let attempts        = self.settings.connect_attempts;
    let timeout         = Duration::from_secs(self.settings.connect_timeout_sec);
    let mut n_expected  = 0usize;
    let mut n_active    = 0usize;

    for link in 0..n_links {
      for pos in 0..boards_per_link {
        let slot_index = link as usize * boards_per_link as usize + pos as usize;
        let module_id  = self.settings.frontend_index as usize
                         * self.settings.n_boards() + slot_index;
        println!("==== frontend:{}, link:{}, board:{} ====",
                 self.settings.frontend_index, link, pos);
        let mut board = Board::new(self.settings.frontend_index,
                                   link,
                                   pos,
                                   module_id as u8,
                                   self.settings.boards[slot_index].clone(),
                                   Arc::clone(&self.transport));
        if board.is_enabled() {
          n_expected += 1;
          match board.connect(attempts, timeout) {
            Ok(_) => {
              n_active += 1;
            }
            Err(ConnectError::BoardMismatch) => {
              // fatal for this board only, it stays disconnected
              error!("Board {} is not the expected board type!", board.module_id());
            }
            Err(err) => {
              error!("Unable to connect board {}! {}", board.module_id(), err);
            }
          }
        }
        self.boards.push(board);
        thread::sleep(Duration::from_millis(SLEEP_BETWEEN_CONNECTS_MS));
      }
    }
    println!(">>> End of board setup. {} active boards. Expected {}", n_active, n_expected);
    if n_active < n_expected {
      error!("Unexpected number of active boards ({} vs {})", n_active, n_expected);
      return Err(RunControlError::UnexpectedBoardCount);
    }

    for board in self.boards.iter_mut() {
      if !board.is_connected() {
        continue;
      }
      if let Err(err) = board.configure_for_acquisition() {
        error!("Initial configuration of board {} failed! {}", board.module_id(), err);
        return Err(RunControlError::HardwareInit);
      }
    }
    self.publish_health_taps();
    Ok(())
  }

  /// Idle/Paused -> Arming. Snapshot the configuration, push it to
  /// the boards, verify the clocks, build the rings, start the
  /// boards and spawn the readers. With the trigger box enabled the
  /// box is stopped first and started again once the readers are up.
  pub fn begin_run(&mut self,
                   run_id : u32,
                   fresh_settings : Option<FrontendSettings>) -> Result<(), RunControlError> {
    match self.state {
      RunState::Idle | RunState::Paused => (),
      _ => {
        error!("Can not begin a run from {}", self.state);
        return Err(RunControlError::NotIdle);
      }
    }
    println!("<<< Start of begin_run (run {})", run_id);

    // configuration may have been touched since the last run
    if let Some(fresh) = fresh_settings {
      match fresh.validate() {
        Err(err) => error!("Refreshed settings are invalid ({}), keeping the previous snapshot!", err),
        Ok(_)    => self.settings = fresh,
      }
    }
    let boards_per_link = self.settings.boards_per_link as usize;
    for board in self.boards.iter_mut() {
      let slot_index = board.link() as usize * boards_per_link + board.chain_pos() as usize;
      if slot_index < self.settings.boards.len() {
        board.update_settings(self.settings.boards[slot_index].clone());
      }
    }
    self.merge_cfg = MergeConfig {
      merge_across_boards   : self.settings.merge_data_from_boards,
      use_trigger_box       : self.settings.trigger_box.enable_trigger_box,
      accept_partial_merges : self.settings.write_partially_merged_events,
      ts_match_window       : self.settings.ts_match_thresh_ticks,
      trigger_box_budget    : Duration::from_millis(self.settings.trigger_box.recv_budget_ms),
    };
    self.stats = MergeStats::new();
    self.ctx   = Arc::new(RunContext::new(run_id));

    // make sure the box is quiet while the boards arm
    if self.settings.trigger_box.enable_trigger_box {
      if self.trigger_box.is_none() {
        match TriggerBoxClient::new(&self.settings.trigger_box) {
          Err(err) => {
            error!("Can not set up the trigger box client! {}", err);
            return Err(RunControlError::TriggerBoxSetup);
          }
          Ok(client) => {
            self.trigger_box = Some(client);
          }
        }
      }
      if let Some(client) = &self.trigger_box {
        let _ = client.send_stop();
      }
    }

    // arm every connected board and give it a ring
    let mut producers = Vec::<Option<RingProducer>>::with_capacity(self.boards.len());
    let mut taps      = Vec::<BoardTap>::new();
    let mut health    = Vec::<HealthTap>::new();
    for board in self.boards.iter_mut() {
      if !board.is_connected() {
        producers.push(None);
        continue;
      }
      match board.verify_pll_locked() {
        Err(err) => {
          error!("Can not verify the PLL of board {}! {}", board.module_id(), err);
          return Err(RunControlError::HardwareInit);
        }
        Ok(false) => {
          error!("PLL lock still lost on board {}!", board.module_id());
          return Err(RunControlError::PLLNotLocked);
        }
        Ok(true) => (),
      }
      if let Err(err) = board.configure_for_acquisition() {
        error!("Configuration of board {} failed! {}", board.module_id(), err);
        return Err(RunControlError::HardwareInit);
      }
      if let Err(err) = board.start() {
        error!("Could not start board {}! {}", board.module_id(), err);
        return Err(RunControlError::HardwareInit);
      }
      let (producer, consumer, ring_monitor) = event_ring(RING_CAPACITY_BYTES);
      taps.push(BoardTap {
        module_id : board.module_id(),
        ring      : consumer,
        zle       : board.data_format() == DataFormat::Zle,
      });
      if let Some(moni) = board.monitor_tap() {
        health.push(HealthTap { moni, ring : Some(ring_monitor) });
      }
      producers.push(Some(producer));
    }
    self.taps = taps;
    match self.health_taps.lock() {
      Err(err)     => error!("Can not update the monitor taps! {}", err),
      Ok(mut refs) => *refs = health,
    }

    // move the connected boards into one reader thread per link
    self.ctx.set_run_active(true);
    let boards = std::mem::take(&mut self.boards);
    let mut stay_home = Vec::<Board>::new();
    let mut groups : Vec<Vec<ReaderBoard>> =
      (0..self.settings.n_links).map(|_| Vec::new()).collect();
    for (board, producer) in boards.into_iter().zip(producers.into_iter()) {
      match producer {
        None       => stay_home.push(board),
        Some(ring) => {
          let link = board.link() as usize;
          groups[link].push(ReaderBoard { board, ring });
        }
      }
    }
    self.boards = stay_home;
    for (link, group) in groups.into_iter().enumerate() {
      if group.is_empty() {
        continue;
      }
      let ctx    = Arc::clone(&self.ctx);
      let handle = thread::Builder::new()
        .name(format!("link-reader-{}", link))
        .spawn(move || link_reader(link as u8, group, ctx))
        .expect("Failed to spawn link-reader thread!");
      self.reader_handles.push(handle);
    }

    // the readers are up, let the box publish again
    if self.settings.trigger_box.enable_trigger_box {
      if let Some(client) = &mut self.trigger_box {
        client.mark_run_start();
        thread::sleep(Duration::from_secs(1));
        let _ = client.send_start();
      }
    }
    self.state = RunState::Arming;
    println!(">>> End of begin_run");
    Ok(())
  }

  /// One merge/poll cycle. The first poll after BeginRun completes
  /// the Arming -> Running transition.
  pub fn poll(&mut self, sink : &mut dyn EventSink) -> PollOutcome {
    if self.state == RunState::Arming {
      info!("First poll - run {} is running now", self.ctx.run_id());
      self.state = RunState::Running;
    }
    if self.state != RunState::Running && self.state != RunState::Draining {
      return PollOutcome::NotReady;
    }
    let feed = self.trigger_box.as_mut().map(|b| b as &mut dyn TriggerFeed);
    let outcome = poll_cycle(&mut self.taps,
                             feed,
                             sink,
                             &self.merge_cfg,
                             &self.ctx,
                             &mut self.stats);
    if matches!(outcome, PollOutcome::EventWritten(_))
    && self.stats.n_events_built % 100 == 0 {
      self.stats.print();
    }
    outcome
  }

  /// Running -> Paused. Joins the readers, stops the boards and
  /// destroys the rings, symmetric with Begin/End.
  pub fn pause_run(&mut self) -> Result<(), RunControlError> {
    match self.state {
      RunState::Running | RunState::Arming => (),
      _ => {
        error!("Can not pause a run from {}", self.state);
        return Err(RunControlError::NotRunning);
      }
    }
    println!("<<< Beginning of pause_run");
    self.ctx.set_run_active(false);
    self.join_readers();
    self.stop_boards();
    self.teardown_rings();
    self.state = RunState::Paused;
    println!(">>> End of pause_run");
    Ok(())
  }

  /// Paused -> Running, through the Arming path
  pub fn resume_run(&mut self) -> Result<(), RunControlError> {
    if self.state != RunState::Paused {
      error!("Can not resume a run from {}", self.state);
      return Err(RunControlError::NotPaused);
    }
    let run_id = self.ctx.run_id();
    self.begin_run(run_id, None)
  }

  /// Deferred stop. With flush enabled the readers go idle (the box
  /// is stopped first when in use, otherwise the readers stop their
  /// boards) and the merge stage keeps polling until every ring is
  /// empty or the drain deadline lapses. Returns the worst reader
  /// status.
  pub fn end_run(&mut self, sink : &mut dyn EventSink) -> Result<i32, RunControlError> {
    match self.state {
      RunState::Running | RunState::Arming => (),
      _ => {
        error!("Can not end a run from {}", self.state);
        return Err(RunControlError::NotRunning);
      }
    }
    println!("<<< Start of end_run");
    if self.settings.flush_buffers_at_end_of_run {
      self.state = RunState::Draining;
      if self.settings.trigger_box.enable_trigger_box {
        // pause the readout before the box stop command goes out,
        // the two contend on the system otherwise
        self.ctx.set_stop_pending(true);
        thread::sleep(Duration::from_micros(500));
        if let Some(client) = &self.trigger_box {
          let _ = client.send_stop();
        }
        self.ctx.set_stop_pending(false);
        thread::sleep(Duration::from_secs(1));
      } else {
        // the boards' register space belongs to the readers now,
        // they execute the stop and then idle
        self.ctx.request_board_stop();
      }
      info!("Deferring the transition to flush more data from the boards");
      let deadline      = Duration::from_secs(self.settings.drain_timeout_sec);
      let drain_started = Instant::now();
      loop {
        let _ = self.poll(sink);
        let all_empty = self.taps.iter().all(|tap| tap.ring.event_count() == 0);
        if all_empty {
          println!("Deferred transition: cleared all events");
          break;
        }
        if self.merge_cfg.merge_across_boards
        && self.taps.iter().any(|tap| tap.ring.event_count() == 0) {
          info!("A ring ran empty, no further merge is possible, completing the transition");
          break;
        }
        if drain_started.elapsed() > deadline {
          warn!("Still have data in the rings, but the drain is taking too long. Completing the transition now.");
          break;
        }
      }
    } else if self.settings.trigger_box.enable_trigger_box {
      if let Some(client) = &self.trigger_box {
        let _ = client.send_stop();
      }
    }
    self.finish_stop()
  }

  fn finish_stop(&mut self) -> Result<i32, RunControlError> {
    self.state = RunState::Stopping;
    self.ctx.set_run_active(false);
    self.join_readers();
    self.stop_boards();
    // anything still sitting in the hardware buffers is lost now
    for board in self.boards.iter() {
      if !board.is_connected() {
        continue;
      }
      match board.poll_stored_events() {
        Err(_)     => (),
        Ok(stored) => {
          if stored != 0 {
            error!("Events left in the hardware buffer of module {}: {}",
                   board.module_id(), stored);
          }
        }
      }
    }
    if let Some(client) = &self.trigger_box {
      client.drain();
    }
    self.teardown_rings();
    self.state = RunState::Idle;
    let worst = self.ctx.worst_reader_status();
    println!(">>> End of end_run, worst reader status: {}", worst);
    Ok(worst)
  }

  fn join_readers(&mut self) {
    for handle in self.reader_handles.drain(..) {
      match handle.join() {
        Err(_) => {
          error!("A reader thread panicked!");
        }
        Ok((boards, status)) => {
          println!(">>> Reader thread joined, return code: {}", status);
          self.boards.extend(boards);
        }
      }
    }
    // restore the enumeration order for the next settings snapshot
    self.boards.sort_by_key(|board| (board.link(), board.chain_pos()));
  }

  fn stop_boards(&mut self) {
    for board in self.boards.iter_mut() {
      if board.is_running() {
        match board.stop() {
          Err(err) => error!("Could not stop the run for module {}! {}",
                             board.module_id(), err),
          Ok(_)    => (),
        }
      }
    }
  }

  fn teardown_rings(&mut self) {
    for tap in &self.taps {
      let left_over = tap.ring.event_count();
      if left_over > 0 {
        println!("Number of events left in the ring for module {}: {}",
                 tap.module_id, left_over);
      }
    }
    self.taps.clear();
    match self.health_taps.lock() {
      Err(err)     => error!("Can not update the monitor taps! {}", err),
      Ok(mut taps) => {
        for tap in taps.iter_mut() {
          tap.ring = None;
        }
      }
    }
  }

  #[cfg(test)]
  fn n_boards_home(&self) -> usize {
    self.boards.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ringside_lib::emulator::{compose_record,
                               EmulatedTransport};
  use ringside_lib::settings::BoardSettings;
  use ringside_lib::transport::DeviceHandle;

  use crate::sink::MemorySink;

  fn test_settings() -> FrontendSettings {
    let mut settings = FrontendSettings::new();
    settings.n_links                     = 1;
    settings.boards_per_link             = 2;
    settings.boards                      = vec![BoardSettings::new(); 2];
    settings.merge_data_from_boards      = true;
    settings.flush_buffers_at_end_of_run = true;
    settings.ts_match_thresh_ticks       = 50;
    settings.drain_timeout_sec           = 3;
    settings.connect_timeout_sec         = 1;
    settings
  }

  fn stage_lockstep_events(transport : &EmulatedTransport, n_events : u32) {
    for pos in 0..2u8 {
      let device = transport.device(0, pos);
      for k in 0..n_events {
        device.push_event(compose_record(0x100 * k + pos as u32, 32, false));
      }
    }
  }

  fn setup_controller(transport : &Arc<EmulatedTransport>) -> RunController {
    let mut controller = RunController::new(
      test_settings(),
      Arc::clone(transport) as Arc<dyn OpticalTransport>);
    controller.setup_boards().expect("board setup failed");
    controller
  }

  #[test]
  fn full_run_cycle_merges_staged_events() {
    let transport = Arc::new(EmulatedTransport::new());
    stage_lockstep_events(&transport, 3);
    let mut controller = setup_controller(&transport);
    assert_eq!(controller.state(), RunState::Idle);

    controller.begin_run(42, None).expect("begin_run failed");
    assert_eq!(controller.n_active_rings(), 2);

    let mut sink = MemorySink::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while sink.events.len() < 3 && Instant::now() < deadline {
      controller.poll(&mut sink);
    }
    assert_eq!(controller.state(), RunState::Running);
    assert_eq!(sink.events.len(), 3);
    for merged in &sink.events {
      assert_eq!(merged.len(), 2);
    }

    let worst = controller.end_run(&mut sink).expect("end_run failed");
    assert_eq!(worst, 0);
    assert_eq!(controller.state(), RunState::Idle);
    assert_eq!(controller.n_active_rings(), 0);
    assert_eq!(controller.n_boards_home(), 2);
  }

  #[test]
  fn deferred_stop_drains_the_rings() {
    let transport = Arc::new(EmulatedTransport::new());
    stage_lockstep_events(&transport, 5);
    let mut controller = setup_controller(&transport);
    controller.begin_run(1, None).expect("begin_run failed");

    // give the readers a moment to move the events into the rings,
    // then stop without ever polling
    thread::sleep(Duration::from_millis(300));
    let mut sink  = MemorySink::new();
    let started   = Instant::now();
    let worst     = controller.end_run(&mut sink).expect("end_run failed");
    assert_eq!(worst, 0);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(sink.events.len(), 5);
    assert_eq!(controller.state(), RunState::Idle);
  }

  #[test]
  fn pause_and_resume() {
    let transport = Arc::new(EmulatedTransport::new());
    stage_lockstep_events(&transport, 1);
    let mut controller = setup_controller(&transport);
    controller.begin_run(3, None).expect("begin_run failed");

    let mut sink = MemorySink::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while sink.events.is_empty() && Instant::now() < deadline {
      controller.poll(&mut sink);
    }
    assert_eq!(sink.events.len(), 1);

    controller.pause_run().expect("pause_run failed");
    assert_eq!(controller.state(), RunState::Paused);
    assert_eq!(controller.n_active_rings(), 0);
    assert_eq!(controller.n_boards_home(), 2);

    controller.resume_run().expect("resume_run failed");
    stage_lockstep_events(&transport, 1);
    let deadline = Instant::now() + Duration::from_secs(10);
    while sink.events.len() < 2 && Instant::now() < deadline {
      controller.poll(&mut sink);
    }
    assert_eq!(sink.events.len(), 2);
    controller.end_run(&mut sink).expect("end_run failed");
    assert_eq!(controller.state(), RunState::Idle);
  }

  #[test]
  fn reader_errors_surface_in_the_worst_status() {
    let transport = Arc::new(EmulatedTransport::new());
    let mut controller = setup_controller(&transport);
    controller.begin_run(9, None).expect("begin_run failed");

    // sever the link mid-run
    transport.device(0, 0).close();
    thread::sleep(Duration::from_millis(300));

    let mut sink = MemorySink::new();
    let worst = controller.end_run(&mut sink).expect("end_run failed");
    assert_eq!(worst, -1);
    assert_eq!(controller.state(), RunState::Idle);
  }

  #[test]
  fn missing_board_fails_the_setup() {
    let transport = Arc::new(EmulatedTransport::new());
    transport.kill_slot(0, 1);
    let mut controller = RunController::new(
      test_settings(),
      Arc::clone(&transport) as Arc<dyn OpticalTransport>);
    assert_eq!(controller.setup_boards().unwrap_err(),
               RunControlError::UnexpectedBoardCount);
  }

  #[test]
  fn disabled_boards_stay_out_of_the_readout() {
    let transport = Arc::new(EmulatedTransport::new());
    let mut settings = test_settings();
    settings.boards[1].enable = false;
    stage_lockstep_events(&transport, 1);
    let mut controller = RunController::new(
      settings,
      Arc::clone(&transport) as Arc<dyn OpticalTransport>);
    controller.setup_boards().expect("board setup failed");
    controller.begin_run(5, None).expect("begin_run failed");
    // only the enabled board got a ring
    assert_eq!(controller.n_active_rings(), 1);
    let mut sink = MemorySink::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while sink.events.is_empty() && Instant::now() < deadline {
      controller.poll(&mut sink);
    }
    assert_eq!(sink.events.len(), 1);
    assert_eq!(sink.events[0].len(), 1);
    controller.end_run(&mut sink).expect("end_run failed");
  }
}
