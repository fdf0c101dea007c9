//! ringside-fe - frontend process for multi-board waveform
//! digitizer readout over optical links.
//!
//! One process owns the optical links of one host: it connects the
//! daisy-chained boards, spawns one pinned reader thread per link
//! plus the periodic monitor, and runs the merge/poll stage and the
//! run state machine on the main thread. Merged events leave on a
//! PUB socket, health records on a second one.

#[macro_use] extern crate log;

use std::process::exit;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool,
                        Ordering};
use std::thread;
use std::time::{Duration,
                Instant};

use clap::{Parser,
           Subcommand};
use crossbeam_channel::unbounded;
use indicatif::ProgressBar;

use ringside_lib::emulator::EmulatedTransport;
use ringside_lib::errors::RunControlError;
use ringside_lib::health::BoardHealth;
use ringside_lib::init_env_logger;
use ringside_lib::settings::FrontendSettings;
use ringside_lib::transport::OpticalTransport;

use ringside_fe::merge::PollOutcome;
use ringside_fe::run_control::RunController;
use ringside_fe::sink::PubSink;
use ringside_fe::threads::monitor_boards;

// exit codes per startup failure class
const EXIT_SETTINGS      : i32 = 1;
const EXIT_HARDWARE_INIT : i32 = 2;
const EXIT_BOARD_COUNT   : i32 = 3;
const EXIT_INVALID_COMBO : i32 = 4;

#[derive(Debug, Subcommand, PartialEq)]
enum CommandFE {
  /// Connect the boards and take data until the configured runtime
  /// expires or SIGINT arrives
  Run,
  /// Write a settings file with all defaults and quit
  Template {
    /// where to put the template
    #[arg(default_value = "ringside-settings.toml")]
    path : String,
  },
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct ArgsFE {
  /// Configuration of the frontend: boards, merge policy,
  /// trigger box, monitor
  #[arg(short, long)]
  config  : Option<String>,
  /// Run id for later identification
  #[arg(short, long)]
  run_id  : Option<u32>,
  /// More detailed output for debugging
  #[arg(short, long, default_value_t = false)]
  verbose : bool,
  #[command(subcommand)]
  command : CommandFE,
}

fn main() {
  init_env_logger();
  let args = ArgsFE::parse();

  if let CommandFE::Template { path } = &args.command {
    let settings = FrontendSettings::new();
    match settings.to_toml(path) {
      Err(err) => {
        error!("Can not write the settings template! {}", err);
        exit(EXIT_SETTINGS);
      }
      Ok(_) => {
        println!("==> Wrote a settings template to {}", path);
        exit(0);
      }
    }
  }

  println!("-----------------------------------------------");
  println!(" >> ringside-fe");
  println!(" >> frontend for daisy-chained waveform digitizers");
  println!(" >> on optical links");
  println!("-----------------------------------------------\n");

  let settings = match &args.config {
    None => {
      error!("No config file provided! Please provide a config file with --config or -c flag!");
      exit(EXIT_SETTINGS);
    }
    Some(path) => {
      match FrontendSettings::from_toml(path) {
        Err(err) => {
          error!("CRITICAL! Unable to parse the settings file! {}", err);
          exit(EXIT_SETTINGS);
        }
        Ok(settings) => settings,
      }
    }
  };
  if let Err(err) = settings.validate() {
    error!("Settings invalid! {}", err);
    exit(EXIT_INVALID_COMBO);
  }
  if args.verbose {
    println!("{}", settings);
  }

  // keep the merge stage off the reader cores
  match core_affinity::get_core_ids() {
    None => warn!("Can not query the core ids, main thread stays unpinned!"),
    Some(core_ids) => {
      if !core_affinity::set_for_current(core_ids[0]) {
        warn!("Pinning the main thread failed!");
      }
    }
  }

  // No adapter library bound in - the emulated transport answers
  // the full register map and serves queued events, so the process
  // runs on any host.
  let transport : Arc<dyn OpticalTransport> = Arc::new(EmulatedTransport::new());

  let mut controller = RunController::new(settings.clone(), transport);
  match controller.setup_boards() {
    Err(RunControlError::UnexpectedBoardCount) => exit(EXIT_BOARD_COUNT),
    Err(_)                                     => exit(EXIT_HARDWARE_INIT),
    Ok(_)                                      => (),
  }
  println!("==> All boards set up!");

  // health feed: monitor thread -> channel -> PUB socket
  let (health_sender, health_receiver) = unbounded::<BoardHealth>();
  let pll_alarm = Arc::new(AtomicBool::new(false));
  let shutdown  = Arc::new(AtomicBool::new(false));
  let moni_taps     = controller.health_taps();
  let moni_alarm    = Arc::clone(&pll_alarm);
  let moni_shutdown = Arc::clone(&shutdown);
  let moni_interval = settings.monitor.moni_interval_sec;
  let _moni_handle = thread::Builder::new()
    .name("monitoring".into())
    .spawn(move || {
      monitor_boards(moni_taps,
                     health_sender,
                     moni_alarm,
                     moni_shutdown,
                     moni_interval);
    })
    .expect("Failed to spawn monitoring thread!");

  let health_ctx    = zmq::Context::new();
  let health_socket = health_ctx.socket(zmq::PUB).expect("Unable to create 0MQ PUB socket!");
  health_socket.bind(&settings.monitor.health_pub_address).expect("Unable to bind to (PUB) socket!");

  let mut sink = PubSink::new(&settings.sink_pub_address);

  // SIGINT/SIGTERM end the run gracefully
  let stop_flag = Arc::new(AtomicBool::new(false));
  for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
    if let Err(err) = signal_hook::flag::register(signal, Arc::clone(&stop_flag)) {
      warn!("Can not register the handler for signal {}! {}", signal, err);
    }
  }

  let run_id = args.run_id.unwrap_or(0);
  if let Err(err) = controller.begin_run(run_id, None) {
    error!("Run start failed! {}", err);
    exit(EXIT_HARDWARE_INIT);
  }

  let bar = ProgressBar::new_spinner();
  bar.enable_steady_tick(Duration::from_secs(1));
  bar.set_message(".. acquiring data ..");

  let run_started = Instant::now();
  loop {
    let outcome = controller.poll(&mut sink);

    // forward whatever the monitor collected
    while let Ok(health) = health_receiver.try_recv() {
      if args.verbose {
        println!("{}", health);
      }
      match serde_json::to_string(&health) {
        Err(err)  => error!("Can not serialize a health record! {}", err),
        Ok(frame) => {
          match health_socket.send(frame.as_str(), 0) {
            Err(err) => error!("Can not publish a health record! {}", err),
            Ok(_)    => trace!("Health record published"),
          }
        }
      }
    }
    if pll_alarm.load(Ordering::SeqCst) {
      // latched by the monitor; it re-arms on the next good reading
      trace!("PLL alarm is set!");
    }

    if controller.stop_was_requested() {
      warn!("The merge stage requested a run stop!");
      break;
    }
    if stop_flag.load(Ordering::SeqCst) {
      println!("==> Received stop signal, ending the run!");
      break;
    }
    if settings.runtime_sec > 0
    && run_started.elapsed().as_secs() > settings.runtime_sec {
      println!("==> Runtime seconds of {} have expired!", settings.runtime_sec);
      break;
    }
    if outcome == PollOutcome::NotReady {
      thread::sleep(Duration::from_micros(20));
    }
  }
  bar.finish();

  let worst = match controller.end_run(&mut sink) {
    Err(err) => {
      error!("Run stop failed! {}", err);
      -1
    }
    Ok(worst) => worst,
  };
  controller.stats().print();
  println!("==> Sent {} merged events downstream", sink.n_events());
  if worst != 0 {
    warn!("A reader thread reported status {}", worst);
  }

  shutdown.store(true, Ordering::SeqCst);
  println!("==> Ending program. So long!");
  exit(0);
}
