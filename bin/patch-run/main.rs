use autopatch::{
    build_stage, load_config_or_default, AppConfig, PatchStateId, SessionLog, SessionRecord,
    SimulatedRig, StateEvent, StateTask,
};
use chrono::Utc;
use clap::Parser;
use crossbeam_channel::unbounded;
use env_logger::Env;
use log::{error, info, warn, LevelFilter};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

/// Automated patch-clamp sequence runner (simulated rig)
#[derive(Parser, Debug)]
#[command(name = "patch-run")]
#[command(about = "Drive the automated patch pipette state machine against a simulated rig", long_about = None)]
struct Args {
    /// Path to configuration file (optional; defaults are used otherwise)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// State to start the sequence from
    #[arg(short, long, value_name = "STATE", default_value = "cell detect")]
    start: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config_or_default(args.config.as_deref());

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.log_level.clone());
    initialize_logging(&log_level)?;

    let start = PatchStateId::from_str(&args.start)?;
    info!("=== Automated Patch Runner ===");
    info!("Starting state: {start}");

    let session_log = if config.logging.session_logging {
        Some(SessionLog::new(
            create_log_file_path(&config.logging.log_path)?,
            16,
        ))
    } else {
        None
    };

    let rig = SimulatedRig::new(Duration::from_millis(100), demo_profile);
    let shutdown = setup_shutdown_handler();

    run_sequence(rig, &config, start, shutdown, session_log)
}

/// Resistance profile for the demo run: a quiet bath, a cell encountered a
/// few seconds in, then a seal climbing into the gigaohm range.
fn demo_profile(t: f64) -> f64 {
    if t < 3.0 {
        100e6
    } else if t < 5.0 {
        100e6 + (t - 3.0) / 2.0 * 3e6
    } else if t < 20.0 {
        103e6 * (1.5e9 / 103e6_f64).powf((t - 5.0) / 15.0)
    } else {
        1.5e9
    }
}

/// Drive states in sequence, following each completed task's next-state
/// label until the graph terminates, a failure has no fallback, or the
/// operator stops the run.
fn run_sequence(
    rig: Arc<SimulatedRig>,
    config: &AppConfig,
    start: PatchStateId,
    shutdown: Arc<AtomicBool>,
    mut session_log: Option<SessionLog>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (events_tx, events_rx) = unbounded();
    let mut next = Some(start);

    while let Some(id) = next {
        info!("entering state: {id}");
        let entered = Instant::now();
        let stage = build_stage(id, config);
        let mut task = StateTask::new(rig.clone(), stage).with_events(events_tx.clone());
        task.initialize();

        let completion = loop {
            if shutdown.load(Ordering::SeqCst) {
                task.stop();
            }
            for event in events_rx.try_iter() {
                if let StateEvent::Status { state, message } = event {
                    info!("[{state}] {message}");
                }
            }
            if let Some(completion) = task.wait(Duration::from_millis(200)) {
                break completion;
            }
        };

        let next_state = task.next_state();
        if let Some(log) = session_log.as_mut() {
            log.add(SessionRecord::new(
                id,
                &completion,
                next_state,
                entered.elapsed().as_secs_f64(),
            ))?;
        }

        match (&completion.error, completion.interrupted) {
            (Some(message), _) => warn!("state {id} failed: {message}"),
            (None, true) => {
                info!("state {id} stopped by request");
                break;
            }
            (None, false) => info!("state {id} complete"),
        }

        next = next_state;
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
    }

    if shutdown.load(Ordering::SeqCst) {
        info!("✓ Sequence stopped by user");
    } else {
        info!("✓ Sequence finished");
    }
    Ok(())
}

/// Setup Ctrl+C handler for graceful shutdown
fn setup_shutdown_handler() -> Arc<AtomicBool> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        info!("Ctrl+C received - initiating graceful shutdown...");
        shutdown_flag_clone.store(true, Ordering::SeqCst);
    }) {
        error!("Error setting Ctrl+C handler: {e}");
    }

    shutdown_flag
}

/// Initialize logging with configurable level
fn initialize_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    Ok(())
}

fn create_log_file_path(log_path: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let history_dir = PathBuf::from(log_path);
    std::fs::create_dir_all(&history_dir)?;

    let filename = format!("patch_{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S"));
    Ok(history_dir.join(filename))
}
