use clap::Parser;
use env_logger::Env;
use log::{LevelFilter, error, info, warn};
use nne_sweep::{
    AppConfig, DisplayEvent, DisplayLink, RunState, SessionManager, SimulatedFactory,
    SweepOrchestrator, TelemetryStore, load_config_or_default,
};
use std::path::PathBuf;
use std::sync::atomic::Ordering;

/// Sweep runner against the simulated instrument bench. Hardware session
/// factories wrap the concrete wire protocols and live outside this crate.
#[derive(Parser, Debug)]
#[command(name = "sweep-run")]
#[command(about = "Run an AC amplitude / temperature sweep", long_about = None)]
struct Args {
    /// Path to configuration file (defaults are used when omitted)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config_or_default(args.config.as_deref());

    let log_level = args.log_level.unwrap_or(config.logging.log_level.clone());
    initialize_logging(&log_level);
    log_startup_info(&config);

    // Provision simulated sessions for the configured mode.
    let mut manager = SessionManager::new(Box::new(SimulatedFactory::new()));
    let report = manager.provision(
        config.measurement.mode,
        &config.instrument_addresses(),
        &config.measurement.harmonics,
        config.measurement.dc_bias_amps,
    );
    if !report.is_complete() {
        for (role, e) in &report.failures {
            warn!("{role} unavailable: {e}");
        }
    }

    let plan = config.sweep_plan()?;
    let store = TelemetryStore::new(config.measurement.mode);
    let (display, events) = DisplayLink::channel();
    let orchestrator = SweepOrchestrator::new(
        plan,
        config.run_context(),
        manager.into_sessions(),
        store.clone(),
        display,
    );

    let handle = orchestrator.spawn()?;
    let stop_flag = handle.stop_flag();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received - finishing the current point, then stopping");
        stop_flag.store(true, Ordering::SeqCst);
    })?;

    // Drain display events until the run reaches a terminal state.
    for event in events {
        match event {
            DisplayEvent::Status {
                temperature,
                amplitude,
            } => {
                info!(
                    "point done: {amplitude:.3e} A at {temperature:.2} K ({} samples)",
                    store.len()
                );
            }
            DisplayEvent::TemperaturePointDone => info!("temperature point done"),
            DisplayEvent::Finished(_) => break,
        }
    }

    match handle.join() {
        RunState::Completed => {
            info!("sweep completed with {} samples", store.len());
            Ok(())
        }
        RunState::Aborted => {
            info!("sweep aborted by user after {} samples", store.len());
            Ok(())
        }
        state => {
            error!("sweep ended in {state:?}");
            Err(format!("sweep ended in {state:?}").into())
        }
    }
}

fn log_startup_info(config: &AppConfig) {
    info!("=== Sweep Runner ===");
    info!("Mode: {:?}", config.measurement.mode);
    info!(
        "Excitation: {:.3} Hz, DC bias {:.1e} A",
        config.measurement.frequency_hz, config.measurement.dc_bias_amps
    );
    if let Some(dir) = &config.measurement.save_directory {
        info!("Snapshots: {}", dir.display());
    } else {
        info!("Snapshots: disabled");
    }
}

fn initialize_logging(log_level: &str) {
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
}
