use anyhow::Context;
use clap::Parser;
use crossbeam_channel::unbounded;
use daw_runner::{sim::SimDigitizer, *};
use log::{error, info, warn, LevelFilter};
use simplelog::{CombinedLogger, WriteLogger};
use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

const DEFAULT_CONFIG_FILE: &str = "daw_runner.toml";
const LOG_FILE: &str = "daw_runner.log";

#[derive(Parser, Debug)]
#[command(version, about = "Readout loop for DAW digitizers")]
struct Args {
    /// Configuration file; defaults to daw_runner.toml in the working directory
    config: Option<PathBuf>,
}

/// Per-platform directory holding the default configuration and the log.
fn working_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Some(profile) = std::env::var_os("USERPROFILE") {
            let dir = PathBuf::from(profile).join("DAW_DEMO");
            let _ = std::fs::create_dir_all(&dir);
            return dir;
        }
    }
    PathBuf::new()
}

fn init_logging(dir: &Path) -> anyhow::Result<()> {
    let log_path = dir.join(LOG_FILE);
    let log_file = File::create(&log_path)
        .with_context(|| format!("can't create log file {}", log_path.display()))?;
    CombinedLogger::init(vec![
        // the keyboard thread keeps the terminal in raw mode
        WriteLogger::new(
            LevelFilter::Info,
            simplelog::Config::default(),
            CrlfWriter::new(io::stdout()),
        ),
        WriteLogger::new(LevelFilter::Debug, simplelog::Config::default(), log_file),
    ])
    .context("logger already initialised")
}

/// Report a fatal error and wait for the user to acknowledge it.
fn report_fatal(e: &DaqError) {
    error!("\x07{e}");
    println!("Press a key to quit");
    if let Err(e) = wait_for_keypress() {
        warn!("Can't read the keyboard: {e}");
    }
}

fn acquire(conf: &Conf) -> Result<RunExit, DaqError> {
    let mut readout = ReadoutLoop::<SimDigitizer, _>::setup(conf, SystemClock)?;

    info!("Open plotter");
    let (plot_tx, plotter) = match spawn_renderer(&conf.plot_settings) {
        Ok(plotter) => plotter,
        Err(e) => {
            readout.shutdown();
            return Err(e);
        }
    };

    let (command_tx, command_rx) = unbounded();
    let stop_keyboard = Arc::new(AtomicBool::new(false));
    let keyboard = spawn_keyboard(command_tx, Arc::clone(&stop_keyboard))
        .map_err(|e| warn!("No keyboard commands available: {e}"))
        .ok();

    let result = readout.run(&command_rx, &plot_tx);

    stop_keyboard.store(true, Ordering::SeqCst);
    if let Some(keyboard) = keyboard {
        if keyboard.join().is_err() {
            warn!("Keyboard thread panicked");
        }
    }
    if let Err(e) = &result {
        report_fatal(e);
    }

    drop(plot_tx);
    if plotter.join().is_err() {
        warn!("Plotter thread panicked");
    }
    readout.shutdown();
    result
}

fn main() {
    let args = Args::parse();
    let dir = working_dir();
    if let Err(e) = init_logging(&dir) {
        eprintln!("{e:#}");
    }
    info!("DAW runner {}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.unwrap_or_else(|| dir.join(DEFAULT_CONFIG_FILE));
    let conf = match Conf::load(&config_path) {
        Ok(conf) => conf,
        Err(e) => {
            report_fatal(&e);
            process::exit(e.exit_code());
        }
    };

    match acquire(&conf) {
        Ok(exit) => {
            info!("Run ended ({exit:?}). TTFN!");
        }
        Err(e) => {
            if !e.is_readout() {
                report_fatal(&e);
            }
            process::exit(e.exit_code());
        }
    }
}
