//! Error taxonomy of the runner.
//!
//! Errors raised before the readout loop starts (configuration, board open and
//! programming, allocation, output directory) abort the run before any data is
//! taken. `Readout` and `EventDecode` are raised inside the loop and trigger the
//! full shutdown sequence. `Rename` is only ever logged.

use crate::DigitizerError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("can't open digitizer {board}: {source}")]
    Open {
        board: usize,
        source: DigitizerError,
    },

    #[error("can't read board info of digitizer {board}: {source}")]
    BoardInfo {
        board: usize,
        source: DigitizerError,
    },

    #[error("digitizer {board} runs firmware 0x{found:02x}, not DAW")]
    WrongFirmware { board: usize, found: u32 },

    #[error("can't program digitizer {board}: {source}")]
    Program {
        board: usize,
        source: DigitizerError,
    },

    #[error("can't allocate {bytes} bytes of readout memory")]
    Malloc { bytes: usize },

    #[error("output directory {} could not be created: {source}", path.display())]
    OutDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("can't open output file {}: {source}", path.display())]
    FileOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("can't write output file {}: {source}", path.display())]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("readout error on digitizer {board}: {source}")]
    Readout {
        board: usize,
        source: DigitizerError,
    },

    #[error("event build error on digitizer {board}: {source}")]
    EventDecode {
        board: usize,
        source: DigitizerError,
    },

    #[error("can't start the plotter: {0}")]
    Plotter(std::io::Error),

    #[error("rename failed ({} -> {}): {source}", from.display(), to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl DaqError {
    /// Process exit status reported for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            DaqError::Config(_) => 1,
            DaqError::Open { .. } => 2,
            DaqError::BoardInfo { .. } => 3,
            DaqError::WrongFirmware { .. } => 4,
            DaqError::Program { .. } => 5,
            DaqError::Malloc { .. } => 6,
            DaqError::OutDir { .. } => 7,
            DaqError::FileOpen { .. } => 8,
            DaqError::FileWrite { .. } => 9,
            DaqError::Readout { .. } => 10,
            DaqError::EventDecode { .. } => 11,
            DaqError::Plotter(_) => 12,
            DaqError::Rename { .. } => 13,
        }
    }

    /// Whether the error was raised by the running readout loop rather than setup.
    pub fn is_readout(&self) -> bool {
        matches!(self, DaqError::Readout { .. } | DaqError::EventDecode { .. })
    }
}
