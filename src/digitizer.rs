use crate::{DecodedEvent, PerBoardSettings};
use thiserror::Error;

/// Firmware family code reported by boards running the DAW firmware.
pub const DAW_FW_ID: u32 = 0x88;

/// Return codes of the digitizer library.
#[repr(i32)]
#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
pub enum DigitizerError {
    #[error("generic error")]
    Generic = -1,
    #[error("communication error")]
    Comm = -2,
    #[error("maximum number of devices exceeded")]
    MaxDevicesError = -3,
    #[error("invalid parameter")]
    InvalidParam = -4,
    #[error("device not found")]
    DevNotFound = -5,
    #[error("device already open")]
    DevAlreadyOpen = -6,
    #[error("invalid handle")]
    InvalidHandle = -7,
    #[error("readout error")]
    Readout = -8,
    #[error("event not found")]
    EventNotFound = -9,
    #[error("out of memory")]
    OutOfMemory = -10,
    #[error("function not supported by this board")]
    NotImplemented = -11,
    #[error("unknown error")]
    Unknown = 1,
}

impl From<i32> for DigitizerError {
    fn from(value: i32) -> Self {
        match value {
            -1 => Self::Generic,
            -2 => Self::Comm,
            -3 => Self::MaxDevicesError,
            -4 => Self::InvalidParam,
            -5 => Self::DevNotFound,
            -6 => Self::DevAlreadyOpen,
            -7 => Self::InvalidHandle,
            -8 => Self::Readout,
            -9 => Self::EventNotFound,
            -10 => Self::OutOfMemory,
            -11 => Self::NotImplemented,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardInfo {
    pub model_name: String,
    pub serial_number: u32,
    pub channels: usize,
    pub roc_firmware: String,
    pub amc_firmware: String,
    /// Firmware family code; must be [`DAW_FW_ID`].
    pub firmware_code: u32,
}

/// One hardware data source.
///
/// `poll` must return promptly when the board has no data: an empty buffer is
/// the normal "nothing yet" answer, never an error.
pub trait Digitizer {
    /// Connect to board number `index` as described by `settings`.
    fn open(index: usize, settings: &PerBoardSettings) -> Result<Self, DigitizerError>
    where
        Self: Sized;

    fn info(&self) -> Result<BoardInfo, DigitizerError>;

    fn program(&mut self, settings: &PerBoardSettings) -> Result<(), DigitizerError>;

    /// Largest buffer a single `poll` can return, in bytes.
    fn max_readout_size(&self) -> usize;

    /// Largest number of events a single buffer can decode into.
    fn max_events_per_read(&self) -> usize;

    fn start(&mut self) -> Result<(), DigitizerError>;

    fn stop(&mut self) -> Result<(), DigitizerError>;

    fn send_sw_trigger(&mut self) -> Result<(), DigitizerError>;

    /// Replace the contents of `buffer` with the data pending on the board.
    fn poll(&mut self, buffer: &mut Vec<u8>) -> Result<(), DigitizerError>;

    /// Decode `buffer` into `events`, replacing their previous contents.
    fn decode_events(
        &mut self,
        buffer: &[u8],
        events: &mut Vec<DecodedEvent>,
    ) -> Result<(), DigitizerError>;

    fn close(&mut self) -> Result<(), DigitizerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_codes_map_back() {
        assert_eq!(DigitizerError::from(-2), DigitizerError::Comm);
        assert_eq!(DigitizerError::from(-11), DigitizerError::NotImplemented);
        assert_eq!(DigitizerError::from(42), DigitizerError::Unknown);
        assert_eq!(DigitizerError::from(DigitizerError::Readout as i32), DigitizerError::Readout);
    }
}
