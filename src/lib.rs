//! Control loop of a multi-board DAW digitizer acquisition.

mod command;
mod config;
mod digitizer;
mod error;
mod event;
mod plot;
mod readout;
pub mod sim;
mod session;
mod stats;
mod writer;

pub use command::*;
pub use config::*;
pub use digitizer::*;
pub use error::*;
pub use event::*;
pub use plot::*;
pub use readout::*;
pub use session::*;
pub use stats::*;
pub use writer::*;
