use crate::{DaqError, MAX_CHANNELS};
use confique::Config;
use serde::Deserialize;
use std::path::Path;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub run_settings: RunSettings,
    #[config(nested)]
    pub plot_settings: PlotSettings,
    #[config(nested)]
    pub board_settings: BoardSettings,
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    #[config(default = "output")]
    pub output_dir: String,
    #[config(default = "run")]
    pub output_file_name: String,
    #[config(default = true)]
    pub raw_enable: bool,
    /// Raw files are rotated once they hold more than this many MiB, compared
    /// byte for byte rather than in whole MiB. 0 disables rotation altogether;
    /// it does not mean "rotate every MiB".
    #[config(default = 1024)]
    pub max_file_size_mb: u64,
    /// Session length in seconds; 0 runs until stopped by hand.
    #[config(default = 0)]
    pub acq_time_s: u32,
    #[config(default = 1000)]
    pub print_interval_ms: u64,
    #[config(default = 1)]
    pub poll_interval_ms: u64,
    #[config(default = false)]
    pub continuous_trigger: bool,
}

#[derive(Config, Debug, Clone)]
pub struct PlotSettings {
    #[config(default = "Periodic")]
    pub mode: PlotModeConfig,
    #[config(default = 0)]
    pub board: usize,
    #[config(default = 0)]
    pub channel: usize,
    #[config(default = "plot_data.txt")]
    pub data_file: String,
    pub gnuplot: Option<String>,
}

#[derive(Config, Debug, Clone)]
pub struct BoardSettings {
    pub boards: Vec<PerBoardSettings>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct PerBoardSettings {
    pub link: String,
    #[serde(default = "default_channels")]
    pub enabled_channels: ChannelConfig,
    #[serde(default = "default_record_len")]
    pub record_len: usize,
    #[serde(default = "default_pre_trig_len")]
    pub pre_trig_len: usize,
    #[serde(default)]
    pub save_waves: bool,
    /// Mean events per poll produced by the simulated backend.
    #[serde(default = "default_event_rate")]
    pub event_rate: f64,
    #[serde(default)]
    pub truncate_probability: f64,
}

fn default_channels() -> ChannelConfig {
    ChannelConfig::All(true)
}

fn default_record_len() -> usize {
    1024
}

fn default_pre_trig_len() -> usize {
    100
}

fn default_event_rate() -> f64 {
    4.0
}

#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum ChannelConfig {
    All(bool),
    List(Vec<u32>),
}

impl ChannelConfig {
    /// Channel enable bitmask, bit `n` set when channel `n` is enabled.
    pub fn mask(&self) -> u16 {
        match self {
            ChannelConfig::All(true) => u16::MAX,
            ChannelConfig::All(false) => 0,
            ChannelConfig::List(channels) => channels
                .iter()
                .filter(|&&ch| (ch as usize) < MAX_CHANNELS)
                .fold(0u16, |mask, &ch| mask | (1 << ch)),
        }
    }
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlotModeConfig {
    Off,
    Periodic,
    Continuous,
}

impl Conf {
    pub fn load(path: &Path) -> Result<Self, DaqError> {
        let conf = Conf::builder()
            .file(path)
            .load()
            .map_err(|e| DaqError::Config(format!("{}: {e}", path.display())))?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<(), DaqError> {
        let boards = &self.board_settings.boards;
        if boards.is_empty() {
            return Err(DaqError::Config("no boards configured".into()));
        }
        if self.plot_settings.board >= boards.len() {
            return Err(DaqError::Config(format!(
                "plotted board {} out of range (0..{})",
                self.plot_settings.board,
                boards.len()
            )));
        }
        if self.plot_settings.channel >= MAX_CHANNELS {
            return Err(DaqError::Config(format!(
                "plotted channel {} out of range (0..{MAX_CHANNELS})",
                self.plot_settings.channel
            )));
        }
        if self.run_settings.print_interval_ms == 0 {
            return Err(DaqError::Config("print_interval_ms must be positive".into()));
        }
        for (board, settings) in boards.iter().enumerate() {
            if let ChannelConfig::List(ref channels) = settings.enabled_channels {
                if let Some(ch) = channels.iter().find(|&&ch| ch as usize >= MAX_CHANNELS) {
                    return Err(DaqError::Config(format!(
                        "board {board}: channel {ch} out of range (0..{MAX_CHANNELS})"
                    )));
                }
            }
            if settings.record_len == 0 {
                return Err(DaqError::Config(format!("board {board}: record_len is 0")));
            }
            if settings.pre_trig_len >= settings.record_len {
                return Err(DaqError::Config(format!(
                    "board {board}: pre_trig_len must be shorter than record_len"
                )));
            }
            if !(0.0..=1.0).contains(&settings.truncate_probability) {
                return Err(DaqError::Config(format!(
                    "board {board}: truncate_probability must be within 0..=1"
                )));
            }
        }
        Ok(())
    }
}
