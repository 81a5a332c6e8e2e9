use ndarray::{s, Array2, ArrayView1};

/// Channels per board handled by the DAW firmware.
pub const MAX_CHANNELS: usize = 16;

/// One event as decoded from a readout buffer.
///
/// Waveforms are stored as a `(MAX_CHANNELS, record_len)` array; only the first
/// `n_samples[ch]` samples of a row are meaningful, and only for channels present
/// in `channel_mask`.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub timestamp: u64,
    pub channel_mask: u16,
    /// Bit `n` set when the firmware flagged channel `n` as truncated.
    pub truncated_mask: u16,
    pub waveform_data: Array2<u16>,
    pub n_samples: [usize; MAX_CHANNELS],
}

impl DecodedEvent {
    /// Create an empty event able to hold `waveform_len` samples per channel.
    pub fn new(waveform_len: usize) -> Self {
        Self {
            timestamp: 0,
            channel_mask: 0,
            truncated_mask: 0,
            waveform_data: Array2::<u16>::zeros((MAX_CHANNELS, waveform_len)),
            n_samples: [0; MAX_CHANNELS],
        }
    }

    pub fn has_channel(&self, channel: usize) -> bool {
        channel < MAX_CHANNELS && self.channel_mask & (1 << channel) != 0
    }

    pub fn is_truncated(&self, channel: usize) -> bool {
        self.has_channel(channel) && self.truncated_mask & (1 << channel) != 0
    }

    /// Samples recorded for `channel`; empty if the channel is absent.
    pub fn waveform(&self, channel: usize) -> ArrayView1<'_, u16> {
        let len = if self.has_channel(channel) {
            self.n_samples[channel].min(self.waveform_data.ncols())
        } else {
            0
        };
        let row = channel.min(MAX_CHANNELS - 1);
        self.waveform_data.slice(s![row, ..len])
    }

    pub fn channels(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_CHANNELS).filter(move |&ch| self.has_channel(ch))
    }
}
