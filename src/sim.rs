//! Simulated DAW digitizer.
//!
//! Boards with a `sim://` link are served by [`SimDigitizer`], which produces
//! random pulses on the enabled channels. Buffers use a small little-endian
//! layout, one record per event:
//!
//! ```text
//! u32 record size in bytes | u64 timestamp | u16 channel mask | u16 truncated mask
//! then, per channel in the mask (ascending): u16 n_samples | n_samples x u16
//! ```

use crate::{
    BoardInfo, DecodedEvent, Digitizer, DigitizerError, PerBoardSettings, DAW_FW_ID, MAX_CHANNELS,
};
use log::debug;
use rand::{rngs::StdRng, Rng, SeedableRng};

pub const SIM_SCHEME: &str = "sim://";

const HEADER_SIZE: usize = 4 + 8 + 2 + 2;
const MAX_EVENTS_PER_READ: usize = 1023;
const MAX_RECORD_LEN: usize = u16::MAX as usize;
const BASELINE: u16 = 8000;

#[derive(Debug)]
pub struct SimDigitizer {
    index: usize,
    rng: StdRng,
    running: bool,
    enable_mask: u16,
    record_len: usize,
    pre_trig_len: usize,
    event_rate: f64,
    truncate_probability: f64,
    pending_triggers: usize,
    timestamp: u64,
}

impl SimDigitizer {
    fn record_size(n_channels: usize, samples: usize) -> usize {
        HEADER_SIZE + n_channels * (2 + 2 * samples)
    }

    fn push_event(&mut self, buffer: &mut Vec<u8>, forced: bool) {
        let mut channel_mask = 0u16;
        for ch in 0..MAX_CHANNELS {
            if self.enable_mask & (1 << ch) != 0 && self.rng.random_bool(0.5) {
                channel_mask |= 1 << ch;
            }
        }
        if channel_mask == 0 {
            if !forced || self.enable_mask == 0 {
                return;
            }
            // software triggers read out every enabled channel
            channel_mask = self.enable_mask;
        }
        self.timestamp += self.rng.random_range(1_000..50_000);

        let mut truncated_mask = 0u16;
        let mut payload = Vec::new();
        for ch in (0..MAX_CHANNELS).filter(|&ch| channel_mask & (1 << ch) != 0) {
            let truncated = self.rng.random_bool(self.truncate_probability);
            let samples = if truncated {
                truncated_mask |= 1 << ch;
                self.rng.random_range(self.pre_trig_len.max(1)..=self.record_len)
            } else {
                self.record_len
            };
            let amplitude: u16 = self.rng.random_range(200..4000);
            payload.extend_from_slice(&(samples as u16).to_le_bytes());
            for i in 0..samples {
                let noise: u16 = self.rng.random_range(0..8);
                let sample = if i >= self.pre_trig_len {
                    let decay = (i - self.pre_trig_len) as u32;
                    let pulse = u32::from(amplitude) * 64 / (64 + decay);
                    BASELINE.saturating_sub(pulse as u16)
                } else {
                    BASELINE
                };
                payload.extend_from_slice(&(sample + noise).to_le_bytes());
            }
        }

        let size = (HEADER_SIZE + payload.len()) as u32;
        buffer.extend_from_slice(&size.to_le_bytes());
        buffer.extend_from_slice(&self.timestamp.to_le_bytes());
        buffer.extend_from_slice(&channel_mask.to_le_bytes());
        buffer.extend_from_slice(&truncated_mask.to_le_bytes());
        buffer.extend_from_slice(&payload);
    }
}

impl Digitizer for SimDigitizer {
    fn open(index: usize, settings: &PerBoardSettings) -> Result<Self, DigitizerError> {
        if !settings.link.starts_with(SIM_SCHEME) {
            return Err(DigitizerError::DevNotFound);
        }
        debug!("Board {index}: simulated digitizer at {}", settings.link);
        Ok(Self {
            index,
            rng: StdRng::seed_from_u64(index as u64),
            running: false,
            enable_mask: 0,
            record_len: settings.record_len,
            pre_trig_len: settings.pre_trig_len,
            event_rate: 0.0,
            truncate_probability: 0.0,
            pending_triggers: 0,
            timestamp: 0,
        })
    }

    fn info(&self) -> Result<BoardInfo, DigitizerError> {
        Ok(BoardInfo {
            model_name: "V1730S (simulated)".into(),
            serial_number: 30_000 + self.index as u32,
            channels: MAX_CHANNELS,
            roc_firmware: "4.25".into(),
            amc_firmware: format!("{}.1", DAW_FW_ID),
            firmware_code: DAW_FW_ID,
        })
    }

    fn program(&mut self, settings: &PerBoardSettings) -> Result<(), DigitizerError> {
        if settings.record_len == 0 || settings.record_len > MAX_RECORD_LEN {
            return Err(DigitizerError::InvalidParam);
        }
        self.enable_mask = settings.enabled_channels.mask();
        self.record_len = settings.record_len;
        self.pre_trig_len = settings.pre_trig_len.min(settings.record_len - 1);
        self.event_rate = settings.event_rate.max(0.0);
        self.truncate_probability = settings.truncate_probability.clamp(0.0, 1.0);
        Ok(())
    }

    fn max_readout_size(&self) -> usize {
        MAX_EVENTS_PER_READ * Self::record_size(MAX_CHANNELS, self.record_len)
    }

    fn max_events_per_read(&self) -> usize {
        MAX_EVENTS_PER_READ
    }

    fn start(&mut self) -> Result<(), DigitizerError> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DigitizerError> {
        self.running = false;
        self.pending_triggers = 0;
        Ok(())
    }

    fn send_sw_trigger(&mut self) -> Result<(), DigitizerError> {
        if self.running {
            self.pending_triggers += 1;
        }
        Ok(())
    }

    fn poll(&mut self, buffer: &mut Vec<u8>) -> Result<(), DigitizerError> {
        buffer.clear();
        if !self.running {
            return Ok(());
        }
        let upper = (2.0 * self.event_rate).round() as usize;
        let random = self.rng.random_range(0..=upper);
        let forced = std::mem::take(&mut self.pending_triggers);
        for n in 0..(random + forced).min(MAX_EVENTS_PER_READ) {
            self.push_event(buffer, n >= random);
        }
        Ok(())
    }

    fn decode_events(
        &mut self,
        buffer: &[u8],
        events: &mut Vec<DecodedEvent>,
    ) -> Result<(), DigitizerError> {
        events.clear();
        let mut rest = buffer;
        while !rest.is_empty() {
            let size = read_u32(rest, 0)? as usize;
            if size < HEADER_SIZE || size > rest.len() {
                return Err(DigitizerError::EventNotFound);
            }
            let (record, tail) = rest.split_at(size);
            events.push(decode_record(record, self.record_len)?);
            rest = tail;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DigitizerError> {
        self.running = false;
        Ok(())
    }
}

fn read_u16(bytes: &[u8], at: usize) -> Result<u16, DigitizerError> {
    bytes
        .get(at..at + 2)
        .and_then(|b| b.try_into().ok())
        .map(u16::from_le_bytes)
        .ok_or(DigitizerError::EventNotFound)
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, DigitizerError> {
    bytes
        .get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(DigitizerError::EventNotFound)
}

fn read_u64(bytes: &[u8], at: usize) -> Result<u64, DigitizerError> {
    bytes
        .get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or(DigitizerError::EventNotFound)
}

fn decode_record(record: &[u8], record_len: usize) -> Result<DecodedEvent, DigitizerError> {
    let mut event = DecodedEvent::new(record_len);
    event.timestamp = read_u64(record, 4)?;
    event.channel_mask = read_u16(record, 12)?;
    event.truncated_mask = read_u16(record, 14)?;

    let mut at = HEADER_SIZE;
    for ch in 0..MAX_CHANNELS {
        if event.channel_mask & (1 << ch) == 0 {
            continue;
        }
        let samples = read_u16(record, at)? as usize;
        at += 2;
        if samples > record_len {
            return Err(DigitizerError::EventNotFound);
        }
        for i in 0..samples {
            event.waveform_data[[ch, i]] = read_u16(record, at)?;
            at += 2;
        }
        event.n_samples[ch] = samples;
    }
    if at != record.len() {
        return Err(DigitizerError::EventNotFound);
    }
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelConfig;

    fn settings(channels: ChannelConfig) -> PerBoardSettings {
        PerBoardSettings {
            link: "sim://0".into(),
            enabled_channels: channels,
            record_len: 64,
            pre_trig_len: 8,
            save_waves: false,
            event_rate: 3.0,
            truncate_probability: 0.2,
        }
    }

    fn board(channels: ChannelConfig) -> SimDigitizer {
        let settings = settings(channels);
        let mut board = SimDigitizer::open(0, &settings).unwrap();
        board.program(&settings).unwrap();
        board
    }

    #[test]
    fn rejects_foreign_links() {
        let mut settings = settings(ChannelConfig::All(true));
        settings.link = "usb://0".into();
        assert_eq!(
            SimDigitizer::open(0, &settings).unwrap_err(),
            DigitizerError::DevNotFound
        );
    }

    #[test]
    fn idle_board_returns_empty_buffer() {
        let mut board = board(ChannelConfig::All(true));
        let mut buffer = vec![1, 2, 3];
        board.poll(&mut buffer).unwrap();
        assert!(buffer.is_empty());
    }

    #[test]
    fn decoded_events_respect_enabled_channels() {
        let mut board = board(ChannelConfig::List(vec![1, 4]));
        board.start().unwrap();
        let mut buffer = Vec::new();
        let mut events = Vec::new();
        let mut total = 0;
        for _ in 0..20 {
            board.poll(&mut buffer).unwrap();
            assert!(buffer.len() <= board.max_readout_size());
            board.decode_events(&buffer, &mut events).unwrap();
            for event in &events {
                assert_eq!(event.channel_mask & !0b1_0010, 0);
                assert_eq!(event.truncated_mask & !event.channel_mask, 0);
                for ch in event.channels() {
                    assert!(event.n_samples[ch] <= 64);
                }
            }
            assert!(events.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
            total += events.len();
        }
        assert!(total > 0);
    }

    #[test]
    fn software_trigger_forces_an_event() {
        let mut settings = settings(ChannelConfig::List(vec![2]));
        settings.event_rate = 0.0;
        let mut board = SimDigitizer::open(0, &settings).unwrap();
        board.program(&settings).unwrap();
        board.start().unwrap();

        let mut buffer = Vec::new();
        let mut events = Vec::new();
        board.send_sw_trigger().unwrap();
        board.poll(&mut buffer).unwrap();
        board.decode_events(&buffer, &mut events).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].has_channel(2));

        board.poll(&mut buffer).unwrap();
        assert!(buffer.is_empty());
    }

    #[test]
    fn corrupt_buffer_fails_to_decode() {
        let mut board = board(ChannelConfig::All(true));
        let mut events = Vec::new();
        let corrupt = [0xff, 0xff, 0, 0, 1, 2];
        assert_eq!(
            board.decode_events(&corrupt, &mut events).unwrap_err(),
            DigitizerError::EventNotFound
        );
    }
}
