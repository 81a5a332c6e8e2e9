use crate::MAX_CHANNELS;
use std::fmt;

pub const MB_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelCounter {
    pub trigger_count: u64,
    /// Events the firmware flagged as truncated on this channel.
    pub truncated_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceCounter {
    pub byte_count: u64,
    /// Timestamp of the most recently decoded event.
    pub last_timestamp: u64,
    pub channels: [ChannelCounter; MAX_CHANNELS],
}

/// Counters of every board frozen at the last print cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterSnapshot {
    counters: Vec<SourceCounter>,
    taken_at_ms: i64,
}

impl CounterSnapshot {
    pub fn source(&self, source: usize) -> &SourceCounter {
        &self.counters[source]
    }

    pub fn taken_at_ms(&self) -> i64 {
        self.taken_at_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TruncationRate {
    /// Truncated events were counted but no event arrived in the interval.
    NoEvents,
    Fraction(f64),
}

/// Per-board counters, one slot per configured board, sized once at startup.
#[derive(Debug)]
pub struct StatisticsAggregator {
    counters: Vec<SourceCounter>,
}

impl StatisticsAggregator {
    pub fn new(n_sources: usize) -> Self {
        Self {
            counters: vec![SourceCounter::default(); n_sources],
        }
    }

    pub fn n_sources(&self) -> usize {
        self.counters.len()
    }

    pub fn source(&self, source: usize) -> &SourceCounter {
        &self.counters[source]
    }

    /// Account for a buffer read from `source`. Empty reads are ignored.
    pub fn record_buffer(&mut self, source: usize, byte_count: u64) {
        if byte_count == 0 {
            return;
        }
        self.counters[source].byte_count += byte_count;
    }

    /// Account for one decoded event of `source`.
    pub fn record_event(
        &mut self,
        source: usize,
        channel_mask: u16,
        truncated_mask: u16,
        timestamp: u64,
    ) {
        let counter = &mut self.counters[source];
        for ch in 0..MAX_CHANNELS {
            let bit = 1 << ch;
            if channel_mask & bit == 0 {
                continue;
            }
            counter.channels[ch].trigger_count += 1;
            if truncated_mask & bit != 0 {
                counter.channels[ch].truncated_count += 1;
            }
        }
        counter.last_timestamp = timestamp;
    }

    pub fn snapshot(&self, now_ms: i64) -> CounterSnapshot {
        CounterSnapshot {
            counters: self.counters.clone(),
            taken_at_ms: now_ms,
        }
    }

    pub fn reset(&mut self) {
        self.counters.fill(SourceCounter::default());
    }

    /// Fraction of truncated events on a channel since `baseline`.
    ///
    /// `None` when no new truncated event was counted.
    pub fn truncation_rate(
        &self,
        source: usize,
        channel: usize,
        baseline: &CounterSnapshot,
        n_events: u64,
    ) -> Option<TruncationRate> {
        let current = self.counters[source].channels[channel].truncated_count;
        let delta = current.saturating_sub(baseline.source(source).channels[channel].truncated_count);
        if delta == 0 {
            return None;
        }
        if n_events == 0 {
            return Some(TruncationRate::NoEvents);
        }
        Some(TruncationRate::Fraction(delta as f64 / n_events as f64))
    }

    /// Rates of `source` over the interval since `baseline` was taken.
    pub fn report(
        &self,
        source: usize,
        baseline: &CounterSnapshot,
        now_ms: i64,
        enable_mask: u16,
    ) -> SourceReport {
        let current = &self.counters[source];
        let previous = baseline.source(source);
        let secs = ((now_ms - baseline.taken_at_ms()).max(1)) as f64 / 1000.0;
        let bytes = current.byte_count.saturating_sub(previous.byte_count);

        let channels = (0..MAX_CHANNELS)
            .filter(|&ch| enable_mask & (1 << ch) != 0)
            .map(|ch| {
                let events = current.channels[ch]
                    .trigger_count
                    .saturating_sub(previous.channels[ch].trigger_count);
                ChannelReport {
                    channel: ch,
                    trigger_rate: events as f64 / secs,
                    truncation: self.truncation_rate(source, ch, baseline, events),
                }
            })
            .collect();

        SourceReport {
            source,
            readout_rate: bytes as f64 / secs / MB_SIZE as f64,
            last_timestamp: current.last_timestamp,
            channels,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelReport {
    pub channel: usize,
    /// Triggers per second.
    pub trigger_rate: f64,
    pub truncation: Option<TruncationRate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceReport {
    pub source: usize,
    /// MB/s
    pub readout_rate: f64,
    pub last_timestamp: u64,
    pub channels: Vec<ChannelReport>,
}

impl fmt::Display for SourceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Board {}: Readout Rate = {:.2} MB/s, TimeStamp = {}",
            self.source, self.readout_rate, self.last_timestamp
        )?;
        for ch in &self.channels {
            write!(f, "\n    Ch {:2}: Trg Rate = {:.2} Hz", ch.channel, ch.trigger_rate)?;
            match ch.truncation {
                Some(TruncationRate::Fraction(fraction)) => {
                    write!(f, ", truncated events = {:.2}%", 100.0 * fraction)?
                }
                Some(TruncationRate::NoEvents) => write!(f, ", truncated events = n/a (no events)")?,
                None => (),
            }
        }
        Ok(())
    }
}
