use time::{
    format_description::BorrowedFormatItem, macros::format_description, OffsetDateTime, UtcOffset,
};

const LABEL_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day]_[hour][minute][second]_[subsecond digits:3]");

/// Millisecond wall clock.
pub trait Clock {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEnd {
    pub start_ms: i64,
    pub elapsed_s: u32,
}

impl SessionEnd {
    /// `YYYYMMDD_HHMMSS_mmm_<elapsed>s` in local time.
    pub fn label(&self) -> String {
        let start = OffsetDateTime::from_unix_timestamp_nanos(self.start_ms as i128 * 1_000_000)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
        format_session_label(start.to_offset(offset), self.elapsed_s)
    }
}

pub fn format_session_label(start: OffsetDateTime, elapsed_s: u32) -> String {
    let stamp = start
        .format(LABEL_FORMAT)
        .unwrap_or_else(|_| start.unix_timestamp().to_string());
    format!("{stamp}_{elapsed_s}s")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTick {
    Idle,
    Running { elapsed_s: u32 },
    /// The duration limit was reached; the session is back to idle.
    Expired(SessionEnd),
}

/// Time-boxed acquisition session.
///
/// Elapsed time is always recomputed from the fixed start time, so repeated
/// ticks never accumulate rounding error.
#[derive(Debug, Default)]
pub struct AcquisitionSession {
    started_at_ms: Option<i64>,
}

impl AcquisitionSession {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn is_running(&self) -> bool {
        self.started_at_ms.is_some()
    }

    pub fn started_at_ms(&self) -> Option<i64> {
        self.started_at_ms
    }

    /// Begin a session at `now_ms`. Returns false, changing nothing, if one is already running.
    pub fn start(&mut self, now_ms: i64) -> bool {
        if self.started_at_ms.is_some() {
            return false;
        }
        self.started_at_ms = Some(now_ms);
        true
    }

    pub fn elapsed_s(&self, now_ms: i64) -> u32 {
        match self.started_at_ms {
            Some(start) => u32::try_from((now_ms - start).max(0) / 1000).unwrap_or(u32::MAX),
            None => 0,
        }
    }

    /// Check the session against `duration_limit_s` (0 = unbounded).
    pub fn tick(&mut self, now_ms: i64, duration_limit_s: u32) -> SessionTick {
        let Some(start_ms) = self.started_at_ms else {
            return SessionTick::Idle;
        };
        let elapsed_s = self.elapsed_s(now_ms);
        if duration_limit_s > 0 && elapsed_s >= duration_limit_s {
            self.started_at_ms = None;
            return SessionTick::Expired(SessionEnd { start_ms, elapsed_s });
        }
        SessionTick::Running { elapsed_s }
    }

    /// End the session. Idempotent; returns how the session ended if one was running.
    pub fn stop(&mut self, now_ms: i64) -> Option<SessionEnd> {
        let elapsed_s = self.elapsed_s(now_ms);
        self.started_at_ms
            .take()
            .map(|start_ms| SessionEnd { start_ms, elapsed_s })
    }
}

/// Fires once per elapsed interval without drifting: late checks keep the
/// original phase instead of restarting the interval from the late instant.
#[derive(Debug, Clone)]
pub struct IntervalTimer {
    interval_ms: i64,
    last_ms: i64,
}

impl IntervalTimer {
    pub fn new(interval_ms: u64, now_ms: i64) -> Self {
        Self {
            interval_ms: i64::try_from(interval_ms).unwrap_or(i64::MAX).max(1),
            last_ms: now_ms,
        }
    }

    pub fn restart(&mut self, now_ms: i64) {
        self.last_ms = now_ms;
    }

    pub fn fire(&mut self, now_ms: i64) -> bool {
        let elapsed = now_ms - self.last_ms;
        if elapsed < self.interval_ms {
            return false;
        }
        self.last_ms = now_ms - elapsed % self.interval_ms;
        true
    }
}
