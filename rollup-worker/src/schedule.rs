use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::WorkerError;

/// Periods longer than this are aligned to whole minutes.
const MINUTE_ALIGNMENT_THRESHOLD: Duration = Duration::from_secs(30);

const MINUTE: Duration = Duration::from_secs(60);

/// Determines when the first run of a periodic worker happens.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPolicy {
    /// Start on a boundary derived from the period.
    ///
    /// The first run happens no earlier than one period from now. Periods above 30 seconds are
    /// aligned to the next whole minute, shorter periods to the next multiple of the period within
    /// the current minute. Processes with the same period thereby flush in lockstep.
    #[default]
    Aligned,
    /// Start one period from now plus a random offset of up to one period.
    ///
    /// Spreads the flushes of many processes to avoid bursts at the receiver.
    Wobble,
}

impl StartPolicy {
    /// Returns the delay until the first run, relative to the wall-clock time `now`.
    ///
    /// Fails with [`WorkerError::InvalidPeriod`] if the delay is not representable.
    pub fn first_delay(self, period: Duration, now: SystemTime) -> Result<Duration, WorkerError> {
        let delay = match self {
            Self::Aligned => aligned_delay(period, now),
            Self::Wobble => wobble_delay(period),
        };

        delay.ok_or(WorkerError::InvalidPeriod(period))
    }
}

fn wobble_delay(period: Duration) -> Option<Duration> {
    // The latest possible start is just short of two periods.
    period.checked_mul(2)?;

    let nanos = period.as_nanos().min(u64::MAX as u128) as u64;
    let offset = match nanos {
        0 => 0,
        _ => rand::rng().random_range(0..nanos),
    };
    period.checked_add(Duration::from_nanos(offset))
}

fn aligned_delay(period: Duration, now: SystemTime) -> Option<Duration> {
    let earliest = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .checked_add(period)?;

    let unit = if period > MINUTE_ALIGNMENT_THRESHOLD {
        MINUTE
    } else {
        period
    };

    let into_minute = earliest.as_nanos() % MINUTE.as_nanos();
    if into_minute == 0 || unit.is_zero() {
        return Some(period);
    }

    let bump = unit.as_nanos() - into_minute % unit.as_nanos();
    period.checked_add(Duration::from_nanos(u64::try_from(bump).ok()?))
}

/// The run times of a periodic task.
///
/// Runs happen at `first + n * period`. If a run is late, the schedule skips all slots that have
/// already passed, so a slow task never causes back-to-back invocations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Schedule {
    period: Duration,
    next_run: Instant,
}

impl Schedule {
    /// Creates a schedule with the first run at `first_run`.
    ///
    /// The period must be non-zero and small enough that the run after `first_run` is
    /// representable.
    pub fn new(period: Duration, first_run: Instant) -> Result<Self, WorkerError> {
        if period.is_zero() || first_run.checked_add(period).is_none() {
            return Err(WorkerError::InvalidPeriod(period));
        }

        Ok(Self {
            period,
            next_run: first_run,
        })
    }

    /// Returns the period between runs.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Returns the instant of the next run.
    pub fn next_run(&self) -> Instant {
        self.next_run
    }

    /// Returns `true` if the next run is due at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        self.next_run <= now
    }

    /// Returns the time left until the next run.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.next_run.saturating_duration_since(now)
    }

    /// Moves the next run to the first slot after `now` and returns the number of skipped slots.
    ///
    /// Called after a run completes. A run that finishes within its period skips nothing. Once the
    /// clock can no longer represent a later slot, the next run stays at the last slot.
    pub fn advance(&mut self, now: Instant) -> u32 {
        let mut skipped = 0;
        let Some(next_run) = self.next_run.checked_add(self.period) else {
            return skipped;
        };
        self.next_run = next_run;

        while self.next_run <= now {
            match self.next_run.checked_add(self.period) {
                Some(next_run) => self.next_run = next_run,
                None => break,
            }
            skipped += 1;
        }

        skipped
    }
}
