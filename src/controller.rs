//! Occupancy debounce controller.
//!
//! Converts the per-frame presence signal into a stable actuator state.
//! The debounce is asymmetric: a single detection switches the actuator ON,
//! while switching OFF requires the vacancy timeout to elapse since the last
//! detection.
//!
//! Timestamps are monotonic offsets from the start of the stream session.
//! A timestamp that goes backwards is treated as "no elapsed time": the
//! controller holds its state and ignores the observation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Default vacancy timeout (seconds of continuous absence before OFF).
pub const DEFAULT_VACANCY_TIMEOUT: Duration = Duration::from_secs(3);

/// Binary actuator state (lights / AC).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActuatorState {
    On,
    #[default]
    Off,
}

impl ActuatorState {
    pub fn as_str(self) -> &'static str {
        match self {
            ActuatorState::On => "ON",
            ActuatorState::Off => "OFF",
        }
    }

    pub fn is_on(self) -> bool {
        self == ActuatorState::On
    }
}

impl fmt::Display for ActuatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActuatorState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim() {
            "ON" => Ok(ActuatorState::On),
            "OFF" => Ok(ActuatorState::Off),
            other => Err(anyhow::anyhow!(
                "actuator state must be ON or OFF, got '{}'",
                other
            )),
        }
    }
}

/// Result of a single `observe` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Observation {
    /// State after the update.
    pub state: ActuatorState,
    /// True when this call changed the state.
    pub transitioned: bool,
}

/// Hysteresis controller for one stream session.
///
/// Not thread-safe by construction: it is owned by exactly one session and
/// driven synchronously, one call per frame, in arrival order.
#[derive(Clone, Debug)]
pub struct OccupancyController {
    state: ActuatorState,
    last_seen: Option<Duration>,
    last_observed: Option<Duration>,
    vacancy_timeout: Duration,
    clock_regressions: u64,
}

impl OccupancyController {
    pub fn new(vacancy_timeout: Duration) -> Self {
        Self {
            state: ActuatorState::Off,
            last_seen: None,
            last_observed: None,
            vacancy_timeout,
            clock_regressions: 0,
        }
    }

    /// Feed one presence sample taken at `now`.
    pub fn observe(&mut self, presence_now: bool, now: Duration) -> Observation {
        if let Some(previous) = self.last_observed {
            if now < previous {
                self.clock_regressions += 1;
                log::warn!(
                    "occupancy clock regressed by {:?}; holding state {}",
                    previous - now,
                    self.state
                );
                return self.hold();
            }
        }
        self.last_observed = Some(now);

        if presence_now {
            self.last_seen = Some(now);
            return self.transition_to(ActuatorState::On);
        }

        match self.last_seen {
            Some(seen) if now - seen > self.vacancy_timeout => {
                self.transition_to(ActuatorState::Off)
            }
            _ => self.hold(),
        }
    }

    pub fn state(&self) -> ActuatorState {
        self.state
    }

    /// Timestamp of the most recent positive presence sample.
    pub fn last_seen(&self) -> Option<Duration> {
        self.last_seen
    }

    pub fn vacancy_timeout(&self) -> Duration {
        self.vacancy_timeout
    }

    /// Number of observations ignored because the clock went backwards.
    pub fn clock_regressions(&self) -> u64 {
        self.clock_regressions
    }

    /// Time left before the actuator would switch OFF, if it is ON.
    pub fn remaining_grace(&self, now: Duration) -> Option<Duration> {
        if !self.state.is_on() {
            return None;
        }
        let seen = self.last_seen?;
        let elapsed = now.saturating_sub(seen);
        Some(self.vacancy_timeout.saturating_sub(elapsed))
    }

    fn transition_to(&mut self, target: ActuatorState) -> Observation {
        if self.state == target {
            return self.hold();
        }
        self.state = target;
        Observation {
            state: target,
            transitioned: true,
        }
    }

    fn hold(&self) -> Observation {
        Observation {
            state: self.state,
            transitioned: false,
        }
    }
}

impl Default for OccupancyController {
    fn default() -> Self {
        Self::new(DEFAULT_VACANCY_TIMEOUT)
    }
}

// ----------------------------------------------------------------------------
// Session clocks
// ----------------------------------------------------------------------------

/// Source of monotonic session timestamps.
pub trait SessionClock: Send {
    fn now(&mut self) -> Duration;
}

/// Wall-time monotonic clock anchored at construction.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionClock for MonotonicClock {
    fn now(&mut self) -> Duration {
        self.origin.elapsed()
    }
}

/// Virtual clock that advances by a fixed step per reading.
///
/// Used for synthetic runs where frames are produced faster than real time
/// but must be timestamped as if captured at a fixed frame rate.
pub struct SteppedClock {
    current: Duration,
    step: Duration,
}

impl SteppedClock {
    pub fn new(step: Duration) -> Self {
        Self {
            current: Duration::ZERO,
            step,
        }
    }

    pub fn from_fps(fps: u32) -> Self {
        Self::new(Duration::from_secs(1) / fps.max(1))
    }
}

impl SessionClock for SteppedClock {
    fn now(&mut self) -> Duration {
        let now = self.current;
        self.current += self.step;
        now
    }
}
