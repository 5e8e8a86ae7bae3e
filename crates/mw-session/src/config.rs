use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Session lifetime and monitoring cadence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which the session expires
    pub session_timeout_secs: u64,
    /// Remaining time at which the expiry warning fires
    pub warning_threshold_secs: u64,
    /// Remaining time at which the access token is refreshed ahead of use.
    /// Zero disables proactive refresh.
    pub refresh_threshold_secs: u64,
    /// Minimum spacing between activity events that reset the clock
    pub activity_throttle_secs: u64,
    /// Countdown display tick
    pub display_tick_millis: u64,
    /// Warning/expiry enforcement tick
    pub enforcement_tick_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: 30 * 60,
            warning_threshold_secs: 5 * 60,
            refresh_threshold_secs: 2 * 60,
            activity_throttle_secs: 10,
            display_tick_millis: 1000,
            enforcement_tick_secs: 30,
        }
    }
}

impl SessionConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn warning_threshold(&self) -> Duration {
        Duration::from_secs(self.warning_threshold_secs)
    }

    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.refresh_threshold_secs)
    }

    pub fn activity_throttle(&self) -> Duration {
        Duration::from_secs(self.activity_throttle_secs)
    }

    pub fn display_tick(&self) -> Duration {
        Duration::from_millis(self.display_tick_millis.max(1))
    }

    pub fn enforcement_tick(&self) -> Duration {
        Duration::from_secs(self.enforcement_tick_secs.max(1))
    }
}
