//! Modem health tracking
//!
//! Counts consecutive timeouts on critical operations (PDP activation,
//! socket open, socket send). A run of three marks the modem as a zombie;
//! the transport then gets one deep-recovery attempt per cycle.

use std::fmt;
use tracing::{error, info, warn};

/// Consecutive critical timeouts that flag a zombie modem
pub const ZOMBIE_TIMEOUTS: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Ok,
    Trying,
    ZombieDetected,
    Failed,
    Recovered,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Ok => write!(f, "OK"),
            HealthState::Trying => write!(f, "TRYING"),
            HealthState::ZombieDetected => write!(f, "ZOMBIE_DETECTED"),
            HealthState::Failed => write!(f, "FAILED"),
            HealthState::Recovered => write!(f, "RECOVERED"),
        }
    }
}

/// What the transport should do after consulting the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Continue,
    AttemptRecovery,
    Abort,
}

#[derive(Debug, Clone)]
pub struct HealthMonitor {
    state: HealthState,
    timeouts: u8,
    recovery_attempted: bool,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            state: HealthState::Ok,
            timeouts: 0,
            recovery_attempted: false,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn timeouts(&self) -> u8 {
        self.timeouts
    }

    /// Start of a communication cycle
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn record_timeout(&mut self, tag: &str) {
        self.timeouts = self.timeouts.saturating_add(1);
        if self.timeouts == 1 {
            warn!("First critical timeout in {}", tag);
            self.state = HealthState::Trying;
        } else if self.timeouts >= ZOMBIE_TIMEOUTS && self.state != HealthState::Failed {
            warn!(
                "{} consecutive critical timeouts in {}, modem may be a zombie",
                self.timeouts, tag
            );
            self.state = HealthState::ZombieDetected;
        }
    }

    pub fn mark_ok(&mut self) {
        self.state = match self.state {
            HealthState::Trying | HealthState::ZombieDetected => {
                info!("Modem recovered after earlier timeouts");
                HealthState::Recovered
            }
            _ => HealthState::Ok,
        };
        self.timeouts = 0;
    }

    /// Decide whether the cycle can go on, needs deep recovery, or is lost
    pub fn verdict(&mut self, tag: &str) -> HealthVerdict {
        match self.state {
            HealthState::ZombieDetected if self.timeouts >= ZOMBIE_TIMEOUTS => {
                if self.recovery_attempted {
                    error!("Deep recovery already used this cycle, failing at {}", tag);
                    self.state = HealthState::Failed;
                    HealthVerdict::Abort
                } else {
                    self.recovery_attempted = true;
                    HealthVerdict::AttemptRecovery
                }
            }
            HealthState::Failed => {
                error!("Cycle already marked failed at {}", tag);
                HealthVerdict::Abort
            }
            _ => HealthVerdict::Continue,
        }
    }

    pub fn recovery_finished(&mut self, ok: bool) {
        if ok {
            info!("Deep recovery complete, continuing with remaining budget");
            self.state = HealthState::Trying;
            self.timeouts = 0;
        } else {
            error!("Deep recovery failed, aborting cycle");
            self.state = HealthState::Failed;
        }
    }
}
