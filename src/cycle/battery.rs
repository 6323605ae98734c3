//! Low-battery transmission gate
//!
//! Asymmetric thresholds: the gate closes as soon as the filtered voltage
//! drops to `enter_volts`, and opens again only after `stable_count`
//! consecutive cycles at or above `exit_volts`.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::BatteryConfig;

/// Gate state carried between cycles in the retained region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateState {
    pub low: bool,
    pub stable: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct BatteryGate {
    enter_volts: f64,
    exit_volts: f64,
    stable_count: u32,
}

impl BatteryGate {
    pub fn new(enter_volts: f64, exit_volts: f64, stable_count: u32) -> Self {
        Self {
            enter_volts,
            exit_volts,
            stable_count: stable_count.max(1),
        }
    }

    pub fn from_config(config: &BatteryConfig) -> Self {
        Self::new(config.enter_volts, config.exit_volts, config.stable_count)
    }

    /// Feed one filtered reading; returns true while transmission is blocked
    pub fn update(&self, state: &mut GateState, volts: f64) -> bool {
        if !state.low {
            if volts <= self.enter_volts {
                warn!(
                    "Battery {:.2} V <= {:.2} V, entering rest mode",
                    volts, self.enter_volts
                );
                state.low = true;
                state.stable = 0;
            }
            return state.low;
        }

        if volts >= self.exit_volts {
            state.stable += 1;
            if state.stable >= self.stable_count {
                info!(
                    "Battery {:.2} V stable for {} cycle(s), leaving rest mode",
                    volts, state.stable
                );
                state.low = false;
                state.stable = 0;
            } else {
                info!(
                    "Battery {:.2} V recovering ({}/{})",
                    volts, state.stable, self.stable_count
                );
            }
        } else {
            state.stable = 0;
        }
        state.low
    }
}

/// Average of the samples after dropping the first; `None` if nothing is left
pub fn filter_voltage(samples: &[f64]) -> Option<f64> {
    let kept = samples.get(1..)?;
    if kept.is_empty() {
        return None;
    }
    Some(kept.iter().sum::<f64>() / kept.len() as f64)
}
