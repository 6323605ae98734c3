//! Sensor, GPS and battery collaborators
//!
//! The drivers themselves live outside this crate; the cycle only needs
//! raw samples, an optional fix and a voltage. The simulated versions
//! report the values from the `[simulation]` config section.

use tracing::{debug, warn};

use crate::codec::{Location, VAR_COUNT};
use crate::config::SimulationConfig;

/// Raw sensor channels, one per telemetry variable
pub trait SensorSuite {
    fn sample(&mut self, channel: usize) -> anyhow::Result<i32>;
}

pub trait Gps {
    /// Power the receiver, wait for a fix, power it down
    fn acquire(&mut self) -> anyhow::Result<Option<Location>>;
}

pub trait BatteryMonitor {
    fn read_volts(&mut self) -> anyhow::Result<f64>;
}

pub struct Peripherals {
    pub sensors: Box<dyn SensorSuite>,
    pub gps: Box<dyn Gps>,
    pub battery: Box<dyn BatteryMonitor>,
}

impl Peripherals {
    pub fn simulated(config: &SimulationConfig) -> Self {
        Self {
            sensors: Box::new(SimulatedSensors::new(config.vars)),
            gps: Box::new(SimulatedGps {
                fix: config.gps_fix,
            }),
            battery: Box::new(SimulatedBattery {
                volts: config.battery_volts,
            }),
        }
    }
}

/// Drop `discard` samples, then average the next `keep` (rounded)
pub fn discard_and_average(
    sensors: &mut dyn SensorSuite,
    channel: usize,
    discard: usize,
    keep: usize,
) -> anyhow::Result<i32> {
    for _ in 0..discard {
        sensors.sample(channel)?;
    }
    if keep == 0 {
        return sensors.sample(channel);
    }
    let mut sum = 0i64;
    for _ in 0..keep {
        sum += sensors.sample(channel)? as i64;
    }
    Ok((sum as f64 / keep as f64).round() as i32)
}

/// Read every channel; a failing channel reports 0
pub fn read_all(sensors: &mut dyn SensorSuite, discard: usize, keep: usize) -> [i32; VAR_COUNT] {
    let mut vars = [0; VAR_COUNT];
    for (channel, slot) in vars.iter_mut().enumerate() {
        match discard_and_average(sensors, channel, discard, keep) {
            Ok(v) => *slot = v,
            Err(e) => warn!("Sensor channel {} failed, reporting 0: {}", channel, e),
        }
    }
    debug!("Sensor values: {:?}", vars);
    vars
}

/// Constant channels with a settling transient on the first read of each
pub struct SimulatedSensors {
    values: [i32; VAR_COUNT],
    settled: [bool; VAR_COUNT],
}

impl SimulatedSensors {
    pub fn new(values: [i32; VAR_COUNT]) -> Self {
        Self {
            values,
            settled: [false; VAR_COUNT],
        }
    }
}

impl SensorSuite for SimulatedSensors {
    fn sample(&mut self, channel: usize) -> anyhow::Result<i32> {
        let value = *self
            .values
            .get(channel)
            .ok_or_else(|| anyhow::anyhow!("no sensor channel {}", channel))?;
        if !self.settled[channel] {
            self.settled[channel] = true;
            return Ok(0);
        }
        Ok(value)
    }
}

pub struct SimulatedGps {
    pub fix: Option<Location>,
}

impl Gps for SimulatedGps {
    fn acquire(&mut self) -> anyhow::Result<Option<Location>> {
        Ok(self.fix)
    }
}

pub struct SimulatedBattery {
    pub volts: f64,
}

impl BatteryMonitor for SimulatedBattery {
    fn read_volts(&mut self) -> anyhow::Result<f64> {
        Ok(self.volts)
    }
}
