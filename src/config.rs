use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::buffer::{DEFAULT_MARKER, DEFAULT_MAX_LINES_TO_READ, DEFAULT_MAX_UNPROCESSED};
use crate::codec::{Location, VAR_COUNT};
use crate::modem::budget::DEFAULT_COMM_BUDGET_MS;
use crate::operator::profile::{default_profiles, OperatorProfile};
use crate::operator::DEFAULT_SKIP_SCAN_CYCLES;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub modem: ModemConfig,
    pub server: ServerConfig,
    pub sampling: SamplingConfig,
    pub battery: BatteryConfig,
    pub recovery: RecoveryConfig,
    pub capabilities: Capabilities,
    pub operators: Vec<OperatorProfile>,
    pub simulation: SimulationConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            modem: ModemConfig::default(),
            server: ServerConfig::default(),
            sampling: SamplingConfig::default(),
            battery: BatteryConfig::default(),
            recovery: RecoveryConfig::default(),
            capabilities: Capabilities::default(),
            operators: default_profiles(),
            simulation: SimulationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Holds the buffer file and the persisted state
    pub state_dir: PathBuf,
    pub buffer_file: String,
    pub sleep_minutes: u64,
    pub processed_marker: String,
    pub max_unprocessed: usize,
    pub max_lines_to_read: usize,
    /// Presence of this file (in `state_dir`) requests a buffer export
    pub provision_request: String,
    pub provision_export: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("state"),
            buffer_file: "buffer.txt".to_string(),
            sleep_minutes: 10,
            processed_marker: DEFAULT_MARKER.to_string(),
            max_unprocessed: DEFAULT_MAX_UNPROCESSED,
            max_lines_to_read: DEFAULT_MAX_LINES_TO_READ,
            provision_request: "provision.request".to_string(),
            provision_export: "buffer_export.json".to_string(),
        }
    }
}

/// Modem wiring, PWRKEY timings and board-level modem capabilities
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModemConfig {
    pub port: String,
    pub baud: u32,
    /// Board can switch the modem supply rail
    pub supply_switch: bool,
    /// Try a supply-rail cycle when PWRKEY and forced reset fail
    pub hard_power_cycle: bool,
    /// Send `AT+CPSMS=0` after every boot
    pub disable_psm: bool,
    pub power_on_attempts: u32,
    pub pwrkey_pre_ms: u64,
    pub pwrkey_on_ms: u64,
    pub pwrkey_off_ms: u64,
    pub uart_ready_ms: u64,
    pub forced_reset_ms: u64,
    pub max_forced_resets: u8,
    pub poweroff_urc_ms: u64,
    pub toff_buffer_ms: u64,
    pub hard_cycle_off_ms: u64,
    pub max_hard_cycles: u8,
    /// Wall-clock limit for the send phase of one cycle
    pub comm_budget_ms: u64,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud: 115_200,
            supply_switch: false,
            hard_power_cycle: false,
            disable_psm: true,
            power_on_attempts: 3,
            pwrkey_pre_ms: 100,
            pwrkey_on_ms: 1500,
            pwrkey_off_ms: 1500,
            uart_ready_ms: 2500,
            forced_reset_ms: 13_000,
            max_forced_resets: 1,
            poweroff_urc_ms: 10_000,
            toff_buffer_ms: 2000,
            hard_cycle_off_ms: 3000,
            max_hard_cycles: 1,
            comm_budget_ms: DEFAULT_COMM_BUDGET_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Wait for the server's acknowledgement before marking a line sent
    pub require_ack: bool,
    pub ack_token: String,
    pub ack_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 12607,
            require_ack: false,
            ack_token: "$".to_string(),
            ack_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Raw samples thrown away while the input settles
    pub discard: usize,
    /// Samples averaged after the discard
    pub keep: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self { discard: 2, keep: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    pub enter_volts: f64,
    pub exit_volts: f64,
    pub stable_count: u32,
    pub filter_samples: usize,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            enter_volts: 3.20,
            exit_volts: 3.80,
            stable_count: 3,
            filter_samples: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Accumulated sleep that triggers a preventive restart
    pub restart_hours: u64,
    /// Consecutive failed send cycles before the modem backoff restart
    pub modem_fail_threshold: u32,
    pub skip_cycles_after_restart: u32,
    pub skip_scan_cycles: u8,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            restart_hours: 24,
            modem_fail_threshold: 6,
            skip_cycles_after_restart: 3,
            skip_scan_cycles: DEFAULT_SKIP_SCAN_CYCLES,
        }
    }
}

/// Subsystems enabled on this device
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub gps: bool,
    pub battery_gate: bool,
    pub modem_backoff: bool,
    pub preventive_restart: bool,
    pub provisioning: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            gps: true,
            battery_gate: true,
            modem_backoff: true,
            preventive_restart: true,
            provisioning: true,
        }
    }
}

/// Values reported by the stand-in sensor, GPS and battery drivers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub vars: [i32; VAR_COUNT],
    pub gps_fix: Option<Location>,
    pub battery_volts: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            vars: [2215, 4830, 1013, 350, 0, 0, 0],
            gps_fix: Some(Location {
                lat: 19.432608,
                lng: -99.133209,
                alt: 2240.0,
            }),
            battery_volts: 3.95,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }

    pub fn buffer_path(&self) -> PathBuf {
        self.node.state_dir.join(&self.node.buffer_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.node.sleep_minutes, 10);
        assert_eq!(config.operators.len(), 5);
        assert_eq!(config.modem.forced_reset_ms, 13_000);
        assert_eq!(config.battery.enter_volts, 3.20);
        assert_eq!(config.buffer_path(), PathBuf::from("state/buffer.txt"));
    }

    #[test]
    fn test_partial_sections() {
        let text = r#"
[server]
host = "ingest.example.org"
require_ack = true

[modem]
port = "/dev/ttyAMA0"
hard_power_cycle = true

[capabilities]
gps = false

[[operators]]
name = "TEST"
plmn = "00101"
apn = "internet"

[simulation]
vars = [1, 2, 3, 4, 5, 6, 7]
battery_volts = 3.1
"#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.server.host, "ingest.example.org");
        assert_eq!(config.server.port, 12607);
        assert!(config.server.require_ack);
        assert_eq!(config.modem.port, "/dev/ttyAMA0");
        assert!(config.modem.hard_power_cycle);
        assert_eq!(config.modem.baud, 115_200);
        assert!(!config.capabilities.gps);
        assert!(config.capabilities.battery_gate);
        assert_eq!(config.operators.len(), 1);
        assert_eq!(config.operators[0].apn, "internet");
        assert_eq!(config.operators[0].network_mode, "AT+CNMP=38");
        assert_eq!(config.simulation.vars[6], 7);
        assert!(config.simulation.gps_fix.is_some());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load(Path::new("/nonexistent/telemetry-node.toml")).is_err());
    }
}
