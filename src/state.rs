//! Persisted process state
//!
//! Two lifecycles:
//! - [`Nvs`]: non-volatile key/value store that survives everything
//!   (operator choice, GPS fix, backoff counters).
//! - [`RetainedState`]: the retained region, kept across deep sleep and
//!   reset on a true power-on or a restart.
//!
//! Deep sleep and restart are "save state, terminate, re-enter": the next
//! process reads [`StateStore::boot`] to learn how it was woken.

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::cycle::battery::GateState;

/// Non-volatile keys
pub mod keys {
    pub const LAST_OPERATOR: &str = "last_operator";
    pub const GPS_LAT: &str = "gps_lat";
    pub const GPS_LNG: &str = "gps_lng";
    pub const GPS_ALT: &str = "gps_alt";
    pub const SKIP_SCAN_CYCLES: &str = "skip_scan_cycles";
    pub const MODEM_CONSEC_FAILS: &str = "modem_consec_fails";
    pub const MODEM_SKIP_CYCLES: &str = "modem_skip_cycles";
    pub const MODEM_POST_RESTART: &str = "modem_post_restart";
}

const NVS_FILE: &str = "nvs.json";
const RETAINED_FILE: &str = "rtc.json";

/// How the current process was entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WakeReason {
    PowerOn,
    DeepSleep,
    Restart,
}

impl WakeReason {
    /// Power-on and restart both start from a cleared retained region
    pub fn is_cold_boot(&self) -> bool {
        !matches!(self, WakeReason::DeepSleep)
    }
}

impl fmt::Display for WakeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WakeReason::PowerOn => write!(f, "power-on"),
            WakeReason::DeepSleep => write!(f, "deep-sleep"),
            WakeReason::Restart => write!(f, "restart"),
        }
    }
}

/// Retained region: survives deep sleep only
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetainedState {
    pub boot_count: u32,
    pub accum_sleep_us: u64,
    /// Set just before the process terminates on purpose
    pub pending_wake: Option<WakeReason>,
    #[serde(default)]
    pub battery: GateState,
}

/// File-backed key/value store; every call reads or writes the file
#[derive(Debug, Clone)]
pub struct Nvs {
    path: PathBuf,
}

impl Nvs {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        let map = self.load()?;
        match map.get(key) {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .with_context(|| format!("bad value for NVS key {}", key)),
            None => Ok(None),
        }
    }

    /// Like [`Nvs::get`] but logs and falls back on read errors
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            Ok(Some(v)) => v,
            Ok(None) => default,
            Err(e) => {
                warn!("NVS read of {} failed: {}", key, e);
                default
            }
        }
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let mut map = self.load()?;
        map.insert(key.to_string(), serde_json::to_value(value)?);
        self.store(&map)?;
        debug!("NVS set {}", key);
        Ok(())
    }

    /// Remove a key, returning whether it existed
    pub fn remove(&self, key: &str) -> anyhow::Result<bool> {
        let mut map = self.load()?;
        let existed = map.remove(key).is_some();
        if existed {
            self.store(&map)?;
            debug!("NVS removed {}", key);
        }
        Ok(existed)
    }

    pub fn contains(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.load()?.contains_key(key))
    }

    fn load(&self) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(serde_json::Map::new()),
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("corrupt NVS file {:?}", self.path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(serde_json::Map::new()),
            Err(e) => Err(e).with_context(|| format!("failed to read {:?}", self.path)),
        }
    }

    fn store(&self, map: &serde_json::Map<String, serde_json::Value>) -> anyhow::Result<()> {
        write_atomic(&self.path, &serde_json::to_vec_pretty(map)?)
    }
}

/// Both persisted regions, rooted in one state directory
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
    nvs: Nvs,
}

impl StateStore {
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create state directory {:?}", dir))?;
        let nvs = Nvs::open(dir.join(NVS_FILE));
        Ok(Self { dir, nvs })
    }

    pub fn nvs(&self) -> &Nvs {
        &self.nvs
    }

    /// Work out the wake reason and load the retained region for it.
    ///
    /// Anything other than a recorded deep sleep clears the retained
    /// region. The pending marker is consumed here, so a process that dies
    /// mid-cycle is seen as a power-on next time.
    pub fn boot(&self, force_power_on: bool) -> anyhow::Result<(WakeReason, RetainedState)> {
        let previous = if force_power_on {
            None
        } else {
            self.load_retained()
        };

        let (reason, mut retained) = match previous {
            Some(state) => match state.pending_wake {
                Some(WakeReason::DeepSleep) => (WakeReason::DeepSleep, state),
                Some(WakeReason::Restart) => (WakeReason::Restart, RetainedState::default()),
                _ => (WakeReason::PowerOn, RetainedState::default()),
            },
            None => (WakeReason::PowerOn, RetainedState::default()),
        };

        retained.pending_wake = None;
        retained.boot_count = retained.boot_count.saturating_add(1);
        self.save_retained(&retained)?;

        info!("Wake reason: {} (boot #{})", reason, retained.boot_count);
        Ok((reason, retained))
    }

    pub fn save_retained(&self, state: &RetainedState) -> anyhow::Result<()> {
        write_atomic(&self.retained_path(), &serde_json::to_vec_pretty(state)?)
    }

    /// Record how the next process should consider itself woken
    pub fn park(&self, state: &mut RetainedState, next: WakeReason) -> anyhow::Result<()> {
        state.pending_wake = Some(next);
        self.save_retained(state)
    }

    fn retained_path(&self) -> PathBuf {
        self.dir.join(RETAINED_FILE)
    }

    fn load_retained(&self) -> Option<RetainedState> {
        let content = fs::read_to_string(self.retained_path()).ok()?;
        match serde_json::from_str(&content) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Retained region unreadable, treating as power-on: {}", e);
                None
            }
        }
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data).with_context(|| format!("failed to write {:?}", tmp))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(name: &str) -> StateStore {
        let dir = std::env::temp_dir().join(format!("telemetry-state-{}-{}", std::process::id(), name));
        let _ = fs::remove_dir_all(&dir);
        StateStore::open(dir).unwrap()
    }

    #[test]
    fn test_nvs_put_get_remove() {
        let store = temp_store("nvs");
        let nvs = store.nvs();
        assert_eq!(nvs.get::<u8>(keys::LAST_OPERATOR).unwrap(), None);

        nvs.put(keys::LAST_OPERATOR, &3u8).unwrap();
        nvs.put(keys::GPS_LAT, &20.5f64).unwrap();
        assert_eq!(nvs.get::<u8>(keys::LAST_OPERATOR).unwrap(), Some(3));
        assert_eq!(nvs.get::<f64>(keys::GPS_LAT).unwrap(), Some(20.5));

        assert!(nvs.remove(keys::LAST_OPERATOR).unwrap());
        assert!(!nvs.remove(keys::LAST_OPERATOR).unwrap());
        assert!(!nvs.contains(keys::LAST_OPERATOR).unwrap());
        assert_eq!(nvs.get_or(keys::SKIP_SCAN_CYCLES, 0u8), 0);
    }

    #[test]
    fn test_first_boot_is_power_on() {
        let store = temp_store("first-boot");
        let (reason, retained) = store.boot(false).unwrap();
        assert_eq!(reason, WakeReason::PowerOn);
        assert_eq!(retained.boot_count, 1);
        assert_eq!(retained.accum_sleep_us, 0);
    }

    #[test]
    fn test_deep_sleep_keeps_retained() {
        let store = temp_store("deep-sleep");
        let (_, mut retained) = store.boot(false).unwrap();
        retained.accum_sleep_us = 600_000_000;
        store.park(&mut retained, WakeReason::DeepSleep).unwrap();

        let (reason, retained) = store.boot(false).unwrap();
        assert_eq!(reason, WakeReason::DeepSleep);
        assert_eq!(retained.accum_sleep_us, 600_000_000);
        assert_eq!(retained.boot_count, 2);
    }

    #[test]
    fn test_restart_and_power_on_clear_retained() {
        let store = temp_store("restart");
        let (_, mut retained) = store.boot(false).unwrap();
        retained.accum_sleep_us = 42;
        store.park(&mut retained, WakeReason::Restart).unwrap();

        let (reason, retained) = store.boot(false).unwrap();
        assert_eq!(reason, WakeReason::Restart);
        assert_eq!(retained.accum_sleep_us, 0);

        let mut retained = retained;
        retained.accum_sleep_us = 7;
        store.park(&mut retained, WakeReason::DeepSleep).unwrap();
        let (reason, retained) = store.boot(true).unwrap();
        assert_eq!(reason, WakeReason::PowerOn);
        assert_eq!(retained.accum_sleep_us, 0);
    }

    #[test]
    fn test_unplanned_exit_is_power_on() {
        let store = temp_store("crash");
        let (_, mut retained) = store.boot(false).unwrap();
        retained.accum_sleep_us = 99;
        store.save_retained(&retained).unwrap();

        let (reason, retained) = store.boot(false).unwrap();
        assert_eq!(reason, WakeReason::PowerOn);
        assert_eq!(retained.accum_sleep_us, 0);
    }

    #[test]
    fn test_nvs_survives_power_on() {
        let store = temp_store("nvs-power-on");
        store.nvs().put(keys::MODEM_CONSEC_FAILS, &4u8).unwrap();
        store.boot(true).unwrap();
        assert_eq!(store.nvs().get::<u8>(keys::MODEM_CONSEC_FAILS).unwrap(), Some(4));
    }
}
