//! Operator selection
//!
//! Reuses the last operator that delivered data; otherwise tests every
//! profile, scores its signal and picks the best one.

pub mod profile;

use tracing::{debug, error, info, warn};

use crate::modem::io::ModemIo;
use crate::modem::response::CellInfo;
use crate::modem::CellularTransport;
use crate::state::{keys, Nvs};
use profile::OperatorProfile;

/// Score of a profile that could not be tested
pub const INVALID_SCORE: i32 = -999;

/// Score reported when no profile is valid
pub const WORST_SCORE: i32 = -9999;

/// Cycles to skip scanning after a scan found nothing usable
pub const DEFAULT_SKIP_SCAN_CYCLES: u8 = 3;

/// Weighted signal score; SINR dominates, RSRP and RSRQ are shifted positive
pub fn signal_score(sinr: i32, rsrp: i32, rsrq: i32) -> i32 {
    4 * sinr + 2 * (rsrp + 120) + (rsrq + 20)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalQuality {
    pub rsrp: i32,
    pub rsrq: i32,
    pub rssi: i32,
    pub sinr: i32,
    pub score: i32,
    pub valid: bool,
}

impl SignalQuality {
    pub fn invalid() -> Self {
        Self {
            rsrp: 0,
            rsrq: 0,
            rssi: 0,
            sinr: 0,
            score: INVALID_SCORE,
            valid: false,
        }
    }

    pub fn from_cell(cell: &CellInfo) -> Self {
        Self {
            rsrp: cell.rsrp,
            rsrq: cell.rsrq,
            rssi: cell.rssi,
            sinr: cell.sinr,
            score: signal_score(cell.sinr, cell.rsrp, cell.rsrq),
            valid: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BestOperator {
    pub index: usize,
    pub score: i32,
}

/// Argmax over valid entries; the earlier profile wins a tie. With nothing
/// valid the result is index 0 with [`WORST_SCORE`].
pub fn best_operator(qualities: &[SignalQuality]) -> BestOperator {
    let mut best = BestOperator {
        index: 0,
        score: WORST_SCORE,
    };
    for (index, q) in qualities.iter().enumerate() {
        if q.valid && q.score > best.score {
            best = BestOperator {
                index,
                score: q.score,
            };
        }
    }
    best
}

pub struct OperatorSelector {
    profiles: Vec<OperatorProfile>,
    nvs: Nvs,
    skip_scan_cycles: u8,
    qualities: Vec<SignalQuality>,
}

impl OperatorSelector {
    pub fn new(profiles: Vec<OperatorProfile>, nvs: Nvs, skip_scan_cycles: u8) -> Self {
        let qualities = vec![SignalQuality::invalid(); profiles.len()];
        Self {
            profiles,
            nvs,
            skip_scan_cycles,
            qualities,
        }
    }

    pub fn profiles(&self) -> &[OperatorProfile] {
        &self.profiles
    }

    pub fn qualities(&self) -> &[SignalQuality] {
        &self.qualities
    }

    /// Make the transport forget the saved operator whenever a profile
    /// fails to configure.
    pub fn install_invalid_hook<M: ModemIo>(&self, transport: &mut CellularTransport<M>) {
        let nvs = self.nvs.clone();
        transport.set_operator_invalid_callback(Box::new(move |profile: &OperatorProfile| {
            match nvs.remove(keys::LAST_OPERATOR) {
                Ok(true) => info!("Forgot saved operator after {} failed", profile),
                Ok(false) => {}
                Err(e) => warn!("Could not clear saved operator: {}", e),
            }
        }));
    }

    /// Saved operator index, if present and still in the table
    pub fn saved_operator(&self) -> Option<usize> {
        let saved: u8 = match self.nvs.get(keys::LAST_OPERATOR) {
            Ok(Some(v)) => v,
            Ok(None) => return None,
            Err(e) => {
                warn!("Saved operator unreadable: {}", e);
                return None;
            }
        };
        let index = saved as usize;
        if index < self.profiles.len() {
            Some(index)
        } else {
            warn!("Saved operator {} is outside the table, ignoring", index);
            self.forget();
            None
        }
    }

    /// Configure, bring up PDP, read signal, tear down, reset
    pub fn test_operator<M: ModemIo>(&mut self, transport: &mut CellularTransport<M>, index: usize) -> SignalQuality {
        let Some(profile) = self.profiles.get(index).cloned() else {
            return SignalQuality::invalid();
        };
        info!("Testing operator {}", profile);

        let quality = match Self::measure_signal(transport, &profile) {
            Ok(q) => {
                info!(
                    "{}: RSRP={} RSRQ={} SINR={} score={}",
                    profile, q.rsrp, q.rsrq, q.sinr, q.score
                );
                q
            }
            Err(e) => {
                warn!("{} unusable: {}", profile, e);
                SignalQuality::invalid()
            }
        };
        if let Err(e) = transport.reset_modem() {
            warn!("Reset after testing {} failed: {}", profile, e);
        }
        self.qualities[index] = quality;
        quality
    }

    fn measure_signal<M: ModemIo>(transport: &mut CellularTransport<M>, profile: &OperatorProfile) -> anyhow::Result<SignalQuality> {
        transport.configure_operator(profile, false)?;
        transport.activate_pdp()?;
        let cell = transport.network_info();
        if let Err(e) = transport.deactivate_pdp() {
            debug!("PDP teardown after signal check: {}", e);
        }
        Ok(SignalQuality::from_cell(&cell?))
    }

    /// Test every profile and return the winner
    pub fn scan<M: ModemIo>(&mut self, transport: &mut CellularTransport<M>) -> BestOperator {
        info!("Scanning {} operators", self.profiles.len());
        for index in 0..self.profiles.len() {
            self.test_operator(transport, index);
        }
        let best = best_operator(&self.qualities);
        info!(
            "Best operator: {} (score {})",
            self.profiles.get(best.index).map(|p| p.name.as_str()).unwrap_or("?"),
            best.score
        );
        best
    }

    /// Pick and configure an operator for this cycle.
    ///
    /// Saved operator first (without a modem reset). If that fails the
    /// skip-scan counter is consumed, or the choice is purged and all
    /// profiles are rescanned. A scan with no usable signal arms the
    /// skip-scan counter.
    pub fn select<M: ModemIo>(&mut self, transport: &mut CellularTransport<M>) -> anyhow::Result<usize> {
        if let Some(index) = self.saved_operator() {
            let profile = self.profiles[index].clone();
            info!("Using saved operator {}", profile);
            if transport.configure_operator(&profile, true).is_ok() {
                return Ok(index);
            }

            warn!("Saved operator {} failed", profile);
            let skip: u8 = self.nvs.get_or(keys::SKIP_SCAN_CYCLES, 0);
            if skip > 0 {
                self.nvs.put(keys::SKIP_SCAN_CYCLES, &(skip - 1))?;
                anyhow::bail!("skipping operator scan ({} cycle(s) left)", skip - 1);
            }
            self.forget();
        } else {
            info!("No saved operator");
        }

        let best = self.scan(transport);
        if best.score <= INVALID_SCORE {
            error!(
                "No operator with usable signal, skipping scans for {} cycle(s)",
                self.skip_scan_cycles
            );
            self.nvs.put(keys::SKIP_SCAN_CYCLES, &self.skip_scan_cycles)?;
            anyhow::bail!("no operator with usable signal");
        }

        let profile = self.profiles[best.index].clone();
        transport.configure_operator(&profile, false)?;
        Ok(best.index)
    }

    /// Persist the operator that delivered data, or forget it
    pub fn record_outcome(&self, index: usize, delivered: bool) {
        if delivered {
            match self.nvs.put(keys::LAST_OPERATOR, &(index as u8)) {
                Ok(()) => info!("Saved operator {} for next cycles", self.profiles[index]),
                Err(e) => warn!("Could not save operator: {}", e),
            }
        } else {
            self.forget();
        }
    }

    fn forget(&self) {
        if let Err(e) = self.nvs.remove(keys::LAST_OPERATOR) {
            warn!("Could not clear saved operator: {}", e);
        }
    }
}
