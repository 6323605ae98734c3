//! Cellular transport
//!
//! Drives a SIM7080-class LTE-M modem over AT commands: power sequencing,
//! operator configuration, network attach, PDP context and a single TCP
//! socket. Each step is bounded by its own timeout and retry count; critical
//! timeouts feed the [`health::HealthMonitor`].

pub mod at;
pub mod budget;
pub mod health;
pub mod io;
#[cfg(test)]
pub mod mock;
pub mod response;
#[cfg(feature = "serial")]
pub mod serial;

use anyhow::Context;
use tracing::{debug, error, info, warn};

use crate::config::ModemConfig;
use crate::operator::profile::OperatorProfile;
use at::{AtChannel, AtOutcome, ERROR_TOKENS};
use budget::CommBudget;
use health::{HealthMonitor, HealthVerdict};
use io::ModemIo;
use response::CellInfo;

/// Largest payload written in one `+CASEND`
pub const MAX_TCP_PAYLOAD: usize = 1460;

/// Connection id used for the single socket
const SOCKET_CID: u8 = 0;

const SEND_OK_TOKENS: &[&str] = &["SEND OK", "OK", "+CADATAIND: 0"];
const SEND_ERROR_TOKENS: &[&str] = &["SEND FAIL", "ERROR", "+CME ERROR", "+CMS ERROR"];

const ALIVE_ATTEMPTS: u32 = 3;
const ALIVE_TIMEOUT_MS: u64 = 1000;
const ALIVE_GAP_MS: u64 = 300;

/// Called with the profile whose configuration just failed
pub type OperatorInvalidFn = Box<dyn FnMut(&OperatorProfile)>;

pub struct CellularTransport<M: ModemIo> {
    at: AtChannel<M>,
    config: ModemConfig,
    health: HealthMonitor,
    budget: CommBudget,
    forced_resets: u8,
    hard_cycles: u8,
    socket_open: bool,
    data_indicated: bool,
    on_operator_invalid: Option<OperatorInvalidFn>,
}

impl<M: ModemIo> CellularTransport<M> {
    pub fn new(io: M, config: ModemConfig) -> Self {
        let budget = CommBudget::new(config.comm_budget_ms);
        Self {
            at: AtChannel::new(io),
            config,
            health: HealthMonitor::new(),
            budget,
            forced_resets: 0,
            hard_cycles: 0,
            socket_open: false,
            data_indicated: false,
            on_operator_invalid: None,
        }
    }

    pub fn io(&self) -> &M {
        self.at.io()
    }

    pub fn io_mut(&mut self) -> &mut M {
        self.at.io_mut()
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Register the hook run when an operator fails to configure
    pub fn set_operator_invalid_callback(&mut self, callback: OperatorInvalidFn) {
        self.on_operator_invalid = Some(callback);
    }

    /// Reset health tracking and start the communication budget
    pub fn begin_comm_cycle(&mut self) {
        self.health.reset();
        self.budget.start(self.at.now_ms());
    }

    pub fn ensure_budget(&self, tag: &str) -> bool {
        self.budget.ensure(self.at.now_ms(), tag)
    }

    pub fn is_alive(&mut self) -> bool {
        self.at.is_alive(ALIVE_ATTEMPTS, ALIVE_TIMEOUT_MS, ALIVE_GAP_MS)
    }

    fn pulse_power_key(&mut self, pulse_ms: u64) -> anyhow::Result<()> {
        let io = self.at.io_mut();
        io.set_power_key(false)?;
        io.delay_ms(self.config.pwrkey_pre_ms);
        io.set_power_key(true)?;
        io.delay_ms(pulse_ms);
        io.set_power_key(false)?;
        Ok(())
    }

    /// Hold PWRKEY long enough to force a firmware reset
    fn forced_reset(&mut self) -> anyhow::Result<()> {
        warn!("Forcing modem reset ({} ms PWRKEY)", self.config.forced_reset_ms);
        self.pulse_power_key(self.config.forced_reset_ms)?;
        self.at.delay_ms(self.config.uart_ready_ms);
        Ok(())
    }

    fn hard_power_cycle(&mut self) -> anyhow::Result<()> {
        if self.hard_cycles >= self.config.max_hard_cycles {
            anyhow::bail!("hard power cycle limit reached for this boot");
        }
        self.hard_cycles += 1;
        warn!(
            "Hard power cycle {}/{}",
            self.hard_cycles, self.config.max_hard_cycles
        );
        let off_ms = self.config.hard_cycle_off_ms;
        let io = self.at.io_mut();
        io.set_supply(false)?;
        io.delay_ms(off_ms);
        io.set_supply(true)?;
        io.delay_ms(500);
        Ok(())
    }

    fn after_boot(&mut self) {
        if self.config.disable_psm {
            match self.at.command("AT+CPSMS=0", 1000) {
                Ok(reply) if reply.is_ok() => debug!("PSM disabled"),
                Ok(reply) => warn!("Could not disable PSM: {}", reply.text.trim()),
                Err(e) => warn!("Could not disable PSM: {}", e),
            }
        }
    }

    /// Power the modem up and wait for it to answer `AT`
    pub fn power_on(&mut self) -> anyhow::Result<()> {
        if self.is_alive() {
            info!("Modem already on");
            return Ok(());
        }

        let attempts = self.config.power_on_attempts;
        for attempt in 1..=attempts {
            info!("PWRKEY power-on attempt {}/{}", attempt, attempts);
            self.pulse_power_key(self.config.pwrkey_on_ms)?;
            self.at.delay_ms(self.config.uart_ready_ms);
            if self.is_alive() {
                info!("Modem answered after attempt {}", attempt);
                self.after_boot();
                return Ok(());
            }
        }

        if self.forced_resets < self.config.max_forced_resets {
            self.forced_resets += 1;
            self.forced_reset()?;
            if self.is_alive() {
                info!("Modem recovered by forced reset");
                self.after_boot();
                return Ok(());
            }
        } else {
            warn!("Forced reset already used this boot, skipping");
        }

        if self.config.hard_power_cycle {
            match self.hard_power_cycle() {
                Ok(()) => {
                    self.pulse_power_key(self.config.pwrkey_on_ms)?;
                    self.at.delay_ms(self.config.uart_ready_ms);
                    if self.is_alive() {
                        info!("Modem recovered by hard power cycle");
                        self.after_boot();
                        return Ok(());
                    }
                }
                Err(e) => warn!("{}", e),
            }
        }

        error!("Modem not responding");
        anyhow::bail!("modem not responding after power-on sequence")
    }

    /// Clean shutdown with `+CPOWD`, falling back to PWRKEY then forced reset
    pub fn power_off(&mut self) -> anyhow::Result<()> {
        if !self.is_alive() {
            debug!("Modem already off");
            return Ok(());
        }
        self.socket_open = false;

        self.at.clear_input()?;
        self.at.write_line("AT+CPOWD=1")?;
        let reply = self
            .at
            .wait_for(&["NORMAL POWER DOWN"], ERROR_TOKENS, self.config.poweroff_urc_ms)?;
        if reply.is_ok() {
            info!("Modem powered down");
            self.at.delay_ms(self.config.toff_buffer_ms);
            return Ok(());
        }

        warn!("No power-down URC, toggling PWRKEY");
        self.pulse_power_key(self.config.pwrkey_off_ms)?;
        self.at.delay_ms(self.config.toff_buffer_ms);
        if !self.is_alive() {
            info!("Modem off after PWRKEY");
            return Ok(());
        }

        warn!("Modem still alive, forcing reset");
        self.forced_reset()?;
        if !self.is_alive() {
            return Ok(());
        }
        anyhow::bail!("modem still answering after power-off sequence")
    }

    /// Full functionality reset, then wait for the SIM
    pub fn reset_modem(&mut self) -> anyhow::Result<()> {
        let mut reset = false;
        for attempt in 1..=3 {
            if self.at.command("AT+CFUN=1,1", 15_000)?.is_ok() {
                reset = true;
                break;
            }
            warn!("CFUN reset attempt {}/3 failed", attempt);
            self.at.delay_ms(2000);
        }
        if !reset {
            anyhow::bail!("modem did not accept CFUN reset");
        }
        self.at.delay_ms(3000);

        for attempt in 1..=10 {
            let reply = self.at.command_expect("AT+CPIN?", &["+CPIN: READY"], 5000)?;
            if reply.is_ok() {
                debug!("SIM ready after {} poll(s)", attempt);
                self.at.delay_ms(5000);
                return Ok(());
            }
            self.at.delay_ms(1000);
        }
        anyhow::bail!("SIM not ready after reset")
    }

    pub fn get_iccid(&mut self) -> anyhow::Result<String> {
        let reply = self.at.command("AT+CCID", 3000)?.require("AT+CCID")?;
        response::parse_iccid(&reply.text)
    }

    /// Apply an operator profile: optional reset, RAT and bands, PLMN lock,
    /// APN. Any failing step runs the operator-invalid callback.
    pub fn configure_operator(&mut self, profile: &OperatorProfile, skip_reset: bool) -> anyhow::Result<()> {
        info!(
            "Configuring operator {} ({}){}",
            profile.name,
            profile.plmn,
            if skip_reset { " without reset" } else { "" }
        );
        let result = self.apply_profile(profile, skip_reset);
        if let Err(ref e) = result {
            error!("Operator {} configuration failed: {}", profile.name, e);
            if let Some(callback) = self.on_operator_invalid.as_mut() {
                callback(profile);
            }
        }
        result
    }

    fn apply_profile(&mut self, profile: &OperatorProfile, skip_reset: bool) -> anyhow::Result<()> {
        if !skip_reset {
            self.reset_modem().context("modem reset")?;
        }
        self.at
            .command(&profile.network_mode, 2000)?
            .require("network mode")?;
        self.at
            .command(&profile.cat_mode, 2000)?
            .require("CAT-M mode")?;
        self.at
            .command(&format!("AT+CBANDCFG=\"CAT-M\",{}", profile.bands), 5000)?
            .require("band configuration")?;
        self.at
            .command(&format!("AT+COPS=1,2,\"{}\"", profile.plmn), 120_000)?
            .require("operator lock")?;
        self.at
            .command(&format!("AT+CGDCONT=1,\"IP\",\"{}\"", profile.apn), 2000)?
            .require("APN")?;
        Ok(())
    }

    pub fn attach_network(&mut self) -> anyhow::Result<()> {
        self.at
            .command("AT+CGATT=1", 75_000)?
            .require("network attach")?;
        Ok(())
    }

    pub fn activate_pdp(&mut self) -> anyhow::Result<()> {
        let reply = self.at.command("AT+CNACT=0,1", 10_000)?;
        match reply.outcome {
            AtOutcome::Ok => {
                self.health.mark_ok();
                Ok(())
            }
            AtOutcome::Timeout => {
                self.health.record_timeout("pdp_activate");
                anyhow::bail!("PDP activation timed out")
            }
            AtOutcome::Error => anyhow::bail!("PDP activation rejected: {}", reply.text.trim()),
        }
    }

    pub fn deactivate_pdp(&mut self) -> anyhow::Result<()> {
        self.at
            .command("AT+CNACT=0,0", 5000)?
            .require("PDP deactivation")?;
        Ok(())
    }

    /// Best effort: up to three tries, failure is only logged
    pub fn detach_network(&mut self) -> bool {
        for attempt in 1..=3 {
            match self.at.command("AT+CGATT=0", 15_000) {
                Ok(reply) if reply.is_ok() => return true,
                Ok(_) => warn!("Detach attempt {}/3 failed", attempt),
                Err(e) => warn!("Detach attempt {}/3 failed: {}", attempt, e),
            }
            if attempt < 3 {
                self.at.delay_ms(2000);
            }
        }
        warn!("Network detach failed, continuing");
        false
    }

    pub fn network_info(&mut self) -> anyhow::Result<CellInfo> {
        let reply = self.at.command("AT+CPSI?", 3000)?.require("AT+CPSI?")?;
        response::parse_cpsi(&reply.text)
    }

    /// CSQ rssi index, 99 when unknown
    pub fn signal_csq(&mut self) -> u8 {
        match self.at.command("AT+CSQ", 2000) {
            Ok(reply) if reply.is_ok() => response::parse_csq(&reply.text).unwrap_or(99),
            _ => 99,
        }
    }

    /// Raw `+COPS=?` listing (slow: up to three minutes)
    pub fn scan_networks(&mut self) -> anyhow::Result<Vec<String>> {
        let reply = self
            .at
            .command("AT+COPS=?", 180_000)?
            .require("network scan")?;
        Ok(response::lines(&reply.text)
            .filter(|l| l.starts_with("+COPS:"))
            .map(str::to_string)
            .collect())
    }

    /// Open the single TCP socket, closing any leftover one first
    pub fn open_tcp(&mut self, host: &str, port: u16) -> anyhow::Result<()> {
        for attempt in 1..=3 {
            if !self.ensure_budget("tcp_open") {
                anyhow::bail!("no communication budget left to open socket");
            }
            if let Err(e) = self.at.command("AT+CACLOSE=0", 2000) {
                debug!("CACLOSE before open: {}", e);
            }

            let cmd = format!("AT+CAOPEN={},0,\"TCP\",\"{}\",{}", SOCKET_CID, host, port);
            let reply = self.at.command_expect(&cmd, &["+CAOPEN:"], 75_000)?;
            match reply.outcome {
                AtOutcome::Ok => match response::parse_caopen(&reply.text, SOCKET_CID) {
                    Ok(0) => {
                        info!("Socket open to {}:{}", host, port);
                        self.socket_open = true;
                        self.health.mark_ok();
                        return Ok(());
                    }
                    Ok(code) => warn!("CAOPEN attempt {}/3 returned {}", attempt, code),
                    Err(e) => warn!("CAOPEN attempt {}/3: {}", attempt, e),
                },
                AtOutcome::Error => warn!("CAOPEN attempt {}/3 rejected", attempt),
                AtOutcome::Timeout => {
                    warn!("CAOPEN attempt {}/3 timed out", attempt);
                    self.health.record_timeout("tcp_open");
                    if self.should_abort_cycle("tcp_open") {
                        anyhow::bail!("modem unhealthy while opening socket");
                    }
                }
            }
            if attempt < 3 {
                self.at.delay_ms(2000);
            }
        }
        anyhow::bail!("could not open socket to {}:{}", host, port)
    }

    pub fn close_tcp(&mut self) -> anyhow::Result<()> {
        self.socket_open = false;
        self.at
            .command("AT+CACLOSE=0", 10_000)?
            .require("socket close")?;
        Ok(())
    }

    pub fn is_tcp_connected(&mut self) -> bool {
        match self.at.command("AT+CASTATE?", 3000) {
            Ok(reply) if reply.is_ok() => response::socket_connected(&reply.text, SOCKET_CID),
            _ => false,
        }
    }

    /// Write one payload through the open socket and wait for confirmation
    pub fn send_tcp(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if data.is_empty() {
            anyhow::bail!("refusing to send an empty payload");
        }
        let data = if data.len() > MAX_TCP_PAYLOAD {
            warn!(
                "Payload of {} bytes exceeds {}, truncating",
                data.len(),
                MAX_TCP_PAYLOAD
            );
            &data[..MAX_TCP_PAYLOAD]
        } else {
            data
        };
        if !self.ensure_budget("tcp_send") {
            anyhow::bail!("no communication budget left to send");
        }

        self.data_indicated = false;
        let cmd = format!("AT+CASEND={},{}", SOCKET_CID, data.len());
        let prompt = self.at.command_expect(&cmd, &[">"], 5000)?;
        match prompt.outcome {
            AtOutcome::Ok => {}
            AtOutcome::Timeout => {
                self.health.record_timeout("tcp_send_prompt");
                anyhow::bail!("no data prompt from modem");
            }
            AtOutcome::Error => anyhow::bail!("CASEND rejected: {}", prompt.text.trim()),
        }

        self.at.write_raw(data)?;
        let reply = self.at.wait_for(SEND_OK_TOKENS, SEND_ERROR_TOKENS, 10_000)?;
        match reply.outcome {
            AtOutcome::Ok => {
                self.data_indicated = reply.text.contains("+CADATAIND: 0");
                self.health.mark_ok();
                debug!("Sent {} bytes", data.len());
                Ok(())
            }
            AtOutcome::Timeout => {
                self.health.record_timeout("tcp_send");
                anyhow::bail!("send confirmation timed out")
            }
            AtOutcome::Error => anyhow::bail!("send failed: {}", reply.text.trim()),
        }
    }

    /// Wait for the server's reply on the socket and check it contains `ack`
    pub fn await_server_ack(&mut self, ack: &str, timeout_ms: u64) -> anyhow::Result<()> {
        if !self.data_indicated {
            let reply = self.at.wait_for(&["+CADATAIND: 0"], ERROR_TOKENS, timeout_ms)?;
            reply.require("server reply")?;
        }
        self.data_indicated = false;
        let reply = self
            .at
            .command(&format!("AT+CARECV={},64", SOCKET_CID), 5000)?
            .require("AT+CARECV")?;
        let data = response::parse_carecv(&reply.text)?;
        if data.contains(ack) {
            Ok(())
        } else {
            anyhow::bail!("server did not acknowledge (got {:?})", data)
        }
    }

    /// Consult the health monitor; runs the deep recovery when it asks for it
    pub fn should_abort_cycle(&mut self, tag: &str) -> bool {
        match self.health.verdict(tag) {
            HealthVerdict::Continue => false,
            HealthVerdict::Abort => true,
            HealthVerdict::AttemptRecovery => {
                warn!("Zombie modem confirmed at {}, attempting deep recovery", tag);
                let ok = self.deep_recovery();
                self.health.recovery_finished(ok);
                !ok
            }
        }
    }

    /// Drop PDP, cycle the RF front end, bring it back
    fn deep_recovery(&mut self) -> bool {
        if !self.ensure_budget("deep_recovery") {
            return false;
        }
        let mut ok = true;

        if self.socket_open {
            ok &= self.close_tcp().is_ok();
            self.at.delay_ms(200);
        }
        for (cmd, what) in [("AT+CNACT=0,0", "PDP deactivation"), ("AT+CFUN=0", "RF off")] {
            let done = matches!(self.at.command(cmd, 10_000), Ok(ref r) if r.is_ok());
            if !done {
                warn!("Deep recovery: {} failed", what);
            }
            ok &= done;
        }
        self.at.delay_ms(1500);
        let rf_on = matches!(self.at.command("AT+CFUN=1", 10_000), Ok(ref r) if r.is_ok());
        if !rf_on {
            warn!("Deep recovery: RF on failed");
        }
        ok && rf_on
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::health::HealthState;
    use crate::modem::mock::MockModem;
    use crate::operator::profile::default_profiles;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn transport(modem: MockModem) -> CellularTransport<MockModem> {
        CellularTransport::new(modem, ModemConfig::default())
    }

    #[test]
    fn test_power_on_already_alive() {
        let mut t = transport(MockModem::sim7080());
        t.power_on().unwrap();
        assert!(t.io().pwrkey_pulses().is_empty());
    }

    #[test]
    fn test_power_on_from_off() {
        let mut modem = MockModem::sim7080();
        modem.set_powered(false);
        let mut t = transport(modem);
        t.power_on().unwrap();
        assert!(t.io().is_powered());
        assert_eq!(t.io().pwrkey_pulses().len(), 1);
        assert_eq!(t.io().count("AT+CPSMS=0"), 1);
    }

    #[test]
    fn test_power_on_forced_reset_fallback() {
        let mut modem = MockModem::sim7080();
        modem.set_powered(false);
        modem.set_pwrkey_responsive(false);
        let mut t = transport(modem);
        t.power_on().unwrap();
        let pulses = t.io().pwrkey_pulses().to_vec();
        assert_eq!(pulses.len(), 4);
        assert_eq!(pulses[3], ModemConfig::default().forced_reset_ms);
    }

    #[test]
    fn test_forced_reset_once_per_boot() {
        let mut modem = MockModem::sim7080();
        modem.set_zombie(true);
        let mut t = transport(modem);
        assert!(t.power_on().is_err());
        let after_first = t.io().pwrkey_pulses().len();
        assert!(t.power_on().is_err());
        let long_pulses = t
            .io()
            .pwrkey_pulses()
            .iter()
            .filter(|&&p| p >= 12_000)
            .count();
        assert_eq!(long_pulses, 1);
        assert!(t.io().pwrkey_pulses().len() > after_first);
    }

    #[test]
    fn test_zombie_needs_hard_power_cycle() {
        let mut modem = MockModem::sim7080();
        modem.set_zombie(true);
        let config = ModemConfig {
            hard_power_cycle: true,
            ..ModemConfig::default()
        };
        let mut t = CellularTransport::new(modem, config);
        t.power_on().unwrap();
        assert_eq!(t.io().supply_cycles(), 1);
        assert!(t.is_alive());
    }

    #[test]
    fn test_power_off_clean() {
        let mut t = transport(MockModem::sim7080());
        t.power_off().unwrap();
        assert!(!t.io().is_powered());
        assert_eq!(t.io().count("AT+CPOWD=1"), 1);
        assert!(t.io().pwrkey_pulses().is_empty());
    }

    #[test]
    fn test_power_off_falls_back_to_pwrkey() {
        let mut modem = MockModem::sim7080();
        modem.reply("AT+CPOWD=1", "\r\nOK\r\n");
        let mut t = transport(modem);
        t.power_off().unwrap();
        assert!(!t.io().is_powered());
        assert_eq!(t.io().pwrkey_pulses(), &[ModemConfig::default().pwrkey_off_ms]);
    }

    #[test]
    fn test_configure_operator_sequence() {
        let profile = &default_profiles()[0];
        let mut t = transport(MockModem::sim7080());
        t.configure_operator(profile, true).unwrap();
        let sent = t.io().sent().to_vec();
        assert_eq!(
            sent,
            vec![
                "AT+CNMP=38".to_string(),
                "AT+CMNB=1".to_string(),
                "AT+CBANDCFG=\"CAT-M\",1,2,3,4,5,8,12,13,18,19,20,26,28".to_string(),
                "AT+COPS=1,2,\"334020\"".to_string(),
                "AT+CGDCONT=1,\"IP\",\"em\"".to_string(),
            ]
        );
    }

    #[test]
    fn test_configure_failure_runs_callback() {
        let profile = &default_profiles()[3];
        let mut modem = MockModem::sim7080();
        modem.reply("AT+COPS=1,2", "\r\n+CME ERROR: 30\r\n");
        let mut t = transport(modem);

        let invalid = Rc::new(RefCell::new(Vec::new()));
        let seen = invalid.clone();
        t.set_operator_invalid_callback(Box::new(move |p: &OperatorProfile| seen.borrow_mut().push(p.plmn.clone())));

        assert!(t.configure_operator(profile, true).is_err());
        assert_eq!(*invalid.borrow(), vec!["334030".to_string()]);
        assert_eq!(t.io().count("AT+CGDCONT"), 0);
    }

    #[test]
    fn test_configure_with_reset_waits_for_sim() {
        let mut modem = MockModem::sim7080();
        modem.queue("AT+CPIN?", "\r\n+CPIN: SIM PIN\r\n\r\nOK\r\n");
        let mut t = transport(modem);
        t.configure_operator(&default_profiles()[1], false).unwrap();
        assert_eq!(t.io().count("AT+CFUN=1,1"), 1);
        assert_eq!(t.io().count("AT+CPIN?"), 2);
    }

    #[test]
    fn test_get_iccid() {
        let mut t = transport(MockModem::sim7080());
        assert_eq!(t.get_iccid().unwrap(), "89520201234567890123");
    }

    #[test]
    fn test_detach_is_best_effort() {
        let mut modem = MockModem::sim7080();
        modem.reply("AT+CGATT=0", "\r\nERROR\r\n");
        let mut t = transport(modem);
        assert!(!t.detach_network());
        assert_eq!(t.io().count("AT+CGATT=0"), 3);
    }

    #[test]
    fn test_open_tcp_retries() {
        let mut modem = MockModem::sim7080();
        modem.queue("AT+CAOPEN=", "\r\n+CAOPEN: 0,27\r\n\r\nOK\r\n");
        modem.queue("AT+CAOPEN=", "\r\nERROR\r\n");
        let mut t = transport(modem);
        t.begin_comm_cycle();
        t.open_tcp("telemetry.example.net", 12607).unwrap();
        assert_eq!(t.io().count("AT+CAOPEN=0,0,\"TCP\",\"telemetry.example.net\",12607"), 3);
        assert_eq!(t.io().count("AT+CACLOSE=0"), 3);
        assert!(t.is_tcp_connected());
    }

    #[test]
    fn test_open_tcp_gives_up_after_three() {
        let mut modem = MockModem::sim7080();
        modem.reply("AT+CAOPEN=", "\r\n+CAOPEN: 0,27\r\n\r\nOK\r\n");
        let mut t = transport(modem);
        t.begin_comm_cycle();
        assert!(t.open_tcp("telemetry.example.net", 12607).is_err());
        assert_eq!(t.io().count("AT+CAOPEN="), 3);
    }

    #[test]
    fn test_open_and_send_with_chunked_uart() {
        let mut modem = MockModem::sim7080();
        modem.set_read_chunk(Some(12));
        let mut t = transport(modem);
        t.begin_comm_cycle();
        t.open_tcp("h", 1).unwrap();
        assert_eq!(t.io().count("AT+CAOPEN="), 1);
        t.send_tcp(b"line\n").unwrap();
        assert_eq!(t.io().payloads(), &[b"line\n".to_vec()]);
    }

    #[test]
    fn test_send_tcp_truncates_payload() {
        let mut t = transport(MockModem::sim7080());
        t.begin_comm_cycle();
        t.send_tcp(&vec![b'A'; 2000]).unwrap();
        assert_eq!(t.io().count("AT+CASEND=0,1460"), 1);
        assert_eq!(t.io().payloads()[0].len(), MAX_TCP_PAYLOAD);
    }

    #[test]
    fn test_send_tcp_rejects_empty() {
        let mut t = transport(MockModem::sim7080());
        assert!(t.send_tcp(&[]).is_err());
        assert!(t.io().sent().is_empty());
    }

    #[test]
    fn test_send_tcp_failure_token() {
        let mut modem = MockModem::sim7080();
        modem.reply(mock::DATA_KEY, "\r\nSEND FAIL\r\n");
        let mut t = transport(modem);
        t.begin_comm_cycle();
        assert!(t.send_tcp(b"abc").is_err());
        assert_eq!(t.io().payloads(), &[b"abc".to_vec()]);
    }

    #[test]
    fn test_server_ack() {
        let mut modem = MockModem::sim7080();
        modem.reply(mock::DATA_KEY, "\r\nOK\r\n\r\n+CADATAIND: 0\r\n");
        let mut t = transport(modem);
        t.begin_comm_cycle();
        t.send_tcp(b"line").unwrap();
        t.await_server_ack("$", 10_000).unwrap();

        t.io_mut().reply("AT+CARECV=", "\r\n+CARECV: 1,?\r\n\r\nOK\r\n");
        t.send_tcp(b"line").unwrap();
        assert!(t.await_server_ack("$", 10_000).is_err());
    }

    #[test]
    fn test_pdp_timeouts_trigger_deep_recovery() {
        let mut modem = MockModem::sim7080();
        modem.reply("AT+CNACT=0,1", "");
        let mut t = transport(modem);
        t.begin_comm_cycle();
        for _ in 0..3 {
            assert!(t.activate_pdp().is_err());
        }
        assert_eq!(t.health().state(), HealthState::ZombieDetected);

        assert!(!t.should_abort_cycle("pdp"));
        assert_eq!(t.health().state(), HealthState::Trying);
        assert_eq!(t.io().count("AT+CFUN=0"), 1);
        assert_eq!(t.io().count("AT+CFUN=1"), 1);
    }

    #[test]
    fn test_failed_deep_recovery_aborts() {
        let mut modem = MockModem::sim7080();
        modem.reply("AT+CNACT=0,1", "");
        modem.reply("AT+CFUN=0", "\r\nERROR\r\n");
        let mut t = transport(modem);
        t.begin_comm_cycle();
        for _ in 0..3 {
            let _ = t.activate_pdp();
        }
        assert!(t.should_abort_cycle("pdp"));
        assert_eq!(t.health().state(), HealthState::Failed);
        assert!(t.should_abort_cycle("pdp"));
    }

    #[test]
    fn test_scan_networks() {
        let mut t = transport(MockModem::sim7080());
        let found = t.scan_networks().unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].contains("334020"));
    }
}
