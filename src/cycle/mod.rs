//! Wake-cycle state machine
//!
//! One process run is one wake cycle: sense, locate, identify, encode,
//! persist, transmit, compact, then park the retained state and hand a
//! [`CycleOutcome`] back to the caller. The next cycle starts from a fresh
//! process that reads the persisted state again.

pub mod battery;
pub mod peripherals;
pub mod provision;

use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferedLine, PersistentBuffer};
use crate::codec::{encode_line, Location, PayloadCipher, Plaintext, Reading, VAR_COUNT};
use crate::config::Config;
use crate::modem::io::ModemIo;
use crate::modem::CellularTransport;
use crate::operator::OperatorSelector;
use crate::state::{keys, RetainedState, StateStore, WakeReason};
use self::battery::{filter_voltage, BatteryGate};
use self::peripherals::Peripherals;

const US_PER_MINUTE: u64 = 60_000_000;
const US_PER_HOUR: u64 = 60 * US_PER_MINUTE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Boot,
    Provision,
    ReadSensors,
    Gps,
    GetIdentity,
    BuildFrame,
    BufferWrite,
    SendTelemetry,
    CompactBuffer,
    Sleep,
    Error,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleState::Boot => "Boot",
            CycleState::Provision => "Provision",
            CycleState::ReadSensors => "ReadSensors",
            CycleState::Gps => "Gps",
            CycleState::GetIdentity => "GetIdentity",
            CycleState::BuildFrame => "BuildFrame",
            CycleState::BufferWrite => "BufferWrite",
            CycleState::SendTelemetry => "SendTelemetry",
            CycleState::CompactBuffer => "CompactBuffer",
            CycleState::Sleep => "Sleep",
            CycleState::Error => "Error",
        };
        write!(f, "{}", name)
    }
}

/// How the cycle ended and what the caller should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Retained state parked for a deep-sleep wake after this long
    Sleep(Duration),
    /// Retained state parked for a clean restart
    Restart,
    /// Terminal error; nothing parked
    Halted,
}

enum Step {
    Next(CycleState),
    Done(CycleOutcome),
}

/// Counters logged at the end of the cycle
#[derive(Debug, Clone, Default)]
struct CycleReport {
    pending: usize,
    sent: usize,
    operator: Option<String>,
    csq: Option<u8>,
    battery_volts: Option<f64>,
}

pub struct CycleController<M: ModemIo> {
    config: Config,
    store: StateStore,
    wake: WakeReason,
    retained: RetainedState,
    transport: CellularTransport<M>,
    selector: OperatorSelector,
    peripherals: Peripherals,
    cipher: Box<dyn PayloadCipher>,
    buffer: Option<PersistentBuffer>,
    modem_allowed: bool,
    vars: [i32; VAR_COUNT],
    location: Option<Location>,
    iccid: String,
    line: Option<String>,
    report: CycleReport,
}

impl<M: ModemIo> CycleController<M> {
    pub fn new(
        config: Config,
        store: StateStore,
        wake: WakeReason,
        retained: RetainedState,
        modem: M,
        peripherals: Peripherals,
    ) -> Self {
        let mut transport = CellularTransport::new(modem, config.modem.clone());
        let selector = OperatorSelector::new(
            config.operators.clone(),
            store.nvs().clone(),
            config.recovery.skip_scan_cycles,
        );
        selector.install_invalid_hook(&mut transport);

        Self {
            config,
            store,
            wake,
            retained,
            transport,
            selector,
            peripherals,
            cipher: Box::new(Plaintext),
            buffer: None,
            modem_allowed: true,
            vars: [0; VAR_COUNT],
            location: None,
            iccid: String::new(),
            line: None,
            report: CycleReport::default(),
        }
    }

    pub fn with_cipher(mut self, cipher: Box<dyn PayloadCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn transport(&self) -> &CellularTransport<M> {
        &self.transport
    }

    pub fn retained(&self) -> &RetainedState {
        &self.retained
    }

    /// Run the cycle from `Boot` to a parked outcome
    pub fn run(&mut self) -> CycleOutcome {
        let mut state = CycleState::Boot;
        info!("Cycle start ({} wake, boot #{})", self.wake, self.retained.boot_count);

        loop {
            debug!("State: {}", state);
            let step = match state {
                CycleState::Boot => self.boot(),
                CycleState::Provision => self.provision(),
                CycleState::ReadSensors => self.read_sensors(),
                CycleState::Gps => self.gps(),
                CycleState::GetIdentity => self.get_identity(),
                CycleState::BuildFrame => self.build_frame(),
                CycleState::BufferWrite => self.buffer_write(),
                CycleState::SendTelemetry => self.send_telemetry(),
                CycleState::CompactBuffer => self.compact_buffer(),
                CycleState::Sleep => self.sleep(),
                CycleState::Error => {
                    error!("Cycle halted in error state; waiting for external reset");
                    return CycleOutcome::Halted;
                }
            };

            state = match step {
                Ok(Step::Next(next)) => next,
                Ok(Step::Done(outcome)) => return outcome,
                Err(e) => {
                    error!("{} failed: {:#}", state, e);
                    CycleState::Error
                }
            };
        }
    }

    fn buffer(&self) -> anyhow::Result<&PersistentBuffer> {
        self.buffer
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("buffer not mounted"))
    }

    fn boot(&mut self) -> anyhow::Result<Step> {
        let node = &self.config.node;
        self.buffer = Some(PersistentBuffer::open(
            self.config.buffer_path(),
            &node.processed_marker,
            node.max_unprocessed,
        )?);

        if self.config.capabilities.modem_backoff {
            if let Some(outcome) = self.evaluate_modem_backoff()? {
                return Ok(Step::Done(outcome));
            }
        }

        if self.wake.is_cold_boot() && self.config.capabilities.provisioning {
            Ok(Step::Next(CycleState::Provision))
        } else {
            Ok(Step::Next(CycleState::ReadSensors))
        }
    }

    /// Decide whether the modem may be used this cycle. Returns an outcome
    /// when the failure threshold calls for a restart.
    fn evaluate_modem_backoff(&mut self) -> anyhow::Result<Option<CycleOutcome>> {
        let nvs = self.store.nvs().clone();
        let recovery = &self.config.recovery;

        if nvs.get_or(keys::MODEM_POST_RESTART, 0u8) > 0 {
            nvs.put(keys::MODEM_POST_RESTART, &0u8)?;
            nvs.put(keys::MODEM_CONSEC_FAILS, &0u32)?;
            info!("Post-restart recovery, modem backoff armed");
        }

        let skip: u32 = nvs.get_or(keys::MODEM_SKIP_CYCLES, 0);
        if skip > 0 {
            nvs.put(keys::MODEM_SKIP_CYCLES, &(skip - 1))?;
            warn!("Modem in backoff, {} cycle(s) left after this one", skip - 1);
            self.modem_allowed = false;
            return Ok(None);
        }

        let fails: u32 = nvs.get_or(keys::MODEM_CONSEC_FAILS, 0);
        if fails >= recovery.modem_fail_threshold {
            error!(
                "Modem failed {} consecutive cycles, restarting with {} cycle(s) of backoff",
                fails, recovery.skip_cycles_after_restart
            );
            nvs.put(keys::MODEM_SKIP_CYCLES, &recovery.skip_cycles_after_restart)?;
            nvs.put(keys::MODEM_POST_RESTART, &1u8)?;
            nvs.put(keys::MODEM_CONSEC_FAILS, &0u32)?;
            self.store.park(&mut self.retained, WakeReason::Restart)?;
            return Ok(Some(CycleOutcome::Restart));
        }
        Ok(None)
    }

    fn provision(&mut self) -> anyhow::Result<Step> {
        let dir = &self.config.node.state_dir;
        let request = dir.join(&self.config.node.provision_request);
        let export = dir.join(&self.config.node.provision_export);
        if let Err(e) = provision::export_if_requested(
            self.buffer()?,
            self.config.node.max_lines_to_read,
            &request,
            &export,
        ) {
            warn!("Buffer export failed: {:#}", e);
        }
        Ok(Step::Next(CycleState::ReadSensors))
    }

    fn read_sensors(&mut self) -> anyhow::Result<Step> {
        let sampling = &self.config.sampling;
        self.vars = peripherals::read_all(
            self.peripherals.sensors.as_mut(),
            sampling.discard,
            sampling.keep,
        );

        if self.wake.is_cold_boot() && self.config.capabilities.gps {
            info!("First cycle after {}: acquiring GPS", self.wake);
            return Ok(Step::Next(CycleState::Gps));
        }

        self.location = self.stored_location();
        match self.location {
            Some(loc) => info!("Reusing stored fix {:.6},{:.6} alt {:.0}", loc.lat, loc.lng, loc.alt),
            None => warn!("No stored GPS fix, sending zeros"),
        }
        Ok(Step::Next(CycleState::GetIdentity))
    }

    fn stored_location(&self) -> Option<Location> {
        let nvs = self.store.nvs();
        let lat = nvs.get::<f64>(keys::GPS_LAT).ok().flatten()?;
        let lng = nvs.get::<f64>(keys::GPS_LNG).ok().flatten()?;
        let alt = nvs.get::<f64>(keys::GPS_ALT).ok().flatten()?;
        Some(Location { lat, lng, alt })
    }

    fn gps(&mut self) -> anyhow::Result<Step> {
        let nvs = self.store.nvs().clone();
        let fix = match self.peripherals.gps.acquire() {
            Ok(fix) => fix,
            Err(e) => {
                warn!("GPS failed: {:#}", e);
                None
            }
        };

        match fix {
            Some(loc) => {
                nvs.put(keys::GPS_LAT, &loc.lat)?;
                nvs.put(keys::GPS_LNG, &loc.lng)?;
                nvs.put(keys::GPS_ALT, &loc.alt)?;
                info!("GPS fix {:.6},{:.6} alt {:.0} saved", loc.lat, loc.lng, loc.alt);
            }
            None => {
                for key in [keys::GPS_LAT, keys::GPS_LNG, keys::GPS_ALT] {
                    nvs.remove(key)?;
                }
                warn!("No GPS fix, sending zeros until next cold boot");
            }
        }
        self.location = fix;
        Ok(Step::Next(CycleState::GetIdentity))
    }

    fn get_identity(&mut self) -> anyhow::Result<Step> {
        self.iccid.clear();
        if !self.modem_allowed {
            info!("Modem in backoff, ICCID left empty");
            return Ok(Step::Next(CycleState::BuildFrame));
        }

        match self.transport.power_on() {
            Ok(()) => {
                match self.transport.get_iccid() {
                    Ok(iccid) => {
                        info!("ICCID {}", iccid);
                        self.iccid = iccid;
                    }
                    Err(e) => warn!("ICCID unavailable: {:#}", e),
                }
                if let Err(e) = self.transport.power_off() {
                    warn!("Modem power-off after ICCID failed: {:#}", e);
                }
            }
            Err(e) => warn!("Modem power-on for ICCID failed: {:#}", e),
        }
        Ok(Step::Next(CycleState::BuildFrame))
    }

    fn build_frame(&mut self) -> anyhow::Result<Step> {
        let reading = Reading {
            iccid: self.iccid.clone(),
            epoch: chrono::Utc::now().timestamp().max(0) as u64,
            location: self.location,
            vars: self.vars,
        };
        let line = encode_line(&reading, self.cipher.as_ref())?;
        info!("Frame for epoch {}: {}", reading.epoch, line);
        self.line = Some(line);
        Ok(Step::Next(CycleState::BufferWrite))
    }

    fn buffer_write(&mut self) -> anyhow::Result<Step> {
        let line = self
            .line
            .take()
            .ok_or_else(|| anyhow::anyhow!("no frame to buffer"))?;
        match self.buffer()?.store_line(&line) {
            Ok(()) => info!("Frame buffered"),
            Err(e) => error!("Could not buffer frame: {:#}", e),
        }

        if self.config.capabilities.battery_gate && self.battery_blocks_transmission() {
            info!("Transmission blocked by low battery, data kept for later");
            return Ok(Step::Next(CycleState::Sleep));
        }
        if !self.modem_allowed {
            return Ok(Step::Next(CycleState::CompactBuffer));
        }
        Ok(Step::Next(CycleState::SendTelemetry))
    }

    fn battery_blocks_transmission(&mut self) -> bool {
        let count = self.config.battery.filter_samples.max(2);
        let mut samples = Vec::with_capacity(count);
        for _ in 0..count {
            match self.peripherals.battery.read_volts() {
                Ok(v) => samples.push(v),
                Err(e) => warn!("Battery read failed: {:#}", e),
            }
        }
        let Some(volts) = filter_voltage(&samples) else {
            warn!("No usable battery reading, keeping previous gate state");
            return self.retained.battery.low;
        };
        self.report.battery_volts = Some(volts);
        BatteryGate::from_config(&self.config.battery).update(&mut self.retained.battery, volts)
    }

    fn send_telemetry(&mut self) -> anyhow::Result<Step> {
        let sent = match self.send_buffer() {
            Ok(sent) => sent,
            Err(e) => {
                warn!("Telemetry send failed: {:#}", e);
                0
            }
        };
        self.report.sent = sent;

        if self.config.capabilities.modem_backoff {
            let nvs = self.store.nvs();
            if sent > 0 {
                nvs.put(keys::MODEM_CONSEC_FAILS, &0u32)?;
            } else {
                let fails = nvs.get_or(keys::MODEM_CONSEC_FAILS, 0u32).saturating_add(1);
                nvs.put(keys::MODEM_CONSEC_FAILS, &fails)?;
                warn!("Consecutive failed send cycles: {}", fails);
            }
        }
        Ok(Step::Next(CycleState::CompactBuffer))
    }

    /// Power up, deliver pending lines in order, power down
    fn send_buffer(&mut self) -> anyhow::Result<usize> {
        let pending = self
            .buffer()?
            .read_unprocessed_lines(self.config.node.max_lines_to_read)?;
        self.report.pending = pending.len();
        if pending.is_empty() {
            info!("Nothing to send");
            return Ok(0);
        }

        self.transport.power_on()?;
        let result = self.deliver(&pending);
        if let Err(e) = self.transport.power_off() {
            warn!("Modem power-off after send failed: {:#}", e);
        }
        result
    }

    fn deliver(&mut self, pending: &[BufferedLine]) -> anyhow::Result<usize> {
        let index = self.selector.select(&mut self.transport)?;
        self.report.operator = Some(self.selector.profiles()[index].to_string());

        self.transport.begin_comm_cycle();
        let sent = match self.transmit(pending) {
            Ok(sent) => sent,
            Err(e) => {
                warn!("Transmission aborted: {:#}", e);
                0
            }
        };
        self.selector.record_outcome(index, sent > 0);
        info!("Sent {} of {} pending line(s)", sent, pending.len());
        Ok(sent)
    }

    fn transmit(&mut self, pending: &[BufferedLine]) -> anyhow::Result<usize> {
        if !self.transport.ensure_budget("attach") {
            anyhow::bail!("no budget left to attach");
        }
        self.transport.attach_network()?;
        self.transport.activate_pdp()?;
        self.report.csq = Some(self.transport.signal_csq());

        let server = self.config.server.clone();
        if let Err(e) = self.transport.open_tcp(&server.host, server.port) {
            if let Err(e) = self.transport.deactivate_pdp() {
                debug!("PDP teardown: {:#}", e);
            }
            return Err(e);
        }

        let mut sent = 0;
        for line in pending {
            if !self.transport.ensure_budget("send_line") || self.transport.should_abort_cycle("send_line") {
                warn!("Stopping send, {} line(s) left for next cycle", pending.len() - sent);
                break;
            }
            let payload = format!("{}\n", line.text);
            let confirmed = self.transport.send_tcp(payload.as_bytes()).and_then(|()| {
                if server.require_ack {
                    self.transport
                        .await_server_ack(&server.ack_token, server.ack_timeout_ms)
                } else {
                    Ok(())
                }
            });
            match confirmed {
                Ok(()) => {
                    sent += 1;
                    let marked = self
                        .buffer()
                        .and_then(|b| b.mark_line_as_processed(line.index));
                    if let Err(e) = marked {
                        error!(
                            "Line {} delivered but not marked, it will be resent: {:#}",
                            line.index + 1,
                            e
                        );
                        break;
                    }
                    info!("Line {} sent and marked", line.index + 1);
                }
                Err(e) => {
                    warn!("Line {} not confirmed, stopping: {:#}", line.index + 1, e);
                    break;
                }
            }
        }

        if let Err(e) = self.transport.close_tcp() {
            warn!("Socket close failed: {:#}", e);
        }
        if let Err(e) = self.transport.deactivate_pdp() {
            warn!("PDP deactivation failed: {:#}", e);
        }
        self.transport.detach_network();
        Ok(sent)
    }

    fn compact_buffer(&mut self) -> anyhow::Result<Step> {
        if let Err(e) = self.buffer()?.remove_processed_lines() {
            warn!("Buffer compaction failed: {:#}", e);
        }
        Ok(Step::Next(CycleState::Sleep))
    }

    fn sleep(&mut self) -> anyhow::Result<Step> {
        if self.modem_allowed {
            if let Err(e) = self.transport.power_off() {
                warn!("Modem power-off before sleep failed: {:#}", e);
            }
        }
        self.log_summary();

        let sleep_us = self.config.node.sleep_minutes * US_PER_MINUTE;
        self.retained.accum_sleep_us = self.retained.accum_sleep_us.saturating_add(sleep_us);
        let ceiling_us = self.config.recovery.restart_hours * US_PER_HOUR;

        if self.config.capabilities.preventive_restart && self.retained.accum_sleep_us >= ceiling_us {
            info!(
                "Accumulated sleep {} s reached {} h, preventive restart",
                self.retained.accum_sleep_us / 1_000_000,
                self.config.recovery.restart_hours
            );
            self.store.park(&mut self.retained, WakeReason::Restart)?;
            return Ok(Step::Done(CycleOutcome::Restart));
        }

        self.store.park(&mut self.retained, WakeReason::DeepSleep)?;
        let duration = Duration::from_micros(sleep_us);
        info!("Sleeping {} min", self.config.node.sleep_minutes);
        Ok(Step::Done(CycleOutcome::Sleep(duration)))
    }

    fn log_summary(&self) {
        let status = self.buffer().and_then(|b| b.status());
        info!(
            "Cycle summary: iccid={} sent={}/{} operator={} csq={} battery={} buffer={}",
            if self.iccid.is_empty() { "-" } else { self.iccid.as_str() },
            self.report.sent,
            self.report.pending,
            self.report.operator.as_deref().unwrap_or("-"),
            self.report.csq.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
            self.report
                .battery_volts
                .map(|v| format!("{:.2}V", v))
                .unwrap_or_else(|| "-".to_string()),
            match status {
                Ok(s) => format!("{} unsent/{} total", s.unprocessed, s.total),
                Err(e) => format!("unreadable ({})", e),
            }
        );
    }
}
