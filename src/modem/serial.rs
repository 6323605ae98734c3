//! Serial-port modem backend
//!
//! The modem UART is a serial device; PWRKEY is wired to DTR and the
//! optional supply-enable switch to RTS, as on the usual USB carrier boards.

use super::io::ModemIo;
use anyhow::Context;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::info;

/// Read timeout for one poll of the port
const READ_POLL: Duration = Duration::from_millis(20);

pub struct SerialModem {
    port: Box<dyn SerialPort>,
    epoch: Instant,
    has_supply_switch: bool,
}

impl SerialModem {
    pub fn open(path: &str, baud: u32, has_supply_switch: bool) -> anyhow::Result<Self> {
        let port = serialport::new(path, baud)
            .timeout(READ_POLL)
            .open()
            .with_context(|| format!("failed to open modem port {}", path))?;
        info!("Modem UART open on {} @ {} baud", path, baud);
        Ok(Self {
            port,
            epoch: Instant::now(),
            has_supply_switch,
        })
    }
}

impl ModemIo for SerialModem {
    fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.port.write_all(data).context("modem UART write failed")?;
        self.port.flush().context("modem UART flush failed")?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e).context("modem UART read failed"),
        }
    }

    fn set_power_key(&mut self, asserted: bool) -> anyhow::Result<()> {
        self.port
            .write_data_terminal_ready(asserted)
            .context("failed to drive PWRKEY (DTR)")
    }

    fn set_supply(&mut self, on: bool) -> anyhow::Result<()> {
        if !self.has_supply_switch {
            anyhow::bail!("board has no switchable modem supply");
        }
        self.port
            .write_request_to_send(on)
            .context("failed to drive supply enable (RTS)")
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn delay_ms(&mut self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}
