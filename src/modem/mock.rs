//! Scripted in-memory modem for tests
//!
//! Replies are looked up by the longest registered command prefix; one-shot
//! queued replies take precedence over the standing ones. The clock is
//! virtual and only moves on `delay_ms`, so long AT timeouts cost nothing.

use super::io::ModemIo;
use std::collections::{HashMap, VecDeque};

/// Key for the reply sent after a `+CASEND` payload is fully written
pub const DATA_KEY: &str = "DATA";

pub const CPSI_GOOD: &str = "\r\n+CPSI: LTE CAT-M1,Online,334-020,0x1A2B,123456,99,EUTRAN-BAND2,1000,3,3,-10,-95,-65,12\r\n\r\nOK\r\n";

pub struct MockModem {
    powered: bool,
    zombie: bool,
    pwrkey_responsive: bool,
    clock_ms: u64,
    rx: VecDeque<u8>,
    line: Vec<u8>,
    sent: Vec<String>,
    payloads: Vec<Vec<u8>>,
    pending_payload: Option<(usize, Vec<u8>)>,
    standing: HashMap<String, String>,
    queued: HashMap<String, VecDeque<String>>,
    pwrkey_asserted_at: Option<u64>,
    pwrkey_pulses: Vec<u64>,
    supply_cycles: u32,
    read_chunk: Option<usize>,
}

impl MockModem {
    /// Powered, healthy SIM7080-style modem that answers the usual dialect
    pub fn sim7080() -> Self {
        let mut modem = Self {
            powered: true,
            zombie: false,
            pwrkey_responsive: true,
            clock_ms: 0,
            rx: VecDeque::new(),
            line: Vec::new(),
            sent: Vec::new(),
            payloads: Vec::new(),
            pending_payload: None,
            standing: HashMap::new(),
            queued: HashMap::new(),
            pwrkey_asserted_at: None,
            pwrkey_pulses: Vec::new(),
            supply_cycles: 0,
            read_chunk: None,
        };
        for (prefix, text) in [
            ("AT", "\r\nOK\r\n"),
            ("AT+CCID", "\r\n+CCID: 89520201234567890123\r\n\r\nOK\r\n"),
            ("AT+CPIN?", "\r\n+CPIN: READY\r\n\r\nOK\r\n"),
            ("AT+CPSI?", CPSI_GOOD),
            ("AT+CSQ", "\r\n+CSQ: 20,99\r\n\r\nOK\r\n"),
            ("AT+CAOPEN=", "\r\n+CAOPEN: 0,0\r\n\r\nOK\r\n"),
            ("AT+CASTATE?", "\r\n+CASTATE: 0,1\r\n\r\nOK\r\n"),
            ("AT+CASEND=", "\r\n> "),
            (DATA_KEY, "\r\nOK\r\n"),
            ("AT+CARECV=", "\r\n+CARECV: 1,$\r\n\r\nOK\r\n"),
            ("AT+CPOWD=1", "\r\nOK\r\n\r\nNORMAL POWER DOWN\r\n"),
            (
                "AT+COPS=?",
                "\r\n+COPS: (1,\"TELCEL\",\"TELCEL\",\"334020\",9),,(0-4),(0-2)\r\n\r\nOK\r\n",
            ),
        ] {
            modem.reply(prefix, text);
        }
        modem
    }

    /// Standing reply for commands starting with `prefix` ("" = silence)
    pub fn reply(&mut self, prefix: &str, text: &str) {
        self.standing.insert(prefix.to_string(), text.to_string());
    }

    /// One-shot reply, used before the standing one
    pub fn queue(&mut self, prefix: &str, text: &str) {
        self.queued
            .entry(prefix.to_string())
            .or_default()
            .push_back(text.to_string());
    }

    /// Put bytes straight into the receive path
    pub fn inject(&mut self, text: &str) {
        self.rx.extend(text.as_bytes());
    }

    /// Cap the bytes returned per `read`, like a UART delivering in bursts
    pub fn set_read_chunk(&mut self, chunk: Option<usize>) {
        self.read_chunk = chunk;
    }

    pub fn set_powered(&mut self, powered: bool) {
        self.powered = powered;
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    /// Zombie: powered but deaf until the supply rail is cycled
    pub fn set_zombie(&mut self, zombie: bool) {
        self.zombie = zombie;
    }

    /// When false, normal PWRKEY pulses are ignored (forced reset still works)
    pub fn set_pwrkey_responsive(&mut self, responsive: bool) {
        self.pwrkey_responsive = responsive;
    }

    pub fn sent(&self) -> &[String] {
        &self.sent
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.sent.iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn payloads(&self) -> &[Vec<u8>] {
        &self.payloads
    }

    pub fn pwrkey_pulses(&self) -> &[u64] {
        &self.pwrkey_pulses
    }

    pub fn supply_cycles(&self) -> u32 {
        self.supply_cycles
    }

    fn lookup(&mut self, cmd: &str) -> String {
        let queued_key = longest_prefix(
            cmd,
            self.queued
                .iter()
                .filter(|(_, q)| !q.is_empty())
                .map(|(k, _)| k),
        );
        if let Some(key) = queued_key {
            if let Some(text) = self.queued.get_mut(&key).and_then(|q| q.pop_front()) {
                return text;
            }
        }

        match longest_prefix(cmd, self.standing.keys()) {
            Some(key) => self.standing[&key].clone(),
            None => "\r\nERROR\r\n".to_string(),
        }
    }

    fn handle_command(&mut self, cmd: String) {
        self.sent.push(cmd.clone());
        if !self.powered || self.zombie {
            return;
        }

        let reply = self.lookup(&cmd);
        self.rx.extend(reply.as_bytes());

        if cmd.starts_with("AT+CPOWD") && reply.contains("NORMAL POWER DOWN") {
            self.powered = false;
        }
        if let Some(len) = cmd.strip_prefix("AT+CASEND=0,") {
            if reply.contains('>') {
                if let Ok(len) = len.trim().parse::<usize>() {
                    self.pending_payload = Some((len, Vec::new()));
                }
            }
        }
    }

    fn take_payload_byte(&mut self, byte: u8) -> bool {
        let Some((len, collected)) = self.pending_payload.as_mut() else {
            return false;
        };
        // tail of the command's CRLF
        if collected.is_empty() && byte == b'\n' {
            return true;
        }
        collected.push(byte);
        if collected.len() >= *len {
            let payload = std::mem::take(collected);
            self.pending_payload = None;
            self.payloads.push(payload);
            let reply = self.lookup(DATA_KEY);
            self.rx.extend(reply.as_bytes());
        }
        true
    }
}

fn longest_prefix<'a>(cmd: &str, keys: impl Iterator<Item = &'a String>) -> Option<String> {
    keys.filter(|k| cmd.starts_with(k.as_str()))
        .max_by_key(|k| k.len())
        .cloned()
}

impl ModemIo for MockModem {
    fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        for &byte in data {
            if self.take_payload_byte(byte) {
                continue;
            }
            match byte {
                b'\r' | b'\n' => {
                    if !self.line.is_empty() {
                        let cmd = String::from_utf8_lossy(&self.line).to_string();
                        self.line.clear();
                        self.handle_command(cmd);
                    }
                }
                _ => self.line.push(byte),
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let limit = self.read_chunk.unwrap_or(usize::MAX).max(1);
        let n = buf.len().min(self.rx.len()).min(limit);
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn set_power_key(&mut self, asserted: bool) -> anyhow::Result<()> {
        if asserted {
            self.pwrkey_asserted_at = Some(self.clock_ms);
            return Ok(());
        }
        if let Some(since) = self.pwrkey_asserted_at.take() {
            let pulse = self.clock_ms - since;
            self.pwrkey_pulses.push(pulse);
            if pulse >= 12_000 {
                // forced reset reboots the firmware but cannot clear a latch-up
                self.powered = true;
            } else if pulse >= 1_000 && self.pwrkey_responsive {
                self.powered = !self.powered;
            }
        }
        Ok(())
    }

    fn set_supply(&mut self, on: bool) -> anyhow::Result<()> {
        if !on {
            self.powered = false;
            self.zombie = false;
            self.supply_cycles += 1;
        }
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        self.clock_ms
    }

    fn delay_ms(&mut self, ms: u64) {
        self.clock_ms += ms;
    }
}
