//! AT command channel
//!
//! Every exchange is a synchronous call with a deadline: stale input is
//! dropped, the command is written, and the input is polled until a success
//! token, an error token, or the timeout. Tokens are matched against the
//! start of each complete response line; only prompt tokens such as the
//! `>` data prompt also match a trailing partial line.

use super::io::ModemIo;
use super::response;
use tracing::debug;

/// Default per-command timeout
pub const AT_TIMEOUT_MS: u64 = 1000;

/// Idle wait between polls of an empty UART
pub const POLL_INTERVAL_MS: u64 = 10;

pub const OK_TOKENS: &[&str] = &["OK"];
pub const ERROR_TOKENS: &[&str] = &["ERROR", "+CME ERROR", "+CMS ERROR"];

/// Tokens the modem sends without a line terminator
pub const PROMPT_TOKENS: &[&str] = &[">"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtOutcome {
    Ok,
    Error,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct AtReply {
    pub outcome: AtOutcome,
    /// Everything received while waiting
    pub text: String,
}

impl AtReply {
    pub fn is_ok(&self) -> bool {
        self.outcome == AtOutcome::Ok
    }

    pub fn is_timeout(&self) -> bool {
        self.outcome == AtOutcome::Timeout
    }

    /// Turn a non-OK reply into an error naming the step
    pub fn require(self, what: &str) -> anyhow::Result<AtReply> {
        match self.outcome {
            AtOutcome::Ok => Ok(self),
            AtOutcome::Error => Err(anyhow::anyhow!(
                "{} failed: {}",
                what,
                self.text.trim()
            )),
            AtOutcome::Timeout => Err(anyhow::anyhow!("{} timed out", what)),
        }
    }
}

fn matches_any(text: &str, tokens: &[&str]) -> bool {
    let (complete, partial) = match text.rfind('\n') {
        Some(end) => (&text[..end], &text[end + 1..]),
        None => ("", text),
    };
    if response::lines(complete).any(|line| tokens.iter().any(|t| line.starts_with(t))) {
        return true;
    }
    let partial = partial.trim();
    tokens
        .iter()
        .any(|t| PROMPT_TOKENS.contains(t) && partial.starts_with(t))
}

pub struct AtChannel<M: ModemIo> {
    io: M,
}

impl<M: ModemIo> AtChannel<M> {
    pub fn new(io: M) -> Self {
        Self { io }
    }

    pub fn io(&self) -> &M {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut M {
        &mut self.io
    }

    pub fn now_ms(&self) -> u64 {
        self.io.now_ms()
    }

    pub fn delay_ms(&mut self, ms: u64) {
        self.io.delay_ms(ms);
    }

    /// Drop anything sitting in the receive path
    pub fn clear_input(&mut self) -> anyhow::Result<()> {
        let mut buf = [0u8; 256];
        for _ in 0..64 {
            let n = self.io.read(&mut buf)?;
            if n == 0 {
                break;
            }
            debug!("Discarded {} stale byte(s)", n);
        }
        Ok(())
    }

    pub fn write_line(&mut self, cmd: &str) -> anyhow::Result<()> {
        debug!("AT> {}", cmd);
        self.io.write(cmd.as_bytes())?;
        self.io.write(b"\r\n")
    }

    pub fn write_raw(&mut self, data: &[u8]) -> anyhow::Result<()> {
        debug!("AT> <{} data bytes>", data.len());
        self.io.write(data)
    }

    /// Poll until a line starts with one of `ok` or `err`, or `timeout_ms`
    /// passes. Error tokens win when both appear.
    pub fn wait_for(&mut self, ok: &[&str], err: &[&str], timeout_ms: u64) -> anyhow::Result<AtReply> {
        let start = self.io.now_ms();
        let mut text = String::new();
        let mut buf = [0u8; 256];

        loop {
            let n = self.io.read(&mut buf)?;
            if n > 0 {
                text.push_str(&String::from_utf8_lossy(&buf[..n]));
                if matches_any(&text, err) {
                    debug!("AT< {:?}", text);
                    return Ok(AtReply { outcome: AtOutcome::Error, text });
                }
                if matches_any(&text, ok) {
                    debug!("AT< {:?}", text);
                    return Ok(AtReply { outcome: AtOutcome::Ok, text });
                }
            }
            if self.io.now_ms().saturating_sub(start) >= timeout_ms {
                debug!("AT< timeout after {} ms: {:?}", timeout_ms, text);
                return Ok(AtReply { outcome: AtOutcome::Timeout, text });
            }
            if n == 0 {
                self.io.delay_ms(POLL_INTERVAL_MS);
            }
        }
    }

    /// Send `cmd` and wait for `OK` / `ERROR`
    pub fn command(&mut self, cmd: &str, timeout_ms: u64) -> anyhow::Result<AtReply> {
        self.command_expect(cmd, OK_TOKENS, timeout_ms)
    }

    /// Send `cmd` and wait for any of `tokens` instead of plain `OK`
    pub fn command_expect(&mut self, cmd: &str, tokens: &[&str], timeout_ms: u64) -> anyhow::Result<AtReply> {
        self.clear_input()?;
        self.write_line(cmd)?;
        self.wait_for(tokens, ERROR_TOKENS, timeout_ms)
    }

    /// `AT` → `OK` liveness check with a few retries
    pub fn is_alive(&mut self, attempts: u32, timeout_ms: u64, gap_ms: u64) -> bool {
        for attempt in 0..attempts {
            match self.command("AT", timeout_ms) {
                Ok(reply) if reply.is_ok() => return true,
                Ok(_) => {}
                Err(e) => debug!("Liveness check I/O error: {}", e),
            }
            if attempt + 1 < attempts {
                self.io.delay_ms(gap_ms);
            }
        }
        false
    }
}
