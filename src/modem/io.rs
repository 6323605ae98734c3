//! Board-level modem interface: UART bytes, PWRKEY and supply lines, and
//! the monotonic clock the AT engine measures its deadlines against.

pub trait ModemIo {
    /// Write raw bytes to the modem UART
    fn write(&mut self, data: &[u8]) -> anyhow::Result<()>;

    /// Read whatever arrived; returns 0 after a short poll if nothing did
    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize>;

    /// Drive the PWRKEY line (`true` = asserted)
    fn set_power_key(&mut self, asserted: bool) -> anyhow::Result<()>;

    /// Switch the modem supply rail; boards without one report an error
    fn set_supply(&mut self, on: bool) -> anyhow::Result<()> {
        let _ = on;
        anyhow::bail!("board has no switchable modem supply")
    }

    /// Milliseconds since an arbitrary fixed point
    fn now_ms(&self) -> u64;

    fn delay_ms(&mut self, ms: u64);
}
