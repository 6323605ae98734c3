//! AT response tokenizer
//!
//! Responses are split into trimmed CRLF lines; information lines of the
//! form `+TAG: a,b,"c"` are split into comma fields with quotes stripped.
//! Every parser returns an error when its line is missing instead of a
//! made-up value.

/// Non-empty, trimmed lines of a response
pub fn lines(text: &str) -> impl Iterator<Item = &str> {
    text.split(['\r', '\n'])
        .map(str::trim)
        .filter(|l| !l.is_empty())
}

/// First line starting with `prefix`
pub fn find_line<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    lines(text).find(|l| l.starts_with(prefix))
}

/// Comma-separated fields of the first `prefix` line (e.g. `+CSQ:`)
pub fn fields<'a>(text: &'a str, prefix: &str) -> anyhow::Result<Vec<&'a str>> {
    let line = find_line(text, prefix)
        .ok_or_else(|| anyhow::anyhow!("no {} line in response", prefix))?;
    Ok(line[prefix.len()..]
        .split(',')
        .map(|f| f.trim().trim_matches('"'))
        .collect())
}

fn int_field(fields: &[&str], index: usize, what: &str) -> anyhow::Result<i32> {
    let raw = fields
        .get(index)
        .ok_or_else(|| anyhow::anyhow!("{} missing (field {})", what, index))?;
    raw.parse::<i32>()
        .or_else(|_| raw.parse::<f64>().map(|v| v.round() as i32))
        .map_err(|e| anyhow::anyhow!("{} not numeric {:?}: {}", what, raw, e))
}

/// SIM ICCID from `AT+CCID`.
///
/// Takes the digits after `+CCID:` when present, otherwise the first run
/// of 19 to 22 digits anywhere in the response.
pub fn parse_iccid(text: &str) -> anyhow::Result<String> {
    if let Some(line) = find_line(text, "+CCID:") {
        let value: String = line["+CCID:".len()..]
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();
        if !value.is_empty() {
            return Ok(value);
        }
    }

    text.split(|c: char| !c.is_ascii_digit())
        .find(|run| (19..=22).contains(&run.len()))
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("no ICCID in response"))
}

/// Received signal strength index from `+CSQ: <rssi>,<ber>` (99 = unknown)
pub fn parse_csq(text: &str) -> anyhow::Result<u8> {
    let f = fields(text, "+CSQ:")?;
    let rssi = int_field(&f, 0, "CSQ rssi")?;
    u8::try_from(rssi).map_err(|_| anyhow::anyhow!("CSQ rssi out of range: {}", rssi))
}

/// Serving-cell radio metrics from `AT+CPSI?`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellInfo {
    pub system_mode: String,
    pub operation_mode: String,
    pub rsrq: i32,
    pub rsrp: i32,
    pub rssi: i32,
    pub sinr: i32,
}

/// Parse an LTE `+CPSI:` line.
///
/// Layout: mode, op-mode, MCC-MNC, TAC, cell id, PCI, band, EARFCN,
/// DL bw, UL bw, RSRQ, RSRP, RSSI, SINR.
pub fn parse_cpsi(text: &str) -> anyhow::Result<CellInfo> {
    let f = fields(text, "+CPSI:")?;
    if f.len() < 14 {
        anyhow::bail!("CPSI has {} fields, need 14 (no LTE service?)", f.len());
    }
    Ok(CellInfo {
        system_mode: f[0].to_string(),
        operation_mode: f[1].to_string(),
        rsrq: int_field(&f, 10, "RSRQ")?,
        rsrp: int_field(&f, 11, "RSRP")?,
        rssi: int_field(&f, 12, "RSSI")?,
        sinr: int_field(&f, 13, "SINR")?,
    })
}

/// Result code of `+CAOPEN: <cid>,<result>` for the given connection id
pub fn parse_caopen(text: &str, cid: u8) -> anyhow::Result<i32> {
    lines(text)
        .filter(|l| l.starts_with("+CAOPEN:"))
        .filter_map(|l| {
            let mut parts = l["+CAOPEN:".len()..].split(',').map(str::trim);
            let id = parts.next()?.parse::<u8>().ok()?;
            let result = parts.next()?.parse::<i32>().ok()?;
            (id == cid).then_some(result)
        })
        .next()
        .ok_or_else(|| anyhow::anyhow!("no +CAOPEN result for connection {}", cid))
}

/// Whether `+CASTATE:` reports connection `cid` as connected (state 1)
pub fn socket_connected(text: &str, cid: u8) -> bool {
    lines(text)
        .filter(|l| l.starts_with("+CASTATE:"))
        .any(|l| {
            let mut parts = l["+CASTATE:".len()..].split(',').map(str::trim);
            parts.next().and_then(|id| id.parse::<u8>().ok()) == Some(cid)
                && parts.next() == Some("1")
        })
}

/// Payload of `+CARECV: <len>,<data>`
pub fn parse_carecv(text: &str) -> anyhow::Result<String> {
    let line = find_line(text, "+CARECV:")
        .ok_or_else(|| anyhow::anyhow!("no +CARECV line in response"))?;
    let rest = line["+CARECV:".len()..].trim();
    let (len, data) = rest.split_once(',').unwrap_or((rest, ""));
    let len: usize = len
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("bad CARECV length {:?}: {}", len, e))?;
    Ok(data.chars().take(len).collect())
}
