//! Telemetry frame codec
//!
//! A reading is packed into a fixed-width, comma-delimited text frame:
//!
//! ```text
//! $,<iccid:20>,<epoch:10>,<lat>,<lng>,<alt:4>,<var1:4>,...,<var7:4>,#
//! ```
//!
//! The frame bytes get a CRC16/Modbus trailer, pass through the payload
//! cipher, and are base64-encoded into a single buffered line.
//! Slot widths come from [`LAYOUT`]; padding and truncation are defined once
//! in [`Slot`] and reused by every field.

pub mod crc;

use base64::Engine;
use serde::{Deserialize, Serialize};

pub const ICCID_LEN: usize = 20;
pub const EPOCH_LEN: usize = 10;
pub const COORD_LEN: usize = 12;
pub const ALT_LEN: usize = 4;
pub const VAR_LEN: usize = 4;
pub const VAR_COUNT: usize = 7;

const FRAME_START: &[u8] = b"$,";
const FRAME_END: &[u8] = b",#";
const SEPARATOR: u8 = b',';

/// How a field's text is placed into its slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Right-aligned, zero-padded to exactly `width` characters.
    /// Overlong text keeps its least-significant characters; a leading
    /// `-` survives truncation in the first column.
    Fixed(usize),
    /// Copied as-is, cut to at most `width` characters, never padded.
    Coord(usize),
}

impl Slot {
    pub const fn max_width(&self) -> usize {
        match self {
            Slot::Fixed(w) | Slot::Coord(w) => *w,
        }
    }

    /// Write `text` into `dst`, returning the number of bytes written
    fn write(&self, text: &[u8], dst: &mut [u8]) -> usize {
        match *self {
            Slot::Fixed(width) => {
                let slot = &mut dst[..width];
                slot.fill(b'0');
                if text.len() > width {
                    if text[0] == b'-' {
                        slot[0] = b'-';
                        let digits = &text[text.len() - (width - 1)..];
                        slot[1..].copy_from_slice(digits);
                    } else {
                        slot.copy_from_slice(&text[text.len() - width..]);
                    }
                } else {
                    slot[width - text.len()..].copy_from_slice(text);
                }
                width
            }
            Slot::Coord(width) => {
                let n = text.len().min(width);
                dst[..n].copy_from_slice(&text[..n]);
                n
            }
        }
    }
}

/// One column of the frame layout
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub slot: Slot,
}

pub const FIELD_COUNT: usize = 5 + VAR_COUNT;

/// Frame layout, in wire order
pub const LAYOUT: [Field; FIELD_COUNT] = [
    Field { name: "iccid", slot: Slot::Fixed(ICCID_LEN) },
    Field { name: "epoch", slot: Slot::Fixed(EPOCH_LEN) },
    Field { name: "lat", slot: Slot::Coord(COORD_LEN) },
    Field { name: "lng", slot: Slot::Coord(COORD_LEN) },
    Field { name: "alt", slot: Slot::Fixed(ALT_LEN) },
    Field { name: "var1", slot: Slot::Fixed(VAR_LEN) },
    Field { name: "var2", slot: Slot::Fixed(VAR_LEN) },
    Field { name: "var3", slot: Slot::Fixed(VAR_LEN) },
    Field { name: "var4", slot: Slot::Fixed(VAR_LEN) },
    Field { name: "var5", slot: Slot::Fixed(VAR_LEN) },
    Field { name: "var6", slot: Slot::Fixed(VAR_LEN) },
    Field { name: "var7", slot: Slot::Fixed(VAR_LEN) },
];

const fn frame_max_len() -> usize {
    let mut total = FRAME_START.len() + FRAME_END.len() + (FIELD_COUNT - 1);
    let mut i = 0;
    while i < FIELD_COUNT {
        total += LAYOUT[i].slot.max_width();
        i += 1;
    }
    total
}

/// Longest possible frame text (without CRC trailer)
pub const FRAME_MAX_LEN: usize = frame_max_len();

/// GPS position attached to a reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    /// Metres; sent rounded to the nearest integer
    pub alt: f64,
}

/// One cycle's worth of telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub iccid: String,
    pub epoch: u64,
    pub location: Option<Location>,
    /// Pre-scaled sensor values (e.g. °C×100)
    pub vars: [i32; VAR_COUNT],
}

impl Reading {
    /// Text representation of each field, in [`LAYOUT`] order
    fn field_texts(&self) -> Vec<String> {
        let mut texts = Vec::with_capacity(FIELD_COUNT);
        texts.push(self.iccid.clone());
        texts.push(self.epoch.to_string());
        match self.location {
            Some(loc) => {
                texts.push(format!("{:.6}", loc.lat));
                texts.push(format!("{:.6}", loc.lng));
                texts.push((loc.alt.round() as i64).to_string());
            }
            None => {
                texts.push("0".repeat(COORD_LEN));
                texts.push("0".repeat(COORD_LEN));
                texts.push("0".to_string());
            }
        }
        texts.extend(self.vars.iter().map(|v| v.to_string()));
        texts
    }
}

/// Build the frame text into `out`, returning the number of bytes written.
///
/// `out` must hold at least [`FRAME_MAX_LEN`] bytes; the layout is never
/// truncated to fit a smaller buffer.
pub fn build_frame_into(reading: &Reading, out: &mut [u8]) -> anyhow::Result<usize> {
    if out.len() < FRAME_MAX_LEN {
        anyhow::bail!(
            "frame buffer too small: {} bytes, need {}",
            out.len(),
            FRAME_MAX_LEN
        );
    }
    if !reading.iccid.is_ascii() {
        anyhow::bail!("ICCID is not ASCII: {:?}", reading.iccid);
    }

    let mut pos = 0;
    out[..FRAME_START.len()].copy_from_slice(FRAME_START);
    pos += FRAME_START.len();

    for (i, (field, text)) in LAYOUT.iter().zip(reading.field_texts()).enumerate() {
        if i > 0 {
            out[pos] = SEPARATOR;
            pos += 1;
        }
        pos += field.slot.write(text.as_bytes(), &mut out[pos..]);
    }

    out[pos..pos + FRAME_END.len()].copy_from_slice(FRAME_END);
    pos += FRAME_END.len();
    Ok(pos)
}

/// Build the frame text for a reading
pub fn build_frame(reading: &Reading) -> anyhow::Result<String> {
    let mut out = [0u8; FRAME_MAX_LEN];
    let len = build_frame_into(reading, &mut out)?;
    String::from_utf8(out[..len].to_vec())
        .map_err(|e| anyhow::anyhow!("Frame is not valid UTF-8: {}", e))
}

/// Parse frame text back into a reading
pub fn decode_frame(text: &str) -> anyhow::Result<Reading> {
    let inner = text
        .strip_prefix("$,")
        .and_then(|t| t.strip_suffix(",#"))
        .ok_or_else(|| anyhow::anyhow!("Missing frame sentinels"))?;

    let tokens: Vec<&str> = inner.split(',').collect();
    if tokens.len() != FIELD_COUNT {
        return Err(anyhow::anyhow!(
            "Expected {} fields, got {}",
            FIELD_COUNT,
            tokens.len()
        ));
    }

    for (field, token) in LAYOUT.iter().zip(&tokens) {
        let ok = match field.slot {
            Slot::Fixed(w) => token.len() == w,
            Slot::Coord(w) => !token.is_empty() && token.len() <= w,
        };
        if !ok {
            return Err(anyhow::anyhow!(
                "Field {} has bad width {}: {:?}",
                field.name,
                token.len(),
                token
            ));
        }
    }

    let epoch = tokens[1]
        .parse::<u64>()
        .map_err(|e| anyhow::anyhow!("Invalid epoch {:?}: {}", tokens[1], e))?;

    let zero_filled = |t: &str| t.bytes().all(|b| b == b'0');
    let location = if zero_filled(tokens[2]) && zero_filled(tokens[3]) {
        None
    } else {
        Some(Location {
            lat: parse_coord(tokens[2])?,
            lng: parse_coord(tokens[3])?,
            alt: parse_fixed_int(tokens[4])? as f64,
        })
    };

    let mut vars = [0i32; VAR_COUNT];
    for (i, var) in vars.iter_mut().enumerate() {
        *var = parse_fixed_int(tokens[5 + i])? as i32;
    }

    Ok(Reading {
        iccid: tokens[0].to_string(),
        epoch,
        location,
        vars,
    })
}

fn parse_coord(token: &str) -> anyhow::Result<f64> {
    token
        .parse::<f64>()
        .map_err(|e| anyhow::anyhow!("Invalid coordinate {:?}: {}", token, e))
}

/// Parse a right-aligned slot; the sign may sit after pad zeros (`00-5`)
fn parse_fixed_int(token: &str) -> anyhow::Result<i64> {
    let parsed = match token.find('-') {
        Some(pos) => token[pos + 1..].parse::<i64>().map(|v| -v),
        None => token.parse::<i64>(),
    };
    parsed.map_err(|e| anyhow::anyhow!("Invalid numeric slot {:?}: {}", token, e))
}

/// Opaque byte transform applied to framed bytes before base64
pub trait PayloadCipher {
    fn seal(&self, plain: &[u8]) -> anyhow::Result<Vec<u8>>;
    fn open(&self, sealed: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Pass-through cipher (payload encryption disabled)
#[derive(Debug, Clone, Copy, Default)]
pub struct Plaintext;

impl PayloadCipher for Plaintext {
    fn seal(&self, plain: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(plain.to_vec())
    }

    fn open(&self, sealed: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(sealed.to_vec())
    }
}

pub fn encode_base64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn decode_base64(input: &str) -> anyhow::Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(input)
        .map_err(|e| anyhow::anyhow!("Base64 decode error: {}", e))
}

/// Frame, CRC, seal and base64-encode a reading into one buffer line
pub fn encode_line(reading: &Reading, cipher: &dyn PayloadCipher) -> anyhow::Result<String> {
    let frame = build_frame(reading)?;
    let framed = crc::with_crc16(frame.as_bytes());
    tracing::debug!("Frame bytes: {}", hex::encode(&framed));
    let sealed = cipher.seal(&framed)?;
    Ok(encode_base64(&sealed))
}

/// Reverse of [`encode_line`]; fails on bad base64, CRC or layout
pub fn decode_line(line: &str, cipher: &dyn PayloadCipher) -> anyhow::Result<Reading> {
    let sealed = decode_base64(line.trim())?;
    let framed = cipher.open(&sealed)?;
    let payload = crc::verify_crc16(&framed)?;
    let text = std::str::from_utf8(payload)
        .map_err(|e| anyhow::anyhow!("Invalid UTF-8 in frame: {}", e))?;
    decode_frame(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_reading() -> Reading {
        Reading {
            iccid: "89520201234567890123".to_string(),
            epoch: 1_718_000_000,
            location: Some(Location {
                lat: 20.123456,
                lng: -103.654321,
                alt: 1540.0,
            }),
            vars: [2150, 6500, 12, 0, 999, 4095, 37],
        }
    }

    #[test]
    fn test_frame_max_len() {
        assert_eq!(FRAME_MAX_LEN, 101);
    }

    #[test]
    fn test_build_frame_layout() {
        let frame = build_frame(&sample_reading()).unwrap();
        assert_eq!(
            frame,
            "$,89520201234567890123,1718000000,20.123456,-103.654321,1540,\
             2150,6500,0012,0000,0999,4095,0037,#"
        );
    }

    #[test]
    fn test_missing_location_zero_filled() {
        let mut reading = sample_reading();
        reading.location = None;
        let frame = build_frame(&reading).unwrap();
        assert!(frame.contains(",000000000000,000000000000,0000,"));
    }

    #[test]
    fn test_short_iccid_padded() {
        let mut reading = sample_reading();
        reading.iccid = "8952020123456789012".to_string();
        let frame = build_frame(&reading).unwrap();
        assert!(frame.starts_with("$,08952020123456789012,"));
    }

    #[test]
    fn test_fixed_slot_truncation() {
        let mut dst = [0u8; 4];
        Slot::Fixed(4).write(b"123456", &mut dst);
        assert_eq!(&dst, b"3456");

        Slot::Fixed(4).write(b"-12345", &mut dst);
        assert_eq!(&dst, b"-345");

        Slot::Fixed(4).write(b"-5", &mut dst);
        assert_eq!(&dst, b"00-5");

        Slot::Fixed(4).write(b"7", &mut dst);
        assert_eq!(&dst, b"0007");
    }

    #[test]
    fn test_coord_slot_truncation() {
        let mut dst = [0u8; COORD_LEN];
        let n = Slot::Coord(COORD_LEN).write(b"-1234.5678901234", &mut dst);
        assert_eq!(n, COORD_LEN);
        assert_eq!(&dst, b"-1234.567890");
    }

    #[test]
    fn test_small_buffer_rejected() {
        let mut out = [0u8; FRAME_MAX_LEN - 1];
        assert!(build_frame_into(&sample_reading(), &mut out).is_err());
    }

    #[test]
    fn test_decode_round_trip() {
        let reading = sample_reading();
        let frame = build_frame(&reading).unwrap();
        assert_eq!(decode_frame(&frame).unwrap(), reading);

        let mut no_fix = reading.clone();
        no_fix.location = None;
        no_fix.vars = [-5, -999, 0, 1, 22, 333, 4444];
        let frame = build_frame(&no_fix).unwrap();
        assert_eq!(decode_frame(&frame).unwrap(), no_fix);
    }

    #[test]
    fn test_line_round_trip() {
        let reading = sample_reading();
        let line = encode_line(&reading, &Plaintext).unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(decode_line(&line, &Plaintext).unwrap(), reading);
    }

    #[test]
    fn test_corrupted_line_rejected() {
        let line = encode_line(&sample_reading(), &Plaintext).unwrap();
        let mut bytes = decode_base64(&line).unwrap();
        bytes[10] ^= 0x01;
        let corrupted = encode_base64(&bytes);
        assert!(decode_line(&corrupted, &Plaintext).is_err());
    }

    #[test]
    fn test_base64_length() {
        for n in 0..10usize {
            let data = vec![0xA5u8; n];
            assert_eq!(encode_base64(&data).len(), n.div_ceil(3) * 4);
        }
    }

    #[test]
    fn test_decode_rejects_bad_sentinels() {
        assert!(decode_frame("89520201234567890123,#").is_err());
        assert!(decode_frame("$,1,2,#").is_err());
    }
}
