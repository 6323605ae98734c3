//! CRC16/Modbus frame trailer
//!
//! Reflected polynomial 0xA001 (0x8005), initial value 0xFFFF, no final XOR.
//! The two CRC bytes are appended little-endian (low byte first).

use bytes::{BufMut, BytesMut};

/// Size of the CRC trailer in bytes
pub const CRC_LEN: usize = 2;

const CRC16_INIT: u16 = 0xFFFF;
const CRC16_POLY: u16 = 0xA001;

/// Compute CRC16/Modbus over `data`
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc = CRC16_INIT;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ CRC16_POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Append the CRC of `buf[..len]` in place, returning the new length.
///
/// Fails if the buffer has no room for the two trailer bytes.
pub fn append_crc16(buf: &mut [u8], len: usize) -> anyhow::Result<usize> {
    if len > buf.len() || len + CRC_LEN > buf.len() {
        anyhow::bail!(
            "no room for CRC trailer: {} bytes used of {}",
            len,
            buf.len()
        );
    }
    let crc = crc16_modbus(&buf[..len]);
    buf[len..len + CRC_LEN].copy_from_slice(&crc.to_le_bytes());
    Ok(len + CRC_LEN)
}

/// Copy `payload` into a new buffer with its CRC trailer appended
pub fn with_crc16(payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(payload.len() + CRC_LEN);
    buf.put_slice(payload);
    buf.put_u16_le(crc16_modbus(payload));
    buf
}

/// Split a buffer into payload and trailer, checking the CRC
pub fn verify_crc16(data: &[u8]) -> anyhow::Result<&[u8]> {
    if data.len() < CRC_LEN {
        return Err(anyhow::anyhow!(
            "Frame too short for CRC: {} bytes",
            data.len()
        ));
    }
    let (payload, trailer) = data.split_at(data.len() - CRC_LEN);
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);
    let computed = crc16_modbus(payload);
    if received != computed {
        return Err(anyhow::anyhow!(
            "CRC mismatch: received 0x{:04X}, computed 0x{:04X}",
            received,
            computed
        ));
    }
    Ok(payload)
}
