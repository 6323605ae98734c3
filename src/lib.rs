//! Duty-cycled cellular telemetry node
//!
//! Each wake cycle samples the sensors, frames the reading, appends it to a
//! persistent line buffer and drains that buffer over an LTE-M TCP socket
//! driven through AT commands. Delivery is at-least-once: a line is only
//! marked processed after the modem (and optionally the server) confirms it.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod cycle;
pub mod modem;
pub mod operator;
pub mod state;
