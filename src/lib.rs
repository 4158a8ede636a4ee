//! # Interface Expander Host Library
//!
//! This crate talks to an Interface Expander over its framed serial
//! link. It contains no knowledge about how the serial port itself is
//! opened; see the binary for that.
//!
//! The layers, from the wire upwards:
//!
//! - [`link`]: frame codec and channel dispatch over any byte stream,
//! - [`i2c`]: per-bus request correlation and flow control,
//! - [`memory`]: a linear byte store on top of an I2C memory device.

#![deny(missing_docs)]
#![deny(rustdoc::all)]
#![deny(clippy::must_use_candidate)]
#![deny(missing_debug_implementations)]

pub mod i2c;
pub mod interval;
pub mod link;
pub mod memory;

#[cfg(test)]
pub mod testutils;
