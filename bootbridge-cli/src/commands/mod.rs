//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod crc;
pub(crate) mod flash;
pub(crate) mod monitor;
pub(crate) mod ports;
