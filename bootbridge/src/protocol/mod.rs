//! Target bootloader protocol: framing and checksum.

pub mod crc;
pub mod frame;

// Re-export common types
pub use frame::{Command, Opcode, Response, TargetFlashGeometry, Word};
