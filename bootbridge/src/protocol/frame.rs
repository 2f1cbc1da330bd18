//! Command and response framing for the target's serial bootloader.
//!
//! Every field on the wire is a 32-bit little-endian word. Commands start
//! with a four-character ASCII opcode packed into a word, followed by zero or
//! more argument words and, for WRITE only, the raw bytes to program:
//!
//! ```text
//! +---------+---------+---------+-----+----------------+
//! | opcode  |  arg 0  |  arg 1  | ... | payload (WRITE)|
//! +---------+---------+---------+-----+----------------+
//! | 4 bytes | 4 bytes | 4 bytes |     |  len bytes     |
//! +---------+---------+---------+-----+----------------+
//! ```
//!
//! | Command | Arguments               | Response                          |
//! |---------|-------------------------|-----------------------------------|
//! | SYNC    | -                       | `PICO`                            |
//! | INFO    | -                       | status + 5 words                  |
//! | ERASE   | addr, size              | status                            |
//! | WRITE   | addr, len + len bytes   | status + 1 word (not checked)     |
//! | SEAL    | base, len, crc32        | status                            |
//! | GO      | base                    | none                              |

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::fmt;

/// Alignment every WRITE length is rounded up to.
pub const WRITE_ALIGN: u32 = 256;

/// A 32-bit protocol word, usually a packed four-character tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Word(pub u32);

impl Word {
    /// Pack a four-character tag, first character in the lowest byte.
    pub const fn from_tag(tag: &[u8; 4]) -> Self {
        Self(u32::from_le_bytes(*tag))
    }

    /// Decode a word from the first four bytes of `bytes`.
    pub fn from_le_slice(bytes: &[u8]) -> Option<Self> {
        (bytes.len() >= 4).then(|| Self(LittleEndian::read_u32(bytes)))
    }

    /// Wire representation.
    pub fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.to_le_bytes();
        if bytes.iter().all(u8::is_ascii_graphic) {
            bytes.iter().try_for_each(|&b| write!(f, "{}", char::from(b)))
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}

impl fmt::Debug for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Word({self})")
    }
}

/// SYNC opcode.
pub const CMD_SYNC: Word = Word::from_tag(b"SYNC");
/// INFO opcode.
pub const CMD_INFO: Word = Word::from_tag(b"INFO");
/// ERASE opcode.
pub const CMD_ERASE: Word = Word::from_tag(b"ERAS");
/// WRITE opcode.
pub const CMD_WRITE: Word = Word::from_tag(b"WRIT");
/// SEAL opcode.
pub const CMD_SEAL: Word = Word::from_tag(b"SEAL");
/// GO opcode.
pub const CMD_GO: Word = Word::from_tag(b"GOGO");

/// Answer to a successful SYNC.
pub const RSP_SYNC: Word = Word::from_tag(b"PICO");
/// Success status.
pub const RSP_OK: Word = Word::from_tag(b"OKOK");
/// Failure status.
pub const RSP_ERR: Word = Word::from_tag(b"ERR!");

/// Bootloader operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Lockstep handshake.
    Sync,
    /// Query flash geometry.
    Info,
    /// Erase a range.
    Erase,
    /// Program a range.
    Write,
    /// Verify and seal the written image.
    Seal,
    /// Jump to the application.
    Go,
}

impl Opcode {
    /// All opcodes, in protocol order.
    pub const ALL: [Self; 6] = [
        Self::Sync,
        Self::Info,
        Self::Erase,
        Self::Write,
        Self::Seal,
        Self::Go,
    ];

    /// Packed opcode word.
    pub fn word(self) -> Word {
        match self {
            Self::Sync => CMD_SYNC,
            Self::Info => CMD_INFO,
            Self::Erase => CMD_ERASE,
            Self::Write => CMD_WRITE,
            Self::Seal => CMD_SEAL,
            Self::Go => CMD_GO,
        }
    }

    /// Human-readable name.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Sync => "SYNC",
            Self::Info => "INFO",
            Self::Erase => "ERASE",
            Self::Write => "WRITE",
            Self::Seal => "SEAL",
            Self::Go => "GO",
        }
    }

    /// Number of argument words that follow the opcode.
    pub fn arg_count(self) -> usize {
        match self {
            Self::Sync | Self::Info => 0,
            Self::Go => 1,
            Self::Erase | Self::Write => 2,
            Self::Seal => 3,
        }
    }

    /// Bytes the target sends back, `None` when no answer is expected.
    pub fn response_len(self) -> Option<usize> {
        match self {
            Self::Sync | Self::Erase | Self::Seal => Some(4),
            Self::Info => Some(4 + 5 * 4),
            Self::Write => Some(4 + 4),
            Self::Go => None,
        }
    }

    /// Look up an opcode from its packed word.
    pub fn from_word(word: Word) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.word() == word)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Outbound command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    opcode: Opcode,
    args: Vec<u32>,
    payload: Vec<u8>,
}

impl Command {
    fn new(opcode: Opcode, args: &[u32]) -> Self {
        Self {
            opcode,
            args: args.to_vec(),
            payload: Vec::new(),
        }
    }

    /// Build SYNC.
    pub fn sync() -> Self {
        Self::new(Opcode::Sync, &[])
    }

    /// Build INFO.
    pub fn info() -> Self {
        Self::new(Opcode::Info, &[])
    }

    /// Build ERASE for `size` bytes at `addr`.
    pub fn erase(addr: u32, size: u32) -> Self {
        Self::new(Opcode::Erase, &[addr, size])
    }

    /// Build WRITE of `data` at `addr`.
    ///
    /// The declared length is `data.len()`; callers pad `data` to
    /// [`WRITE_ALIGN`] first.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write(addr: u32, data: Vec<u8>) -> Self {
        // Safe cast: a write never exceeds the target's write granularity
        let len = data.len() as u32;
        Self {
            opcode: Opcode::Write,
            args: vec![addr, len],
            payload: data,
        }
    }

    /// Build SEAL for an image of `len` bytes at `base` with checksum `crc`.
    pub fn seal(base: u32, len: u32, crc: u32) -> Self {
        Self::new(Opcode::Seal, &[base, len, crc])
    }

    /// Build GO to `base`.
    pub fn go(base: u32) -> Self {
        Self::new(Opcode::Go, &[base])
    }

    /// Opcode of this command.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Argument words.
    pub fn args(&self) -> &[u32] {
        &self.args
    }

    /// Raw payload (WRITE only).
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize the frame for the wire.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn build(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.args.len() * 4 + self.payload.len());
        buf.write_u32::<LittleEndian>(self.opcode.word().0).unwrap();
        for &arg in &self.args {
            buf.write_u32::<LittleEndian>(arg).unwrap();
        }
        buf.extend_from_slice(&self.payload);
        buf
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        for arg in &self.args {
            write!(f, " {arg:#010x}")?;
        }
        if !self.payload.is_empty() {
            write!(f, " +{} bytes", self.payload.len())?;
        }
        Ok(())
    }
}

/// Flash layout reported by the target's INFO response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TargetFlashGeometry {
    /// First address of the application flash region.
    pub base: u32,
    /// Size of the application flash region.
    pub size: u32,
    /// Erase unit.
    pub erase_granularity: u32,
    /// Reserved word, logged but not used.
    pub reserved: u32,
    /// Largest WRITE the target accepts.
    pub write_granularity: u32,
}

impl TargetFlashGeometry {
    /// Decode the five payload words following the INFO status.
    pub fn from_words(words: &[u8]) -> Option<Self> {
        if words.len() < 5 * 4 {
            return None;
        }
        let mut w = [0u32; 5];
        LittleEndian::read_u32_into(&words[..20], &mut w);
        Some(Self {
            base: w[0],
            size: w[1],
            erase_granularity: w[2],
            reserved: w[3],
            write_granularity: w[4],
        })
    }

    /// Wire form of the five payload words.
    pub fn to_words(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        LittleEndian::write_u32_into(
            &[
                self.base,
                self.size,
                self.erase_granularity,
                self.reserved,
                self.write_granularity,
            ],
            &mut out,
        );
        out
    }
}

/// Decoded inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// A bare status word (SYNC, ERASE, SEAL).
    Status(Word),
    /// INFO status plus geometry.
    Info(Word, TargetFlashGeometry),
    /// WRITE status plus the trailing word, which is consumed but unchecked.
    Write(Word, u32),
}

impl Response {
    /// Decode the answer to `opcode` from exactly
    /// [`Opcode::response_len`] bytes.
    pub fn decode(opcode: Opcode, bytes: &[u8]) -> Option<Self> {
        if Some(bytes.len()) != opcode.response_len() {
            return None;
        }
        let status = Word::from_le_slice(bytes)?;
        match opcode {
            Opcode::Info => TargetFlashGeometry::from_words(&bytes[4..])
                .map(|geometry| Self::Info(status, geometry)),
            Opcode::Write => Some(Self::Write(status, LittleEndian::read_u32(&bytes[4..]))),
            _ => Some(Self::Status(status)),
        }
    }

    /// Status word of the response.
    pub fn status(&self) -> Word {
        match *self {
            Self::Status(s) | Self::Info(s, _) | Self::Write(s, _) => s,
        }
    }
}

/// Round `len` up to the next multiple of [`WRITE_ALIGN`].
pub fn align_write_len(len: u32) -> u32 {
    len.div_ceil(WRITE_ALIGN) * WRITE_ALIGN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_packing() {
        assert_eq!(CMD_SYNC.0, 0x434E_5953);
        assert_eq!(CMD_SYNC.to_le_bytes(), *b"SYNC");
        assert_eq!(RSP_OK.to_le_bytes(), *b"OKOK");
    }

    #[test]
    fn test_word_display() {
        assert_eq!(RSP_ERR.to_string(), "ERR!");
        assert_eq!(Word(0x0000_0001).to_string(), "0x00000001");
        assert_eq!(format!("{:?}", RSP_SYNC), "Word(PICO)");
    }

    #[test]
    fn test_sync_frame() {
        assert_eq!(Command::sync().build(), b"SYNC".to_vec());
    }

    #[test]
    fn test_erase_frame() {
        let data = Command::erase(0x1000_4000, 0x1000).build();
        assert_eq!(data.len(), 12);
        assert_eq!(&data[0..4], b"ERAS");
        assert_eq!(&data[4..8], &[0x00, 0x40, 0x00, 0x10]);
        assert_eq!(&data[8..12], &[0x00, 0x10, 0x00, 0x00]);
    }

    #[test]
    fn test_write_frame_carries_payload() {
        let cmd = Command::write(0x1000_4000, vec![0xAB; 256]);
        assert_eq!(cmd.args(), &[0x1000_4000, 256]);
        let data = cmd.build();
        assert_eq!(data.len(), 12 + 256);
        assert!(data[12..].iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_seal_and_go_frames() {
        let seal = Command::seal(0x1000_4000, 1000, 0xCBF4_3926).build();
        assert_eq!(seal.len(), 16);
        assert_eq!(&seal[12..16], &0xCBF4_3926u32.to_le_bytes());

        let go = Command::go(0x1000_4000).build();
        assert_eq!(go.len(), 8);
        assert_eq!(&go[0..4], b"GOGO");
    }

    #[test]
    fn test_command_display() {
        let cmd = Command::write(0x1000_0000, vec![0; 512]);
        assert_eq!(cmd.to_string(), "WRITE 0x10000000 0x00000200 +512 bytes");
    }

    #[test]
    fn test_opcode_arg_counts_match_builders() {
        assert_eq!(Command::sync().args().len(), Opcode::Sync.arg_count());
        assert_eq!(Command::info().args().len(), Opcode::Info.arg_count());
        assert_eq!(Command::erase(0, 0).args().len(), Opcode::Erase.arg_count());
        assert_eq!(Command::write(0, vec![]).args().len(), Opcode::Write.arg_count());
        assert_eq!(Command::seal(0, 0, 0).args().len(), Opcode::Seal.arg_count());
        assert_eq!(Command::go(0).args().len(), Opcode::Go.arg_count());
    }

    #[test]
    fn test_opcode_from_word() {
        assert_eq!(Opcode::from_word(CMD_SEAL), Some(Opcode::Seal));
        assert_eq!(Opcode::from_word(RSP_OK), None);
    }

    #[test]
    fn test_decode_info() {
        let geometry = TargetFlashGeometry {
            base: 0x1000_4000,
            size: 0x001F_C000,
            erase_granularity: 4096,
            reserved: 256,
            write_granularity: 4096,
        };
        let mut bytes = RSP_OK.to_le_bytes().to_vec();
        bytes.extend_from_slice(&geometry.to_words());

        assert_eq!(
            Response::decode(Opcode::Info, &bytes),
            Some(Response::Info(RSP_OK, geometry))
        );
    }

    #[test]
    fn test_decode_write_keeps_trailing_word() {
        let mut bytes = RSP_OK.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        let rsp = Response::decode(Opcode::Write, &bytes).unwrap();
        assert_eq!(rsp, Response::Write(RSP_OK, 0xDEAD_BEEF));
        assert_eq!(rsp.status(), RSP_OK);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert_eq!(Response::decode(Opcode::Erase, b"OK"), None);
        assert_eq!(Response::decode(Opcode::Go, b"OKOK"), None);
    }

    #[test]
    fn test_align_write_len() {
        assert_eq!(align_write_len(0), 0);
        assert_eq!(align_write_len(1), 256);
        assert_eq!(align_write_len(256), 256);
        assert_eq!(align_write_len(257), 512);
        assert_eq!(align_write_len(4000), 4096);
    }
}
