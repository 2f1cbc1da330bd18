//! CRC32 checksum used by the SEAL command.
//!
//! Reflected CRC-32 (IEEE 802.3, `CRC_32_ISO_HDLC`), polynomial
//! `0xEDB88320`. A [`crc::Digest`] carries the running state so an image
//! can be checksummed chunk by chunk:
//!
//! ```rust
//! use bootbridge::protocol::crc::CRC32;
//!
//! let mut digest = CRC32.digest();
//! digest.update(b"12345");
//! digest.update(b"6789");
//! assert_eq!(digest.finalize(), 0xCBF43926);
//! ```

use std::io::{self, Read, Seek, SeekFrom};

use crc::{CRC_32_ISO_HDLC, Crc};

/// The bootloader's CRC-32 algorithm.
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Chunk size used when checksumming a reader.
pub const CRC32_CHUNK: usize = 512;

/// Checksum of a complete buffer.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Checksum of everything in `reader` from offset 0 to its end.
///
/// The reader is rewound first and read in [`CRC32_CHUNK`]-byte pieces.
pub fn crc32_reader<R: Read + Seek>(reader: &mut R) -> io::Result<u32> {
    reader.seek(SeekFrom::Start(0))?;

    let mut digest = CRC32.digest();
    let mut buf = [0u8; CRC32_CHUNK];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        digest.update(&buf[..n]);
    }

    Ok(digest.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_crc32_empty() {
        assert_eq!(crc32(&[]), 0x0000_0000);
    }

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_crc32_streaming_matches_whole() {
        let data: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        let mut digest = CRC32.digest();
        for chunk in data.chunks(7) {
            digest.update(chunk);
        }
        assert_eq!(digest.finalize(), crc32(&data));
    }

    #[test]
    fn test_crc32_reader_rewinds() {
        let data: Vec<u8> = (0..1500u32).map(|i| (i * 31) as u8).collect();
        let mut cursor = Cursor::new(data.clone());
        cursor.seek(SeekFrom::Start(900)).unwrap();
        assert_eq!(crc32_reader(&mut cursor).unwrap(), crc32(&data));
    }

    #[test]
    fn test_crc32_reader_spans_chunks() {
        let data = vec![0xA5u8; CRC32_CHUNK * 2 + 17];
        let mut cursor = Cursor::new(data.clone());
        assert_eq!(crc32_reader(&mut cursor).unwrap(), crc32(&data));
    }

    #[test]
    fn test_crc32_reader_empty() {
        let mut cursor = Cursor::new(Vec::new());
        assert_eq!(crc32_reader(&mut cursor).unwrap(), 0);
    }
}
