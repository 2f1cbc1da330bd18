//! In-memory port for unit tests.

use std::collections::VecDeque;
use std::io;

use crate::error::Result;
use crate::port::Port;

/// Scripted port: tests push the bytes the target sends with
/// [`MockPort::feed`] and inspect what the host wrote with
/// [`MockPort::take_written`].
#[derive(Debug, Default)]
pub(crate) struct MockPort {
    read_buf: VecDeque<u8>,
    write_buf: Vec<u8>,
    pub(crate) dtr: Vec<bool>,
    pub(crate) rts: Vec<bool>,
    pub(crate) fail_writes: bool,
}

impl MockPort {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        self.read_buf.extend(bytes);
    }

    pub(crate) fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.write_buf)
    }
}

impl io::Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.read_buf.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.read_buf.len());
        for (dst, src) in buf.iter_mut().zip(self.read_buf.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl io::Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "line down"));
        }
        self.write_buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.read_buf.len())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.dtr.push(level);
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.rts.push(level);
        Ok(())
    }
}
