//! Length-prefixed, big-endian binary codec shared by the ssh-agent
//! protocol (`agent`) and the container header (`container`).
use std::io::Read;

use crate::error::{Result, ShovelError};

/// Length fields read from an untrusted source are refused past this
/// bound, to keep a malicious or truncated stream from triggering a
/// huge allocation.
const MAX_STRING_LEN: u32 = 16 * 1024 * 1024;

/// Accumulates primitives into a buffer in wire order.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Writes a `u32` byte-length followed by the raw bytes. The length
    /// is always `bytes.len()`, never a character count.
    pub fn put_string(&mut self, bytes: &[u8]) -> &mut Self {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Wraps the accumulated buffer as a `string`: a complete agent
    /// request framed with its own outer length prefix.
    pub fn framed(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.buf.len());
        out.extend_from_slice(&(self.buf.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.buf);
        out
    }
}

/// Reads primitives out of anything that implements `Read`. Loops until
/// the exact requested byte count has been accumulated; real streams
/// (sockets in particular) are not guaranteed to fill a buffer in one
/// call.
pub struct Reader<R> {
    inner: R,
}

impl<R: Read> Reader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn fill(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let read = self
                .inner
                .read(&mut buf[filled..])
                .map_err(|e| ShovelError::Malformed(format!("read error: {e}")))?;
            if read == 0 {
                return Err(ShovelError::Malformed(format!(
                    "short read: wanted {n} bytes, got {filled}"
                )));
            }
            filled += read;
        }
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.fill(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.fill(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_string(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()?;
        if len > MAX_STRING_LEN {
            return Err(ShovelError::Overflow(format!(
                "string length {len} exceeds {MAX_STRING_LEN} byte bound"
            )));
        }
        self.fill(len as usize)
    }

    pub fn read_exact_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        self.fill(n)
    }
}
