//! The *sshovel* container preamble: magic, version, cipher name,
//! nonce, recipient count, selector hash.
use std::io::BufRead;

use crate::codec::{Reader, Writer};
use crate::error::{Result, ShovelError};

pub const MAGIC: &[u8; 15] = b"HAZ.CAT/SSHOVEL";
pub const VERSION: u32 = 5807;
pub const NONCE_LEN: usize = 1024;
pub const SELECTOR_LEN: usize = 20; // SHA-1
const RECIPIENT_COUNT: u32 = 1;

#[derive(Debug, Clone)]
pub struct Header {
    pub cipher_name: String,
    pub nonce: Vec<u8>,
    pub selector_hash: Vec<u8>,
}

impl Header {
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.nonce.len() != NONCE_LEN {
            return Err(ShovelError::Malformed(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                self.nonce.len()
            )));
        }
        if self.selector_hash.len() != SELECTOR_LEN {
            return Err(ShovelError::Malformed(format!(
                "selector hash must be {SELECTOR_LEN} bytes, got {}",
                self.selector_hash.len()
            )));
        }
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        let mut rest = Writer::new();
        rest.put_u32(VERSION);
        rest.put_string(self.cipher_name.to_lowercase().as_bytes());
        rest.put_string(&self.nonce);
        rest.put_u32(RECIPIENT_COUNT);
        rest.put_string(&self.selector_hash);
        buf.extend_from_slice(rest.as_bytes());
        Ok(buf)
    }

    pub fn decode<R: BufRead>(input: R) -> Result<Self> {
        let mut r = Reader::new(input);
        let magic = r.read_exact_bytes(MAGIC.len())?;
        if magic != MAGIC {
            return Err(ShovelError::Malformed("magic mismatch".into()));
        }
        let version = r.read_u32()?;
        if version != VERSION {
            return Err(ShovelError::Malformed(format!(
                "version mismatch: expected {VERSION}, got {version}"
            )));
        }
        let cipher_name = String::from_utf8(r.read_string()?)
            .map_err(|_| ShovelError::Malformed("cipher name is not valid UTF-8".into()))?;
        let nonce = r.read_string()?;
        if nonce.len() != NONCE_LEN {
            return Err(ShovelError::Malformed(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }
        let count = r.read_u32()?;
        if count != RECIPIENT_COUNT {
            return Err(ShovelError::Malformed(format!(
                "recipient count must be {RECIPIENT_COUNT}, got {count}"
            )));
        }
        let selector_hash = r.read_string()?;
        if selector_hash.len() != SELECTOR_LEN {
            return Err(ShovelError::Malformed(format!(
                "selector hash must be {SELECTOR_LEN} bytes, got {}",
                selector_hash.len()
            )));
        }
        Ok(Self {
            cipher_name,
            nonce,
            selector_hash,
        })
    }
}

/// Peeks the first 15 bytes of `input` without consuming them, so the
/// caller can decide encrypt-vs-decrypt before committing to a parse.
pub fn is_shovel_stream<R: BufRead>(input: &mut R) -> Result<bool> {
    let buf = input
        .fill_buf()
        .map_err(|e| ShovelError::Malformed(format!("peek failed: {e}")))?;
    Ok(buf.len() >= MAGIC.len() && &buf[..MAGIC.len()] == MAGIC)
}
