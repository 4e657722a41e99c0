//! The pluggable cipher abstraction: an encrypt/decrypt pair over a
//! byte-stream pair with a passphrase, realized by driving an external
//! child process. The container only ever records the cipher's name;
//! resolving a name to an implementation is the sole job of this
//! module's registry.
use std::io::{Read, Write};

use crate::error::{Result, ShovelError};

pub mod openssl;
pub mod scrypt;

pub use openssl::OpenSslCipher;
pub use scrypt::{ScryptCipher, ScryptOptions};

/// A cipher plug-in: streaming encrypt/decrypt driven by an external
/// binary, keyed by a passphrase the engine derives from an agent
/// signature.
pub trait Cipher {
    fn encrypt(&self, input: &mut dyn Read, output: &mut dyn Write, passphrase: &str) -> Result<()>;
    fn decrypt(&self, input: &mut dyn Read, output: &mut dyn Write, passphrase: &str) -> Result<()>;
}

/// The closed set of cipher names the engine understands, used for
/// both resolution and the CLI's help text.
pub fn names() -> &'static [&'static str] {
    &["openssl", "scrypt"]
}

/// Resolves a cipher name (case-insensitive) to an implementation.
/// `scrypt_options` only matters for encrypt; decrypt ignores it
/// (scrypt's own body format embeds its tuning parameters).
pub fn resolve(name: &str, scrypt_options: ScryptOptions) -> Result<Box<dyn Cipher>> {
    match name.to_lowercase().as_str() {
        "openssl" => Ok(Box::new(OpenSslCipher)),
        "scrypt" => Ok(Box::new(ScryptCipher::new(scrypt_options))),
        other => Err(ShovelError::UnknownCipher(other.to_string())),
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! A deterministic, dependency-free cipher used by the engine's
    //! round-trip tests so they don't require `openssl`/`scrypt` on
    //! PATH. XORs the stream with the passphrase's bytes, repeated.
    use super::*;

    pub struct XorCipher;

    impl Cipher for XorCipher {
        fn encrypt(&self, input: &mut dyn Read, output: &mut dyn Write, passphrase: &str) -> Result<()> {
            xor_stream(input, output, passphrase)
        }

        fn decrypt(&self, input: &mut dyn Read, output: &mut dyn Write, passphrase: &str) -> Result<()> {
            xor_stream(input, output, passphrase)
        }
    }

    fn xor_stream(input: &mut dyn Read, output: &mut dyn Write, passphrase: &str) -> Result<()> {
        let key = passphrase.as_bytes();
        if key.is_empty() {
            return Err(ShovelError::CipherFailure("empty passphrase".into()));
        }
        let mut buf = Vec::new();
        input
            .read_to_end(&mut buf)
            .map_err(|e| ShovelError::CipherFailure(format!("read: {e}")))?;
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte ^= key[i % key.len()];
        }
        output
            .write_all(&buf)
            .map_err(|e| ShovelError::CipherFailure(format!("write: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_cipher_name_is_rejected() {
        let err = resolve("rot13", ScryptOptions::default()).unwrap_err();
        assert!(matches!(err, ShovelError::UnknownCipher(_)));
    }

    #[test]
    fn resolve_is_case_insensitive() {
        assert!(resolve("OpenSSL", ScryptOptions::default()).is_ok());
        assert!(resolve("SCRYPT", ScryptOptions::default()).is_ok());
    }

    #[test]
    fn fake_cipher_round_trips() {
        use fake::XorCipher;
        let plaintext = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789".to_vec();
        let cipher = XorCipher;
        let mut ciphertext = Vec::new();
        cipher
            .encrypt(&mut &plaintext[..], &mut ciphertext, "deadbeef")
            .unwrap();
        let mut roundtripped = Vec::new();
        cipher
            .decrypt(&mut &ciphertext[..], &mut roundtripped, "deadbeef")
            .unwrap();
        assert_eq!(roundtripped, plaintext);
    }
}
