//! Ties the agent client, container format and cipher registry
//! together: generate nonces, select identities, derive passphrases,
//! emit/parse headers, and hand the body to the selected cipher.
use std::io::{BufRead, Read, Write};

use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::agent::{Agent, Identity};
use crate::cipher::{self, Cipher, ScryptOptions};
use crate::container::{Header, NONCE_LEN};
use crate::error::{Result, ShovelError};

/// Generates a fresh 1024-byte nonce. Never reused across encryptions.
pub fn generate_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// SHA-1 of (nonce ‖ identity.blob); an opaque predicate the decryptor
/// evaluates against each identity the agent offers.
pub fn selector_hash(nonce: &[u8], identity_blob: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(identity_blob);
    hasher.finalize().to_vec()
}

/// Signs `nonce` with `identity` and reduces the signature to a
/// lowercase-hex SHA-1 passphrase. Because RSA-PKCS#1 and Ed25519 are
/// deterministic, this is reproducible across sessions for the same
/// key and nonce.
fn derive_passphrase(agent: &Agent, identity: &Identity, nonce: &[u8]) -> Result<String> {
    let signature = agent
        .sign(&identity.blob, nonce, identity.sign_flags())?
        .ok_or_else(|| {
            ShovelError::KeyMissing(format!(
                "missing key: agent refused to sign with {}",
                identity.comment
            ))
        })?;
    let mut hasher = Sha1::new();
    hasher.update(&signature);
    Ok(hex::encode(hasher.finalize()))
}

/// Encrypts `input` into `output`, writing the sshovel header followed
/// by the chosen cipher's body.
pub fn encrypt<W: Write>(
    input: &mut dyn Read,
    output: &mut W,
    agent: &Agent,
    identity: &Identity,
    cipher_name: &str,
    scrypt_options: ScryptOptions,
) -> Result<()> {
    let nonce = generate_nonce();
    encrypt_with_nonce(input, output, agent, identity, cipher_name, scrypt_options, nonce)
}

/// Same as [`encrypt`] but takes the nonce as a parameter, so the edit
/// workflow can deliberately reuse a `CiphertextExisting` file's
/// original nonce on re-encryption (preserving its selector hash).
pub fn encrypt_with_nonce<W: Write>(
    input: &mut dyn Read,
    output: &mut W,
    agent: &Agent,
    identity: &Identity,
    cipher_name: &str,
    scrypt_options: ScryptOptions,
    nonce: Vec<u8>,
) -> Result<()> {
    let cipher = cipher::resolve(cipher_name, scrypt_options)?;
    encrypt_with_cipher(input, output, agent, identity, cipher_name, cipher.as_ref(), nonce)
}

/// The common core of encryption, parameterized over an already
/// resolved cipher so callers (and tests) can substitute a
/// dependency-free fake without touching the name-based registry. The
/// `edit` workflow uses this directly to decouple its own re-encryption
/// step from cipher-name resolution.
pub(crate) fn encrypt_with_cipher<W: Write>(
    input: &mut dyn Read,
    output: &mut W,
    agent: &Agent,
    identity: &Identity,
    cipher_name: &str,
    cipher: &dyn Cipher,
    nonce: Vec<u8>,
) -> Result<()> {
    let passphrase = derive_passphrase(agent, identity, &nonce)?;
    let selector = selector_hash(&nonce, &identity.blob);

    let header = Header {
        cipher_name: cipher_name.to_lowercase(),
        nonce,
        selector_hash: selector,
    };
    output
        .write_all(&header.encode()?)
        .map_err(|e| ShovelError::CipherFailure(format!("write header: {e}")))?;

    cipher.encrypt(input, output, &passphrase)
}

/// Parses the header, matches the unique identity whose selector hash
/// fits, derives the passphrase, and invokes the matched cipher's
/// decrypt. Never reads past the header before delegating the body.
pub fn decrypt<R: BufRead, W: Write>(mut input: R, output: &mut W, agent: &Agent) -> Result<()> {
    let header = Header::decode(&mut input)?;
    let cipher = cipher::resolve(&header.cipher_name, ScryptOptions::default())?;
    decrypt_with_cipher(input, output, agent, cipher.as_ref(), header)
}

/// The common core of decryption, parameterized the same way as
/// [`encrypt_with_cipher`]; the `edit` workflow uses this directly so
/// its tests don't need `openssl`/`scrypt` on `PATH`.
pub(crate) fn decrypt_with_cipher<R: BufRead, W: Write>(
    mut input: R,
    output: &mut W,
    agent: &Agent,
    cipher: &dyn Cipher,
    header: Header,
) -> Result<()> {
    let identities = agent.list_identities()?;
    let matched = identities
        .iter()
        .find(|id| selector_hash(&header.nonce, &id.blob) == header.selector_hash)
        .ok_or_else(|| {
            ShovelError::KeyMissing("no agent identity matches this file's missing key selector".into())
        })?;

    let passphrase = derive_passphrase(agent, matched, &header.nonce)?;
    cipher.decrypt(&mut input, output, &passphrase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::FingerprintHash;
    use crate::cipher::fake::XorCipher;
    use crate::testutil::FakeAgent;
    use std::io::BufReader;

    #[test]
    fn selector_hash_is_deterministic() {
        let nonce = generate_nonce();
        let blob = b"identity-blob".to_vec();
        assert_eq!(selector_hash(&nonce, &blob), selector_hash(&nonce, &blob));
    }

    #[test]
    fn round_trip_with_fake_agent_and_fake_cipher() {
        let (agent, identity) = FakeAgent::start(FingerprintHash::Sha256);
        let plaintext = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789".to_vec();

        let mut container = Vec::new();
        encrypt_with_cipher(
            &mut &plaintext[..],
            &mut container,
            agent.client(),
            &identity,
            "openssl",
            &XorCipher,
            generate_nonce(),
        )
        .unwrap();

        assert_eq!(&container[..15], crate::container::MAGIC);

        let mut reader = BufReader::new(&container[..]);
        let header = Header::decode(&mut reader).unwrap();
        let mut out = Vec::new();
        decrypt_with_cipher(reader, &mut out, agent.client(), &XorCipher, header).unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn key_missing_when_identity_removed() {
        let (agent, identity) = FakeAgent::start(FingerprintHash::Sha256);
        let plaintext = b"hello".to_vec();

        let mut container = Vec::new();
        encrypt_with_cipher(
            &mut &plaintext[..],
            &mut container,
            agent.client(),
            &identity,
            "openssl",
            &XorCipher,
            generate_nonce(),
        )
        .unwrap();

        agent.remove_identity(&identity);

        let mut out = Vec::new();
        let err = decrypt(BufReader::new(&container[..]), &mut out, agent.client()).unwrap_err();
        assert!(matches!(err, ShovelError::KeyMissing(_)));
        assert!(err.to_string().contains("missing key"));
    }
}
