//! The ssh-agent wire-protocol client: connects to `SSH_AUTH_SOCK`,
//! lists identities, and asks the agent to sign a message.
use std::io::{Cursor, Write};
use std::os::unix::net::UnixStream;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::codec::{Reader, Writer};
use crate::error::{Result, ShovelError};

const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
const SSH_AGENTC_SIGN_REQUEST: u8 = 13;
const SSH_AGENT_SIGN_RESPONSE: u8 = 14;
const SSH_AGENT_FAILURE: u8 = 5;

/// Signature-request flags, straight from the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignFlags(pub u32);

impl SignFlags {
    pub const NONE: SignFlags = SignFlags(0);
    pub const RSA_SHA2_256: SignFlags = SignFlags(2);
    pub const RSA_SHA2_512: SignFlags = SignFlags(4);
}

/// Which hash the CLI renders a key's fingerprint with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintHash {
    Md5,
    Sha256,
}

/// A public key offered by the agent, plus the metadata needed to
/// display and select it.
#[derive(Debug, Clone)]
pub struct Identity {
    pub blob: Vec<u8>,
    pub comment: String,
    pub algorithm: String,
    pub fingerprint: String,
}

impl Identity {
    fn from_wire(blob: Vec<u8>, comment: Vec<u8>, hash: FingerprintHash) -> Result<Self> {
        let algorithm = parse_algorithm(&blob)?;
        let fingerprint = fingerprint(&blob, hash);
        Ok(Self {
            blob,
            comment: String::from_utf8_lossy(&comment).into_owned(),
            algorithm,
            fingerprint,
        })
    }

    /// The flag set the core uses when asking the agent to sign with
    /// this identity: `rsa-sha2-512` for RSA keys, `NONE` otherwise.
    pub fn sign_flags(&self) -> SignFlags {
        if self.algorithm == "ssh-rsa" {
            SignFlags::RSA_SHA2_512
        } else {
            SignFlags::NONE
        }
    }
}

fn parse_algorithm(blob: &[u8]) -> Result<String> {
    let mut r = Reader::new(blob);
    let name = r
        .read_string()
        .map_err(|_| ShovelError::ProtocolViolation("key blob missing algorithm field".into()))?;
    Ok(String::from_utf8_lossy(&name).into_owned())
}

fn fingerprint(blob: &[u8], hash: FingerprintHash) -> String {
    match hash {
        FingerprintHash::Md5 => {
            let digest = md5::compute(blob);
            let hex_pairs: Vec<String> = digest.0.iter().map(|b| format!("{b:02x}")).collect();
            format!("MD5:{}", hex_pairs.join(":"))
        }
        FingerprintHash::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(blob);
            format!("SHA256:{}", STANDARD_NO_PAD.encode(hasher.finalize()))
        }
    }
}

/// A client bound to a single ssh-agent socket path.
pub struct Agent {
    sock_path: String,
    fingerprint_hash: FingerprintHash,
}

impl Agent {
    /// Binds a client directly to `sock_path`, bypassing environment
    /// discovery. Used by `from_env` and by the test suite's fake
    /// agent, which needs a client bound to a temp socket.
    pub fn new(sock_path: String, fingerprint_hash: FingerprintHash) -> Self {
        Self {
            sock_path,
            fingerprint_hash,
        }
    }

    /// Resolves `SSH_AUTH_SOCK`. An unset variable and a set-but-empty
    /// one are both `AgentUnreachable` — never a panic.
    pub fn from_env(fingerprint_hash: FingerprintHash) -> Result<Self> {
        let path = std::env::var("SSH_AUTH_SOCK").unwrap_or_default();
        if path.is_empty() {
            return Err(ShovelError::AgentUnreachable(
                "SSH_AUTH_SOCK is not set".into(),
            ));
        }
        Ok(Self::new(path, fingerprint_hash))
    }

    fn connect(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.sock_path).map_err(|e| {
            ShovelError::AgentUnreachable(format!("connect {}: {e}", self.sock_path))
        })
    }

    /// `SSH_AGENTC_REQUEST_IDENTITIES` -> `Vec<Identity>`.
    pub fn list_identities(&self) -> Result<Vec<Identity>> {
        let stream = self.connect()?;
        let mut request = Writer::new();
        request.put_u8(SSH_AGENTC_REQUEST_IDENTITIES);
        let mut body = send_and_read(stream, &request.framed())?;

        let msg_type = body.read_u8().map_err(as_protocol_violation)?;
        if msg_type != SSH_AGENT_IDENTITIES_ANSWER {
            return Err(ShovelError::ProtocolViolation(format!(
                "expected identities answer (12), got {msg_type}"
            )));
        }

        let count = body.read_u32().map_err(as_protocol_violation)?;
        let mut identities = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let blob = body.read_string().map_err(as_protocol_violation)?;
            let comment = body.read_string().map_err(as_protocol_violation)?;
            identities.push(Identity::from_wire(blob, comment, self.fingerprint_hash)?);
        }
        Ok(identities)
    }

    /// `SSH_AGENTC_SIGN_REQUEST` -> `None` on an explicit agent failure,
    /// `Some(signature bytes)` otherwise.
    pub fn sign(&self, blob: &[u8], message: &[u8], flags: SignFlags) -> Result<Option<Vec<u8>>> {
        let stream = self.connect()?;
        let mut request = Writer::new();
        request
            .put_u8(SSH_AGENTC_SIGN_REQUEST)
            .put_string(blob)
            .put_string(message)
            .put_u32(flags.0);
        let mut body = send_and_read(stream, &request.framed())?;

        let msg_type = body.read_u8().map_err(as_protocol_violation)?;
        if msg_type == SSH_AGENT_FAILURE {
            return Ok(None);
        }
        if msg_type != SSH_AGENT_SIGN_RESPONSE {
            return Err(ShovelError::ProtocolViolation(format!(
                "expected sign response (14), got {msg_type}"
            )));
        }

        // This is the outer `string` wrapper's own length, not a
        // separate field; the two inner strings are self-delimiting,
        // so it is read and discarded.
        let _wrapper_len = body.read_u32().map_err(as_protocol_violation)?;
        let _format_tag = body.read_string().map_err(as_protocol_violation)?;
        let signature = body.read_string().map_err(as_protocol_violation)?;
        Ok(Some(signature))
    }
}

/// Writes a framed request over `stream`, reads the response's outer
/// length, and returns a `Reader` over just the response payload.
fn send_and_read(mut stream: UnixStream, framed_request: &[u8]) -> Result<Reader<Cursor<Vec<u8>>>> {
    stream
        .write_all(framed_request)
        .map_err(|e| ShovelError::AgentUnreachable(format!("write: {e}")))?;
    stream
        .flush()
        .map_err(|e| ShovelError::AgentUnreachable(format!("flush: {e}")))?;

    let mut reader = Reader::new(stream);
    let len = reader.read_u32().map_err(as_protocol_violation)?;
    let payload = reader.read_exact_bytes(len as usize).map_err(as_protocol_violation)?;
    Ok(Reader::new(Cursor::new(payload)))
}

/// `codec::Reader` raises the generic `Malformed`/`Overflow` categories;
/// at the agent-protocol boundary a short or oversized read is always a
/// protocol violation, not a container-parsing concern, so it is
/// recategorized here.
fn as_protocol_violation(e: ShovelError) -> ShovelError {
    match e {
        ShovelError::Malformed(msg) | ShovelError::Overflow(msg) => ShovelError::ProtocolViolation(msg),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rsa_algorithm_from_blob() {
        let mut w = Writer::new();
        w.put_string(b"ssh-rsa").put_string(b"rest-of-the-blob-is-opaque");
        let algo = parse_algorithm(&w.into_bytes()).unwrap();
        assert_eq!(algo, "ssh-rsa");
    }

    #[test]
    fn sign_flags_pick_rsa_sha2_512_for_rsa_only() {
        let rsa = Identity {
            blob: vec![],
            comment: String::new(),
            algorithm: "ssh-rsa".into(),
            fingerprint: String::new(),
        };
        let ed25519 = Identity {
            algorithm: "ssh-ed25519".into(),
            ..rsa.clone()
        };
        assert_eq!(rsa.sign_flags(), SignFlags::RSA_SHA2_512);
        assert_eq!(ed25519.sign_flags(), SignFlags::NONE);
    }

    #[test]
    fn sha256_fingerprint_has_no_padding() {
        let f = fingerprint(b"some-key-material", FingerprintHash::Sha256);
        assert!(f.starts_with("SHA256:"));
        assert!(!f.contains('='));
    }

    #[test]
    fn codec_errors_are_recategorized_as_protocol_violations() {
        assert!(matches!(
            as_protocol_violation(ShovelError::Malformed("short read".into())),
            ShovelError::ProtocolViolation(_)
        ));
        assert!(matches!(
            as_protocol_violation(ShovelError::Overflow("too long".into())),
            ShovelError::ProtocolViolation(_)
        ));
        assert!(matches!(
            as_protocol_violation(ShovelError::AgentUnreachable("gone".into())),
            ShovelError::AgentUnreachable(_)
        ));
    }

    #[test]
    fn truncated_response_is_protocol_violation() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("agent.sock");
        let listener = std::os::unix::net::UnixListener::bind(&sock_path).unwrap();
        let server = std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                // Claims a 100-byte body, then supplies only 2 bytes.
                let _ = stream.write_all(&[0, 0, 0, 100, 0xaa, 0xbb]);
            }
        });

        let agent = Agent::new(sock_path.to_str().unwrap().to_string(), FingerprintHash::Sha256);
        let err = agent.list_identities().unwrap_err();
        assert!(matches!(err, ShovelError::ProtocolViolation(_)));
        server.join().unwrap();
    }

    #[test]
    fn md5_fingerprint_is_colon_separated_hex() {
        let f = fingerprint(b"some-key-material", FingerprintHash::Md5);
        assert!(f.starts_with("MD5:"));
        assert_eq!(f.trim_start_matches("MD5:").split(':').count(), 16);
    }
}
