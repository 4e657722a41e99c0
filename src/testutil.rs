//! A fake ssh-agent used only by the test suite: a real `UnixListener`
//! speaking the genuine wire protocol, backed by an in-process
//! Ed25519 keypair, so signatures are truly deterministic without
//! requiring a real `ssh-agent` binary in CI.
#![cfg(test)]

use std::io::Write;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use ed25519_dalek::{Signer, SigningKey};
use rand_core::{OsRng, RngCore};

use crate::agent::{Agent, FingerprintHash, Identity};
use crate::codec::{Reader, Writer};

const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
const SSH_AGENTC_SIGN_REQUEST: u8 = 13;
const SSH_AGENT_SIGN_RESPONSE: u8 = 14;
const SSH_AGENT_FAILURE: u8 = 5;

fn ed25519_blob(verifying_key: &ed25519_dalek::VerifyingKey) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_string(b"ssh-ed25519");
    w.put_string(verifying_key.as_bytes());
    w.into_bytes()
}

pub struct FakeAgent {
    present: Arc<AtomicBool>,
    _handle: JoinHandle<()>,
}

impl FakeAgent {
    /// Spawns the fake agent on a fresh temp socket with a single
    /// Ed25519 identity, returning an `Agent` client bound to it and
    /// that identity's `Identity` struct.
    pub fn start(fingerprint_hash: FingerprintHash) -> (FakeAgentHandle, Identity) {
        let dir = tempfile::tempdir().expect("tempdir");
        let sock_path = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&sock_path).expect("bind fake agent socket");

        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();
        let blob = ed25519_blob(&verifying_key);
        let comment = "test@fake-agent".to_string();

        let present = Arc::new(AtomicBool::new(true));
        let present_for_thread = present.clone();
        let blob_for_thread = blob.clone();
        let comment_for_thread = comment.clone();

        let handle = std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                if serve_one(
                    stream,
                    &signing_key,
                    &blob_for_thread,
                    &comment_for_thread,
                    &present_for_thread,
                )
                .is_err()
                {
                    break;
                }
            }
        });

        let identity = Identity {
            blob: blob.clone(),
            comment,
            algorithm: "ssh-ed25519".to_string(),
            fingerprint: fingerprint_for_test(&blob, fingerprint_hash),
        };

        let client = Agent::new(sock_path.to_str().unwrap().to_string(), fingerprint_hash);

        let fake = FakeAgent {
            present,
            _handle: handle,
        };
        // The tempdir's socket must outlive the background thread; in
        // these short-lived tests it is simplest to leak it rather
        // than thread a guard through `FakeAgentHandle`.
        std::mem::forget(dir);

        (FakeAgentHandle { fake, client }, identity)
    }
}

fn fingerprint_for_test(blob: &[u8], hash: FingerprintHash) -> String {
    match hash {
        FingerprintHash::Sha256 => {
            use base64::engine::general_purpose::STANDARD_NO_PAD;
            use base64::Engine;
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(blob);
            format!("SHA256:{}", STANDARD_NO_PAD.encode(hasher.finalize()))
        }
        FingerprintHash::Md5 => {
            let digest = md5::compute(blob);
            let pairs: Vec<String> = digest.0.iter().map(|b| format!("{b:02x}")).collect();
            format!("MD5:{}", pairs.join(":"))
        }
    }
}

fn serve_one(
    mut stream: UnixStream,
    signing_key: &SigningKey,
    blob: &[u8],
    comment: &str,
    present: &AtomicBool,
) -> std::io::Result<()> {
    loop {
        let mut reader = Reader::new(&mut stream);
        let len = match reader.read_u32() {
            Ok(len) => len,
            Err(_) => return Ok(()),
        };
        let body = match reader.read_exact_bytes(len as usize) {
            Ok(b) => b,
            Err(_) => return Ok(()),
        };
        let mut body_reader = Reader::new(&body[..]);
        let msg_type = body_reader.read_u8().unwrap_or(0);

        let response = match msg_type {
            SSH_AGENTC_REQUEST_IDENTITIES => {
                let mut w = Writer::new();
                w.put_u8(SSH_AGENT_IDENTITIES_ANSWER);
                if present.load(Ordering::SeqCst) {
                    w.put_u32(1);
                    w.put_string(blob);
                    w.put_string(comment.as_bytes());
                } else {
                    w.put_u32(0);
                }
                w.framed()
            }
            SSH_AGENTC_SIGN_REQUEST => {
                let req_blob = body_reader.read_string().unwrap_or_default();
                let message = body_reader.read_string().unwrap_or_default();
                let _flags = body_reader.read_u32().unwrap_or(0);

                if !present.load(Ordering::SeqCst) || req_blob != blob {
                    let mut w = Writer::new();
                    w.put_u8(SSH_AGENT_FAILURE);
                    w.framed()
                } else {
                    let signature = signing_key.sign(&message);
                    let mut sig_wrapper = Writer::new();
                    sig_wrapper.put_string(b"ssh-ed25519");
                    sig_wrapper.put_string(&signature.to_bytes());

                    let mut w = Writer::new();
                    w.put_u8(SSH_AGENT_SIGN_RESPONSE);
                    w.put_string(&sig_wrapper.into_bytes());
                    w.framed()
                }
            }
            _ => {
                let mut w = Writer::new();
                w.put_u8(SSH_AGENT_FAILURE);
                w.framed()
            }
        };

        stream.write_all(&response)?;
        stream.flush()?;
    }
}

/// Owns the fake agent's background thread and an `Agent` client
/// bound to its socket.
pub struct FakeAgentHandle {
    fake: FakeAgent,
    client: Agent,
}

impl FakeAgentHandle {
    pub fn client(&self) -> &Agent {
        &self.client
    }

    /// Simulates removing the encryption identity from the agent, for
    /// the `KeyMissing` test scenario.
    pub fn remove_identity(&self, _identity: &Identity) {
        self.fake.present.store(false, Ordering::SeqCst);
    }
}
