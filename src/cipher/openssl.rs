//! Drives `openssl aes-256-cbc` as a non-interactive child process,
//! handing it the passphrase over an anonymous pipe rather than the
//! command line or a temp file.
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use nix::unistd;

use super::Cipher;
use crate::error::{Result, ShovelError};

/// The fixed fd number the passphrase pipe is duplicated onto inside
/// the child, referenced on the command line as `/dev/fd/<N>`.
const PASSPHRASE_FD: i32 = 3;

pub struct OpenSslCipher;

impl Cipher for OpenSslCipher {
    fn encrypt(&self, input: &mut dyn Read, output: &mut dyn Write, passphrase: &str) -> Result<()> {
        run(&["aes-256-cbc", "-a", "-salt"], input, output, passphrase)
    }

    fn decrypt(&self, input: &mut dyn Read, output: &mut dyn Write, passphrase: &str) -> Result<()> {
        run(&["aes-256-cbc", "-d", "-a"], input, output, passphrase)
    }
}

fn run(args: &[&str], input: &mut dyn Read, output: &mut dyn Write, passphrase: &str) -> Result<()> {
    let (read_end, write_end) = unistd::pipe()
        .map_err(|e| ShovelError::CipherFailure(format!("pipe() failed: {e}")))?;

    unistd::write(&write_end, passphrase.as_bytes())
        .map_err(|e| ShovelError::CipherFailure(format!("write passphrase: {e}")))?;
    drop(write_end); // child sees EOF after reading the passphrase

    let read_fd = read_end.as_raw_fd();
    let kfile = format!("/dev/fd/{PASSPHRASE_FD}");

    let mut cmd = Command::new("openssl");
    cmd.args(args).arg("-kfile").arg(&kfile);
    cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());

    // Safety: `pre_exec` runs in the forked child before exec, with no
    // other threads sharing its address space. `dup2` here only
    // duplicates `read_fd` onto `PASSPHRASE_FD`; it does not allocate
    // or touch anything the parent depends on afterward.
    unsafe {
        cmd.pre_exec(move || {
            nix::unistd::dup2(read_fd, PASSPHRASE_FD)
                .map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| ShovelError::CipherFailure(format!("spawn openssl: {e}")))?;
    drop(read_end); // the child now owns its own duplicate at fd 3

    // Pump stdin from a background thread: for inputs larger than the
    // pipe buffer, writing it all before reading any output would
    // deadlock against openssl's own output buffering.
    let mut child_stdin = child.stdin.take().expect("piped stdin");
    let mut buf = Vec::new();
    input
        .read_to_end(&mut buf)
        .map_err(|e| ShovelError::CipherFailure(format!("read input: {e}")))?;
    let writer = std::thread::spawn(move || -> std::io::Result<()> {
        child_stdin.write_all(&buf)?;
        Ok(())
    });

    let mut child_stdout = child.stdout.take().expect("piped stdout");
    let mut produced = Vec::new();
    child_stdout
        .read_to_end(&mut produced)
        .map_err(|e| ShovelError::CipherFailure(format!("read openssl stdout: {e}")))?;

    writer
        .join()
        .map_err(|_| ShovelError::CipherFailure("stdin writer thread panicked".into()))?
        .map_err(|e| ShovelError::CipherFailure(format!("write to openssl stdin: {e}")))?;

    let status = child
        .wait()
        .map_err(|e| ShovelError::CipherFailure(format!("wait for openssl: {e}")))?;

    if !status.success() {
        let mut stderr = String::new();
        if let Some(mut s) = child.stderr.take() {
            let _ = s.read_to_string(&mut stderr);
        }
        return Err(ShovelError::CipherFailure(format!(
            "openssl exited with {status}: {stderr}"
        )));
    }

    output
        .write_all(&produced)
        .map_err(|e| ShovelError::CipherFailure(format!("write output: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Requires a real `openssl` binary on PATH; the rest of the suite
    // exercises the engine against the dependency-free fake cipher
    // instead (see `cipher::fake`).
    #[test]
    #[ignore]
    fn round_trips_through_real_openssl() {
        let cipher = OpenSslCipher;
        let plaintext = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789".to_vec();
        let mut ciphertext = Vec::new();
        cipher
            .encrypt(&mut &plaintext[..], &mut ciphertext, "correct horse battery staple")
            .unwrap();
        assert!(!ciphertext.is_empty());

        let mut roundtripped = Vec::new();
        cipher
            .decrypt(
                &mut &ciphertext[..],
                &mut roundtripped,
                "correct horse battery staple",
            )
            .unwrap();
        assert_eq!(roundtripped, plaintext);
    }
}
