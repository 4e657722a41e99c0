//! Drives a child process under a pseudo-terminal: wait for a prompt
//! phrase with a deadline, send bytes, pump arbitrary I/O, wait for
//! exit. Used only by the interactive scrypt cipher.
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::{openpty, OpenptyResult};
use nix::sys::termios::{tcgetattr, SpecialCharacterIndices};
use nix::unistd;

use crate::error::{Result, ShovelError};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Spawned,
    PromptWait,
    Driving,
    Finished,
    Error,
}

/// A child process whose controlling terminal is the master side of a
/// freshly allocated pty.
pub struct PtyChild {
    master: OwnedFd,
    child: Child,
    state: State,
    exit_status: Option<std::process::ExitStatus>,
}

impl PtyChild {
    /// Spawns `program` with `args`, stdin/stdout/stderr attached to a
    /// new pty's slave side.
    pub fn spawn(program: &str, args: &[&str]) -> Result<Self> {
        let OpenptyResult { master, slave } = openpty(None, None)
            .map_err(|e| ShovelError::CipherFailure(format!("openpty failed: {e}")))?;

        set_nonblocking(&master)?;

        let slave_fd = slave.as_raw_fd();
        let slave_for_stdin = dup_slave(slave_fd)?;
        let slave_for_stdout = dup_slave(slave_fd)?;
        let slave_for_stderr = dup_slave(slave_fd)?;

        let child = Command::new(program)
            .args(args)
            .stdin(slave_for_stdin)
            .stdout(slave_for_stdout)
            .stderr(slave_for_stderr)
            .spawn()
            .map_err(|e| ShovelError::CipherFailure(format!("spawn {program} failed: {e}")))?;

        // The slave fd is only needed by the child; drop our copy once
        // spawned so EOF propagates correctly when the child exits.
        drop(slave);

        Ok(Self {
            master,
            child,
            state: State::Spawned,
            exit_status: None,
        })
    }

    /// Reads from the terminal until `phrase` appears as a substring of
    /// the accumulated buffer, `timeout` elapses (`PromptTimeout`), or
    /// the terminal yields EOF (`UnexpectedEOF`).
    pub fn expect(&mut self, phrase: &str, timeout: Duration) -> Result<()> {
        self.state = State::PromptWait;
        let deadline = Instant::now() + timeout;
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match read_nonblocking(&self.master, &mut chunk) {
                Ok(0) => {
                    self.state = State::Error;
                    return Err(ShovelError::UnexpectedEOF {
                        phrase: phrase.to_string(),
                    });
                }
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if String::from_utf8_lossy(&buf).contains(phrase) {
                        return Ok(());
                    }
                }
                Err(WouldBlockOr::WouldBlock) => {
                    if Instant::now() >= deadline {
                        self.state = State::Error;
                        return Err(ShovelError::PromptTimeout {
                            phrase: phrase.to_string(),
                            deadline_ms: timeout.as_millis() as u64,
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(WouldBlockOr::Other(e)) => {
                    self.state = State::Error;
                    return Err(ShovelError::CipherFailure(format!("pty read failed: {e}")));
                }
            }
            if Instant::now() >= deadline {
                self.state = State::Error;
                return Err(ShovelError::PromptTimeout {
                    phrase: phrase.to_string(),
                    deadline_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    /// Writes `bytes` to the terminal.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.state = State::Driving;
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let n = unistd::write(&self.master, remaining)
                .map_err(|e| ShovelError::CipherFailure(format!("pty write failed: {e}")))?;
            remaining = &remaining[n..];
        }
        Ok(())
    }

    /// Copies all bytes from `input` to the terminal, then all bytes
    /// from the terminal to `output`, until the child side reaches
    /// EOF, capped by `timeout`.
    pub fn copy<I: Read, O: Write>(
        &mut self,
        mut input: I,
        mut output: O,
        timeout: Duration,
    ) -> Result<()> {
        self.state = State::Driving;
        let mut inbuf = [0u8; 8192];
        loop {
            let n = input
                .read(&mut inbuf)
                .map_err(|e| ShovelError::CipherFailure(format!("read input: {e}")))?;
            if n == 0 {
                break;
            }
            self.send(&inbuf[..n])?;
        }

        // The slave is in canonical mode: the child's `read()` on its
        // stdin only unblocks with 0 once it sees the line discipline's
        // VEOF character, not merely because we stopped writing.
        self.send(&[veof_char(&self.master)?])?;

        let deadline = Instant::now() + timeout;
        let mut outbuf = [0u8; 8192];
        loop {
            match read_nonblocking(&self.master, &mut outbuf) {
                Ok(0) => break,
                Ok(n) => {
                    output
                        .write_all(&outbuf[..n])
                        .map_err(|e| ShovelError::CipherFailure(format!("write output: {e}")))?;
                }
                Err(WouldBlockOr::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(ShovelError::PromptTimeout {
                            phrase: "<eof>".into(),
                            deadline_ms: timeout.as_millis() as u64,
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(WouldBlockOr::Other(e)) => {
                    return Err(ShovelError::CipherFailure(format!("pty read failed: {e}")));
                }
            }
        }
        Ok(())
    }

    /// Closes the terminal and waits for the child, returning its exit
    /// status. Idempotent: calling it more than once returns the first
    /// observed status.
    pub fn finish(&mut self) -> Result<std::process::ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        self.state = State::Finished;
        let status = self
            .child
            .wait()
            .map_err(|e| ShovelError::CipherFailure(format!("wait failed: {e}")))?;
        self.exit_status = Some(status);
        Ok(status)
    }
}

impl Drop for PtyChild {
    fn drop(&mut self) {
        if self.exit_status.is_none() {
            let _ = self.child.wait();
        }
    }
}

enum WouldBlockOr<E> {
    WouldBlock,
    Other(E),
}

fn read_nonblocking(fd: &OwnedFd, buf: &mut [u8]) -> std::result::Result<usize, WouldBlockOr<nix::Error>> {
    match unistd::read(fd.as_raw_fd(), buf) {
        Ok(n) => Ok(n),
        Err(nix::Error::EAGAIN) => Err(WouldBlockOr::WouldBlock),
        Err(e) => Err(WouldBlockOr::Other(e)),
    }
}

/// The terminal's configured end-of-file control character (`Ctrl-D`
/// by default), read off the pty rather than hardcoded.
fn veof_char(fd: &OwnedFd) -> Result<u8> {
    let termios = tcgetattr(fd).map_err(|e| ShovelError::CipherFailure(format!("tcgetattr failed: {e}")))?;
    Ok(termios.control_chars[SpecialCharacterIndices::VEOF as usize])
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)
        .map_err(|e| ShovelError::CipherFailure(format!("fcntl(F_GETFL) failed: {e}")))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags))
        .map_err(|e| ShovelError::CipherFailure(format!("fcntl(F_SETFL) failed: {e}")))?;
    Ok(())
}

fn dup_slave(slave_fd: i32) -> Result<Stdio> {
    let dup = unistd::dup(slave_fd)
        .map_err(|e| ShovelError::CipherFailure(format!("dup(slave) failed: {e}")))?;
    // Safety: `dup` just handed us a freshly duplicated, uniquely owned fd.
    Ok(unsafe { Stdio::from_raw_fd(dup) })
}
