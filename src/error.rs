//! The categorized error taxonomy shared by every component.
use thiserror::Error;

/// A categorized failure. Every leaf component returns this type (or a
/// `Result` wrapping it); only `main` turns a category into an exit code
/// and a one-line message.
#[derive(Debug, Error)]
pub enum ShovelError {
    #[error("ssh-agent unreachable: {0}")]
    AgentUnreachable(String),

    #[error("ssh-agent protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("missing key: {0}")]
    KeyMissing(String),

    #[error("cipher failed: {0}")]
    CipherFailure(String),

    #[error("timed out waiting for prompt {phrase:?} after {deadline_ms}ms")]
    PromptTimeout { phrase: String, deadline_ms: u64 },

    #[error("unexpected EOF while waiting for prompt {phrase:?}")]
    UnexpectedEOF { phrase: String },

    #[error("malformed sshovel container: {0}")]
    Malformed(String),

    #[error("refused to allocate: {0}")]
    Overflow(String),

    #[error("unknown cipher {0:?}")]
    UnknownCipher(String),

    #[error("{0}")]
    UserError(String),

    #[error("interrupted")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, ShovelError>;
