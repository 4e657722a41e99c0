//! Argument parsing: positional `IN`/`OUT`, cipher/key selection, the
//! `--edit` workflow switch, and the `list-keys` subcommand.
use clap::{Parser, Subcommand};

use crate::agent::FingerprintHash;

#[derive(Parser, Debug)]
#[command(name = "sshovel")]
#[command(about = "Encrypt and decrypt files with a passphrase derived from an ssh-agent signature")]
#[command(long_about = "Encrypts or decrypts a file using a passphrase derived from an ssh-agent \
signature over a random nonce. The resulting file is self-describing: decryption does not need \
to be told which cipher or identity was used.\n\n\
Examples:\n  \
sshovel secret.txt secret.txt.enc\n  \
sshovel --cipher openssl secret.txt.enc secret.txt\n  \
sshovel --edit notes.txt.enc")]
pub struct Cli {
    /// Input path, or `-` for stdin. Unused with `--edit`.
    #[arg(value_name = "IN")]
    pub input: Option<String>,

    /// Output path, or `-` for stdout. Unused with `--edit`.
    #[arg(value_name = "OUT")]
    pub output: Option<String>,

    /// Cipher to use (default from `SSHOVEL_CIPHER`, else `scrypt`).
    #[arg(long, value_name = "NAME")]
    pub cipher: Option<String>,

    /// Select an identity whose comment contains this substring.
    /// Required to be a unique match among the agent's identities.
    #[arg(long, value_name = "MATCH")]
    pub key: Option<String>,

    /// Which hash to render a key's fingerprint with.
    #[arg(long, value_enum, default_value = "sha256")]
    pub fingerprint_hash: FingerprintHashArg,

    /// Run the in-place edit workflow against FILE instead of a plain
    /// encrypt/decrypt.
    #[arg(long, value_name = "FILE")]
    pub edit: Option<String>,

    /// Tuning flag forwarded verbatim to `scrypt enc` (repeatable).
    /// Ignored on decrypt and with ciphers other than `scrypt`.
    #[arg(long = "scrypt-opt", value_name = "OPT")]
    pub scrypt_opt: Vec<String>,

    /// Raise the log level; repeatable (`-v`, `-vv`, ...).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output but errors.
    #[arg(short, long)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the agent's identities (comment, algorithm, fingerprint).
    ListKeys,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum FingerprintHashArg {
    Md5,
    Sha256,
}

impl From<FingerprintHashArg> for FingerprintHash {
    fn from(arg: FingerprintHashArg) -> Self {
        match arg {
            FingerprintHashArg::Md5 => FingerprintHash::Md5,
            FingerprintHashArg::Sha256 => FingerprintHash::Sha256,
        }
    }
}

/// Resolves the cipher name from the CLI flag, falling back to
/// `SSHOVEL_CIPHER`, falling back to `scrypt`.
pub fn resolve_cipher_name(cli_value: Option<&str>) -> String {
    cli_value
        .map(str::to_string)
        .or_else(|| std::env::var("SSHOVEL_CIPHER").ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "scrypt".to_string())
}

/// Picks the unique identity whose comment contains `match_str`.
/// Zero or more than one match is a `UserError`.
pub fn select_identity<'a>(
    identities: &'a [crate::agent::Identity],
    match_str: &str,
) -> anyhow::Result<&'a crate::agent::Identity> {
    let matches: Vec<&crate::agent::Identity> = identities
        .iter()
        .filter(|id| id.comment.contains(match_str))
        .collect();
    match matches.len() {
        1 => Ok(matches[0]),
        0 => Err(anyhow::anyhow!(
            "no identity comment contains {match_str:?}"
        )),
        n => Err(anyhow::anyhow!(
            "{match_str:?} matches {n} identities; need exactly one"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Identity;

    fn identity(comment: &str) -> Identity {
        Identity {
            blob: vec![],
            comment: comment.to_string(),
            algorithm: "ssh-ed25519".into(),
            fingerprint: String::new(),
        }
    }

    #[test]
    fn unique_substring_match_is_selected() {
        let ids = vec![identity("work@laptop"), identity("personal@phone")];
        let selected = select_identity(&ids, "work").unwrap();
        assert_eq!(selected.comment, "work@laptop");
    }

    #[test]
    fn zero_matches_is_an_error() {
        let ids = vec![identity("work@laptop")];
        assert!(select_identity(&ids, "nonexistent").is_err());
    }

    #[test]
    fn exactly_two_matches_is_rejected() {
        let ids = vec![identity("work@laptop"), identity("work@desktop")];
        assert!(select_identity(&ids, "work").is_err());
    }

    #[test]
    fn cipher_name_falls_back_to_env_then_scrypt() {
        assert_eq!(resolve_cipher_name(Some("openssl")), "openssl");
    }
}
