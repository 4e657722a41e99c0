//! Drives the interactive `scrypt` CLI tool under a pseudo-terminal,
//! since it reads its passphrase from a terminal rather than a pipe.
use std::io::{Read, Write};
use std::time::Duration;

use super::Cipher;
use crate::error::{Result, ShovelError};
use crate::pty::PtyChild;

const PROMPT: &str = "passphrase: ";
const PROMPT_DEADLINE: Duration = Duration::from_secs(1);
const COPY_DEADLINE: Duration = Duration::from_secs(300);

/// Tuning flags forwarded verbatim to `scrypt enc` (e.g. `-t 2`, `-m
/// 64`). Decrypt takes no options: scrypt's own body format embeds
/// them.
#[derive(Debug, Clone, Default)]
pub struct ScryptOptions {
    pub encrypt_flags: Vec<String>,
}

pub struct ScryptCipher {
    options: ScryptOptions,
}

impl ScryptCipher {
    pub fn new(options: ScryptOptions) -> Self {
        Self { options }
    }
}

impl Cipher for ScryptCipher {
    fn encrypt(&self, input: &mut dyn Read, output: &mut dyn Write, passphrase: &str) -> Result<()> {
        let mut args: Vec<&str> = vec!["enc"];
        args.extend(self.options.encrypt_flags.iter().map(String::as_str));
        args.push("-");

        let mut child = PtyChild::spawn("scrypt", &args)?;
        let result = (|| {
            child.expect(PROMPT, PROMPT_DEADLINE)?;
            child.send(format!("{passphrase}\n").as_bytes())?;
            // scrypt re-prompts to confirm on encrypt.
            child.expect(PROMPT, PROMPT_DEADLINE)?;
            child.send(format!("{passphrase}\n").as_bytes())?;
            child.copy(input, output, COPY_DEADLINE)
        })();
        finish_checked(&mut child, result)
    }

    fn decrypt(&self, input: &mut dyn Read, output: &mut dyn Write, passphrase: &str) -> Result<()> {
        let mut child = PtyChild::spawn("scrypt", &["dec", "-"])?;
        let result = (|| {
            child.expect(PROMPT, PROMPT_DEADLINE)?;
            child.send(format!("{passphrase}\n").as_bytes())?;
            child.copy(input, output, COPY_DEADLINE)
        })();
        finish_checked(&mut child, result)
    }
}

/// Runs `finish()` regardless of whether `result` already failed, then
/// folds a non-zero exit into the error that's ultimately returned.
fn finish_checked(child: &mut PtyChild, result: Result<()>) -> Result<()> {
    let status = child.finish();
    result?;
    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(ShovelError::CipherFailure(format!(
            "scrypt exited with {status}"
        ))),
        Err(e) => Err(e),
    }
}
