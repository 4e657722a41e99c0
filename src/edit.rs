//! The `--edit` workflow: decide whether a path is new, plaintext, or
//! already a shovel container, round-trip it through an editor, and
//! re-encrypt according to the rules for each starting state.
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::agent::{Agent, Identity};
use crate::cipher::{self, Cipher, ScryptOptions};
use crate::container::{is_shovel_stream, Header};
use crate::engine;
use crate::error::{Result, ShovelError};

/// Resolves a cipher name to an implementation. Production wires this
/// to the real registry (`cipher::resolve`); the test suite substitutes
/// one that always hands back a dependency-free fake, so the whole
/// state machine is exercisable without `openssl`/`scrypt` on `PATH`.
trait CipherResolver {
    fn resolve(&self, name: &str, scrypt_options: ScryptOptions) -> Result<Box<dyn Cipher>>;
}

struct RegistryResolver;

impl CipherResolver for RegistryResolver {
    fn resolve(&self, name: &str, scrypt_options: ScryptOptions) -> Result<Box<dyn Cipher>> {
        cipher::resolve(name, scrypt_options)
    }
}

/// Invokes the user's editor against a path on disk. The real
/// implementation shells out to `$EDITOR`; the test suite substitutes
/// a closure that mutates the tempfile directly, standing in for an
/// interactive process.
pub trait Editor {
    fn edit(&self, path: &Path) -> Result<()>;
}

/// Launches `editor_cmd path` and waits for it to exit.
pub struct CommandEditor {
    pub editor_cmd: String,
}

impl Editor for CommandEditor {
    fn edit(&self, path: &Path) -> Result<()> {
        let status = std::process::Command::new(&self.editor_cmd)
            .arg(path)
            .status()
            .map_err(|e| ShovelError::UserError(format!("spawn editor {}: {e}", self.editor_cmd)))?;
        if !status.success() {
            return Err(ShovelError::UserError(format!(
                "editor {} exited with {status}",
                self.editor_cmd
            )));
        }
        Ok(())
    }
}

/// The state a target path is in before editing starts.
#[derive(Debug)]
enum State {
    NewFile,
    PlaintextExisting,
    CiphertextExisting { header: Header },
}

fn inspect(path: &Path) -> Result<State> {
    if !path.exists() {
        return Ok(State::NewFile);
    }
    let file = fs::File::open(path).map_err(|e| ShovelError::UserError(format!("open {path:?}: {e}")))?;
    let mut reader = BufReader::new(file);
    if !is_shovel_stream(&mut reader)? {
        return Ok(State::PlaintextExisting);
    }
    let header = Header::decode(&mut reader)?;
    Ok(State::CiphertextExisting { header })
}

/// Owns a scratch directory holding the plaintext tempfile the editor
/// operates on; removed on every exit path, success or failure.
pub struct TempWorkspace {
    dir: tempfile::TempDir,
}

impl TempWorkspace {
    fn new() -> Result<Self> {
        let dir = tempfile::tempdir()
            .map_err(|e| ShovelError::UserError(format!("create tempdir: {e}")))?;
        Ok(Self { dir })
    }

    fn file_path(&self) -> PathBuf {
        self.dir.path().join("plaintext")
    }
}

/// Runs the edit workflow against `path`, using `cipher_name` and
/// `scrypt_options` for any re-encryption this invocation performs.
pub fn run(
    path: &Path,
    agent: &Agent,
    identity: &Identity,
    cipher_name: &str,
    scrypt_options: ScryptOptions,
    editor: &dyn Editor,
) -> Result<()> {
    run_with_resolver(path, agent, identity, cipher_name, scrypt_options, editor, &RegistryResolver)
}

fn run_with_resolver(
    path: &Path,
    agent: &Agent,
    identity: &Identity,
    cipher_name: &str,
    scrypt_options: ScryptOptions,
    editor: &dyn Editor,
    resolver: &dyn CipherResolver,
) -> Result<()> {
    let state = inspect(path)?;
    let workspace = TempWorkspace::new()?;
    let tmp_path = workspace.file_path();

    match state {
        State::NewFile => {
            debug!("edit: {path:?} does not exist, starting from an empty tempfile");
            fs::File::create(&tmp_path)
                .map_err(|e| ShovelError::UserError(format!("create {tmp_path:?}: {e}")))?;
            editor.edit(&tmp_path)?;
            let plaintext = fs::read(&tmp_path)
                .map_err(|e| ShovelError::UserError(format!("read {tmp_path:?}: {e}")))?;
            if plaintext.is_empty() {
                info!("edit: nothing written, leaving {path:?} absent");
                return Ok(());
            }
            let cipher = resolver.resolve(cipher_name, scrypt_options)?;
            encrypt_fresh(&plaintext, path, agent, identity, cipher_name, cipher.as_ref())
        }
        State::PlaintextExisting => {
            debug!("edit: {path:?} is plaintext, converting to a shovel container");
            fs::copy(path, &tmp_path)
                .map_err(|e| ShovelError::UserError(format!("copy {path:?}: {e}")))?;
            editor.edit(&tmp_path)?;
            let plaintext = fs::read(&tmp_path)
                .map_err(|e| ShovelError::UserError(format!("read {tmp_path:?}: {e}")))?;
            // Conversion from plaintext is itself a change; re-encrypt
            // unconditionally, even if the editor left the bytes alone.
            let cipher = resolver.resolve(cipher_name, scrypt_options)?;
            encrypt_fresh(&plaintext, path, agent, identity, cipher_name, cipher.as_ref())
        }
        State::CiphertextExisting { header } => {
            debug!("edit: {path:?} is already a shovel container, decrypting to tempfile");
            let file = fs::File::open(path).map_err(|e| ShovelError::UserError(format!("open {path:?}: {e}")))?;
            let reader = BufReader::new(file);
            let mut plaintext_before = Vec::new();
            // Decrypt with the cipher the container itself records, not
            // `cipher_name`: the format is self-describing, and a file
            // encrypted under one cipher must stay readable even if the
            // caller's `--cipher` flag now names a different one.
            let decrypt_cipher = resolver.resolve(&header.cipher_name, ScryptOptions::default())?;
            engine::decrypt_with_cipher(reader, &mut plaintext_before, agent, decrypt_cipher.as_ref(), header.clone())?;

            fs::write(&tmp_path, &plaintext_before)
                .map_err(|e| ShovelError::UserError(format!("write {tmp_path:?}: {e}")))?;
            editor.edit(&tmp_path)?;
            let plaintext_after = fs::read(&tmp_path)
                .map_err(|e| ShovelError::UserError(format!("read {tmp_path:?}: {e}")))?;

            if plaintext_after == plaintext_before {
                info!("edit: {path:?} unchanged, skipping re-encryption");
                return Ok(());
            }

            // Reuse the container's original nonce: the passphrase is
            // unchanged, and the cipher body differs only by its own
            // random salt, so the selector hash stays stable.
            let encrypt_cipher = resolver.resolve(cipher_name, scrypt_options)?;
            let mut out = Vec::new();
            engine::encrypt_with_cipher(
                &mut &plaintext_after[..],
                &mut out,
                agent,
                identity,
                cipher_name,
                encrypt_cipher.as_ref(),
                header.nonce,
            )?;
            fs::write(path, &out).map_err(|e| ShovelError::UserError(format!("write {path:?}: {e}")))
        }
    }
}

fn encrypt_fresh(
    plaintext: &[u8],
    path: &Path,
    agent: &Agent,
    identity: &Identity,
    cipher_name: &str,
    cipher: &dyn Cipher,
) -> Result<()> {
    let mut out = Vec::new();
    engine::encrypt_with_cipher(
        &mut &plaintext[..],
        &mut out,
        agent,
        identity,
        cipher_name,
        cipher,
        engine::generate_nonce(),
    )?;
    fs::write(path, &out).map_err(|e| ShovelError::UserError(format!("write {path:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::FingerprintHash;
    use crate::container::NONCE_LEN;
    use crate::testutil::FakeAgent;

    struct AppendEditor(&'static [u8]);
    impl Editor for AppendEditor {
        fn edit(&self, path: &Path) -> Result<()> {
            let mut existing = fs::read(path).unwrap_or_default();
            existing.extend_from_slice(self.0);
            fs::write(path, existing).unwrap();
            Ok(())
        }
    }

    struct NoopEditor;
    impl Editor for NoopEditor {
        fn edit(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn fake_cipher_name_round_trip_setup() -> (crate::testutil::FakeAgentHandle, Identity, tempfile::TempDir) {
        let (agent, identity) = FakeAgent::start(FingerprintHash::Sha256);
        let dir = tempfile::tempdir().unwrap();
        (agent, identity, dir)
    }

    /// Always hands back `cipher::fake::XorCipher`, regardless of the
    /// name asked for, so the edit state machine is fully exercisable
    /// without `openssl`/`scrypt` on `PATH`.
    struct FakeResolver;
    impl CipherResolver for FakeResolver {
        fn resolve(&self, _name: &str, _scrypt_options: ScryptOptions) -> Result<Box<dyn Cipher>> {
            Ok(Box::new(crate::cipher::fake::XorCipher))
        }
    }

    fn run_fake(path: &Path, agent: &Agent, identity: &Identity, editor: &dyn Editor) -> Result<()> {
        run_with_resolver(path, agent, identity, "openssl", ScryptOptions::default(), editor, &FakeResolver)
    }

    #[test]
    fn s4_edit_in_place_on_plaintext_fake_cipher() {
        let (agent, identity, dir) = fake_cipher_name_round_trip_setup();
        let path = dir.path().join("file.txt");
        fs::write(&path, b"original").unwrap();
        let editor = AppendEditor(b"DATA");
        run_fake(&path, agent.client(), &identity, &editor).unwrap();
        assert!(fs::read(&path).unwrap().starts_with(crate::container::MAGIC));
    }

    #[test]
    fn s7_new_file_edit_fake_cipher() {
        let (agent, identity, dir) = fake_cipher_name_round_trip_setup();
        let path = dir.path().join("new.txt");
        let editor = AppendEditor(b"DATA");
        run_fake(&path, agent.client(), &identity, &editor).unwrap();
        assert!(path.exists());
        assert!(fs::read(&path).unwrap().starts_with(crate::container::MAGIC));
    }

    #[test]
    fn s5_noop_edit_on_ciphertext_leaves_file_untouched() {
        let (agent, identity, dir) = fake_cipher_name_round_trip_setup();
        let path = dir.path().join("file.enc");

        run_fake(&path, agent.client(), &identity, &AppendEditor(b"secret payload")).unwrap();
        let bytes_before = fs::read(&path).unwrap();
        let mtime_before = fs::metadata(&path).unwrap().modified().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(1100));
        run_fake(&path, agent.client(), &identity, &NoopEditor).unwrap();

        let bytes_after = fs::read(&path).unwrap();
        let mtime_after = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(bytes_before, bytes_after);
        assert_eq!(mtime_before, mtime_after);
    }

    #[test]
    fn s6_noop_edit_on_plaintext_still_reencrypts() {
        let (agent, identity, dir) = fake_cipher_name_round_trip_setup();
        let path = dir.path().join("file.txt");
        fs::write(&path, b"plain data, never touched by the editor").unwrap();
        let mtime_before = fs::metadata(&path).unwrap().modified().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(1100));
        run_fake(&path, agent.client(), &identity, &NoopEditor).unwrap();

        let bytes_after = fs::read(&path).unwrap();
        let mtime_after = fs::metadata(&path).unwrap().modified().unwrap();
        assert!(bytes_after.starts_with(crate::container::MAGIC));
        assert!(mtime_after > mtime_before);
    }

    // These scenarios drive `run()` against the real cipher registry,
    // which requires the `openssl`/`scrypt` binaries; they are ignored
    // by default and exist to exercise the workflow end to end when
    // those binaries happen to be present. The fake-cipher variants
    // above give the same coverage without that dependency.
    #[test]
    #[ignore]
    fn s4_edit_in_place_on_plaintext() {
        let (agent, identity, dir) = fake_cipher_name_round_trip_setup();
        let path = dir.path().join("file.txt");
        fs::write(&path, b"original").unwrap();
        let editor = AppendEditor(b"DATA");
        run(&path, agent.client(), &identity, "openssl", ScryptOptions::default(), &editor).unwrap();
        assert!(fs::read(&path).unwrap().starts_with(crate::container::MAGIC));
    }

    #[test]
    #[ignore]
    fn s7_new_file_edit() {
        let (agent, identity, dir) = fake_cipher_name_round_trip_setup();
        let path = dir.path().join("new.txt");
        let editor = AppendEditor(b"DATA");
        run(&path, agent.client(), &identity, "openssl", ScryptOptions::default(), &editor).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn new_file_with_empty_write_leaves_path_absent() {
        let (agent, identity, dir) = fake_cipher_name_round_trip_setup();
        let path = dir.path().join("untouched.txt");
        let editor = NoopEditor;
        run(&path, agent.client(), &identity, "openssl", ScryptOptions::default(), &editor).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn inspect_classifies_new_plaintext_and_ciphertext() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(matches!(inspect(&missing).unwrap(), State::NewFile));

        let plain = dir.path().join("plain");
        fs::write(&plain, b"hello").unwrap();
        assert!(matches!(inspect(&plain).unwrap(), State::PlaintextExisting));

        let header = Header {
            cipher_name: "openssl".into(),
            nonce: vec![0x7a; NONCE_LEN],
            selector_hash: vec![0x11; 20],
        };
        let cipher_path = dir.path().join("cipher");
        let mut bytes = header.encode().unwrap();
        bytes.extend_from_slice(b"opaque-cipher-body");
        fs::write(&cipher_path, &bytes).unwrap();
        assert!(matches!(
            inspect(&cipher_path).unwrap(),
            State::CiphertextExisting { .. }
        ));
    }
}
