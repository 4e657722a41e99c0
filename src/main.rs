use std::io::{self, BufReader, IsTerminal, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use log::{debug, error, info};

use sshovel::agent::Agent;
use sshovel::cipher::ScryptOptions;
use sshovel::cli::{resolve_cipher_name, select_identity, Cli, Commands};
use sshovel::container::is_shovel_stream;
use sshovel::edit::{self, CommandEditor};
use sshovel::engine;
use sshovel::error::ShovelError;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    use nix::sys::signal::{signal, SigHandler, Signal};
    // Safety: `on_signal` only stores to an atomic, which is
    // async-signal-safe; no other signal-unsafe work happens here.
    unsafe {
        let _ = signal(Signal::SIGINT, SigHandler::Handler(on_signal));
        let _ = signal(Signal::SIGQUIT, SigHandler::Handler(on_signal));
    }
}

fn check_interrupted() -> Result<(), ShovelError> {
    if INTERRUPTED.load(Ordering::SeqCst) {
        return Err(ShovelError::Interrupted);
    }
    Ok(())
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    install_signal_handlers();

    if let Err(err) = run(cli) {
        error!("{err}");
        eprintln!("sshovel: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let fingerprint_hash = cli.fingerprint_hash.into();
    let agent = Agent::from_env(fingerprint_hash)?;

    if let Some(Commands::ListKeys) = cli.command {
        let identities = agent.list_identities()?;
        for id in &identities {
            println!("{}  {}  {}", id.fingerprint, id.algorithm, id.comment);
        }
        return Ok(());
    }

    let cipher_name = resolve_cipher_name(cli.cipher.as_deref());
    let scrypt_options = ScryptOptions {
        encrypt_flags: cli.scrypt_opt.clone(),
    };

    if let Some(edit_path) = &cli.edit {
        check_interrupted()?;
        let identities = agent.list_identities()?;
        let identity = match &cli.key {
            Some(match_str) => select_identity(&identities, match_str)?.clone(),
            None => identities
                .into_iter()
                .next()
                .ok_or_else(|| ShovelError::KeyMissing("missing key: agent has no identities".into()))?,
        };
        let editor_cmd = std::env::var("EDITOR").unwrap_or_else(|_| "nano".to_string());
        info!("edit: using editor {editor_cmd:?}, cipher {cipher_name:?}");
        edit::run(
            Path::new(edit_path),
            &agent,
            &identity,
            &cipher_name,
            scrypt_options,
            &CommandEditor { editor_cmd },
        )?;
        return Ok(());
    }

    let input_arg = cli.input.as_deref().unwrap_or("-");
    let output_arg = cli.output.as_deref().unwrap_or("-");

    check_interrupted()?;
    let mut input = open_input(input_arg)?;
    let mut buffered = BufReader::new(&mut input);
    let decrypting = is_shovel_stream(&mut buffered)?;

    if decrypting {
        debug!("input begins with the container magic, decrypting");
        let mut output = open_output(output_arg)?;
        engine::decrypt(buffered, &mut output, &agent)?;
        output.flush()?;
    } else {
        debug!("input has no container magic, encrypting");
        let identities = agent.list_identities()?;
        let identity = match &cli.key {
            Some(match_str) => select_identity(&identities, match_str)?.clone(),
            None => identities
                .into_iter()
                .next()
                .ok_or_else(|| ShovelError::KeyMissing("missing key: agent has no identities".into()))?,
        };
        let mut output = open_output(output_arg)?;
        engine::encrypt(
            &mut buffered,
            &mut output,
            &agent,
            &identity,
            &cipher_name,
            scrypt_options,
        )?;
        output.flush()?;
    }

    check_interrupted()?;
    Ok(())
}

fn open_input(path: &str) -> anyhow::Result<Box<dyn Read>> {
    if path == "-" {
        if io::stdin().is_terminal() {
            debug!("reading plaintext from an interactive terminal");
        }
        Ok(Box::new(io::stdin()))
    } else {
        Ok(Box::new(std::fs::File::open(path)?))
    }
}

fn open_output(path: &str) -> anyhow::Result<Box<dyn Write>> {
    if path == "-" {
        Ok(Box::new(io::stdout()))
    } else {
        Ok(Box::new(std::fs::File::create(path)?))
    }
}
