//! dtn-agent - Command-line front end for the transfer tool engine.
//!
//! Drives one end of a transfer (or a loopback pair) for manual use and
//! testing. Results are printed to stdout as JSON; logs go to stderr.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use dtn_engine::{
    compute_checksum, verify_transfer, AgentConfig, ChecksumAlgorithm, EngineError, LaunchDescriptor,
    Orchestrator, Role, SessionKey, TransferResult,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Address a loopback receiver connects to when none is given
const LOOPBACK: &str = "127.0.0.1";

/// dtn-agent - run data transfer tools as supervised sessions
#[derive(Parser, Debug)]
#[command(name = "dtn-agent")]
#[command(version = "0.1.0")]
#[command(about = "Run and supervise data transfer tools on a transfer node")]
struct Args {
    /// Agent configuration file (JSON)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the registered tools
    Tools,

    /// Start a sender and wait for it to finish
    Send {
        /// Tool name
        tool: String,

        /// Source file; omit for memory-to-memory mode
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,

        /// Tool option as KEY=VALUE (VALUE is parsed as JSON when possible)
        #[arg(long = "opt", value_name = "KEY=VALUE")]
        opts: Vec<String>,

        /// Seconds to wait for the process per poll
        #[arg(long, value_name = "SECS", default_value_t = 3600.0)]
        wait: f64,
    },

    /// Start a receiver and wait for it to finish
    Receive {
        tool: String,

        /// Peer host, or source directory for msrsync
        #[arg(long, value_name = "ADDR")]
        address: Option<String>,

        /// Destination file; omit for memory-to-memory mode
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,

        #[arg(long = "opt", value_name = "KEY=VALUE")]
        opts: Vec<String>,

        #[arg(long, value_name = "SECS", default_value_t = 3600.0)]
        wait: f64,
    },

    /// Run a sender and a receiver against each other on this host
    Copy {
        tool: String,

        #[arg(long, value_name = "PATH")]
        src: PathBuf,

        #[arg(long, value_name = "PATH")]
        dst: PathBuf,

        #[arg(long = "opt", value_name = "KEY=VALUE")]
        opts: Vec<String>,

        #[arg(long, value_name = "SECS", default_value_t = 3600.0)]
        wait: f64,

        /// Compare source and destination checksums afterwards
        #[arg(long)]
        verify: bool,

        /// Checksum algorithm for verification: md5, sha256, blake3
        #[arg(long, value_name = "ALGORITHM", default_value = "md5")]
        hash: String,
    },

    /// Print the checksum of a file or directory tree
    Checksum {
        path: PathBuf,

        #[arg(long, value_name = "ALGORITHM", default_value = "md5")]
        hash: String,
    },
}

fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    let exit_code = match run_cli(&args) {
        Ok(()) => 0,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            2
        }
    };

    std::process::exit(exit_code);
}

/// Install the stderr log subscriber. `RUST_LOG` wins over `--verbose`.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args) -> Result<(), String> {
    let config = match &args.config {
        Some(path) => AgentConfig::load(path).map_err(|e| e.to_string())?,
        None => AgentConfig::default(),
    };
    let orchestrator = Orchestrator::new(config);

    match &args.command {
        Command::Tools => {
            for name in orchestrator.tools() {
                println!("{}", name);
            }
            Ok(())
        }
        Command::Send {
            tool,
            file,
            opts,
            wait,
        } => {
            let options = with_wait(parse_opts(opts)?, *wait);
            let descriptor = orchestrator
                .create(tool, Role::Sender, file.as_deref(), &options)
                .map_err(|e| format!("Failed to start sender: {}", e))?;
            print_json(&descriptor)?;
            let result = poll_to_end(&orchestrator, tool, Role::Sender, descriptor.session_key, &options)?;
            report(&result)
        }
        Command::Receive {
            tool,
            address,
            file,
            opts,
            wait,
        } => {
            let mut options = with_wait(parse_opts(opts)?, *wait);
            if let Some(address) = address {
                options.insert("address".to_string(), Value::String(address.clone()));
            }
            let descriptor = orchestrator
                .create(tool, Role::Receiver, file.as_deref(), &options)
                .map_err(|e| format!("Failed to start receiver: {}", e))?;
            print_json(&descriptor)?;
            let result = poll_to_end(&orchestrator, tool, Role::Receiver, descriptor.session_key, &options)?;
            report(&result)
        }
        Command::Copy {
            tool,
            src,
            dst,
            opts,
            wait,
            verify,
            hash,
        } => {
            // Reject a bad algorithm before anything is spawned
            let algorithm = if *verify { Some(parse_algorithm(hash)?) } else { None };
            let options = with_wait(parse_opts(opts)?, *wait);
            copy(&orchestrator, tool, src, dst, &options)?;

            if let Some(algorithm) = algorithm {
                let (expected, matches) =
                    verify_transfer(src, dst, algorithm).map_err(|e| format!("Verification failed: {}", e))?;
                if !matches {
                    return Err(format!(
                        "Checksum mismatch: {} differs from {} ({})",
                        dst.display(),
                        src.display(),
                        expected.to_string_with_algo()
                    ));
                }
                println!("verified {}", expected.to_string_with_algo());
            }
            Ok(())
        }
        Command::Checksum { path, hash } => {
            let algorithm = parse_algorithm(hash)?;
            let value = compute_checksum(path, algorithm).map_err(|e| e.to_string())?;
            println!("{}  {}", value.to_string_with_algo(), path.display());
            Ok(())
        }
    }
}

/// Loopback transfer: sender first, then a receiver paired with its key.
fn copy(
    orchestrator: &Orchestrator,
    tool: &str,
    src: &Path,
    dst: &Path,
    options: &Map<String, Value>,
) -> Result<(), String> {
    let sender = orchestrator
        .create(tool, Role::Sender, Some(src), options)
        .map_err(|e| format!("Failed to start sender: {}", e))?;
    print_json(&sender)?;

    let receiver_options = receiver_options(options, &sender);
    let receiver = match orchestrator.create(tool, Role::Receiver, Some(dst), &receiver_options) {
        Ok(receiver) => receiver,
        Err(e) => {
            release_quietly(orchestrator, tool, sender.session_key);
            return Err(format!("Failed to start receiver: {}", e));
        }
    };
    print_json(&receiver)?;

    let received = poll_to_end(orchestrator, tool, Role::Receiver, receiver.session_key, &receiver_options);
    let received = match received {
        Ok(result) => result,
        Err(e) => {
            release_quietly(orchestrator, tool, sender.session_key);
            return Err(e);
        }
    };
    let sent = poll_to_end(orchestrator, tool, Role::Sender, sender.session_key, options)?;

    print_json(&sent)?;
    report(&received)
}

/// The sender's key and data port, plus a loopback address unless one was given.
fn receiver_options(options: &Map<String, Value>, sender: &LaunchDescriptor) -> Map<String, Value> {
    let mut receiver = options.clone();
    receiver.insert("sessionKey".to_string(), Value::from(sender.session_key.0));
    if let Some(data_port) = sender.data_port {
        receiver.insert("dataPort".to_string(), Value::from(data_port));
    }
    receiver
        .entry("address")
        .or_insert_with(|| Value::String(LOOPBACK.to_string()));
    receiver
}

fn release_quietly(orchestrator: &Orchestrator, tool: &str, key: SessionKey) {
    if let Err(e) = orchestrator.free_port(tool, key) {
        debug!(tool, key = key.0, error = %e, "nothing to release");
    }
}

/// Poll until the session reaches a terminal outcome.
fn poll_to_end(
    orchestrator: &Orchestrator,
    tool: &str,
    role: Role,
    key: SessionKey,
    options: &Map<String, Value>,
) -> Result<TransferResult, String> {
    loop {
        match orchestrator.poll(tool, role, key, options) {
            Ok(result) => return Ok(result),
            Err(e) if e.is_still_in_progress() => {
                debug!(tool, %role, key = key.0, "still in progress");
            }
            Err(EngineError::TransferTimedOut { key, file }) => {
                warn!(tool, key = key.0, "sender stalled");
                return Err(match file {
                    Some(file) => format!("Transfer of {} timed out", file.display()),
                    None => format!("Transfer {} timed out", key),
                });
            }
            Err(e) => return Err(format!("Polling {} failed: {}", role, e)),
        }
    }
}

fn report(result: &TransferResult) -> Result<(), String> {
    print_json(result)?;
    if result.succeeded {
        info!(returncode = result.returncode, bytes = ?result.transferred_bytes, "transfer finished");
        Ok(())
    } else {
        Err(format!("Tool exited with code {}", result.returncode))
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let line = serde_json::to_string(value).map_err(|e| e.to_string())?;
    println!("{}", line);
    Ok(())
}

/// Turn repeated `KEY=VALUE` flags into an options map.
///
/// Values that parse as JSON keep their type (`direct=false`, `blocksize=1`,
/// `cpu={"0":"4"}`); anything else is taken as a string.
fn parse_opts(pairs: &[String]) -> Result<Map<String, Value>, String> {
    let mut options = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| format!("Invalid option '{}'. Expected KEY=VALUE", pair))?;
        if key.is_empty() {
            return Err(format!("Invalid option '{}'. Key is empty", pair));
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        options.insert(key.to_string(), value);
    }
    Ok(options)
}

/// Use `--wait` as the poll wait unless a `timeout` option was given.
fn with_wait(mut options: Map<String, Value>, wait: f64) -> Map<String, Value> {
    options.entry("timeout").or_insert_with(|| Value::from(wait));
    options
}

fn parse_algorithm(name: &str) -> Result<ChecksumAlgorithm, String> {
    name.parse::<ChecksumAlgorithm>().map_err(|_| {
        format!(
            "Invalid hash algorithm '{}'. Must be 'md5', 'sha256', or 'blake3'",
            name
        )
    })
}
