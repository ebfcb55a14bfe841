//! Network copy tool on a single control port.
//!
//! The sender listens and pushes its stdin to the first client; the
//! receiver connects and writes the stream to the destination. A
//! memory-to-memory sender streams `/dev/zero` until its time bound fires.

use std::path::PathBuf;

use crate::error::EngineError;
use crate::port_pool::PortRange;
use crate::process::{CommandSpec, OutputMode, StdinSource};
use crate::tool::{path_arg, Keying, Launch, TransferTool};

pub const DEFAULT_PORTS: PortRange = PortRange::new(33001, 999);

#[derive(Debug, Default, Clone, Copy)]
pub struct Ncat;

impl TransferTool for Ncat {
    fn name(&self) -> &'static str {
        "ncat"
    }

    fn keying(&self) -> Keying {
        Keying::Ports(DEFAULT_PORTS)
    }

    fn supports_memory_mode(&self) -> bool {
        true
    }

    fn sender_command(&self, launch: &Launch<'_>) -> Result<Option<CommandSpec>, EngineError> {
        let port = launch.port()?.to_string();

        let spec = match (launch.file, launch.options.compression) {
            (Some(file), Some(compression)) => CommandSpec::shell(format!(
                "{} < \"$1\" | ncat -l --send-only \"$2\"",
                compression.compress_command()
            ))
            .args([path_arg(file), port]),
            (Some(file), None) => CommandSpec::new("ncat")
                .args(["-l", "--send-only", port.as_str()])
                .stdin(StdinSource::File(file.to_path_buf())),
            (None, _) => {
                let duration = launch.require_duration()?;
                CommandSpec::new("ncat")
                    .args(["-l", "--send-only", port.as_str()])
                    .stdin(StdinSource::File(PathBuf::from("/dev/zero")))
                    .bounded_by(duration)
            }
        };
        Ok(Some(spec.stdout(OutputMode::Null).stderr(OutputMode::Capture)))
    }

    fn receiver_command(&self, launch: &Launch<'_>) -> Result<CommandSpec, EngineError> {
        let port = launch.port()?.to_string();
        let address = launch.require_address()?;

        let spec = match (launch.file, launch.options.compression) {
            (Some(file), Some(compression)) => CommandSpec::pipe(
                "ncat --recv-only \"$1\" \"$2\"",
                &format!("{} > \"$3\"", compression.decompress_command()),
            )
            .args([address.to_string(), port, path_arg(file)]),
            (Some(file), None) => CommandSpec::new("ncat")
                .args(["--recv-only", address, port.as_str()])
                .stdout(OutputMode::File(file.to_path_buf())),
            // Ends when the time-bounded sender closes the stream
            (None, _) => CommandSpec::new("ncat")
                .args(["-v", "--recv-only", address, port.as_str()])
                .stdout(OutputMode::Null),
        };
        Ok(spec.stderr(OutputMode::Capture))
    }

    fn transferred_bytes(&self, output: &str) -> Option<u64> {
        parse_bytes_received(output)
    }
}

/// Byte count from the verbose summary,
/// e.g. `Ncat: 0 bytes sent, 1048576 bytes received in 1.02 seconds.`
fn parse_bytes_received(output: &str) -> Option<u64> {
    output
        .lines()
        .flat_map(|line| line.split(','))
        .filter_map(|part| {
            let (count, _) = part.split_once(" bytes received")?;
            count.split_whitespace().last()?.parse().ok()
        })
        .last()
}
