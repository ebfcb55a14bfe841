//! Throughput tool with separate control and data ports.
//!
//! The sender runs nuttcp as a one-shot server transmitting its stdin; the
//! receiver connects to it and writes what it gets to stdout. Without files
//! both ends run a timed memory-to-memory test and the receiver's report is
//! parsed for the volume moved.

use crate::error::EngineError;
use crate::options::TransferOptions;
use crate::port_pool::PortRange;
use crate::process::{CommandSpec, OutputMode, StdinSource};
use crate::tool::{path_arg, Keying, Launch, TransferTool};

pub const DEFAULT_PORTS: PortRange = PortRange::new(30001, 999).with_data_offset(1000);

const BUFFER_LEN: &str = "-l8m";

#[derive(Debug, Default, Clone, Copy)]
pub struct Nuttcp;

/// Stream-mode flags: `-s`, plus `d` for direct IO and `z` for zero copy.
fn file_flags(options: &TransferOptions) -> String {
    let mut flags = String::from("-s");
    if options.direct {
        flags.push('d');
    }
    if options.zerocopy {
        flags.push('z');
    }
    flags
}

impl TransferTool for Nuttcp {
    fn name(&self) -> &'static str {
        "nuttcp"
    }

    fn keying(&self) -> Keying {
        Keying::Ports(DEFAULT_PORTS)
    }

    fn supports_memory_mode(&self) -> bool {
        true
    }

    fn sender_command(&self, launch: &Launch<'_>) -> Result<Option<CommandSpec>, EngineError> {
        let port = launch.port()?.to_string();
        let data_port = launch.require_data_port()?.to_string();
        let options = launch.options;

        let spec = match (launch.file, options.compression) {
            (Some(file), Some(compression)) => CommandSpec::shell(format!(
                "{} < \"$1\" | nuttcp -S -1 -P \"$2\" -p \"$3\" \"$4\" {} --nofork",
                compression.compress_command(),
                BUFFER_LEN
            ))
            .args([path_arg(file), port, data_port, file_flags(options)]),
            (Some(file), None) => CommandSpec::new("nuttcp")
                .args(["-S", "-1", "-P", port.as_str(), "-p", data_port.as_str()])
                .arg(file_flags(options))
                .args([BUFFER_LEN, "--nofork"])
                .stdin(StdinSource::File(file.to_path_buf())),
            (None, _) => {
                let spec = CommandSpec::new("nuttcp")
                    .args(["-S", "-1", "-P", port.as_str(), "-p", data_port.as_str()])
                    .arg("--nofork");
                match options.duration {
                    Some(duration) => spec.bounded_by(duration),
                    None => spec,
                }
            }
        };
        Ok(Some(spec.stdout(OutputMode::Null).stderr(OutputMode::Capture)))
    }

    fn receiver_command(&self, launch: &Launch<'_>) -> Result<CommandSpec, EngineError> {
        let port = launch.port()?.to_string();
        let data_port = launch.require_data_port()?.to_string();
        let address = launch.require_address()?;
        let options = launch.options;

        let spec = match (launch.file, options.compression) {
            (Some(file), Some(compression)) => CommandSpec::pipe(
                &format!("nuttcp -r -i 1 -P \"$1\" -p \"$2\" \"$3\" {} --nofork \"$4\"", BUFFER_LEN),
                &format!("{} > \"$5\"", compression.decompress_command()),
            )
            .args([port, data_port, file_flags(options), address.to_string(), path_arg(file)]),
            (Some(file), None) => CommandSpec::new("nuttcp")
                .args(["-r", "-i", "1", "-P", port.as_str(), "-p", data_port.as_str()])
                .arg(file_flags(options))
                .args([BUFFER_LEN, "--nofork", address])
                .stdout(OutputMode::File(file.to_path_buf())),
            (None, _) => {
                let duration = launch.require_duration()?;
                CommandSpec::new("nuttcp")
                    .args(["-r", "-i", "1"])
                    .arg(format!("-T{}", duration))
                    .args(["-P", port.as_str(), "-p", data_port.as_str(), address])
                    .stdout(OutputMode::Capture)
            }
        };
        Ok(spec.stderr(OutputMode::Capture))
    }

    fn transferred_bytes(&self, output: &str) -> Option<u64> {
        parse_megabytes(output).map(|mb| (mb * 1024.0 * 1024.0) as u64)
    }
}

/// Volume of the last report line, e.g. `1181.0000 MB /  10.00 sec = ...`.
fn parse_megabytes(output: &str) -> Option<f64> {
    output
        .lines()
        .filter_map(|line| {
            let (before, _) = line.split_once(" MB /")?;
            before.split_whitespace().last()?.parse::<f64>().ok()
        })
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;
    use crate::options::Compression;
    use crate::tools::testing::launch;
    use std::path::Path;

    #[test]
    fn test_file_flags() {
        let mut options = TransferOptions::default();
        assert_eq!(file_flags(&options), "-sdz");
        options.direct = false;
        assert_eq!(file_flags(&options), "-sz");
        options.zerocopy = false;
        assert_eq!(file_flags(&options), "-s");
    }

    #[test]
    fn test_file_sender_reads_source_on_stdin() {
        let options = TransferOptions::default();
        let mut launch = launch(Role::Sender, 30001, &options);
        launch.data_port = Some(31001);
        launch.file = Some(Path::new("/data/src.bin"));

        let spec = Nuttcp.sender_command(&launch).expect("valid").expect("sender runs a process");
        assert_eq!(spec.command_line(), "nuttcp -S -1 -P 30001 -p 31001 -sdz -l8m --nofork");
        assert_eq!(spec.stdin_source(), &StdinSource::File("/data/src.bin".into()));
    }

    #[test]
    fn test_memory_sender_is_time_bounded() {
        let options = TransferOptions {
            duration: Some(10),
            ..TransferOptions::default()
        };
        let mut launch = launch(Role::Sender, 30002, &options);
        launch.data_port = Some(31002);

        let spec = Nuttcp.sender_command(&launch).expect("valid").expect("sender runs a process");
        assert_eq!(spec.command_line(), "timeout 10 nuttcp -S -1 -P 30002 -p 31002 --nofork");
    }

    #[test]
    fn test_receiver_requires_data_port_and_address() {
        let options = TransferOptions::default();
        let mut launch = launch(Role::Receiver, 30001, &options);
        launch.file = Some(Path::new("/data/dst.bin"));
        assert!(Nuttcp.receiver_command(&launch).is_err());

        launch.data_port = Some(31001);
        assert!(Nuttcp.receiver_command(&launch).is_err());

        launch.address = Some("10.0.0.2");
        let spec = Nuttcp.receiver_command(&launch).expect("valid");
        assert_eq!(
            spec.command_line(),
            "nuttcp -r -i 1 -P 30001 -p 31001 -sdz -l8m --nofork 10.0.0.2"
        );
        assert_eq!(spec.stdout_mode(), &OutputMode::File("/data/dst.bin".into()));
    }

    #[test]
    fn test_compressed_receiver_passes_values_as_arguments() {
        let options = TransferOptions {
            compression: Some(Compression::Gzip),
            ..TransferOptions::default()
        };
        let mut launch = launch(Role::Receiver, 30001, &options);
        launch.data_port = Some(31001);
        launch.address = Some("host; rm -rf /");
        launch.file = Some(Path::new("/data/dst.bin"));

        let spec = Nuttcp.receiver_command(&launch).expect("valid");
        assert_eq!(spec.program(), "sh");
        assert!(!spec.argv()[1].contains("host"));
        assert!(spec.argv()[1].contains("gzip -d -c"));
        assert_eq!(spec.argv()[6], "host; rm -rf /");
    }

    #[test]
    fn test_memory_receiver_parses_last_report() {
        let options = TransferOptions {
            duration: Some(10),
            ..TransferOptions::default()
        };
        let mut launch = launch(Role::Receiver, 30001, &options);
        launch.data_port = Some(31001);
        launch.address = Some("10.0.0.2");
        let spec = Nuttcp.receiver_command(&launch).expect("valid");
        assert!(spec.argv().contains(&"-T10".to_string()));
        assert_eq!(spec.stdout_mode(), &OutputMode::Capture);

        let output = "  117.5000 MB /   1.00 sec =  985.6 Mbps\n\
                      \x20 1024.0000 MB /  10.00 sec =  859.0 Mbps 12 %TX 20 %RX\n";
        assert_eq!(Nuttcp.transferred_bytes(output), Some(1024 * 1024 * 1024));
        assert_eq!(Nuttcp.transferred_bytes("nuttcp-r: connect refused"), None);
    }
}
