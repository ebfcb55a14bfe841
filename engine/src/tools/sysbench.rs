//! CPU stress following a thread-count schedule.
//!
//! Receiver only. Each step of the `cpu` schedule becomes one
//! `sysbench --threads=N --time=D cpu run`; steps run back to back in one
//! shell so the whole schedule is a single session. A failed step does not
//! stop later ones; the session exits with the last non-zero status.

use crate::error::EngineError;
use crate::model::Role;
use crate::options::schedule_steps;
use crate::process::{CommandSpec, OutputMode};
use crate::tool::{unsupported, Keying, Launch, TransferTool};

#[derive(Debug, Default, Clone, Copy)]
pub struct Sysbench;

impl TransferTool for Sysbench {
    fn name(&self) -> &'static str {
        "sysbench"
    }

    fn keying(&self) -> Keying {
        Keying::Index
    }

    fn supports(&self, role: Role) -> bool {
        role == Role::Receiver
    }

    fn supports_memory_mode(&self) -> bool {
        true
    }

    /// The schedule bounds the run instead.
    fn memory_mode_needs_duration(&self) -> bool {
        false
    }

    fn sender_command(&self, _launch: &Launch<'_>) -> Result<Option<CommandSpec>, EngineError> {
        Err(unsupported(self, Role::Sender))
    }

    fn receiver_command(&self, launch: &Launch<'_>) -> Result<CommandSpec, EngineError> {
        let schedule = launch
            .options
            .cpu
            .as_ref()
            .ok_or_else(|| EngineError::configuration("cpu schedule is required"))?;

        let mut script = Vec::new();
        let mut args = Vec::new();
        for step in schedule_steps(schedule)? {
            let threads: u32 = step.value.parse().map_err(|_| {
                EngineError::configuration(format!("thread count '{}' is not a number", step.value))
            })?;
            if threads == 0 {
                continue;
            }
            let position = args.len();
            script.push(format!(
                "sysbench --threads=\"${{{}}}\" --time=\"${{{}}}\" cpu run || rc=$?",
                position + 1,
                position + 2
            ));
            args.push(threads.to_string());
            args.push(step.duration.to_string());
        }
        if script.is_empty() {
            return Err(EngineError::configuration("cpu schedule has no active steps"));
        }

        Ok(CommandSpec::shell(format!("rc=0; {}; exit \"$rc\"", script.join("; ")))
            .args(args)
            .stdout(OutputMode::Capture)
            .stderr(OutputMode::Capture))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::TransferOptions;
    use crate::tools::testing::launch;
    use std::collections::BTreeMap;

    fn schedule(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(offset, value)| (offset.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn test_schedule_becomes_positional_script() {
        let options = TransferOptions {
            cpu: Some(schedule(&[("0", "4"), ("10", "0"), ("20", "8"), ("50", "0")])),
            ..TransferOptions::default()
        };
        let spec = Sysbench
            .receiver_command(&launch(Role::Receiver, 0, &options))
            .expect("valid");
        assert_eq!(spec.program(), "sh");
        assert_eq!(
            spec.argv()[1],
            "rc=0; sysbench --threads=\"${1}\" --time=\"${2}\" cpu run || rc=$?; \
             sysbench --threads=\"${3}\" --time=\"${4}\" cpu run || rc=$?; exit \"$rc\""
        );
        assert_eq!(&spec.argv()[3..], &["4", "10", "8", "30"]);
    }

    #[test]
    fn test_failed_step_does_not_stop_schedule() {
        let options = TransferOptions {
            cpu: Some(schedule(&[("0", "1"), ("1", "2"), ("2", "0")])),
            ..TransferOptions::default()
        };
        let spec = Sysbench
            .receiver_command(&launch(Role::Receiver, 0, &options))
            .expect("valid");
        // Stand-in for sysbench: the first step fails, the second records itself
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let log = temp_dir.path().join("steps");
        let script = spec.argv()[1]
            .replace("sysbench", "step")
            .replace(" cpu run", "");
        let stand_in = format!(
            "step() {{ echo \"$1\" >> \"{}\"; [ \"$1\" != --threads=1 ]; }}; {}",
            log.display(),
            script
        );
        let mut argv = vec!["-c".to_string(), stand_in];
        argv.extend(spec.argv()[2..].iter().cloned());
        let status = std::process::Command::new("sh")
            .args(&argv)
            .status()
            .expect("Failed to run sh");
        assert_eq!(status.code(), Some(1));
        let steps = std::fs::read_to_string(&log).expect("Failed to read step log");
        assert_eq!(steps.lines().collect::<Vec<_>>(), ["--threads=1", "--threads=2"]);
    }

    #[test]
    fn test_rejects_missing_or_bad_schedule() {
        let options = TransferOptions::default();
        let err = Sysbench
            .receiver_command(&launch(Role::Receiver, 0, &options))
            .expect_err("no schedule");
        assert!(err.is_configuration());

        let options = TransferOptions {
            cpu: Some(schedule(&[("0", "four"), ("10", "0")])),
            ..TransferOptions::default()
        };
        assert!(Sysbench.receiver_command(&launch(Role::Receiver, 0, &options)).is_err());

        let options = TransferOptions {
            cpu: Some(schedule(&[("0", "0"), ("10", "0")])),
            ..TransferOptions::default()
        };
        assert!(Sysbench.receiver_command(&launch(Role::Receiver, 0, &options)).is_err());
    }

    #[test]
    fn test_memory_mode_without_duration() {
        assert!(Sysbench.supports_memory_mode());
        assert!(!Sysbench.memory_mode_needs_duration());
        assert!(!Sysbench.supports(Role::Sender));
    }
}
