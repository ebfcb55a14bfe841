//! Local IO stress with fio.
//!
//! The sender runs nothing; it sizes the file and checks the IO mode. The
//! receiver runs a single job against its destination, or, when a
//! `sequence` schedule is given, a generated job file with one rate-limited
//! job per step.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::options::{schedule_steps, ScheduleStep, TransferOptions};
use crate::process::{CommandSpec, OutputMode};
use crate::tool::{path_arg, Keying, Launch, TransferTool};

#[derive(Debug, Default, Clone, Copy)]
pub struct Fio;

impl TransferTool for Fio {
    fn name(&self) -> &'static str {
        "fio"
    }

    fn keying(&self) -> Keying {
        Keying::Index
    }

    fn sender_command(&self, launch: &Launch<'_>) -> Result<Option<CommandSpec>, EngineError> {
        // iomode is already validated while decoding the options
        launch.require_file()?;
        Ok(None)
    }

    fn receiver_command(&self, launch: &Launch<'_>) -> Result<CommandSpec, EngineError> {
        let destination = launch.require_file()?;
        let options = launch.options;

        let spec = match &options.sequence {
            Some(sequence) => {
                let steps = schedule_steps(sequence)?;
                let job_file = job_file_path(launch.scratch_dir, launch.key.0);
                let content = job_file_content(destination, options, &steps)?;
                std::fs::write(&job_file, content).map_err(|e| EngineError::WriteError {
                    path: job_file.clone(),
                    source: e,
                })?;
                CommandSpec::new("fio")
                    .arg(path_arg(&job_file))
                    .scratch_file(job_file)
            }
            None => CommandSpec::new("fio")
                .arg("--thread")
                .arg(format!("--direct={}", u8::from(options.direct)))
                .arg(format!("--rw={}", options.iomode.as_str()))
                .arg("--ioengine=sync")
                .arg(format!("--bs={}k", options.blocksize))
                .arg("--iodepth=32")
                .arg(format!("--name=index_{}", launch.key))
                .arg(format!("--filename={}", path_arg(destination))),
        };
        Ok(spec.stdout(OutputMode::Capture).stderr(OutputMode::Capture))
    }
}

fn job_file_path(scratch_dir: &Path, key: u32) -> PathBuf {
    scratch_dir.join(format!("dtn-fio-{}-{}.fio", std::process::id(), key))
}

/// Render the job file for a rate schedule.
///
/// Steps with rate `0` are idle periods and produce no job.
fn job_file_content(
    destination: &Path,
    options: &TransferOptions,
    steps: &[ScheduleStep],
) -> Result<String, EngineError> {
    let size = options
        .size
        .as_deref()
        .ok_or_else(|| EngineError::configuration("size is required with a sequence"))?;
    if size.is_empty() || !size.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(EngineError::configuration(format!("invalid size '{}'", size)));
    }
    let filename = path_arg(destination);
    if filename.contains(['\n', '\r']) {
        return Err(EngineError::configuration("destination path contains a line break"));
    }

    let mut content = String::new();
    let _ = write!(
        content,
        "[global]\nname=fio-seq-{rw}\nrw={rw}\nbs=1m\ndirect={direct}\nioengine=sync\niodepth=16\n\
         group_reporting=1\ntime_based\nfilename={filename}\nsize={size}\n\n",
        rw = options.iomode.as_str(),
        direct = u8::from(options.direct),
    );

    let origin = steps.first().map(|step| step.start).unwrap_or(0);
    for (index, step) in steps.iter().enumerate() {
        if step.value == "0" {
            continue;
        }
        let _ = write!(
            content,
            "[{}]\nruntime={}\nstartdelay={}\nrate={}\n\n",
            index,
            step.duration,
            step.start - origin,
            step.value
        );
    }
    Ok(content)
}
