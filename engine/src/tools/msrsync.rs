//! Parallel archive sync of a directory tree.
//!
//! Receiver only. The `address` of the request is the local source
//! directory.

use std::path::Path;

use crate::error::EngineError;
use crate::model::Role;
use crate::process::{CommandSpec, OutputMode};
use crate::tool::{path_arg, unsupported, Keying, Launch, TransferTool};

#[derive(Debug, Default, Clone, Copy)]
pub struct Msrsync;

impl TransferTool for Msrsync {
    fn name(&self) -> &'static str {
        "msrsync"
    }

    fn keying(&self) -> Keying {
        Keying::Index
    }

    fn supports(&self, role: Role) -> bool {
        role == Role::Receiver
    }

    fn sender_command(&self, _launch: &Launch<'_>) -> Result<Option<CommandSpec>, EngineError> {
        Err(unsupported(self, Role::Sender))
    }

    fn receiver_command(&self, launch: &Launch<'_>) -> Result<CommandSpec, EngineError> {
        let source = launch.require_address()?;
        if !Path::new(source).is_dir() {
            return Err(EngineError::configuration(
                "address should be a path to the source directory",
            ));
        }
        let destination = launch.require_file()?;
        if launch.options.parallel == 0 {
            return Err(EngineError::configuration("parallel must be at least 1"));
        }

        Ok(CommandSpec::new("msrsync")
            .args(["-p".to_string(), launch.options.parallel.to_string(), "-P".to_string()])
            .args([source.to_string(), path_arg(destination)])
            .stdout(OutputMode::Inherit)
            .stderr(OutputMode::Capture))
    }
}
