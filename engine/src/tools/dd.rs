//! Streaming copy between two local paths.
//!
//! The sender runs nothing; it only sizes the source and takes a key. The
//! receiver copies the source of the sender with the same key (or the
//! `srcfile` option) to its destination.

use crate::error::EngineError;
use crate::process::{CommandSpec, OutputMode};
use crate::tool::{path_arg, Keying, Launch, TransferTool};

#[derive(Debug, Default, Clone, Copy)]
pub struct Dd;

impl TransferTool for Dd {
    fn name(&self) -> &'static str {
        "dd"
    }

    fn keying(&self) -> Keying {
        Keying::Index
    }

    fn receiver_needs_peer_source(&self) -> bool {
        true
    }

    fn sender_command(&self, launch: &Launch<'_>) -> Result<Option<CommandSpec>, EngineError> {
        launch.require_file()?;
        Ok(None)
    }

    fn receiver_command(&self, launch: &Launch<'_>) -> Result<CommandSpec, EngineError> {
        let destination = launch.require_file()?;
        let source = launch
            .peer_source
            .ok_or_else(|| EngineError::configuration("srcfile is required"))?;
        if launch.options.blocksize == 0 {
            return Err(EngineError::configuration("blocksize must be positive"));
        }

        let mut spec = CommandSpec::new("dd")
            .arg(format!("if={}", path_arg(source)))
            .arg(format!("of={}", path_arg(destination)))
            .arg(format!("bs={}", launch.options.blocksize));
        if launch.options.direct {
            spec = spec.args(["iflag=direct", "oflag=direct"]);
        }
        Ok(spec.stdout(OutputMode::Null).stderr(OutputMode::Capture))
    }
}
