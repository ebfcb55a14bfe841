//! Built-in transfer tools.
//!
//! | name     | kind             | keying | roles             |
//! |----------|------------------|--------|-------------------|
//! | nuttcp   | throughput       | ports  | sender, receiver  |
//! | ncat     | network copy     | ports  | sender, receiver  |
//! | dd       | streaming copy   | index  | sender, receiver  |
//! | msrsync  | archive sync     | index  | receiver          |
//! | fio      | local IO stress  | index  | sender, receiver  |
//! | sysbench | CPU stress       | index  | receiver          |

pub mod dd;
pub mod fio;
pub mod msrsync;
pub mod ncat;
pub mod nuttcp;
pub mod sysbench;

use crate::tool::TransferTool;

pub use dd::Dd;
pub use fio::Fio;
pub use msrsync::Msrsync;
pub use ncat::Ncat;
pub use nuttcp::Nuttcp;
pub use sysbench::Sysbench;

/// One instance of every built-in tool.
pub fn builtin() -> Vec<Box<dyn TransferTool>> {
    vec![
        Box::new(Nuttcp),
        Box::new(Ncat),
        Box::new(Dd),
        Box::new(Msrsync),
        Box::new(Fio),
        Box::new(Sysbench),
    ]
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;

    use crate::model::{Role, SessionKey};
    use crate::options::TransferOptions;
    use crate::tool::Launch;

    /// A launch with no file, address or data port.
    pub fn launch<'a>(role: Role, key: u32, options: &'a TransferOptions) -> Launch<'a> {
        Launch {
            role,
            key: SessionKey(key),
            data_port: None,
            file: None,
            address: None,
            peer_source: None,
            options,
            scratch_dir: Path::new("/tmp"),
        }
    }
}
