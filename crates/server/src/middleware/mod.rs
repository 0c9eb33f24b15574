mod protocol;
mod shutdown;

pub use protocol::{require_supported_version, PROTOCOL_VERSION_HEADER};
pub use shutdown::abort_on_force_close;
