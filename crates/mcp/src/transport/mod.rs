pub mod stdio;

pub use stdio::StdioTransport;
