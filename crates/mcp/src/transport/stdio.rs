// Line-delimited JSON-RPC over a byte stream (stdin/stdout in production)

use crate::protocol::{JsonRpcError, JsonRpcResponse};
use crate::server::McpServer;
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use toolgate_core::RequestContext;
use tracing::{debug, info, warn};

/// Longest accepted input line in bytes
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

pub struct StdioTransport {
    server: Arc<McpServer>,
    max_line_length: usize,
}

impl StdioTransport {
    pub fn new(server: Arc<McpServer>) -> Self {
        Self {
            server,
            max_line_length: MAX_LINE_LENGTH,
        }
    }

    pub fn with_max_line_length(mut self, max: usize) -> Self {
        self.max_line_length = max;
        self
    }

    /// Serve the process's stdin and stdout until EOF
    pub async fn run_stdio(&self) -> Result<()> {
        self.run(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Answer every non-blank input line with exactly one output line, in order.
    pub async fn run<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(self.max_line_length));
        let mut out = FramedWrite::new(writer, LinesCodec::new());
        let ctx = RequestContext::empty();
        let mut recovering = false;

        info!("Stdio transport ready");
        loop {
            let response = match lines.next().await {
                Some(Ok(line)) => {
                    recovering = false;
                    if line.trim().is_empty() {
                        continue;
                    }
                    self.server.handle_message(&line, &ctx).await
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(max = self.max_line_length, "Input line too long, discarding");
                    // The reader yields one `None` after a decode error before resuming.
                    recovering = true;
                    JsonRpcResponse::error(
                        Value::Null,
                        JsonRpcError::parse_error(format!(
                            "line exceeds {} bytes",
                            self.max_line_length
                        )),
                    )
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    return Err(e).context("failed to read from stdin");
                }
                None if recovering => {
                    recovering = false;
                    continue;
                }
                None => break,
            };

            let encoded = serde_json::to_string(&response).context("failed to encode response")?;
            out.send(encoded).await.context("failed to write response")?;
        }

        debug!("Stdio transport reached end of input");
        Ok(())
    }
}
