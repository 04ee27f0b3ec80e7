//! JSON-lines adapter: one inbound event per line in, one frame per line out.
//!
//! The gateway process owns the platform connection and speaks to Chorus over
//! a pipe. Outbound frames are written under a lock so lines never interleave.

use crate::extensions::commands::{CommandSpec, CommandSurface};
use crate::messaging::traits::{InboundStream, Messaging};
use crate::{InboundEvent, OutboundResponse, ReplyTarget, StatusUpdate};

use anyhow::Context as _;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncWrite, AsyncWriteExt as _, BufReader};
use tokio::sync::Mutex;

type Reader = Box<dyn AsyncBufRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Frames written to the gateway.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundFrame<'a> {
    Response {
        target: &'a ReplyTarget,
        response: &'a OutboundResponse,
    },
    Status {
        target: &'a ReplyTarget,
        status: StatusUpdate,
    },
    Commands {
        commands: &'a [CommandSpec],
    },
}

pub struct JsonLinesAdapter {
    reader: Mutex<Option<Reader>>,
    writer: Mutex<Writer>,
}

impl JsonLinesAdapter {
    pub fn new(
        reader: impl tokio::io::AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Mutex::new(Some(Box::new(BufReader::new(reader)))),
            writer: Mutex::new(Box::new(writer)),
        }
    }

    /// Adapter over the process's stdin and stdout.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    async fn write_frame(&self, frame: &OutboundFrame<'_>) -> crate::Result<()> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&line)
            .await
            .context("failed to write outbound frame")?;
        writer.flush().await.context("failed to flush outbound frame")?;
        Ok(())
    }
}

impl Messaging for JsonLinesAdapter {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn start(&self) -> crate::Result<InboundStream> {
        let Some(reader) = self.reader.lock().await.take() else {
            return Err(anyhow::anyhow!("json-lines adapter already started").into());
        };

        let stream = async_stream::stream! {
            let mut lines = reader.lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<InboundEvent>(line) {
                            Ok(event) => yield event,
                            Err(error) => {
                                tracing::warn!(%error, "skipping malformed inbound event");
                            }
                        }
                    }
                    Ok(None) => {
                        tracing::info!("inbound stream closed");
                        break;
                    }
                    Err(error) => {
                        tracing::error!(%error, "failed to read inbound stream");
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn respond(&self, target: &ReplyTarget, response: OutboundResponse) -> crate::Result<()> {
        self.write_frame(&OutboundFrame::Response {
            target,
            response: &response,
        })
        .await
    }

    async fn send_status(&self, target: &ReplyTarget, status: StatusUpdate) -> crate::Result<()> {
        self.write_frame(&OutboundFrame::Status { target, status })
            .await
    }

    async fn register_commands(&self, surface: &CommandSurface) -> crate::Result<()> {
        self.write_frame(&OutboundFrame::Commands {
            commands: surface.commands(),
        })
        .await
    }

    async fn shutdown(&self) -> crate::Result<()> {
        self.writer
            .lock()
            .await
            .shutdown()
            .await
            .context("failed to close outbound stream")?;
        Ok(())
    }
}
