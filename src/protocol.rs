//! Host <-> worker messages.
//!
//! Inbound (stdin, one JSON object per line):
//!   {"type":"rendered"}
//!   {"type":"patch","patch":"<json>"}
//!   {"type":"location","location":"<json>"}
//!
//! Outbound (stdout, one JSON object per line):
//!   {"type":"status","msg":"Installing leaflet"}
//!   {"type":"render","docs_json":...,"render_items":...,"root_ids":...}
//!   {"type":"patch","patch":"<json>","buffers":["<base64>"],"msg_id":"..."}
//!   {"type":"idle"}

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Message delivered by the host
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundMessage {
    Rendered,
    Patch { patch: String },
    Location { location: String },
    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    /// Decode one line from the host. Blank lines yield `None`.
    pub fn from_line(line: &str) -> Option<Result<Self, serde_json::Error>> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        Some(serde_json::from_str(line))
    }
}

/// Three-part result of a successful entry script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderPayload {
    pub docs_json: Value,
    pub render_items: Value,
    pub root_ids: Value,
}

impl RenderPayload {
    /// Split an entry script's `[docs_json, render_items, root_ids]` result
    pub fn from_parts(value: Value) -> anyhow::Result<Self> {
        match value {
            Value::Array(parts) if parts.len() == 3 => {
                let mut parts = parts.into_iter();
                Ok(Self {
                    docs_json: parts.next().unwrap_or_default(),
                    render_items: parts.next().unwrap_or_default(),
                    root_ids: parts.next().unwrap_or_default(),
                })
            }
            other => Err(anyhow::anyhow!(
                "Entry script must return [docs_json, render_items, root_ids], got: {}",
                other
            )),
        }
    }
}

/// Message posted to the host
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    Status {
        msg: String,
    },
    Render {
        #[serde(flatten)]
        payload: RenderPayload,
    },
    Patch {
        patch: String,
        buffers: Vec<String>,
        msg_id: Option<String>,
    },
    Idle,
}

/// Sending half of the host channel.
///
/// Cloned into the sandbox op state so `sendPatch` can post directly.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl Outbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn post(&self, message: OutboundMessage) {
        if self.tx.send(message).is_err() {
            tracing::debug!("host channel closed, dropping outbound message");
        }
    }

    pub fn status(&self, msg: impl Into<String>) {
        self.post(OutboundMessage::Status { msg: msg.into() });
    }

    pub fn idle(&self) {
        self.post(OutboundMessage::Idle);
    }
}

/// Drain outbound messages to `writer` as JSON lines until every `Outbox` is dropped
pub async fn write_messages<W>(
    mut rx: mpsc::UnboundedReceiver<OutboundMessage>,
    mut writer: W,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}
