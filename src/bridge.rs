//! Relays host messages into the sandbox once bootstrap has finished.

use crate::protocol::{InboundMessage, Outbox};
use crate::sandbox::Sandbox;
use crate::sanitize::{parse_payload, sanitize_payload};
use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Owns the ready sandbox. Constructing one requires a bootstrapped sandbox.
pub struct Bridge<S> {
    sandbox: S,
    outbox: Outbox,
}

impl<S: Sandbox> Bridge<S> {
    pub fn new(sandbox: S, outbox: Outbox) -> Self {
        Self { sandbox, outbox }
    }

    pub fn sandbox(&self) -> &S {
        &self.sandbox
    }

    pub fn into_sandbox(self) -> S {
        self.sandbox
    }

    /// Handle one inbound message to completion.
    pub async fn handle(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::Rendered => {
                if let Err(e) = self.sandbox.link_document().await {
                    tracing::error!(error = %format!("{:#}", e), "failed to link document");
                }
            }
            InboundMessage::Patch { patch } => {
                if let Err(e) = self.apply_patch(&patch).await {
                    tracing::error!(error = %format!("{:#}", e), "failed to apply patch");
                }
                self.outbox.idle();
            }
            InboundMessage::Location { location } => {
                if let Err(e) = self.update_location(&location).await {
                    tracing::error!(error = %format!("{:#}", e), "failed to update location");
                }
            }
            InboundMessage::Unknown => {
                tracing::debug!("ignoring unknown message kind");
            }
        }
    }

    async fn apply_patch(&mut self, raw: &str) -> Result<()> {
        let patch = parse_payload(raw)?;
        self.sandbox.apply_patch(patch).await
    }

    async fn update_location(&mut self, raw: &str) -> Result<()> {
        let value: Value = serde_json::from_str(raw).context("location payload is not valid JSON")?;
        let Value::Object(values) = value else {
            return Err(anyhow!("location payload must be an object"));
        };

        let Some(recognized) = self.sandbox.location_params().await? else {
            tracing::debug!("location not tracked, ignoring update");
            return Ok(());
        };

        // Unrecognized keys are dropped before the kept values are checked
        let params = retain_recognized(values, &recognized)
            .into_iter()
            .map(|(key, value)| Ok((key, sanitize_payload(value)?)))
            .collect::<Result<Map<String, Value>>>()?;
        if params.is_empty() {
            return Ok(());
        }
        self.sandbox.update_location(params).await
    }

    /// Process host lines in arrival order until end of input.
    pub async fn run<R>(&mut self, mut reader: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            let Ok(line) = std::str::from_utf8(&buf) else {
                tracing::warn!("ignoring host message that is not valid UTF-8");
                continue;
            };
            match InboundMessage::from_line(line) {
                None => continue,
                Some(Ok(message)) => self.handle(message).await,
                Some(Err(e)) => tracing::warn!(error = %e, "ignoring malformed host message"),
            }
        }
        tracing::info!("host channel closed");
        Ok(())
    }
}

/// Keep only keys that name a recognized parameter
fn retain_recognized(values: Map<String, Value>, recognized: &[String]) -> Map<String, Value> {
    values
        .into_iter()
        .filter(|(key, _)| recognized.iter().any(|r| r == key))
        .collect()
}
