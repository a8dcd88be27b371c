//! Sandbox runtime - executes scripts in an embedded V8 isolate.
//!
//! Provides only what the worker needs:
//! - console.log/warn/error (routed to tracing and captured per submission)
//! - sendPatch (posts straight to the host outbox)
//! - Sandbox.renderOptions (from the worker config)
//! - Package modules from the packages dir or allowlisted origins only
//! - No fs, net, env, or other system access from scripts

use crate::config::{RenderOptions, WorkerConfig};
use crate::fetch::FetchConfig;
use crate::loader::SandboxedLoader;
use crate::package::PackageSpec;
use crate::protocol::{OutboundMessage, Outbox, RenderPayload};
use crate::sandbox::Sandbox;
use anyhow::{anyhow, Error};
use base64::Engine;
use deno_core::{op2, v8, JsRuntime, OpState, PollEventLoopOptions, RuntimeOptions};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::rc::Rc;

/// Console output captured during one submission
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConsoleOutput {
    pub logs: Vec<String>,
    pub warns: Vec<String>,
    pub errors: Vec<String>,
}

impl ConsoleOutput {
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty() && self.warns.is_empty() && self.errors.is_empty()
    }
}

// ============================================================================
// Console Ops
// ============================================================================

#[op2(fast)]
fn op_console_log(state: &mut OpState, #[string] msg: &str) {
    tracing::info!(target: "sandbox::console", "{}", msg);
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.logs.push(msg.to_string());
    }
}

#[op2(fast)]
fn op_console_warn(state: &mut OpState, #[string] msg: &str) {
    tracing::warn!(target: "sandbox::console", "{}", msg);
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.warns.push(msg.to_string());
    }
}

#[op2(fast)]
fn op_console_error(state: &mut OpState, #[string] msg: &str) {
    tracing::error!(target: "sandbox::console", "{}", msg);
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.errors.push(msg.to_string());
    }
}

// ============================================================================
// Host Ops
// ============================================================================

/// Argument of `sendPatch` as marshalled by the prelude
#[derive(Debug, Deserialize)]
struct PatchEnvelope {
    patch: String,
    #[serde(default)]
    buffers: Vec<Vec<u8>>,
    #[serde(default)]
    msg_id: Option<String>,
}

#[op2]
fn op_send_patch(state: &mut OpState, #[serde] envelope: PatchEnvelope) {
    let buffers = envelope
        .buffers
        .iter()
        .map(|b| base64::engine::general_purpose::STANDARD.encode(b))
        .collect();
    let msg_id = envelope
        .msg_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    match state.try_borrow::<Outbox>() {
        Some(outbox) => outbox.post(OutboundMessage::Patch {
            patch: envelope.patch,
            buffers,
            msg_id: Some(msg_id),
        }),
        None => tracing::warn!("sendPatch called before the outbox was attached"),
    }
}

#[op2]
#[serde]
fn op_render_options(state: &mut OpState) -> RenderOptions {
    state
        .try_borrow::<RenderOptions>()
        .cloned()
        .unwrap_or_default()
}

deno_core::extension!(
    sandbox_worker,
    ops = [
        op_console_log,
        op_console_warn,
        op_console_error,
        op_send_patch,
        op_render_options,
    ],
    esm_entry_point = "ext:sandbox_worker/prelude.js",
    esm = ["ext:sandbox_worker/prelude.js" = "src/prelude.js"],
);

/// Create the V8 runtime with the prelude, loader and host state attached
pub fn create_runtime(config: &WorkerConfig, outbox: Outbox) -> Result<JsRuntime, Error> {
    let loader = SandboxedLoader::new(
        config.packages_dir.as_deref(),
        FetchConfig {
            allowed_origins: config.allowed_origins.clone(),
        },
    )?;

    // Configure V8 heap limits if specified
    let create_params = config
        .max_heap_size
        .map(|max_bytes| v8::Isolate::create_params().heap_limits(0, max_bytes));

    let mut runtime = JsRuntime::new(RuntimeOptions {
        module_loader: Some(Rc::new(loader)),
        extensions: vec![sandbox_worker::init_ops_and_esm()],
        create_params,
        ..Default::default()
    });

    if config.max_heap_size.is_some() {
        runtime.add_near_heap_limit_callback(|current, initial| {
            // Keep the limit so V8 raises an OOM error instead of growing
            tracing::warn!(
                current_mb = current / (1024 * 1024),
                initial_mb = initial / (1024 * 1024),
                "sandbox near heap limit"
            );
            current
        });
    }

    {
        let op_state = runtime.op_state();
        let mut op_state = op_state.borrow_mut();
        op_state.put(outbox);
        op_state.put(config.render.clone());
        op_state.put(ConsoleOutput::default());
    }

    Ok(runtime)
}

/// What `__sandbox_internal_run__` resolves to
#[derive(Debug, Deserialize)]
struct Settled {
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    traceback: String,
}

/// The worker's single sandbox handle
pub struct JsSandbox {
    runtime: JsRuntime,
    timeout_ms: Option<u64>,
    last_console: ConsoleOutput,
}

impl JsSandbox {
    pub fn new(config: &WorkerConfig, outbox: Outbox) -> Result<Self, Error> {
        Ok(Self {
            runtime: create_runtime(config, outbox)?,
            timeout_ms: config.timeout_ms,
            last_console: ConsoleOutput::default(),
        })
    }

    /// Console output of the most recent submission
    pub fn last_console(&self) -> &ConsoleOutput {
        &self.last_console
    }

    /// Run `body` as an async function body and return its JSON result.
    ///
    /// A script that throws yields an error whose text is a traceback with
    /// the `Name: message` line last.
    pub async fn submit(&mut self, name: &'static str, body: &str) -> Result<Value, Error> {
        let result = self.submit_timed(name, body).await;

        // Reset console capture for the next submission
        let op_state = self.runtime.op_state();
        self.last_console = std::mem::take(op_state.borrow_mut().borrow_mut::<ConsoleOutput>());
        if !self.last_console.is_empty() {
            tracing::debug!(
                script = name,
                logs = self.last_console.logs.len(),
                warns = self.last_console.warns.len(),
                errors = self.last_console.errors.len(),
                "sandbox console output"
            );
        }

        result
    }

    async fn submit_timed(&mut self, name: &'static str, body: &str) -> Result<Value, Error> {
        let Some(ms) = self.timeout_ms else {
            return self.submit_inner(name, body).await;
        };

        // Get a handle to terminate execution if needed
        let isolate_handle = self.runtime.v8_isolate().thread_safe_handle();
        let timeout_handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            isolate_handle.terminate_execution();
        });

        let result = self.submit_inner(name, body).await;

        // Finished before the deadline unless the terminator already ran
        let timed_out = timeout_handle.is_finished();
        timeout_handle.abort();
        // Termination is sticky; clear it so the next submission can run
        self.runtime.v8_isolate().cancel_terminate_execution();

        match result {
            Err(e) if timed_out || e.to_string().contains("execution terminated") => {
                tracing::warn!(script = name, timeout_ms = ms, "sandbox call timed out");
                Err(anyhow!("Script timed out after {}ms", ms))
            }
            other => other,
        }
    }

    async fn submit_inner(&mut self, name: &'static str, body: &str) -> Result<Value, Error> {
        let code = format!(
            "globalThis.__sandbox_internal_run__({})",
            serde_json::to_string(body)?
        );

        let settled_global = self.runtime.execute_script(name, code)?;

        // Run event loop to handle any promises/dynamic imports
        self.runtime
            .run_event_loop(PollEventLoopOptions::default())
            .await?;

        let settled = {
            let scope = &mut self.runtime.handle_scope();
            let local = v8::Local::new(scope, &settled_global);
            let promise = v8::Local::<v8::Promise>::try_from(local)
                .map_err(|_| anyhow!("Sandbox call did not return a promise"))?;

            match promise.state() {
                v8::PromiseState::Fulfilled => {
                    let result = promise.result(scope);
                    result.to_rust_string_lossy(scope)
                }
                v8::PromiseState::Rejected => {
                    let exception = promise.result(scope);
                    let exception_str = exception.to_rust_string_lossy(scope);
                    return Err(anyhow!("Sandbox call threw: {}", exception_str));
                }
                v8::PromiseState::Pending => {
                    return Err(anyhow!("Sandbox call returned unresolved promise"));
                }
            }
        };

        let settled: Settled = serde_json::from_str(&settled)
            .map_err(|e| anyhow!("Malformed sandbox result: {}", e))?;
        if settled.ok {
            Ok(settled.value)
        } else {
            Err(anyhow!("{}", settled.traceback))
        }
    }
}

impl Sandbox for JsSandbox {
    async fn install(&mut self, package: &PackageSpec) -> Result<(), Error> {
        let body = format!(
            "return await Sandbox.install({}, {});",
            serde_json::to_string(package.specifier())?,
            serde_json::to_string(package.name())?
        );
        let exports = self.submit("<sandbox:install>", &body).await?;
        tracing::debug!(package = %package.name(), exports = %exports, "package module loaded");
        Ok(())
    }

    async fn run_entry(&mut self, source: &str) -> Result<RenderPayload, Error> {
        let value = self.submit("<sandbox:entry>", source).await?;
        RenderPayload::from_parts(value)
    }

    async fn link_document(&mut self) -> Result<(), Error> {
        self.submit("<sandbox:link>", "Sandbox.linkDocs('js');")
            .await
            .map(drop)
    }

    async fn apply_patch(&mut self, patch: Value) -> Result<(), Error> {
        let body = format!(
            "Sandbox.applyPatch({}, 'js');",
            serde_json::to_string(&patch)?
        );
        self.submit("<sandbox:patch>", &body).await.map(drop)
    }

    async fn location_params(&mut self) -> Result<Option<Vec<String>>, Error> {
        let value = self
            .submit("<sandbox:location>", "return Sandbox.locationParams();")
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn update_location(&mut self, params: Map<String, Value>) -> Result<(), Error> {
        let body = format!(
            "Sandbox.updateLocation({});",
            serde_json::to_string(&params)?
        );
        self.submit("<sandbox:location>", &body).await.map(drop)
    }
}
