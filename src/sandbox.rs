//! The script-execution sandbox as seen by the bootstrapper and bridge.

use crate::package::PackageSpec;
use crate::protocol::RenderPayload;
use anyhow::Result;
use serde_json::{Map, Value};

/// Operations the worker submits to the embedded sandbox.
///
/// Every call is a script submission; the sandbox runs one at a time.
#[allow(async_fn_in_trait)]
pub trait Sandbox {
    /// Install one package into the sandbox's package registry.
    async fn install(&mut self, package: &PackageSpec) -> Result<()>;

    /// Run the entry script and collect its three-part render result.
    async fn run_entry(&mut self, source: &str) -> Result<RenderPayload>;

    /// Bind live document changes to the outbound patch callback.
    async fn link_document(&mut self) -> Result<()>;

    /// Apply a host patch to the live document.
    async fn apply_patch(&mut self, patch: Value) -> Result<()>;

    /// Recognized location parameters, or `None` when location is not tracked.
    async fn location_params(&mut self) -> Result<Option<Vec<String>>>;

    /// Merge already-filtered parameters into the tracked location.
    async fn update_location(&mut self, params: Map<String, Value>) -> Result<()>;
}
