//! One-time startup: acquire the sandbox, install packages, run the entry script.

use crate::package::PackageSpec;
use crate::protocol::{OutboundMessage, Outbox, RenderPayload};
use crate::sandbox::Sandbox;
use anyhow::Result;

/// Used when a failure's trace has no non-blank line
const FALLBACK_SUMMARY: &str = "Entry script failed";

/// What the bootstrapper installs and runs
#[derive(Debug, Clone)]
pub struct BootstrapPlan {
    pub packages: Vec<PackageSpec>,
    pub entry_source: String,
}

pub struct Bootstrapper {
    plan: BootstrapPlan,
    outbox: Outbox,
}

impl Bootstrapper {
    pub fn new(plan: BootstrapPlan, outbox: Outbox) -> Self {
        Self { plan, outbox }
    }

    /// Acquire the sandbox. Failure is fatal; there is no retry.
    pub fn initialize<S, F>(&self, load: F) -> Result<S>
    where
        F: FnOnce() -> Result<S>,
    {
        tracing::info!("loading sandbox runtime");
        self.outbox.status("Loading sandbox runtime");
        let sandbox = load()?;
        tracing::info!("sandbox runtime loaded");
        Ok(sandbox)
    }

    /// Install every package in order; a failed install is reported and skipped.
    pub async fn install_all<S: Sandbox>(&self, sandbox: &mut S) {
        for package in &self.plan.packages {
            let name = package.name();
            tracing::info!(package = %name, target = %package, "installing package");
            self.outbox.status(format!("Installing {}", name));

            if let Err(e) = sandbox.install(package).await {
                tracing::warn!(package = %name, error = %format!("{:#}", e), "package install failed");
                self.outbox.status(format!("Error while installing {}", name));
            }
        }
        tracing::info!(count = self.plan.packages.len(), "packages processed");
    }

    /// Run the entry script and post its render payload.
    ///
    /// On failure the last non-blank line of the error trace is posted as a
    /// status and the error is returned.
    pub async fn run_entry_script<S: Sandbox>(&self, sandbox: &mut S) -> Result<RenderPayload> {
        self.outbox.status("Executing code");

        match sandbox.run_entry(&self.plan.entry_source).await {
            Ok(payload) => {
                tracing::info!("entry script rendered");
                self.outbox.post(OutboundMessage::Render {
                    payload: payload.clone(),
                });
                Ok(payload)
            }
            Err(e) => {
                let trace = format!("{:#}", e);
                tracing::error!(error = %trace, "entry script failed");
                self.outbox.status(failure_summary(&trace));
                Err(e)
            }
        }
    }

    /// The whole startup sequence. Returns the ready sandbox for the bridge.
    pub async fn run<S, F>(&self, load: F) -> Result<S>
    where
        S: Sandbox,
        F: FnOnce() -> Result<S>,
    {
        let mut sandbox = self.initialize(load)?;
        self.install_all(&mut sandbox).await;
        self.run_entry_script(&mut sandbox).await?;
        Ok(sandbox)
    }
}

/// Last non-blank line of a failure's textual trace
pub fn failure_summary(trace: &str) -> String {
    trace
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .unwrap_or(FALLBACK_SUMMARY)
        .to_string()
}
