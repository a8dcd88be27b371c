//! # Sandbox Worker
//!
//! Bootstraps an embedded deno_core sandbox, installs a list of packages into
//! it, runs an entry script that builds a document, and then relays document
//! patches between the host and the sandbox.
//!
//! ## Lifecycle
//!
//! 1. [`Bootstrapper`] acquires the sandbox, installs packages best-effort
//!    (a failed package is reported and skipped), and runs the entry script.
//!    An entry script failure is fatal.
//! 2. [`Bridge`] takes ownership of the ready sandbox and handles
//!    `rendered`, `patch` and `location` messages one at a time.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sandbox_worker::{BootstrapPlan, Bootstrapper, Bridge, JsSandbox, Outbox, WorkerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = WorkerConfig::default();
//!     let (outbox, rx) = Outbox::channel();
//!     tokio::spawn(sandbox_worker::write_messages(rx, tokio::io::stdout()));
//!
//!     let plan = BootstrapPlan {
//!         packages: config.packages.clone(),
//!         entry_source: config.entry_source()?,
//!     };
//!     let sandbox = Bootstrapper::new(plan, outbox.clone())
//!         .run(|| JsSandbox::new(&config, outbox.clone()))
//!         .await?;
//!
//!     let stdin = tokio::io::BufReader::new(tokio::io::stdin());
//!     Bridge::new(sandbox, outbox).run(stdin).await
//! }
//! ```

mod bootstrap;
mod bridge;
mod config;
mod fetch;
mod loader;
mod package;
mod protocol;
mod runtime;
mod sandbox;
mod sanitize;
pub mod telemetry;

pub use bootstrap::{failure_summary, BootstrapPlan, Bootstrapper};
pub use bridge::Bridge;
pub use config::{LogFormat, LogSettings, RenderOptions, WorkerConfig, DEMO_ENTRY_SCRIPT};
pub use package::PackageSpec;
pub use protocol::{write_messages, InboundMessage, OutboundMessage, Outbox, RenderPayload};
pub use runtime::{ConsoleOutput, JsSandbox};
pub use sandbox::Sandbox;
