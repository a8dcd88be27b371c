//! Sandbox worker CLI
//!
//!   sandbox-worker [--config worker.json] [--package <target>]...
//!                  [--packages-dir <dir>] [--allow-origin <origin>]...
//!                  [--entry <script.js>] [--timeout-ms <n>]
//!                  [--log-format compact|json]
//!
//! Protocol (JSON lines):
//!   stdin:  {"type":"rendered"} | {"type":"patch","patch":"..."} | {"type":"location","location":"..."}
//!   stdout: {"type":"status","msg":"..."} | {"type":"render",...} | {"type":"patch",...} | {"type":"idle"}
//!
//! Logs go to stderr.

use anyhow::Result;
use sandbox_worker::{
    telemetry, write_messages, BootstrapPlan, Bootstrapper, Bridge, JsSandbox, Outbox,
    WorkerConfig,
};
use std::process;
use tokio::io::BufReader;

fn print_usage() {
    eprintln!("Sandbox worker - bootstraps a script sandbox and relays document patches");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  sandbox-worker [--config worker.json] [--package <target>]...");
    eprintln!("                 [--packages-dir <dir>] [--allow-origin <origin>]...");
    eprintln!("                 [--entry <script.js>] [--timeout-ms <n>] [--log-format compact|json]");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  sandbox-worker --packages-dir ./packages --package leaflet");
    eprintln!("  sandbox-worker --allow-origin https://cdn.example.com \\");
    eprintln!("                 --package https://cdn.example.com/markers-0.2.0.js");
}

async fn run(config: WorkerConfig) -> Result<()> {
    let (outbox, rx) = Outbox::channel();
    let writer = tokio::spawn(write_messages(rx, tokio::io::stdout()));

    let plan = BootstrapPlan {
        packages: config.packages.clone(),
        entry_source: config.entry_source()?,
    };

    // Sandbox is created ONCE here and handed to the bridge
    let sandbox = Bootstrapper::new(plan, outbox.clone())
        .run(|| JsSandbox::new(&config, outbox.clone()))
        .await;

    let result = match sandbox {
        Ok(sandbox) => {
            tracing::info!("worker ready, reading host messages from stdin");
            let stdin = BufReader::new(tokio::io::stdin());
            let mut bridge = Bridge::new(sandbox, outbox);
            bridge.run(stdin).await
        }
        Err(e) => {
            drop(outbox);
            Err(e)
        }
    };

    // The bridge (and with it the sandbox's outbox) is gone; flush what is queued
    writer.await??;
    result
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    let config = match WorkerConfig::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            print_usage();
            eprintln!();
            eprintln!("error: {:#}", e);
            process::exit(2);
        }
    };

    if let Err(e) = telemetry::init(&config.log) {
        eprintln!("error: {:#}", e);
        process::exit(1);
    }

    if let Err(e) = run(config).await {
        tracing::error!(error = %format!("{:#}", e), "worker stopped");
        process::exit(1);
    }
}
