//! Send ten demo messages to a topic over TLS.

use std::process::ExitCode;

use clap::Parser;
use tracing::info;

use kafka_tls_demo_cli::{build_runtime, exit_status, init, Args};
use kafka_tls_demo_core::config::DemoConfig;
use kafka_tls_demo_core::runner::run_producer;

fn main() -> ExitCode {
    let args = Args::parse();
    let result = init(&args).and_then(run);
    ExitCode::from(exit_status(&result))
}

fn run(config: DemoConfig) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        broker = %config.connection.broker,
        topic = %config.connection.topic,
        tls = config.connection.enable_tls,
        "starting producer"
    );

    let runtime = build_runtime()?;
    let report = runtime.block_on(run_producer(
        &config.connection,
        &config.client,
        &config.producer,
    ))?;

    info!(messages = report.sent.len(), "producer finished");
    Ok(())
}
