//! Stream every partition of a topic over TLS until interrupted.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::bail;
use clap::Parser;
use tracing::{error, info};

use kafka_tls_demo_cli::{build_runtime, exit_status, init, shutdown_signal, Args};
use kafka_tls_demo_core::config::DemoConfig;
use kafka_tls_demo_core::runner::{run_consumer, LogMessageHandler, Outcome, Shutdown};

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
        policy = ?config.consumer.on_stream_error,
        "starting consumer"
    );

    let runtime = build_runtime()?;
    let report = runtime.block_on(async {
        let shutdown = Shutdown::new();
        let on_signal = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("shutdown signal received, stopping consumer");
                shutdown.trigger();
            })
        };

        let result = run_consumer(
            &config.connection,
            &config.client,
            &config.consumer,
            shutdown.signal(),
            Arc::new(LogMessageHandler),
        )
        .await;
        on_signal.abort();
        result
    })?;

    for summary in &report.partitions {
        if let Outcome::Failed(e) = &summary.outcome {
            error!(partition = summary.partition, messages = summary.messages, error = %e, "partition failed");
        }
    }
    if !report.is_success() {
        bail!(
            "{} of {} partitions failed",
            report.failed().count(),
            report.partitions.len()
        );
    }

    info!(messages = report.total_messages(), "consumer stopped");
    Ok(())
}
