//! Shared command line for the producer and consumer demos.
//!
//! Both binaries accept the same flags, layer them over an optional YAML
//! file, and set up tracing the same way.

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tokio::signal;
use tracing::{error, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kafka_tls_demo_core::config::{DemoConfig, LoggingConfig};
use kafka_tls_demo_core::error::ConfigResult;

/// Connect to a managed Kafka service over TLS.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None, arg_required_else_help = true)]
pub struct Args {
    /// Optional YAML configuration file; flags override its values.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Broker address [default: kafka.bj.baidubce.com:9091].
    #[arg(long, value_name = "HOST:PORT")]
    pub broker: Option<String>,

    /// Topic to produce to or consume from (required).
    #[arg(long)]
    pub topic: Option<String>,

    /// Connect over TLS [default: true].
    #[arg(long = "enableTLS", value_name = "BOOL", action = ArgAction::Set)]
    pub enable_tls: Option<bool>,

    /// Client certificate (PEM) [default: client.pem].
    #[arg(long = "client_pem", value_name = "FILE")]
    pub client_pem: Option<PathBuf>,

    /// Client private key (PEM) [default: client.key].
    #[arg(long = "client_key", value_name = "FILE")]
    pub client_key: Option<PathBuf>,

    /// CA certificate (PEM) [default: ca.pem].
    #[arg(long = "ca_pem", value_name = "FILE")]
    pub ca_pem: Option<PathBuf>,

    /// INSECURE: do not verify the broker certificate [default: false].
    #[arg(long = "insecure_skip_verify", value_name = "BOOL", action = ArgAction::Set)]
    pub insecure_skip_verify: Option<bool>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Load the YAML file, if any, and apply the flags given on top of it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load_config(&self) -> ConfigResult<DemoConfig> {
        let mut config = match &self.config {
            Some(path) => DemoConfig::from_file(path)?,
            None => DemoConfig::default(),
        };
        self.apply_overrides(&mut config);
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut DemoConfig) {
        let connection = &mut config.connection;
        if let Some(broker) = &self.broker {
            connection.broker.clone_from(broker);
        }
        if let Some(topic) = &self.topic {
            connection.topic.clone_from(topic);
        }
        if let Some(enable_tls) = self.enable_tls {
            connection.enable_tls = enable_tls;
        }
        if let Some(path) = &self.client_pem {
            connection.client_pem.clone_from(path);
        }
        if let Some(path) = &self.client_key {
            connection.client_key.clone_from(path);
        }
        if let Some(path) = &self.ca_pem {
            connection.ca_pem.clone_from(path);
        }
        if let Some(skip) = self.insecure_skip_verify {
            connection.insecure_skip_verify = skip;
        }
    }

    /// Logging settings with `-v`/`-vv` applied.
    #[must_use]
    pub fn logging(&self, base: &LoggingConfig) -> LoggingConfig {
        match self.verbose {
            0 => base.clone(),
            1 => LoggingConfig {
                level: "debug".to_string(),
                ..base.clone()
            },
            _ => LoggingConfig {
                level: "trace".to_string(),
                ..base.clone()
            },
        }
    }
}

/// Install the global tracing subscriber.
pub fn setup_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());
    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

/// Startup shared by both binaries: load the config and
/// set up tracing from it.
///
/// Tracing is set up even when the config fails to load, so the failure
/// is logged like any other fatal error.
///
/// # Errors
///
/// Returns the config error after logging it.
pub fn init(args: &Args) -> anyhow::Result<DemoConfig> {
    let config = args.load_config();
    let logging = config
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    setup_tracing(&args.logging(&logging));

    config.map_err(|e| {
        error!(error = %e, "invalid configuration");
        e.into()
    })
}

/// Build the multi-threaded runtime both binaries run on.
///
/// # Errors
///
/// Returns an error if the runtime cannot be created.
pub fn build_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

/// Map a run result to the process exit status, logging a failure first.
///
/// Only the outer message is logged: library errors already embed their
/// cause, so the alternate (`{:#}`) form would print it twice.
pub fn exit_status<T>(result: &anyhow::Result<T>) -> u8 {
    match result {
        Ok(_) => 0,
        Err(e) => {
            error!(error = %e, "fatal error");
            1
        }
    }
}

/// Resolve on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
