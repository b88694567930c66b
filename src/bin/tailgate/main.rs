// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, ValueEnum};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tailgate::BoxError;
use tailgate::exporters::kafka::KafkaProducerFactory;
use tailgate::init::agent::Agent;
use tailgate::init::args::AgentRun;
use tailgate::init::config::load_topics_file;
use tailgate::receivers::dir::NativeNotifier;
use tracing::metadata::LevelFilter;
use tracing::{error, info, warn};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Run agent
    Start(Box<AgentRun>),

    /// Return version
    Version,
}

#[derive(Debug, Parser)]
#[command(name = "tailgate")]
#[command(bin_name = "tailgate")]
#[command(version, about, long_about = None)]
#[command(subcommand_required = true)]
struct Arguments {
    #[arg(
        value_enum,
        long,
        global = true,
        env = "TAILGATE_LOG_FORMAT",
        default_value = "text"
    )]
    /// Log format
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    match opt.command {
        Commands::Version => {
            println!("{}", get_version())
        }
        Commands::Start(agent) => {
            let _guard = match setup_logging(&opt.log_format) {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("ERROR: failed to setup logging: {}", e);
                    return ExitCode::from(1);
                }
            };

            if let Err(e) = run_agent(agent) {
                error!(error = e, "Failed to run agent.");
                return ExitCode::from(1);
            }
        }
    }

    ExitCode::SUCCESS
}

fn run_agent(agent_args: Box<AgentRun>) -> Result<(), BoxError> {
    let config = agent_args.build_config()?;
    let topics_file = config.topics_file.clone();
    let topics = load_topics_file(&topics_file)?;

    // Subscribe before anything starts so an early signal is not lost
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    let notifier = Arc::new(NativeNotifier::new()?);
    let mut agent = Agent::new(config, notifier, Arc::new(KafkaProducerFactory));
    agent.start(&topics)?;

    let result = loop {
        let mut shutdown = false;
        for signal in signals.pending() {
            match signal {
                SIGHUP => reload(&mut agent, &topics_file),
                _ => {
                    info!(signal, "Shutdown signal received.");
                    shutdown = true;
                }
            }
        }
        if shutdown {
            break Ok(());
        }

        if let Err(e) = agent.check_health() {
            break Err(e);
        }
        thread::sleep(SIGNAL_POLL_INTERVAL);
    };

    agent.stop();
    result
}

fn reload(agent: &mut Agent, path: &std::path::Path) {
    info!(path = ?path, "Reloading topic file");
    let topics = match load_topics_file(path) {
        Ok(topics) => topics,
        Err(e) => {
            warn!(error = e, "Topic file rejected, keeping current topics");
            return;
        }
    };

    if let Err(e) = agent.reconcile(&topics) {
        warn!(error = e, "Topic file rejected, keeping current topics");
    }
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

fn setup_logging(log_format: &LogFormatArg) -> Result<LoggerGuard, BoxError> {
    LogTracer::init().map_err(|e| format!("unable to setup log tracer: {}", e))?;

    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?
        .add_directive("rdkafka=warn".parse()?)
        .add_directive("notify=warn".parse()?);

    if *log_format == LogFormatArg::Json {
        let app_name = format!("{}-{}", env!("CARGO_PKG_NAME"), get_version());
        let bunyan_formatting_layer = BunyanFormattingLayer::new(app_name, non_blocking_writer);

        let subscriber = Registry::default()
            .with(filter)
            .with(JsonStorageLayer)
            .with(bunyan_formatting_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        use std::io;
        use std::io::IsTerminal;

        // Skip color codes when not in a terminal
        let use_ansi = io::stdout().is_terminal();

        let stdout_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_target(false)
            .with_level(true)
            .with_ansi(use_ansi)
            .compact();

        let subscriber = Registry::default().with(filter).with(stdout_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(guard)
}

fn get_version() -> String {
    let version_build = option_env!("BUILD_SHORT_SHA").unwrap_or("dev");

    format!("{}-{}", env!("CARGO_PKG_VERSION"), version_build)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subcommand_is_required() {
        assert!(Arguments::try_parse_from(["tailgate"]).is_err());

        let args = Arguments::try_parse_from(["tailgate", "version"]).unwrap();
        assert!(matches!(args.command, Commands::Version));
        assert_eq!(args.log_format, LogFormatArg::Text);
    }

    #[test]
    fn test_version_has_build_suffix() {
        let version = get_version();
        assert!(version.starts_with(env!("CARGO_PKG_VERSION")));
        assert!(version.len() > env!("CARGO_PKG_VERSION").len() + 1);
    }
}
