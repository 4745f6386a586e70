//! Reporting plugin process.
//!
//! Launched by a host's supervisor with the reporting family's magic cookie.
//! Serves `ReportingPluginService` backed by the reference provider on the
//! root handle until the host disconnects.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use relay_loop::process::{EnvConfig, Handshake};
use relay_loop::reporting::{ReferenceProvider, ReportingPluginServiceServer};
use relay_loop::{broker::Server, plugin, Config};

#[derive(Debug, Parser)]
#[command(name = "relay-loop-plugin", version, about = "Reporting plugin process")]
struct Args {
    /// JSON config file (encoding versions, logging).
    #[arg(long, env = "RELAY_LOOP_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match Config::from_json_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("relay-loop-plugin: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    let env = EnvConfig::from_env();
    relay_loop::observability::init_tracing_with(
        &config.observability,
        env.as_ref().ok().map(|e| &e.tracing),
    );

    let returns = config.encoding.returns;
    let result = plugin::serve(Handshake::REPORTING, |ctx| {
        let mut root = Server::new();
        ReportingPluginServiceServer::new(ctx.broker, Arc::new(ReferenceProvider), returns)
            .register(&mut root)?;
        Ok(root)
    })
    .await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("plugin failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
