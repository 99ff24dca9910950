// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use ctmigrate::{ContainerRegistry, MigrationCoordinator};
use ctmigrate_server::server;
use dropshot::{ConfigDropshot, HttpServerStarter};
use slog::info;

/// Threads to spawn for the tokio runtime handling the API.
const API_RT_THREADS: usize = 4;

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow::anyhow!("Invalid log level"))
}

#[derive(Debug, Parser)]
#[clap(about, version)]
/// An HTTP server that migrates LXC containers to and from this host
enum Args {
    /// Generates the OpenAPI specification.
    OpenApi,
    /// Runs the migration server.
    Run {
        /// Path to a TOML configuration file. Defaults apply when omitted.
        #[clap(long, action)]
        config: Option<PathBuf>,

        #[clap(name = "CTMIGRATE_IP:PORT", action)]
        server_addr: SocketAddr,

        /// Logging level for the server
        #[clap(long, default_value_t = slog::Level::Info, value_parser = parse_log_level)]
        log_level: slog::Level,
    },
}

pub fn run_openapi() -> Result<(), String> {
    server::api()
        .openapi("ctmigrate Server API", semver::Version::new(0, 0, 1))
        .description("API for migrating LXC containers between hosts.")
        .write(&mut std::io::stdout())
        .map_err(|e| e.to_string())
}

fn run_server(
    config: ctmigrate_config::Config,
    config_dropshot: ConfigDropshot,
    log: slog::Logger,
) -> anyhow::Result<()> {
    let registry = ContainerRegistry::scan(&config.lxc_path, &log)
        .with_context(|| {
            format!("scanning containers in {}", config.lxc_path.display())
        })?;
    info!(log, "container registry loaded";
          "lxc_path" => %config.lxc_path.display(),
          "containers" => registry.names().len());

    let coordinator = MigrationCoordinator::new(
        Arc::new(registry),
        &config,
        log.new(slog::o!("component" => "coordinator")),
    );
    let context =
        server::DropshotEndpointContext::new(coordinator, config, log.new(slog::o!()));

    let api_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(API_RT_THREADS)
        .thread_name("tokio-rt-api")
        .enable_all()
        .build()?;
    let _guard = api_runtime.enter();

    info!(log, "Starting server...");

    let server = HttpServerStarter::new(
        &config_dropshot,
        server::api(),
        Arc::new(context),
        &log,
    )
    .map_err(|error| anyhow!("Failed to start server: {}", error))?
    .start();

    api_runtime
        .block_on(server)
        .map_err(|e| anyhow!("Server exited with an error: {}", e))
}

fn build_logger(level: slog::Level) -> slog::Logger {
    use slog::Drain;

    let main_drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain =
            slog_bunyan::with_name("ctmigrate-server", std::io::stdout())
                .build()
                .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let filtered_main = slog::LevelFilter::new(main_drain, level);
    slog::Logger::root(filtered_main.fuse(), slog::o!())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args {
        Args::OpenApi => run_openapi()
            .map_err(|e| anyhow!("Cannot generate OpenAPI spec: {}", e)),
        Args::Run { config, server_addr, log_level } => {
            let config = match config {
                Some(path) => ctmigrate_config::parse(&path).with_context(
                    || format!("reading config from {}", path.display()),
                )?,
                None => ctmigrate_config::Config::default(),
            };

            let config_dropshot =
                ConfigDropshot { bind_address: server_addr, ..Default::default() };

            let log = build_logger(log_level);
            run_server(config, config_dropshot, log)
        }
    }
}
