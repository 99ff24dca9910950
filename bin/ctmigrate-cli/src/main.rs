// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use ctmigrate_api_types as api;
use slog::{info, o, warn, Drain, Level, Logger};

mod client;

use client::Client;

#[derive(Debug, Parser)]
#[clap(about, version)]
/// A simple CLI tool to drive ctmigrate-server
struct Opt {
    /// ctmigrate-server address, as HOST:PORT
    #[clap(short, long, value_parser = resolve_addr)]
    server: SocketAddr,

    /// Enable debugging
    #[clap(short, long, action)]
    debug: bool,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the containers the server knows about
    List,

    /// Show the state of one container
    Get {
        /// Container name
        #[clap(action)]
        name: String,
    },

    /// Checkpoint a container into a directory on the server's host
    Save {
        /// Container name
        #[clap(action)]
        name: String,

        /// Directory to write the checkpoint under
        #[clap(long, action)]
        to: PathBuf,

        /// Leave the container running after the checkpoint
        #[clap(long, action)]
        running: bool,
    },

    /// Restore a container from a checkpoint directory
    Restore {
        /// Checkpoint directory; its last component names the container
        #[clap(action)]
        from: PathBuf,
    },

    /// Move a running container to another ctmigrate-server
    Migrate {
        /// Container name
        #[clap(action)]
        name: String,

        /// Destination ctmigrate-server address, as HOST:PORT
        #[clap(long, value_parser = resolve_addr)]
        dst: SocketAddr,

        /// Address the checkpoint should be streamed to, if not the
        /// destination's own hostname
        #[clap(long, action)]
        uri: Option<String>,

        /// Name for the container on the destination
        #[clap(long, action)]
        dest_name: Option<String>,
    },
}

fn resolve_addr(server: &str) -> anyhow::Result<SocketAddr> {
    server.to_socket_addrs()?.next().ok_or_else(|| {
        anyhow!("failed to resolve server argument '{}'", server)
    })
}

/// Create a top-level logger that outputs to stderr
fn create_logger(opt: &Opt) -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let level = if opt.debug { Level::Debug } else { Level::Info };
    let drain = slog::LevelFilter(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    Logger::root(drain, o!())
}

fn describe(container: &api::Container) -> String {
    let state = match container.state {
        api::ContainerState::Running { pid, reason } => {
            format!("running (pid {pid}, {reason:?})")
        }
        api::ContainerState::Shutoff { reason } => {
            format!("shut off ({reason:?})")
        }
    };
    let migrating = if container.migrating { ", migrating" } else { "" };
    format!("{}: {state}{migrating}", container.name)
}

async fn list_containers(client: &Client) -> anyhow::Result<()> {
    let list = client
        .containers_list()
        .await
        .with_context(|| anyhow!("failed to list containers"))?;

    for container in &list.containers {
        println!("{}", describe(container));
    }

    Ok(())
}

async fn get_container(client: &Client, name: &str) -> anyhow::Result<()> {
    let container = client
        .container_get(name)
        .await
        .with_context(|| anyhow!("failed to get container {name}"))?;

    println!("{}", describe(&container));

    Ok(())
}

async fn save_container(
    client: &Client,
    name: &str,
    to: PathBuf,
    running: bool,
) -> anyhow::Result<()> {
    let request = api::ContainerSaveRequest {
        to: to.to_string_lossy().into_owned(),
        running,
    };
    let response = client
        .container_save(name, &request)
        .await
        .with_context(|| anyhow!("failed to save container {name}"))?;

    println!("{name} saved to {}", response.path);

    Ok(())
}

async fn restore_container(
    client: &Client,
    from: PathBuf,
) -> anyhow::Result<()> {
    let request =
        api::ContainerRestoreRequest { from: from.to_string_lossy().into_owned() };
    let response = client
        .container_restore(&request)
        .await
        .with_context(|| anyhow!("failed to restore from {}", from.display()))?;

    println!("{} restored, init pid {}", response.name, response.pid);

    Ok(())
}

/// Runs the five migration phases against the two servers.
///
/// Once the destination has prepared, Finish and Confirm are always sent so
/// that both hosts can tear down their half of the migration; a failure in
/// one phase is passed on as `cancelled` to the next.
async fn migrate_container(
    src_client: &Client,
    dst_client: &Client,
    name: &str,
    uri: Option<String>,
    dest_name: Option<String>,
    log: &Logger,
) -> anyhow::Result<()> {
    let params = api::MigrationParams {
        destination_name: dest_name,
        migrate_uri: uri,
        flags: 0,
    };

    let begin = src_client
        .migrate_begin(
            name,
            &api::MigrateBeginRequest { params: params.clone() },
        )
        .await
        .with_context(|| anyhow!("source refused to begin migration"))?;

    let prepare = dst_client
        .migrate_prepare(&api::MigratePrepareRequest {
            name: name.to_owned(),
            definition: Some(begin.definition),
            params: params.clone(),
        })
        .await
        .with_context(|| anyhow!("destination failed to prepare"))?;
    info!(log, "destination prepared";
          "migration_id" => %prepare.migration_id,
          "address" => &prepare.address,
          "checkpoint_port" => prepare.checkpoint_port,
          "copy_port" => prepare.copy_port);

    let params = api::MigrationParams {
        migrate_uri: Some(prepare.address.clone()),
        ..params
    };
    let perform = src_client
        .migrate_perform(
            name,
            &api::MigratePerformRequest { params: params.clone() },
        )
        .await;
    match &perform {
        Ok(response) => {
            info!(log, "source is sending";
                  "migration_id" => %response.migration_id)
        }
        Err(e) => warn!(log, "perform failed, cancelling destination: {e}"),
    }

    let finish = dst_client
        .migrate_finish(&api::MigrateFinishRequest {
            name: name.to_owned(),
            params: params.clone(),
            cancelled: perform.is_err(),
        })
        .await;
    if let Err(e) = &finish {
        warn!(log, "finish failed: {e}";
              "error_code" => e.error_code().unwrap_or("none"));
    }

    // A failed Perform leaves no session on the source to confirm.
    if let Err(e) = perform {
        return Err(e).with_context(|| anyhow!("source failed to perform"));
    }

    let confirm = src_client
        .migrate_confirm(&api::MigrateConfirmRequest {
            name: name.to_owned(),
            params,
            cancelled: finish.is_err(),
        })
        .await;

    let pid = match finish {
        Ok(response) => response.pid,
        Err(e) => {
            if let Err(e) = confirm {
                warn!(log, "source reported: {e}");
            }
            return Err(e).with_context(|| {
                anyhow!("destination failed to finish, source resumed")
            });
        }
    };
    confirm.with_context(|| {
        anyhow!("destination is running {name} but the source did not confirm")
    })?;

    println!(
        "{name} migrated from {} to {}, init pid {pid}",
        src_client.address(),
        dst_client.address()
    );

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let log = create_logger(&opt);

    let client = Client::new(opt.server, log.new(o!()));

    match opt.cmd {
        Command::List => list_containers(&client).await?,
        Command::Get { name } => get_container(&client, &name).await?,
        Command::Save { name, to, running } => {
            save_container(&client, &name, to, running).await?
        }
        Command::Restore { from } => restore_container(&client, from).await?,
        Command::Migrate { name, dst, uri, dest_name } => {
            let dst_client = Client::new(dst, log.clone());
            migrate_container(&client, &dst_client, &name, uri, dest_name, &log)
                .await?
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_migrate_arguments() {
        let opt = Opt::try_parse_from([
            "ctmigrate-cli",
            "-s",
            "127.0.0.1:12400",
            "migrate",
            "web1",
            "--dst",
            "127.0.0.1:12401",
            "--dest-name",
            "web2",
        ])
        .unwrap();
        assert_eq!(opt.server, "127.0.0.1:12400".parse().unwrap());
        match opt.cmd {
            Command::Migrate { name, dst, uri, dest_name } => {
                assert_eq!(name, "web1");
                assert_eq!(dst.port(), 12401);
                assert_eq!(uri, None);
                assert_eq!(dest_name.as_deref(), Some("web2"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn server_needs_a_port() {
        assert!(resolve_addr("127.0.0.1").is_err());
        assert!(resolve_addr("127.0.0.1:80").is_ok());
    }

    #[test]
    fn describes_container_state() {
        let container = api::Container {
            name: "web1".to_owned(),
            state: api::ContainerState::Running {
                pid: 4242,
                reason: api::RunningReason::Migrated,
            },
            migrating: false,
        };
        assert_eq!(describe(&container), "web1: running (pid 4242, Migrated)");
    }
}
