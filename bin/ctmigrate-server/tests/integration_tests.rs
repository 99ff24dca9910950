// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ctmigrate::control::{ContainerControl, ControlError};
use ctmigrate::{Container, ContainerRegistry, MigrationCoordinator};
use ctmigrate_config::Config;
use ctmigrate_server::server;
use dropshot::{ConfigDropshot, HttpServer, HttpServerStarter};
use serde_json::{json, Value};
use slog::{o, Logger};

/// A container that is defined on this host but not running.
struct StoppedContainer {
    config_path: PathBuf,
}

impl ContainerControl for StoppedContainer {
    fn is_running(&self) -> bool {
        false
    }

    fn may_control(&self) -> bool {
        true
    }

    fn checkpoint(&self, _dir: &Path, _stop: bool) -> Result<(), ControlError> {
        unreachable!("stopped containers are never checkpointed")
    }

    fn restore(&self, _dir: &Path, _detach: bool) -> Result<(), ControlError> {
        unreachable!("no image is ever delivered in these tests")
    }

    fn stop(&self) -> Result<(), ControlError> {
        Ok(())
    }

    fn resume(&self) -> Result<(), ControlError> {
        Ok(())
    }

    fn init_pid(&self) -> Option<u32> {
        None
    }

    fn config_item(&self, key: &str) -> Result<String, ControlError> {
        Err(ControlError::MissingConfigItem(key.to_owned()))
    }

    fn config_path(&self) -> PathBuf {
        self.config_path.clone()
    }
}

fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn initialize_server(
    lxc_path: &Path,
) -> HttpServer<Arc<server::DropshotEndpointContext>> {
    let log = test_logger();
    let registry = ContainerRegistry::new();
    let config_path = lxc_path.join("web1");
    std::fs::create_dir_all(&config_path).unwrap();
    registry.insert(Container::new(
        "web1",
        "lxc.uts.name = web1\n",
        Arc::new(StoppedContainer { config_path }),
    ));

    let config = Config { lxc_path: lxc_path.to_owned(), ..Default::default() };
    let coordinator =
        MigrationCoordinator::new(Arc::new(registry), &config, log.clone());
    let context =
        server::DropshotEndpointContext::new(coordinator, config, log.clone());

    let config_dropshot = ConfigDropshot {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    };
    HttpServerStarter::new(
        &config_dropshot,
        server::api(),
        Arc::new(context),
        &log,
    )
    .unwrap()
    .start()
}

#[tokio::test]
async fn test_container_listing() {
    let lxc_path = tempfile::tempdir().unwrap();
    let server = initialize_server(lxc_path.path());
    let base = format!("http://{}", server.local_addr());
    let client = reqwest::Client::new();

    let list: Value = client
        .get(format!("{base}/containers"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        list,
        json!({
            "containers": [{
                "name": "web1",
                "state": { "state": "shutoff", "reason": "Unknown" },
                "migrating": false,
            }]
        })
    );

    let res =
        client.get(format!("{base}/containers/db1")).send().await.unwrap();
    assert_eq!(res.status().as_u16(), 404);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error_code"], "NoSuchContainer");

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_phase_errors_carry_kind() {
    let lxc_path = tempfile::tempdir().unwrap();
    let server = initialize_server(lxc_path.path());
    let base = format!("http://{}", server.local_addr());
    let client = reqwest::Client::new();

    // Only running containers can be migrated away.
    let res = client
        .post(format!("{base}/containers/web1/migrate/begin"))
        .json(&json!({ "params": {} }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 400);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error_code"], "InvalidState");

    // Unknown parameters are rejected before any phase runs.
    let res = client
        .post(format!("{base}/containers/web1/migrate/begin"))
        .json(&json!({ "params": { "bandwidth": 100 } }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 400);

    // Finish without Prepare has nothing to finish.
    let res = client
        .post(format!("{base}/migrate/finish"))
        .json(&json!({ "name": "web1", "params": {}, "cancelled": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 400);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error_code"], "NoMigrationInProgress");

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_save_requires_target_directory() {
    let lxc_path = tempfile::tempdir().unwrap();
    let server = initialize_server(lxc_path.path());
    let base = format!("http://{}", server.local_addr());

    let res = reqwest::Client::new()
        .post(format!("{base}/containers/web1/save"))
        .json(&json!({ "to": lxc_path.path().join("missing") }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 400);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error_code"], "ConfigurationError");

    server.close().await.unwrap();
}
