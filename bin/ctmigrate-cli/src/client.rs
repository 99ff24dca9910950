// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface for making API requests to a ctmigrate-server.

use std::net::SocketAddr;

use ctmigrate_api_types as api;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use slog::{debug, o, Logger};
use thiserror::Error;

/// Errors which may be returned from the client.
#[derive(Debug, Error)]
pub enum Error {
    #[error("request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("{message} (status {status})")]
    Status { status: u16, error_code: Option<String>, message: String },
}

impl Error {
    /// The server's error code, if the server produced one.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            Error::Status { error_code, .. } => error_code.as_deref(),
            Error::Reqwest(_) => None,
        }
    }
}

/// Error body produced by the server for any failed request.
#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error_code: Option<String>,
    message: String,
}

/// Client-side connection to a ctmigrate-server.
pub struct Client {
    client: reqwest::Client,
    log: Logger,
    address: SocketAddr,
}

// Sends "request" and turns any non-success status into an error carrying
// the server's message.
async fn send_and_check_ok(
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response, Error> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let (error_code, message) = match serde_json::from_str::<ErrorBody>(&text)
    {
        Ok(body) => (body.error_code, body.message),
        Err(_) => (None, text),
    };
    Err(Error::Status { status: status.as_u16(), error_code, message })
}

impl Client {
    pub fn new(address: SocketAddr, log: Logger) -> Client {
        Client {
            client: reqwest::Client::new(),
            log: log.new(o!("server" => address.to_string())),
            address,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.address, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        debug!(self.log, "GET request to {}", path);
        let request = self.client.get(self.url(path));
        Ok(send_and_check_ok(request).await?.json().await?)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, Error> {
        debug!(self.log, "POST request to {}", path);
        let request = self.client.post(self.url(path)).json(body);
        Ok(send_and_check_ok(request).await?.json().await?)
    }

    async fn post_no_response<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), Error> {
        debug!(self.log, "POST request to {}", path);
        let request = self.client.post(self.url(path)).json(body);
        send_and_check_ok(request).await?;
        Ok(())
    }

    pub async fn containers_list(&self) -> Result<api::ContainerList, Error> {
        self.get("/containers").await
    }

    pub async fn container_get(
        &self,
        name: &str,
    ) -> Result<api::Container, Error> {
        self.get(&format!("/containers/{name}")).await
    }

    pub async fn migrate_begin(
        &self,
        name: &str,
        request: &api::MigrateBeginRequest,
    ) -> Result<api::MigrateBeginResponse, Error> {
        self.post(&format!("/containers/{name}/migrate/begin"), request).await
    }

    pub async fn migrate_prepare(
        &self,
        request: &api::MigratePrepareRequest,
    ) -> Result<api::MigratePrepareResponse, Error> {
        self.post("/migrate/prepare", request).await
    }

    pub async fn migrate_perform(
        &self,
        name: &str,
        request: &api::MigratePerformRequest,
    ) -> Result<api::MigratePerformResponse, Error> {
        self.post(&format!("/containers/{name}/migrate/perform"), request)
            .await
    }

    pub async fn migrate_finish(
        &self,
        request: &api::MigrateFinishRequest,
    ) -> Result<api::MigrateFinishResponse, Error> {
        self.post("/migrate/finish", request).await
    }

    pub async fn migrate_confirm(
        &self,
        request: &api::MigrateConfirmRequest,
    ) -> Result<(), Error> {
        self.post_no_response("/migrate/confirm", request).await
    }

    pub async fn container_save(
        &self,
        name: &str,
        request: &api::ContainerSaveRequest,
    ) -> Result<api::ContainerSaveResponse, Error> {
        self.post(&format!("/containers/{name}/save"), request).await
    }

    pub async fn container_restore(
        &self,
        request: &api::ContainerRestoreRequest,
    ) -> Result<api::ContainerRestoreResponse, Error> {
        self.post("/restore", request).await
    }
}
