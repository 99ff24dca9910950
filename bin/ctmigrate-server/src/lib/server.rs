// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP server callback functions.
//!
//! Each migration phase blocks on container tools and helper processes, so
//! handlers hand the work to tokio's blocking pool and only await its result.

use std::path::Path;
use std::sync::Arc;

use ctmigrate::migrate::MigrateRole;
use ctmigrate::registry::{self, lock_container};
use ctmigrate::save::{CheckpointStore, SaveFlags};
use ctmigrate::{MigrateError, MigrationCoordinator, SessionTable};
use ctmigrate_api_types as api;
use ctmigrate_config::Config;
use dropshot::{
    endpoint, ApiDescription, HttpError, HttpResponseOk,
    HttpResponseUpdatedNoContent, Path as PathParams, RequestContext,
    TypedBody,
};
use slog::{info, Logger};

/// Context accessible from HTTP callbacks.
pub struct DropshotEndpointContext {
    coordinator: MigrationCoordinator,
    sessions: SessionTable,
    config: Config,
    log: Logger,
}

impl DropshotEndpointContext {
    pub fn new(
        coordinator: MigrationCoordinator,
        config: Config,
        log: Logger,
    ) -> Self {
        DropshotEndpointContext {
            coordinator,
            sessions: SessionTable::new(),
            config,
            log,
        }
    }

    fn store(&self) -> CheckpointStore<'_> {
        CheckpointStore::new(
            self.coordinator.registry(),
            &self.config.checkpoint_tool,
            &self.log,
        )
    }

    fn describe(&self, name: &str) -> Result<api::Container, MigrateError> {
        let container = self
            .coordinator
            .registry()
            .get(name)
            .ok_or_else(|| MigrateError::NoSuchContainer(name.to_owned()))?;
        let state = lock_container(&container).state();
        Ok(api::Container {
            name: name.to_owned(),
            state: api_state(state),
            migrating: self.sessions.contains(name),
        })
    }

    /// Refuses local save/restore of a container that is mid-migration.
    fn ensure_not_migrating(&self, name: &str) -> Result<(), MigrateError> {
        if self.sessions.contains(name) {
            return Err(MigrateError::MigrationInProgress(name.to_owned()));
        }
        Ok(())
    }
}

fn api_state(state: registry::ContainerState) -> api::ContainerState {
    use registry::{ContainerState, RunningReason, ShutoffReason};
    match state {
        ContainerState::Running { pid, reason } => api::ContainerState::Running {
            pid,
            reason: match reason {
                RunningReason::Booted => api::RunningReason::Booted,
                RunningReason::Restored => api::RunningReason::Restored,
                RunningReason::Migrated => api::RunningReason::Migrated,
            },
        },
        ContainerState::Shutoff { reason } => api::ContainerState::Shutoff {
            reason: match reason {
                ShutoffReason::Shutdown => api::ShutoffReason::Shutdown,
                ShutoffReason::Saved => api::ShutoffReason::Saved,
                ShutoffReason::Migrated => api::ShutoffReason::Migrated,
                ShutoffReason::Unknown => api::ShutoffReason::Unknown,
            },
        },
    }
}

fn lib_params(params: api::MigrationParams) -> ctmigrate::MigrationParams {
    ctmigrate::MigrationParams {
        destination_name: params.destination_name,
        migrate_uri: params.migrate_uri,
        flags: params.flags,
    }
}

/// Maps a migration error onto an HTTP error whose `error_code` is the
/// error's stable kind.
pub fn http_error(err: MigrateError) -> HttpError {
    let code = Some(err.kind().to_string());
    let msg = err.to_string();
    match &err {
        MigrateError::NoSuchContainer(_) => HttpError::for_not_found(code, msg),
        MigrateError::InvalidState { .. }
        | MigrateError::Configuration { .. }
        | MigrateError::AlreadyExists { .. }
        | MigrateError::PermissionDenied(_)
        | MigrateError::Cancelled(_)
        | MigrateError::NoMigrationInProgress(_) => {
            HttpError::for_bad_request(code, msg)
        }
        MigrateError::ResourceUnavailable { .. }
        | MigrateError::MigrationInProgress(_) => {
            HttpError::for_unavail(code, msg)
        }
        MigrateError::ProcessFailure { .. }
        | MigrateError::OperationFailed { .. } => {
            // Expose the detail; the caller decides whether to cancel.
            let mut e = HttpError::for_internal_error(msg.clone());
            e.error_code = code;
            e.external_message = msg;
            e
        }
    }
}

/// Runs `f` on the blocking thread pool.
async fn run_blocking<T, F>(f: F) -> Result<T, HttpError>
where
    F: FnOnce() -> Result<T, MigrateError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| {
            HttpError::for_internal_error(format!("request task failed: {e}"))
        })?
        .map_err(http_error)
}

#[endpoint {
    method = GET,
    path = "/containers",
}]
async fn containers_list(
    rqctx: RequestContext<Arc<DropshotEndpointContext>>,
) -> Result<HttpResponseOk<api::ContainerList>, HttpError> {
    let ctx = rqctx.context().clone();
    let list = run_blocking(move || {
        let containers = ctx
            .coordinator
            .registry()
            .names()
            .iter()
            .filter_map(|name| ctx.describe(name).ok())
            .collect();
        Ok(api::ContainerList { containers })
    })
    .await?;
    Ok(HttpResponseOk(list))
}

#[endpoint {
    method = GET,
    path = "/containers/{name}",
}]
async fn container_get(
    rqctx: RequestContext<Arc<DropshotEndpointContext>>,
    path_params: PathParams<api::ContainerPathParams>,
) -> Result<HttpResponseOk<api::Container>, HttpError> {
    let ctx = rqctx.context().clone();
    let name = path_params.into_inner().name;
    let container = run_blocking(move || ctx.describe(&name)).await?;
    Ok(HttpResponseOk(container))
}

#[endpoint {
    method = POST,
    path = "/containers/{name}/migrate/begin",
}]
async fn migrate_begin(
    rqctx: RequestContext<Arc<DropshotEndpointContext>>,
    path_params: PathParams<api::ContainerPathParams>,
    request: TypedBody<api::MigrateBeginRequest>,
) -> Result<HttpResponseOk<api::MigrateBeginResponse>, HttpError> {
    let ctx = rqctx.context().clone();
    let name = path_params.into_inner().name;
    let params = lib_params(request.into_inner().params);
    let definition =
        run_blocking(move || ctx.coordinator.begin(&name, &params)).await?;
    Ok(HttpResponseOk(api::MigrateBeginResponse { definition }))
}

#[endpoint {
    method = POST,
    path = "/migrate/prepare",
}]
async fn migrate_prepare(
    rqctx: RequestContext<Arc<DropshotEndpointContext>>,
    request: TypedBody<api::MigratePrepareRequest>,
) -> Result<HttpResponseOk<api::MigratePrepareResponse>, HttpError> {
    let ctx = rqctx.context().clone();
    let request = request.into_inner();
    let response = run_blocking(move || {
        let params = lib_params(request.params);
        let name = params.destination_name_or(&request.name).to_owned();
        let reservation =
            ctx.sessions.reserve(&name, MigrateRole::Destination)?;
        if let Some(definition) = request.definition.as_deref() {
            ctx.coordinator.compare_definition(&name, definition)?;
        }
        let (address, session) =
            ctx.coordinator.prepare(&request.name, &params)?;
        let ports = session.endpoint().ports;
        let response = api::MigratePrepareResponse {
            migration_id: session.id(),
            address,
            checkpoint_port: ports.checkpoint,
            copy_port: ports.copy,
        };
        reservation.fill(session);
        Ok(response)
    })
    .await?;

    info!(rqctx.log, "prepared for incoming migration";
          "migration_id" => %response.migration_id,
          "address" => &response.address);
    Ok(HttpResponseOk(response))
}

#[endpoint {
    method = POST,
    path = "/containers/{name}/migrate/perform",
}]
async fn migrate_perform(
    rqctx: RequestContext<Arc<DropshotEndpointContext>>,
    path_params: PathParams<api::ContainerPathParams>,
    request: TypedBody<api::MigratePerformRequest>,
) -> Result<HttpResponseOk<api::MigratePerformResponse>, HttpError> {
    let ctx = rqctx.context().clone();
    let name = path_params.into_inner().name;
    let params = lib_params(request.into_inner().params);
    let migration_id = run_blocking(move || {
        let reservation = ctx.sessions.reserve(&name, MigrateRole::Source)?;
        let session = ctx.coordinator.perform(&name, &params)?;
        let id = session.id();
        reservation.fill(session);
        Ok(id)
    })
    .await?;
    Ok(HttpResponseOk(api::MigratePerformResponse { migration_id }))
}

#[endpoint {
    method = POST,
    path = "/migrate/finish",
}]
async fn migrate_finish(
    rqctx: RequestContext<Arc<DropshotEndpointContext>>,
    request: TypedBody<api::MigrateFinishRequest>,
) -> Result<HttpResponseOk<api::MigrateFinishResponse>, HttpError> {
    let ctx = rqctx.context().clone();
    let request = request.into_inner();
    let pid = run_blocking(move || {
        let params = lib_params(request.params);
        let name = params.destination_name_or(&request.name).to_owned();
        // The slot is released only once Finish has torn the session down.
        let (session, _slot) =
            ctx.sessions.take(&name, MigrateRole::Destination).unzip();
        ctx.coordinator.finish(&name, &params, session, request.cancelled)
    })
    .await?;
    Ok(HttpResponseOk(api::MigrateFinishResponse { pid }))
}

#[endpoint {
    method = POST,
    path = "/migrate/confirm",
}]
async fn migrate_confirm(
    rqctx: RequestContext<Arc<DropshotEndpointContext>>,
    request: TypedBody<api::MigrateConfirmRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context().clone();
    let request = request.into_inner();
    run_blocking(move || {
        let params = lib_params(request.params);
        let (session, _slot) =
            ctx.sessions.take(&request.name, MigrateRole::Source).unzip();
        ctx.coordinator.confirm(
            &request.name,
            &params,
            session,
            request.cancelled,
        )
    })
    .await?;
    Ok(HttpResponseUpdatedNoContent {})
}

#[endpoint {
    method = POST,
    path = "/containers/{name}/save",
}]
async fn container_save(
    rqctx: RequestContext<Arc<DropshotEndpointContext>>,
    path_params: PathParams<api::ContainerPathParams>,
    request: TypedBody<api::ContainerSaveRequest>,
) -> Result<HttpResponseOk<api::ContainerSaveResponse>, HttpError> {
    let ctx = rqctx.context().clone();
    let name = path_params.into_inner().name;
    let request = request.into_inner();
    let path = run_blocking(move || {
        ctx.ensure_not_migrating(&name)?;
        ctx.store().save(
            &name,
            Path::new(&request.to),
            SaveFlags { running: request.running },
        )
    })
    .await?;
    Ok(HttpResponseOk(api::ContainerSaveResponse {
        path: path.display().to_string(),
    }))
}

#[endpoint {
    method = POST,
    path = "/restore",
}]
async fn container_restore(
    rqctx: RequestContext<Arc<DropshotEndpointContext>>,
    request: TypedBody<api::ContainerRestoreRequest>,
) -> Result<HttpResponseOk<api::ContainerRestoreResponse>, HttpError> {
    let ctx = rqctx.context().clone();
    let from = request.into_inner().from;
    let (name, pid) = run_blocking(move || {
        let from = Path::new(&from);
        if let Some(name) = from.file_name().and_then(|n| n.to_str()) {
            ctx.ensure_not_migrating(name)?;
        }
        ctx.store().restore(from)
    })
    .await?;
    Ok(HttpResponseOk(api::ContainerRestoreResponse { name, pid }))
}

/// Returns a Dropshot [`ApiDescription`] object to launch a server.
pub fn api() -> ApiDescription<Arc<DropshotEndpointContext>> {
    let mut api = ApiDescription::new();
    api.register(containers_list).unwrap();
    api.register(container_get).unwrap();
    api.register(migrate_begin).unwrap();
    api.register(migrate_prepare).unwrap();
    api.register(migrate_perform).unwrap();
    api.register(migrate_finish).unwrap();
    api.register(migrate_confirm).unwrap();
    api.register(container_save).unwrap();
    api.register(container_restore).unwrap();
    api
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_description_is_complete() {
        let spec = api()
            .openapi("ctmigrate", semver::Version::new(0, 0, 1))
            .json()
            .unwrap();
        let paths = spec["paths"].as_object().unwrap();
        for path in [
            "/containers",
            "/containers/{name}",
            "/containers/{name}/migrate/begin",
            "/migrate/prepare",
            "/containers/{name}/migrate/perform",
            "/migrate/finish",
            "/migrate/confirm",
            "/containers/{name}/save",
            "/restore",
        ] {
            assert!(paths.contains_key(path), "missing {path}");
        }
    }

    #[test]
    fn errors_carry_their_kind() {
        let err = http_error(MigrateError::NoSuchContainer("web1".into()));
        assert_eq!(err.status_code.as_u16(), 404);
        assert_eq!(err.error_code.as_deref(), Some("NoSuchContainer"));

        let err = http_error(MigrateError::MigrationInProgress("web1".into()));
        assert_eq!(err.status_code.as_u16(), 503);

        let err = http_error(MigrateError::Cancelled("web1".into()));
        assert_eq!(err.status_code.as_u16(), 400);
        assert!(err.external_message.contains("web1"));

        let err = http_error(MigrateError::OperationFailed {
            name: "web1".into(),
            detail: "lxc-stop exited with 1".into(),
        });
        assert_eq!(err.status_code.as_u16(), 500);
        assert_eq!(err.error_code.as_deref(), Some("OperationFailed"));
        assert!(err.external_message.contains("lxc-stop"));
    }
}
