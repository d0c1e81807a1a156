//! The registry's HTTP server.
//!
//! Every instance serves its health and metrics. The registry host also serves its membership
//! store to the rest of the ensemble, whose members reach it through `crate::store::HttpStore`.

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::{Body, HttpBody};
use axum::extract::{Extension, Json, Path};
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{AddExtensionLayer, Router};
use futures::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::database::Database;
use crate::error::{RegistryError, ShutdownError};
use crate::models::{Account, ApiKeys, Credential, Member};
use crate::ports::PortSet;
use crate::prom::{get_metrics_recorder, scrape};
use crate::store::{Checkin, MembershipStore};

pub const ROUTE_HEALTH: &str = "/health";
pub const ROUTE_METRICS: &str = "/metrics";
pub const ROUTE_MEMBERS: &str = "/v1/members";
pub const ROUTE_MEMBER: &str = "/v1/members/:uuid";
pub const ROUTE_MEMBER_PORTS: &str = "/v1/members/:uuid/ports";
pub const ROUTE_CHECKINS: &str = "/v1/checkins";
pub const ROUTE_ASSIGNMENTS: &str = "/v1/assignments";
pub const ROUTE_REVOCATIONS: &str = "/v1/revocations";
pub const ROUTE_API_KEYS: &str = "/v1/api-keys";
pub const ROUTE_ACCOUNTS: &str = "/v1/accounts";
pub const ROUTE_CREDENTIALS: &str = "/v1/credentials";

type SharedStore = Arc<dyn MembershipStore>;
type ApiResult<T> = std::result::Result<T, ApiError>;

/// The body of a checkin request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct CheckinRequest {
    pub member: Member,
    pub heartbeat: i64,
}

/// Bind the configured port and spawn the HTTP server.
///
/// The membership store routes are served only when a store is given.
pub fn spawn_http_server(config: &Config, store: Option<SharedStore>, shutdown: broadcast::Receiver<()>) -> Result<JoinHandle<Result<()>>> {
    let listener = TcpListener::bind(("0.0.0.0", config.http_port)).context("error binding socket address for http server")?;
    serve(listener, router(config, store), shutdown)
}

/// Build the router of the HTTP server.
pub(crate) fn router(config: &Config, store: Option<SharedStore>) -> Router {
    let metrics = get_metrics_recorder(config).handle();
    let mut router = Router::new()
        .route(ROUTE_HEALTH, get(|| async { StatusCode::OK }))
        .route(ROUTE_METRICS, get(scrape));
    if let Some(store) = store {
        router = router
            .route(ROUTE_MEMBERS, get(list_members))
            .route(ROUTE_MEMBER, delete(delete_member))
            .route(ROUTE_MEMBER_PORTS, put(set_ports))
            .route(ROUTE_CHECKINS, post(checkin))
            .route(ROUTE_ASSIGNMENTS, post(assign_indices))
            .route(ROUTE_REVOCATIONS, post(revoke_indices))
            .route(ROUTE_API_KEYS, get(api_keys))
            .route(ROUTE_ACCOUNTS, put(put_account))
            .route(ROUTE_CREDENTIALS, put(put_credential))
            .layer(AddExtensionLayer::new(store));
    }
    router.layer(AddExtensionLayer::new(metrics))
}

/// Serve the given router on the given listener until shutdown is signaled.
pub(crate) fn serve(listener: TcpListener, router: Router, mut shutdown: broadcast::Receiver<()>) -> Result<JoinHandle<Result<()>>> {
    listener.set_nonblocking(true).context("error configuring http server socket")?;
    let addr = listener.local_addr().context("error reading http server address")?;
    let server = axum::Server::from_tcp(listener)
        .context("error building http server")?
        .serve(router.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        });
    tracing::info!(%addr, "http server is listening");
    Ok(tokio::spawn(server.map_err(anyhow::Error::from)))
}

#[tracing::instrument(level = "trace", skip(store))]
async fn list_members(Extension(store): Extension<SharedStore>) -> ApiResult<Json<Vec<Member>>> {
    let members = Database::spawn_blocking(move || store.list_members()).await??;
    Ok(Json(members))
}

#[tracing::instrument(level = "trace", skip(store, req), fields(uuid = %req.member.uuid))]
async fn checkin(Extension(store): Extension<SharedStore>, Json(req): Json<CheckinRequest>) -> ApiResult<Json<Checkin>> {
    let outcome = Database::spawn_blocking(move || store.checkin(&req.member, req.heartbeat)).await??;
    Ok(Json(outcome))
}

#[tracing::instrument(level = "debug", skip(store))]
async fn delete_member(Extension(store): Extension<SharedStore>, Path(uuid): Path<String>) -> ApiResult<StatusCode> {
    Database::spawn_blocking(move || store.delete_member(&uuid)).await??;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(level = "debug", skip(store))]
async fn set_ports(Extension(store): Extension<SharedStore>, Path(uuid): Path<String>, Json(ports): Json<PortSet>) -> ApiResult<StatusCode> {
    Database::spawn_blocking(move || store.set_ports(&uuid, &ports)).await??;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(level = "debug", skip(store, indexes))]
async fn assign_indices(Extension(store): Extension<SharedStore>, Json(indexes): Json<BTreeMap<u32, Member>>) -> ApiResult<StatusCode> {
    Database::spawn_blocking(move || store.assign_indices(&indexes)).await??;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(level = "debug", skip(store, members))]
async fn revoke_indices(Extension(store): Extension<SharedStore>, Json(members): Json<Vec<Member>>) -> ApiResult<StatusCode> {
    Database::spawn_blocking(move || store.revoke_indices(&members)).await??;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(level = "trace", skip(store))]
async fn api_keys(Extension(store): Extension<SharedStore>) -> ApiResult<Json<ApiKeys>> {
    let keys = Database::spawn_blocking(move || store.api_keys()).await??;
    Ok(Json(keys))
}

#[tracing::instrument(level = "debug", skip(store, account), fields(id = account.id))]
async fn put_account(Extension(store): Extension<SharedStore>, Json(account): Json<Account>) -> ApiResult<StatusCode> {
    Database::spawn_blocking(move || store.put_account(&account)).await??;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(level = "debug", skip(store, credential), fields(id = credential.id))]
async fn put_credential(Extension(store): Extension<SharedStore>, Json(credential): Json<Credential>) -> ApiResult<StatusCode> {
    Database::spawn_blocking(move || store.put_credential(&credential)).await??;
    Ok(StatusCode::NO_CONTENT)
}

/// A registry error rendered as an HTTP response.
///
/// `NotReady` maps to `503 Service Unavailable`, storage faults to `500 Internal Server Error`.
struct ApiError(RegistryError);

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        Self(err)
    }
}

impl From<ShutdownError> for ApiError {
    fn from(err: ShutdownError) -> Self {
        Self(RegistryError::StorageFault(err.0))
    }
}

impl IntoResponse for ApiError {
    type Body = Body;
    type BodyError = <Self::Body as HttpBody>::Error;

    fn into_response(self) -> Response<Self::Body> {
        let status = match &self.0 {
            RegistryError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            RegistryError::StorageFault(err) => {
                tracing::error!(error = ?err, "error handling registry request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let mut res = Response::new(Body::from(self.0.to_string()));
        *res.status_mut() = status;
        res
    }
}
