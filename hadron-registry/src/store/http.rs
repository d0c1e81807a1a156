use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;

use crate::error::{RegistryError, RegistryResult};
use crate::models::{Account, ApiKeys, Credential, Member};
use crate::ports::PortSet;
use crate::server::{
    CheckinRequest, ROUTE_ACCOUNTS, ROUTE_API_KEYS, ROUTE_ASSIGNMENTS, ROUTE_CHECKINS, ROUTE_CREDENTIALS, ROUTE_HEALTH, ROUTE_MEMBERS,
    ROUTE_REVOCATIONS,
};
use crate::store::{Checkin, MembershipStore};

/// A membership store backed by the registry host over HTTP.
///
/// Operations block the calling thread on the runtime the store was created on, so they must
/// be called from the blocking pool as with any other store.
pub struct HttpStore {
    base_url: String,
    client: Client,
    runtime: Handle,
}

impl HttpStore {
    /// Create a new instance targeting the registry host at the given base URL.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> RegistryResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("error building registry http client")?;
        let runtime = Handle::try_current().context("registry http client requires a tokio runtime")?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { base_url, client, runtime })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn member_url(&self, uuid: &str) -> String {
        format!("{}{}/{}", self.base_url, ROUTE_MEMBERS, uuid)
    }

    /// Send the given request, mapping error statuses onto registry errors.
    async fn request(req: RequestBuilder) -> RegistryResult<Response> {
        let res = req.send().await.context("error sending request to registry host")?;
        match res.status() {
            status if status.is_success() => Ok(res),
            StatusCode::SERVICE_UNAVAILABLE => Err(RegistryError::NotReady),
            status => {
                let body = res.text().await.unwrap_or_default();
                Err(anyhow!("registry host responded with {}: {}", status, body).into())
            }
        }
    }

    /// Send the given request, discarding the response body.
    fn send(&self, req: RequestBuilder) -> RegistryResult<()> {
        self.runtime.block_on(Self::request(req)).map(|_| ())
    }

    /// Send the given request, decoding the JSON response body.
    fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> RegistryResult<T> {
        self.runtime.block_on(async move {
            let res = Self::request(req).await?;
            res.json::<T>()
                .await
                .context("error decoding response from registry host")
                .map_err(RegistryError::from)
        })
    }
}

impl MembershipStore for HttpStore {
    /// The registry host bootstraps its own storage, so this only checks that it is reachable.
    #[tracing::instrument(level = "debug", skip(self), fields(base_url = %self.base_url))]
    fn bootstrap(&self) -> RegistryResult<()> {
        self.send(self.client.get(self.url(ROUTE_HEALTH)))
    }

    fn list_members(&self) -> RegistryResult<Vec<Member>> {
        self.send_json(self.client.get(self.url(ROUTE_MEMBERS)))
    }

    fn checkin(&self, member: &Member, heartbeat: i64) -> RegistryResult<Checkin> {
        let body = CheckinRequest { member: member.clone(), heartbeat };
        self.send_json(self.client.post(self.url(ROUTE_CHECKINS)).json(&body))
    }

    fn assign_indices(&self, indexes: &BTreeMap<u32, Member>) -> RegistryResult<()> {
        self.send(self.client.post(self.url(ROUTE_ASSIGNMENTS)).json(indexes))
    }

    fn revoke_indices(&self, members: &[Member]) -> RegistryResult<()> {
        self.send(self.client.post(self.url(ROUTE_REVOCATIONS)).json(members))
    }

    fn delete_member(&self, uuid: &str) -> RegistryResult<()> {
        self.send(self.client.delete(self.member_url(uuid)))
    }

    fn set_ports(&self, uuid: &str, ports: &PortSet) -> RegistryResult<()> {
        let url = format!("{}/ports", self.member_url(uuid));
        self.send(self.client.put(url).json(ports))
    }

    fn api_keys(&self) -> RegistryResult<ApiKeys> {
        self.send_json(self.client.get(self.url(ROUTE_API_KEYS)))
    }

    fn put_account(&self, account: &Account) -> RegistryResult<()> {
        self.send(self.client.put(self.url(ROUTE_ACCOUNTS)).json(account))
    }

    fn put_credential(&self, credential: &Credential) -> RegistryResult<()> {
        self.send(self.client.put(self.url(ROUTE_CREDENTIALS)).json(credential))
    }
}
