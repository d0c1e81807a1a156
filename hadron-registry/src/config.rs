//! Runtime configuration.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use uuid::Uuid;

/// The default well-known identity of the service account whose API keys are looked up.
pub const DEFAULT_SERVICE_ACCOUNT: &str = "machineServiceAccount";

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port on which the HTTP server is exposed.
    ///
    /// Every instance serves its metrics on this port. The registry host also serves the
    /// membership store here.
    #[serde(default = "Config::default_http_port")]
    pub http_port: u16,
    /// The name of the pod on which this instance is running.
    pub pod_name: String,

    /// The base URL of the registry host, for example `http://registry-0.registry:7002`.
    ///
    /// When not given, this instance is the registry host. It owns the registry database and
    /// acts as the index assignment authority of the ensemble.
    #[serde(default)]
    pub registry_url: Option<String>,
    /// The number of seconds after which a request to the registry host is abandoned.
    #[serde(default = "Config::default_registry_timeout")]
    pub registry_timeout_seconds: u64,

    /// The path to the database on disk, used only by the registry host.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,

    /// The stable identity of this member.
    ///
    /// When not given, a name-based UUID is derived from `pod_name`, so that a restarted pod
    /// checks back in as the same member.
    #[serde(default)]
    pub member_uuid: Option<String>,
    /// An optional human readable label for this member.
    #[serde(default)]
    pub member_name: Option<String>,
    /// The address at which this member is reachable by its peers.
    pub member_ip: String,
    /// The slot this member asks for when it first checks in, `0` for no preference.
    #[serde(default)]
    pub requested_index: u32,

    /// The number of seconds between member checkins.
    #[serde(default = "Config::default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// The number of seconds after which a member whose heartbeat has not advanced is
    /// considered dead by the registry host.
    #[serde(default = "Config::default_heartbeat_timeout")]
    pub heartbeat_timeout_seconds: u64,
    /// The number of seconds between index assignment rounds.
    #[serde(default = "Config::default_assignment_interval")]
    pub assignment_interval_seconds: u64,
    /// The number of slots available for assignment, numbered `1..=cluster_size`.
    #[serde(default = "Config::default_cluster_size")]
    pub cluster_size: u32,

    /// The identity of the service account whose API keys are looked up.
    #[serde(default = "Config::default_service_account")]
    pub service_account_uuid: String,
    /// Whether startup should wait until the service account's API keys are available.
    #[serde(default)]
    pub await_api_keys: bool,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.finalize()
    }

    /// Validate the parsed config and populate any derived values.
    pub(crate) fn finalize(mut self) -> Result<Self> {
        ensure!(self.cluster_size > 0, "CLUSTER_SIZE must be greater than 0");
        ensure!(!self.member_ip.is_empty(), "MEMBER_IP must not be empty");
        ensure!(self.heartbeat_interval_seconds > 0, "HEARTBEAT_INTERVAL_SECONDS must be greater than 0");
        ensure!(self.assignment_interval_seconds > 0, "ASSIGNMENT_INTERVAL_SECONDS must be greater than 0");
        ensure!(self.registry_timeout_seconds > 0, "REGISTRY_TIMEOUT_SECONDS must be greater than 0");
        self.registry_url = self
            .registry_url
            .take()
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());
        if self.member_uuid.as_deref().map(str::is_empty).unwrap_or(true) {
            self.member_uuid = Some(Uuid::new_v5(&Uuid::NAMESPACE_OID, self.pod_name.as_bytes()).to_string());
        }
        Ok(self)
    }

    /// The stable identity of this member.
    pub fn member_uuid(&self) -> &str {
        self.member_uuid.as_deref().unwrap_or_default()
    }

    /// Check if this instance is the registry host.
    pub fn is_registry_host(&self) -> bool {
        self.registry_url.is_none()
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.registry_timeout_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds)
    }

    pub fn assignment_interval(&self) -> Duration {
        Duration::from_secs(self.assignment_interval_seconds)
    }

    fn default_http_port() -> u16 {
        7002
    }

    fn default_registry_timeout() -> u64 {
        10
    }

    fn default_heartbeat_interval() -> u64 {
        5
    }

    fn default_heartbeat_timeout() -> u64 {
        30
    }

    fn default_assignment_interval() -> u64 {
        15
    }

    fn default_cluster_size() -> u32 {
        3
    }

    fn default_service_account() -> String {
        DEFAULT_SERVICE_ACCOUNT.to_string()
    }
}

#[cfg(test)]
impl Config {
    /// Create a new config instance for testing, backed by a temporary storage directory.
    ///
    /// The returned `TempDir` must be kept alive for as long as the storage is in use.
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir().context("error creating tmp dir for test config")?;
        let config = Config {
            rust_log: "error".into(),
            http_port: Self::default_http_port(),
            pod_name: "registry-0".into(),
            registry_url: None,
            registry_timeout_seconds: Self::default_registry_timeout(),
            storage_data_path: tmpdir.path().to_string_lossy().to_string(),
            member_uuid: None,
            member_name: Some("registry-0".into()),
            member_ip: "10.0.0.10".into(),
            requested_index: 0,
            heartbeat_interval_seconds: 1,
            heartbeat_timeout_seconds: Self::default_heartbeat_timeout(),
            assignment_interval_seconds: 1,
            cluster_size: Self::default_cluster_size(),
            service_account_uuid: Self::default_service_account(),
            await_api_keys: false,
        }
        .finalize()?;
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
