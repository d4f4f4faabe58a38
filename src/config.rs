use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Scheduler name pods must request via `spec.schedulerName`.
    #[serde(default = "default_scheduler_name")]
    pub scheduler_name: String,

    /// Namespace holding the managed application deployments.
    #[serde(default = "default_app_namespace")]
    pub app_namespace: String,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_association_ttl_minutes")]
    pub association_ttl_minutes: i64,

    #[serde(default = "default_measurement_ttl_minutes")]
    pub measurement_ttl_minutes: i64,

    #[serde(default = "default_sidecar_port")]
    pub sidecar_port: u16,

    #[serde(default = "default_router_port")]
    pub router_port: u16,

    /// Base URL of the routing manager receiving association snapshots.
    #[serde(default = "default_router_endpoint")]
    pub router_endpoint: String,

    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Address the sidecar proxies application traffic to.
    #[serde(default = "default_app_address")]
    pub app_address: String,

    /// Identity of the pod a sidecar runs next to (`POD_NAME`).
    #[serde(default)]
    pub pod_name: Option<String>,

    /// Application served by a routing manager instance (`APP_NAME`).
    #[serde(default)]
    pub app_name: Option<String>,
}

fn default_scheduler_name() -> String {
    "latency-aware-scheduler".to_string()
}

fn default_app_namespace() -> String {
    "default".to_string()
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_association_ttl_minutes() -> i64 {
    5
}

fn default_measurement_ttl_minutes() -> i64 {
    5
}

fn default_sidecar_port() -> u16 {
    8080
}

fn default_router_port() -> u16 {
    80
}

fn default_router_endpoint() -> String {
    "http://routing-manager:80".to_string()
}

fn default_http_timeout_secs() -> u64 {
    5
}

fn default_app_address() -> String {
    "http://localhost:80".to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;

        let settings: Config = config
            .try_deserialize()
            .unwrap_or_else(|_| Config::default());

        Ok(settings)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler_name: default_scheduler_name(),
            app_namespace: default_app_namespace(),
            poll_interval_secs: default_poll_interval_secs(),
            association_ttl_minutes: default_association_ttl_minutes(),
            measurement_ttl_minutes: default_measurement_ttl_minutes(),
            sidecar_port: default_sidecar_port(),
            router_port: default_router_port(),
            router_endpoint: default_router_endpoint(),
            http_timeout_secs: default_http_timeout_secs(),
            app_address: default_app_address(),
            pod_name: None,
            app_name: None,
        }
    }
}
