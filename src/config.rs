//! The frozen configuration tree the core is handed at startup.
//!
//! Loading this from the environment is an ambient concern, not part of the
//! four core subsystems: the loader's only interface to the rest of the
//! program is producing an [`AppConfig`].

use std::{path::PathBuf, time::Duration};

use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};

/// A single configured Kubernetes cluster.
///
/// Immutable after load. A cluster is "remote" iff `api_server` is set;
/// otherwise it's "local" and tokens for it are forwarded using in-cluster
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub issuer: String,
    #[serde(default)]
    pub api_server: Option<String>,
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    #[serde(default)]
    pub token_path: Option<PathBuf>,
}

impl ClusterConfig {
    pub fn is_remote(&self) -> bool {
        self.api_server.as_deref().is_some_and(|url| !url.is_empty())
    }

    /// The root used for OIDC discovery: `api_server` for remote clusters,
    /// else the cluster's own `issuer`.
    pub fn discovery_url(&self) -> &str {
        match self.api_server.as_deref() {
            Some(api_server) if !api_server.is_empty() => api_server,
            _ => &self.issuer,
        }
    }

    pub fn bootstrap_paths(&self) -> Option<(&PathBuf, &PathBuf)> {
        Some((self.token_path.as_ref()?, self.ca_cert.as_ref()?))
    }
}

/// Process-wide renewal tuning. Defaults: 1h interval, 168h token duration,
/// 48h renew-before threshold.
#[derive(Debug, Clone)]
pub struct RenewalSettings {
    pub interval: Duration,
    pub token_duration: Duration,
    pub renew_before: Duration,
}

impl Default for RenewalSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            token_duration: Duration::from_secs(60 * 60 * 168),
            renew_before: Duration::from_secs(60 * 60 * 48),
        }
    }
}

/// Raw, string-based shape of [`RenewalSettings`] as it comes out of the
/// environment: humantime durations are parsed from plain strings rather
/// than derived through serde.
#[derive(Debug, Serialize, Deserialize)]
struct RawRenewalSettings {
    interval: String,
    token_duration: String,
    renew_before: String,
}

impl Default for RawRenewalSettings {
    fn default() -> Self {
        let defaults = RenewalSettings::default();
        Self {
            interval: humantime::format_duration(defaults.interval).to_string(),
            token_duration: humantime::format_duration(defaults.token_duration).to_string(),
            renew_before: humantime::format_duration(defaults.renew_before).to_string(),
        }
    }
}

impl RawRenewalSettings {
    fn parse(&self) -> anyhow::Result<RenewalSettings> {
        Ok(RenewalSettings {
            interval: humantime::parse_duration(&self.interval)?,
            token_duration: humantime::parse_duration(&self.token_duration)?,
            renew_before: humantime::parse_duration(&self.renew_before)?,
        })
    }
}

/// A single entry in the caller whitelist: `{cluster}/{namespace}/{serviceaccount}`,
/// each segment either a literal or `*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizedClient(pub String);

/// The frozen tree handed to the core by the config loader.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub clusters: Vec<ClusterConfig>,
    pub renewal: RenewalSettings,
    pub authorized_clients: Vec<AuthorizedClient>,
    pub credentials_secret_name: String,
    pub credentials_secret_namespace: String,
    pub listen_addr: String,
}

/// Raw environment shape loaded via `figment`, merging `Env::prefixed(..)`
/// over `Serialized::defaults(..)`.
#[derive(Debug, Serialize, Deserialize)]
struct RawAppConfig {
    clusters: Vec<ClusterConfig>,
    renewal: RawRenewalSettings,
    authorized_clients: Vec<String>,
    credentials_secret_name: String,
    credentials_secret_namespace: String,
    listen_addr: String,
}

impl Default for RawAppConfig {
    fn default() -> Self {
        Self {
            clusters: Vec::new(),
            renewal: RawRenewalSettings::default(),
            authorized_clients: Vec::new(),
            credentials_secret_name: "fedsa-validator-credentials".to_string(),
            credentials_secret_namespace: "default".to_string(),
            listen_addr: "0.0.0.0:8443".to_string(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from `FEDSAVALIDATOR_`-prefixed environment
    /// variables, falling back to defaults.
    ///
    /// File-based YAML loading and CLI flag parsing are external
    /// collaborators; this loader only covers the environment-merge
    /// convention.
    pub fn load() -> anyhow::Result<Self> {
        let raw: RawAppConfig = Figment::from(Serialized::defaults(RawAppConfig::default()))
            .merge(Env::prefixed("FEDSAVALIDATOR_").split("__"))
            .extract()?;

        Ok(Self {
            clusters: raw.clusters,
            renewal: raw.renewal.parse()?,
            authorized_clients: raw.authorized_clients.into_iter().map(AuthorizedClient).collect(),
            credentials_secret_name: raw.credentials_secret_name,
            credentials_secret_namespace: raw.credentials_secret_namespace,
            listen_addr: raw.listen_addr,
        })
    }
}
