//! The per-cluster `(bearer_token, ca_cert)` store.
//!
//! Thread-safe in-memory cache, backed opportunistically by a single
//! Kubernetes Secret. Generalized from a single `patch` call on one object
//! to a map-of-clusters encoded as Secret keys.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::RwLock,
};

use async_trait::async_trait;
use k8s_openapi::{api::core::v1::Secret, ByteString};
use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams},
    Client,
};
use tracing::warn;

/// `(token, ca_cert)` pair for a single remote cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub ca_cert: Vec<u8>,
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("failed to read bootstrap file {path}: {source}")]
    BootstrapRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("credentials persistence error: {0}")]
    Persist(#[source] kube::Error),
}

/// Abstraction over "where the credentials Secret lives", so the Store can
/// be exercised in tests without a live API server.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    async fn load(&self) -> Result<Option<BTreeMap<String, Vec<u8>>>, StoreError>;
    async fn apply(&self, data: BTreeMap<String, Vec<u8>>) -> Result<(), StoreError>;
}

/// Persists the credentials cache to a single namespaced Kubernetes Secret.
pub struct KubeSecretBackend {
    client: Client,
    name: String,
    namespace: String,
}

impl KubeSecretBackend {
    pub fn new(client: Client, name: String, namespace: String) -> Self {
        Self { client, name, namespace }
    }
}

#[async_trait]
impl SecretBackend for KubeSecretBackend {
    async fn load(&self) -> Result<Option<BTreeMap<String, Vec<u8>>>, StoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        match api.get(&self.name).await {
            Ok(secret) => Ok(Some(
                secret
                    .data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(key, value)| (key, value.0))
                    .collect(),
            )),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(None),
            Err(err) => Err(StoreError::Persist(err)),
        }
    }

    async fn apply(&self, data: BTreeMap<String, Vec<u8>>) -> Result<(), StoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            data: Some(
                data.into_iter()
                    .map(|(key, value)| (key, ByteString(value)))
                    .collect(),
            ),
            ..Default::default()
        };

        api.patch(
            &self.name,
            &PatchParams::apply("fedsa-validator"),
            &Patch::Apply(secret),
        )
        .await
        .map_err(StoreError::Persist)?;

        Ok(())
    }
}

/// Used when no Kubernetes API access is available (e.g. running outside a
/// cluster in tests): logs once and otherwise behaves as an empty, inert
/// Secret.
#[derive(Default)]
pub struct NoopBackend {
    warned: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl SecretBackend for NoopBackend {
    async fn load(&self) -> Result<Option<BTreeMap<String, Vec<u8>>>, StoreError> {
        Ok(None)
    }

    async fn apply(&self, _data: BTreeMap<String, Vec<u8>>) -> Result<(), StoreError> {
        if !self.warned.swap(true, std::sync::atomic::Ordering::Relaxed) {
            warn!("no Kubernetes Secret backend configured; credentials will not survive a restart");
        }
        Ok(())
    }
}

fn encode(map: &HashMap<String, Credentials>) -> BTreeMap<String, Vec<u8>> {
    let mut data = BTreeMap::new();
    for (cluster, creds) in map {
        data.insert(format!("{cluster}-token"), creds.token.clone().into_bytes());
        data.insert(format!("{cluster}-ca.crt"), creds.ca_cert.clone());
    }
    data
}

fn decode(data: BTreeMap<String, Vec<u8>>) -> HashMap<String, Credentials> {
    let mut partial: HashMap<String, (Option<String>, Option<Vec<u8>>)> = HashMap::new();

    for (key, value) in data {
        if let Some(cluster) = key.strip_suffix("-token") {
            partial.entry(cluster.to_string()).or_default().0 =
                Some(String::from_utf8_lossy(&value).into_owned());
        } else if let Some(cluster) = key.strip_suffix("-ca.crt") {
            partial.entry(cluster.to_string()).or_default().1 = Some(value);
        }
    }

    partial
        .into_iter()
        .filter_map(|(cluster, (token, ca_cert))| {
            Some((cluster, Credentials { token: token?, ca_cert: ca_cert? }))
        })
        .collect()
}

fn read_bootstrap_files(token_path: &Path, ca_path: &Path) -> Result<Credentials, StoreError> {
    let token = std::fs::read_to_string(token_path)
        .map_err(|source| StoreError::BootstrapRead { path: token_path.to_path_buf(), source })?
        .trim()
        .to_string();
    let ca_cert = std::fs::read(ca_path)
        .map_err(|source| StoreError::BootstrapRead { path: ca_path.to_path_buf(), source })?;

    Ok(Credentials { token, ca_cert })
}

/// Thread-safe mapping from cluster name to `Credentials`.
pub struct CredentialStore {
    backend: Box<dyn SecretBackend>,
    inner: RwLock<HashMap<String, Credentials>>,
}

impl CredentialStore {
    /// Loads the initial state from `backend`; a missing Secret is treated
    /// as an empty starting state, not an error.
    pub async fn new(backend: Box<dyn SecretBackend>) -> Result<Self, StoreError> {
        let inner = match backend.load().await? {
            Some(data) => decode(data),
            None => HashMap::new(),
        };

        Ok(Self { backend, inner: RwLock::new(inner) })
    }

    /// Read-locked, non-blocking, returns a cloned snapshot.
    pub fn get(&self, cluster: &str) -> Option<Credentials> {
        self.inner.read().unwrap().get(cluster).cloned()
    }

    /// Installs `creds` under a write lock, releases it, then attempts to
    /// persist the whole cache. The in-memory update stands even if
    /// persistence fails.
    pub async fn set(&self, cluster: &str, creds: Credentials) -> Result<(), StoreError> {
        let snapshot = {
            let mut guard = self.inner.write().unwrap();
            guard.insert(cluster.to_string(), creds);
            guard.clone()
        };

        self.backend.apply(encode(&snapshot)).await
    }

    /// Reads both files and unconditionally replaces the entry.
    pub fn load_from_files(
        &self,
        cluster: &str,
        token_path: &Path,
        ca_path: &Path,
    ) -> Result<(), StoreError> {
        let creds = read_bootstrap_files(token_path, ca_path)?;
        self.inner.write().unwrap().insert(cluster.to_string(), creds);
        Ok(())
    }

    /// Same as `load_from_files`, but only if no entry exists yet, so
    /// persisted credentials from a prior run win over stale bootstrap
    /// files.
    pub fn load_bootstrap_from_files(
        &self,
        cluster: &str,
        token_path: &Path,
        ca_path: &Path,
    ) -> Result<(), StoreError> {
        if self.inner.read().unwrap().contains_key(cluster) {
            return Ok(());
        }
        self.load_from_files(cluster, token_path, ca_path)
    }
}
