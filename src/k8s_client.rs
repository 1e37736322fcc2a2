//! Builds `kube::Client`s for clusters this process does not run inside.
//!
//! `kube::Config`'s `auth_info` field is private to the crate, so a client
//! carrying a bearer token and a custom CA can't be assembled by hand; the
//! supported route is building an in-memory [`Kubeconfig`] and handing it to
//! [`Config::from_custom_kubeconfig`]. One synthetic kubeconfig is built per
//! remote cluster; the local cluster still goes through plain
//! `Client::try_default`.

use kube::{
    config::{
        AuthInfo, Cluster, Context, KubeConfigOptions, Kubeconfig, NamedAuthInfo, NamedCluster,
        NamedContext,
    },
    Client, Config,
};

use crate::{config::ClusterConfig, credentials::Credentials};

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("cluster {0} has no api_server configured; cannot build a remote client")]
    NotRemote(String),
    #[error("failed to build kubeconfig for cluster {0}: {1}")]
    Config(String, #[source] kube::config::KubeconfigError),
    #[error("failed to build client for cluster {0}: {1}")]
    Client(String, #[source] kube::Error),
}

/// A local cluster is simply this process's own in-cluster identity.
pub async fn local_client() -> Result<Client, kube::Error> {
    Client::try_default().await
}

/// Builds a client for a remote cluster from its configured `api_server`
/// and the currently held bootstrap/renewed credentials.
pub async fn remote_client(
    cluster: &ClusterConfig,
    creds: &Credentials,
) -> Result<Client, ClientError> {
    let api_server =
        cluster.api_server.as_deref().ok_or_else(|| ClientError::NotRemote(cluster.name.clone()))?;

    let ca_pem = String::from_utf8_lossy(&creds.ca_cert).into_owned();

    let kubeconfig = Kubeconfig {
        clusters: vec![NamedCluster {
            name: cluster.name.clone(),
            cluster: Some(Cluster {
                server: Some(api_server.to_string()),
                certificate_authority_data: Some(base64_standard_encode(ca_pem.as_bytes())),
                ..Default::default()
            }),
        }],
        auth_infos: vec![NamedAuthInfo {
            name: cluster.name.clone(),
            auth_info: Some(AuthInfo { token: Some(creds.token.clone()), ..Default::default() }),
        }],
        contexts: vec![NamedContext {
            name: cluster.name.clone(),
            context: Some(Context {
                cluster: cluster.name.clone(),
                user: cluster.name.clone(),
                namespace: None,
                extensions: None,
            }),
        }],
        current_context: Some(cluster.name.clone()),
        ..Default::default()
    };

    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|err| ClientError::Config(cluster.name.clone(), err))?;

    Client::try_from(config).map_err(|err| ClientError::Client(cluster.name.clone(), err))
}

fn base64_standard_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remote_client_rejects_a_cluster_without_an_api_server() {
        let cluster = ClusterConfig {
            name: "home".to_string(),
            issuer: "https://kubernetes.default.svc".to_string(),
            api_server: None,
            ca_cert: None,
            token_path: None,
        };
        let creds = Credentials { token: "tok".into(), ca_cert: b"ca".to_vec() };

        let err = remote_client(&cluster, &creds).await.unwrap_err();
        assert!(matches!(err, ClientError::NotRemote(name) if name == "home"));
    }
}
