//! Per-cluster cache of OIDC verifiers: discovery, JWKS-URL rewriting, and
//! signature verification under a single-writer cache invariant.
//!
//! Generalized from "one baked-in cluster" to a cache keyed by cluster
//! name with lazy, double-checked-locked construction and explicit
//! invalidation.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use jsonwebtoken::{
    jwk::{AlgorithmParameters, EllipticCurve, Jwk, JwkSet},
    Algorithm, DecodingKey, Validation,
};
use reqwest::Url;
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::{
    claims::{Claims, RawClaims},
    config::ClusterConfig,
    credentials::CredentialStore,
};

#[derive(thiserror::Error, Debug)]
pub enum VerifyError {
    #[error("unknown cluster: {0}")]
    UnknownCluster(String),
    #[error("discovery failed for cluster {0}: {1}")]
    Discovery(String, String),
    #[error("JWKS fetch failed for cluster {0}: {1}")]
    Jwks(String, String),
    #[error("token expired (cluster {0})")]
    Expired(String),
    #[error("signature mismatch (cluster {0}): {1}")]
    SignatureMismatch(String, String),
    #[error("token parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    #[allow(dead_code)]
    issuer: String,
    jwks_uri: String,
}

/// `(issuer_pinned, remote_key_set)` derived from a discovery document.
/// Replaced, never mutated, on invalidation.
struct Verifier {
    cluster: String,
    issuer: String,
    decoding_keys: Vec<(DecodingKey, Algorithm)>,
}

fn algorithm_for_jwk(jwk: &Jwk) -> Option<Algorithm> {
    match &jwk.algorithm {
        AlgorithmParameters::EllipticCurve(params) => Some(match params.curve {
            EllipticCurve::P256 => Algorithm::ES256,
            EllipticCurve::P384 => Algorithm::ES384,
            EllipticCurve::P521 => return None,
            EllipticCurve::Ed25519 => Algorithm::EdDSA,
        }),
        AlgorithmParameters::RSA(_) => Some(Algorithm::RS256),
        _ => None,
    }
}

impl Verifier {
    fn from_jwk_set(cluster: &str, issuer: &str, jwk_set: JwkSet) -> Result<Self, VerifyError> {
        if jwk_set.keys.is_empty() {
            return Err(VerifyError::Jwks(cluster.to_string(), "empty JWKS".to_string()));
        }

        let mut decoding_keys = Vec::new();
        for jwk in &jwk_set.keys {
            let Some(algorithm) = algorithm_for_jwk(jwk) else {
                debug!(?cluster, "skipping JWK with unsupported algorithm parameters");
                continue;
            };
            let decoding_key = DecodingKey::from_jwk(jwk)
                .map_err(|err| VerifyError::Jwks(cluster.to_string(), err.to_string()))?;
            decoding_keys.push((decoding_key, algorithm));
        }

        if decoding_keys.is_empty() {
            return Err(VerifyError::Jwks(
                cluster.to_string(),
                "no usable keys in JWKS".to_string(),
            ));
        }

        Ok(Self { cluster: cluster.to_string(), issuer: issuer.to_string(), decoding_keys })
    }

    fn verify(&self, token: &str) -> Result<RawClaims, VerifyError> {
        let mut expired = false;
        let mut last_err: Option<String> = None;

        for (key, algorithm) in &self.decoding_keys {
            let mut validation = Validation::new(*algorithm);
            validation.set_issuer(&[&self.issuer]);
            validation.validate_aud = false;

            match jsonwebtoken::decode::<RawClaims>(token, key, &validation) {
                Ok(data) => return Ok(data.claims),
                Err(err) => {
                    match err.kind() {
                        jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                            expired = true;
                        }
                        jsonwebtoken::errors::ErrorKind::Json(_)
                        | jsonwebtoken::errors::ErrorKind::Base64(_)
                        | jsonwebtoken::errors::ErrorKind::InvalidToken => {
                            return Err(VerifyError::Parse(err.to_string()));
                        }
                        _ => {}
                    }
                    last_err = Some(err.to_string());
                }
            }
        }

        if expired {
            return Err(VerifyError::Expired(self.cluster.clone()));
        }
        Err(VerifyError::SignatureMismatch(
            self.cluster.clone(),
            last_err.unwrap_or_else(|| "no matching key".to_string()),
        ))
    }
}

/// If the discovered JWKS URL advertises the standard k8s path, rewrite its
/// host to the cluster's configured `api_server` — the discovery-advertised
/// host is often an internal DNS name unreachable from the home cluster.
/// Any other path is left as-is, even though it may be unreachable; see
/// SPEC_FULL.md §9 (open question, preserved rather than guessed at).
fn rewrite_jwks_url(discovered: &str, config: &ClusterConfig) -> String {
    if !config.is_remote() || !discovered.contains("/openid/v1/jwks") {
        return discovered.to_string();
    }

    let Some(api_server) = config.api_server.as_deref() else {
        return discovered.to_string();
    };

    match (Url::parse(discovered), Url::parse(api_server)) {
        (Ok(mut discovered_url), Ok(api_url)) => {
            if discovered_url.set_scheme(api_url.scheme()).is_err() {
                return discovered.to_string();
            }
            if discovered_url
                .set_host(api_url.host_str())
                .is_err()
            {
                return discovered.to_string();
            }
            let _ = discovered_url.set_port(api_url.port());
            discovered_url.to_string()
        }
        _ => discovered.to_string(),
    }
}

/// Lazily builds, caches, and invalidates OIDC verifiers per cluster, and
/// performs JWT signature verification against their JWKS.
pub struct VerifierManager {
    clusters: Vec<ClusterConfig>,
    credentials: Arc<CredentialStore>,
    cache: RwLock<HashMap<String, Arc<Verifier>>>,
    build_locks: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl VerifierManager {
    pub fn new(clusters: Vec<ClusterConfig>, credentials: Arc<CredentialStore>) -> Self {
        Self {
            clusters,
            credentials,
            cache: RwLock::new(HashMap::new()),
            build_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn clusters(&self) -> &[ClusterConfig] {
        &self.clusters
    }

    fn config_for(&self, cluster: &str) -> Result<&ClusterConfig, VerifyError> {
        self.clusters
            .iter()
            .find(|c| c.name == cluster)
            .ok_or_else(|| VerifyError::UnknownCluster(cluster.to_string()))
    }

    pub async fn verify(&self, cluster: &str, token: &str) -> Result<Claims, VerifyError> {
        let config = self.config_for(cluster)?;
        let verifier = self.get_or_build(config).await?;
        verifier.verify(token).map(|raw| Claims::from_raw(cluster, raw))
    }

    /// Atomically removes the cached verifier for `cluster`. Any subsequent
    /// `verify` rebuilds it from fresh discovery + JWKS before use.
    pub fn invalidate(&self, cluster: &str) {
        if self.cache.write().unwrap().remove(cluster).is_some() {
            info!(?cluster, "invalidated cached verifier");
        }
    }

    async fn get_or_build(&self, config: &ClusterConfig) -> Result<Arc<Verifier>, VerifyError> {
        if let Some(verifier) = self.cache.read().unwrap().get(&config.name) {
            return Ok(verifier.clone());
        }

        // Double-checked locking: one build mutex per cluster, so
        // construction for *different* clusters never blocks on each other.
        let build_lock = {
            let mut locks = self.build_locks.lock().unwrap();
            locks
                .entry(config.name.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let _guard = build_lock.lock().await;

        if let Some(verifier) = self.cache.read().unwrap().get(&config.name) {
            return Ok(verifier.clone());
        }

        let verifier = Arc::new(self.build(config).await?);
        self.cache.write().unwrap().insert(config.name.clone(), verifier.clone());
        Ok(verifier)
    }

    fn http_client_for(&self, config: &ClusterConfig) -> Result<reqwest::Client, VerifyError> {
        let mut builder = reqwest::Client::builder();

        if !config.is_remote() {
            return builder
                .build()
                .map_err(|err| VerifyError::Discovery(config.name.clone(), err.to_string()));
        }

        // Both the CA and the bearer token are optional here: a remote cluster
        // reachable over plain HTTP (e.g. in tests) or one whose discovery
        // endpoint is unauthenticated needs neither.
        let ca_cert = self
            .credentials
            .get(&config.name)
            .map(|creds| creds.ca_cert)
            .or_else(|| config.ca_cert.as_ref().and_then(|path| std::fs::read(path).ok()));
        let token = self
            .credentials
            .get(&config.name)
            .map(|creds| creds.token)
            .or_else(|| config.token_path.as_ref().and_then(|path| std::fs::read_to_string(path).ok()));

        if let Some(ca_cert) = ca_cert {
            let certificate = reqwest::Certificate::from_pem(&ca_cert)
                .map_err(|err| VerifyError::Discovery(config.name.clone(), err.to_string()))?;
            builder = builder.add_root_certificate(certificate);
        }

        if let Some(token) = token {
            let mut headers = http::HeaderMap::new();
            let value = http::HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                .map_err(|err| VerifyError::Discovery(config.name.clone(), err.to_string()))?;
            headers.insert(http::header::AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }

        builder.build().map_err(|err| VerifyError::Discovery(config.name.clone(), err.to_string()))
    }

    async fn build(&self, config: &ClusterConfig) -> Result<Verifier, VerifyError> {
        let client = self.http_client_for(config)?;

        let discovery_url =
            format!("{}/.well-known/openid-configuration", config.discovery_url().trim_end_matches('/'));

        let discovery: DiscoveryDocument = client
            .get(&discovery_url)
            .send()
            .await
            .map_err(|err| VerifyError::Discovery(config.name.clone(), err.to_string()))?
            .error_for_status()
            .map_err(|err| VerifyError::Discovery(config.name.clone(), err.to_string()))?
            .json()
            .await
            .map_err(|err| VerifyError::Discovery(config.name.clone(), err.to_string()))?;

        let jwks_url = rewrite_jwks_url(&discovery.jwks_uri, config);

        let jwk_set: JwkSet = client
            .get(&jwks_url)
            .send()
            .await
            .map_err(|err| VerifyError::Jwks(config.name.clone(), err.to_string()))?
            .error_for_status()
            .map_err(|err| VerifyError::Jwks(config.name.clone(), err.to_string()))?
            .json()
            .await
            .map_err(|err| VerifyError::Jwks(config.name.clone(), err.to_string()))?;

        info!(cluster = %config.name, %jwks_url, "built OIDC verifier");

        Verifier::from_jwk_set(&config.name, &config.issuer, jwk_set)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::fixtures::{test_jwk_set, TEST_TOKEN};

    fn cluster(name: &str, api_server: Option<&str>) -> ClusterConfig {
        ClusterConfig {
            name: name.to_string(),
            issuer: "https://kubernetes.default.svc.cluster.local".to_string(),
            api_server: api_server.map(str::to_string),
            ca_cert: None,
            token_path: None,
        }
    }

    #[test]
    fn jwks_rewrite_applies_only_to_the_standard_k8s_path() {
        let remote = cluster("remote", Some("https://10.0.0.1:6443"));
        assert_eq!(
            rewrite_jwks_url("https://internal.local/openid/v1/jwks", &remote),
            "https://10.0.0.1:6443/openid/v1/jwks"
        );
    }

    #[test]
    fn jwks_rewrite_leaves_other_paths_untouched() {
        let remote = cluster("remote", Some("https://10.0.0.1:6443"));
        assert_eq!(
            rewrite_jwks_url("https://internal.local/custom/jwks", &remote),
            "https://internal.local/custom/jwks"
        );
    }

    #[test]
    fn jwks_rewrite_is_a_noop_for_local_clusters() {
        let local = cluster("local", None);
        assert_eq!(
            rewrite_jwks_url("https://anything/openid/v1/jwks", &local),
            "https://anything/openid/v1/jwks"
        );
    }

    #[test]
    fn verifies_a_real_k8s_service_account_token() {
        let verifier = Verifier::from_jwk_set(
            "cluster-a",
            "https://kubernetes.default.svc.cluster.local",
            test_jwk_set(),
        )
        .unwrap();

        let claims = verifier.verify(TEST_TOKEN).unwrap();
        assert_eq!(claims.kubernetes_io.serviceaccount.name, "memoriam-pops");
        assert_eq!(claims.kubernetes_io.namespace, "situ");
    }

    #[test]
    fn rejects_token_pinned_to_the_wrong_issuer() {
        let verifier =
            Verifier::from_jwk_set("cluster-a", "https://some-other-issuer.example", test_jwk_set())
                .unwrap();

        let err = verifier.verify(TEST_TOKEN).unwrap_err();
        assert!(matches!(err, VerifyError::SignatureMismatch(..)));
    }

    #[test]
    fn structurally_malformed_token_is_a_parse_error_not_a_signature_mismatch() {
        let verifier = Verifier::from_jwk_set(
            "cluster-a",
            "https://kubernetes.default.svc.cluster.local",
            test_jwk_set(),
        )
        .unwrap();

        let err = verifier.verify("not-a-jwt-at-all").unwrap_err();
        assert!(matches!(err, VerifyError::Parse(..)));
    }

    #[test]
    fn empty_jwks_is_rejected() {
        let empty = serde_json::from_value(serde_json::json!({ "keys": [] })).unwrap();
        let err = Verifier::from_jwk_set("cluster-a", "issuer", empty).unwrap_err();
        assert!(matches!(err, VerifyError::Jwks(..)));
    }

    /// Exercises the full discovery -> JWKS fetch -> signature verification
    /// path over real HTTP (via `wiremock`), for a remote cluster with no
    /// bootstrap CA/token configured at all.
    #[tokio::test]
    async fn builds_and_verifies_against_a_live_discovery_endpoint() {
        use wiremock::{
            matchers::{method, path},
            Mock, MockServer, ResponseTemplate,
        };

        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "issuer": "https://kubernetes.default.svc.cluster.local",
                "jwks_uri": format!("{}/openid/v1/jwks", mock_server.uri()),
            })))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/openid/v1/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(test_jwk_set()))
            .mount(&mock_server)
            .await;

        let cluster = ClusterConfig {
            name: "cluster-a".to_string(),
            issuer: "https://kubernetes.default.svc.cluster.local".to_string(),
            api_server: Some(mock_server.uri()),
            ca_cert: None,
            token_path: None,
        };

        let store = Arc::new(CredentialStore::new(Box::new(crate::credentials::NoopBackend::default())).await.unwrap());
        let manager = VerifierManager::new(vec![cluster], store);

        let claims = manager.verify("cluster-a", TEST_TOKEN).await.unwrap();
        assert_eq!(claims.kubernetes_io.serviceaccount.name, "memoriam-pops");

        // Rebuilding after invalidation fetches a fresh verifier, not a stale one.
        manager.invalidate("cluster-a");
        let claims_after_invalidate = manager.verify("cluster-a", TEST_TOKEN).await.unwrap();
        assert_eq!(claims_after_invalidate.kubernetes_io.namespace, "situ");
    }

    #[tokio::test]
    async fn unknown_cluster_is_rejected_without_any_network_call() {
        let store = Arc::new(CredentialStore::new(Box::new(crate::credentials::NoopBackend::default())).await.unwrap());
        let manager = VerifierManager::new(Vec::new(), store);

        let err = manager.verify("does-not-exist", TEST_TOKEN).await.unwrap_err();
        assert!(matches!(err, VerifyError::UnknownCluster(name) if name == "does-not-exist"));
    }
}
