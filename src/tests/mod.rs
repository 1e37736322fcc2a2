//! Cross-module scenario tests that don't belong to a single subsystem.
//!
//! Per-subsystem unit tests live beside their code (`verifier`, `renewer`,
//! `credentials`, `tokenreview::whitelist`); this module covers the
//! boundary behaviors those scenarios are named after in the design,
//! including a handful driven through `handle_token_review` itself rather
//! than its component parts.

use std::sync::Arc;

use axum::extract::State;
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use http::StatusCode;
use k8s_openapi::api::authentication::v1::TokenReview;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::config::{AppConfig, AuthorizedClient, ClusterConfig, RenewalSettings};
use crate::credentials::{CredentialStore, NoopBackend};
use crate::tokenreview::{handle_token_review, whitelist::is_authorized, AppState};
use crate::verifier::fixtures::{test_jwk_set, TEST_TOKEN};
use crate::verifier::VerifierManager;

#[test]
fn malformed_body_is_rejected_at_parse_time() {
    let result: Result<TokenReview, _> = serde_json::from_slice(b"not json at all");
    assert!(result.is_err());
}

#[test]
fn empty_token_is_distinguishable_from_a_present_one() {
    let body = serde_json::json!({
        "apiVersion": "authentication.k8s.io/v1",
        "kind": "TokenReview",
        "spec": {}
    });
    let review: TokenReview = serde_json::from_value(body).unwrap();
    assert!(review.spec.token.as_deref().filter(|t| !t.is_empty()).is_none());
}

#[test]
fn caller_whitelist_reject_then_accept_wildcard() {
    let whitelist =
        vec![AuthorizedClient("prod/ingress/edge-proxy".to_string()), AuthorizedClient("staging/*/*".to_string())];

    // Not present in either entry: rejected.
    assert!(!is_authorized(&whitelist, "prod", "batch", "nightly-job"));

    // Matches the wildcarded staging entry regardless of namespace/sa.
    assert!(is_authorized(&whitelist, "staging", "whatever-ns", "whatever-sa"));
}

#[test]
fn renewal_settings_defaults_match_1h_168h_48h() {
    let defaults = RenewalSettings::default();
    assert_eq!(defaults.interval.as_secs(), 60 * 60);
    assert_eq!(defaults.token_duration.as_secs(), 60 * 60 * 168);
    assert_eq!(defaults.renew_before.as_secs(), 60 * 60 * 48);
}

#[test]
fn cluster_discovery_root_follows_the_remote_local_split() {
    let local = ClusterConfig {
        name: "home".to_string(),
        issuer: "https://kubernetes.default.svc.cluster.local".to_string(),
        api_server: None,
        ca_cert: None,
        token_path: None,
    };
    assert!(!local.is_remote());
    assert_eq!(local.discovery_url(), local.issuer);

    let remote = ClusterConfig {
        name: "edge".to_string(),
        issuer: "https://kubernetes.default.svc.cluster.local".to_string(),
        api_server: Some("https://203.0.113.10:6443".to_string()),
        ca_cert: None,
        token_path: None,
    };
    assert!(remote.is_remote());
    assert_eq!(remote.discovery_url(), "https://203.0.113.10:6443");
}

/// Stubs discovery + JWKS for a cluster whose `api_server` points at the
/// given mock server, backed by the same RSA key as [`TEST_TOKEN`].
async fn mount_oidc_discovery(mock_server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "issuer": "https://kubernetes.default.svc.cluster.local",
            "jwks_uri": format!("{}/openid/v1/jwks", mock_server.uri()),
        })))
        .mount(mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/openid/v1/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(test_jwk_set()))
        .mount(mock_server)
        .await;
}

async fn test_state(clusters: Vec<ClusterConfig>, authorized_clients: Vec<AuthorizedClient>) -> Arc<AppState> {
    let store = Arc::new(CredentialStore::new(Box::new(NoopBackend::default())).await.unwrap());
    let verifiers = Arc::new(VerifierManager::new(clusters.clone(), store.clone()));
    let config = Arc::new(AppConfig {
        clusters,
        renewal: RenewalSettings::default(),
        authorized_clients,
        credentials_secret_name: "fedsa-validator-credentials".to_string(),
        credentials_secret_namespace: "default".to_string(),
        listen_addr: "0.0.0.0:8443".to_string(),
    });
    Arc::new(AppState { config, store, verifiers })
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Scenario: unknown issuer. The detected-cluster loop tries the one
/// configured cluster, signature verification fails because its issuer
/// doesn't match the token's, and the handler reports failure as a 200 with
/// `authenticated: false` rather than an HTTP error.
#[tokio::test]
async fn end_to_end_unknown_issuer_is_reported_as_an_unauthenticated_token_review() {
    let mock_server = MockServer::start().await;
    mount_oidc_discovery(&mock_server).await;

    let cluster = ClusterConfig {
        name: "cluster-a".to_string(),
        issuer: "https://some-other-issuer.example".to_string(),
        api_server: Some(mock_server.uri()),
        ca_cert: None,
        token_path: None,
    };
    let state = test_state(vec![cluster], vec![]).await;

    let body = serde_json::to_vec(&serde_json::json!({
        "apiVersion": "authentication.k8s.io/v1",
        "kind": "TokenReview",
        "spec": { "token": TEST_TOKEN },
    }))
    .unwrap();

    let response = handle_token_review(State(state), None, axum::body::Bytes::from(body)).await;

    assert_eq!(response.status(), StatusCode::OK);
    let review = body_json(response).await;
    assert_eq!(review["status"]["authenticated"], serde_json::json!(false));
}

/// Scenario: malformed body. Unparseable JSON is rejected with 400 before
/// any cluster is consulted.
#[tokio::test]
async fn end_to_end_malformed_body_returns_bad_request() {
    let state = test_state(Vec::new(), Vec::new()).await;

    let response =
        handle_token_review(State(state), None, axum::body::Bytes::from_static(b"not json at all")).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Scenario: caller whitelist reject. The caller authenticates fine against
/// `cluster-a`, but its identity isn't in the whitelist, so the request
/// never reaches body parsing; it's forbidden as a TokenReview, not a bare
/// text body (see the forbidden-path fix in `tokenreview::mod`).
#[tokio::test]
async fn end_to_end_caller_whitelist_rejects_an_unlisted_caller() {
    let mock_server = MockServer::start().await;
    mount_oidc_discovery(&mock_server).await;

    let cluster = ClusterConfig {
        name: "cluster-a".to_string(),
        issuer: "https://kubernetes.default.svc.cluster.local".to_string(),
        api_server: Some(mock_server.uri()),
        ca_cert: None,
        token_path: None,
    };
    let whitelist = vec![AuthorizedClient("cluster-a/other-ns/other-sa".to_string())];
    let state = test_state(vec![cluster], whitelist).await;

    let bearer: Authorization<Bearer> = Authorization::bearer(TEST_TOKEN).unwrap();
    let response =
        handle_token_review(State(state), Some(TypedHeader(bearer)), axum::body::Bytes::from_static(b"{}"))
            .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let review = body_json(response).await;
    assert_eq!(review["status"]["authenticated"], serde_json::json!(false));
}

/// Scenario: caller whitelist accept (wildcard). The caller clears Step A
/// and the request proceeds to detection, which is the behavior under test
/// here, not the detection outcome itself.
#[tokio::test]
async fn end_to_end_caller_whitelist_accepts_a_wildcarded_caller() {
    let mock_server = MockServer::start().await;
    mount_oidc_discovery(&mock_server).await;

    let cluster = ClusterConfig {
        name: "cluster-a".to_string(),
        issuer: "https://kubernetes.default.svc.cluster.local".to_string(),
        api_server: Some(mock_server.uri()),
        ca_cert: None,
        token_path: None,
    };
    let whitelist = vec![AuthorizedClient("*/*/*".to_string())];
    let state = test_state(vec![cluster], whitelist).await;

    let bearer: Authorization<Bearer> = Authorization::bearer(TEST_TOKEN).unwrap();
    let body = serde_json::to_vec(&serde_json::json!({
        "apiVersion": "authentication.k8s.io/v1",
        "kind": "TokenReview",
        "spec": { "token": "not-a-real-token" },
    }))
    .unwrap();

    let response =
        handle_token_review(State(state), Some(TypedHeader(bearer)), axum::body::Bytes::from(body)).await;

    // Not 401/403: Step A passed. 200 with an unauthenticated status because
    // the review's own spec.token doesn't verify against any cluster.
    assert_eq!(response.status(), StatusCode::OK);
    let review = body_json(response).await;
    assert_eq!(review["status"]["authenticated"], serde_json::json!(false));
}
