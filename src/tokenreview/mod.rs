//! The public HTTP surface: authenticate the caller (optional), detect the
//! issuing cluster, forward the TokenReview, annotate, and respond.
//!
//! The caller-bearer-token step tries every configured cluster's Verifier
//! Manager entry in turn rather than a single fixed verifier.

pub mod whitelist;

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use http::StatusCode;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewStatus, UserInfo};
use kube::api::{Api, PostParams};
use tracing::{info, warn};

use crate::{
    claims::Claims,
    config::AppConfig,
    credentials::CredentialStore,
    k8s_client,
    verifier::VerifierManager,
};

#[derive(thiserror::Error, Debug)]
pub enum ReviewError {
    #[error("failed to build client for detected cluster {0}: {1}")]
    Client(String, #[source] k8s_client::ClientError),
    #[error("forwarding TokenReview to cluster {0} failed: {1}")]
    Forward(String, #[source] kube::Error),
    #[error("no credentials available for remote cluster {0}")]
    NoCredentials(String),
}

pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<CredentialStore>,
    pub verifiers: Arc<VerifierManager>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/apis/authentication.k8s.io/v1/tokenreviews", post(handle_token_review))
        .with_state(state)
}

const CLUSTER_NAME_EXTRA_KEY: &str = "authentication.kubernetes.io/cluster-name";

fn unauthenticated_envelope(status_code: StatusCode, error: &str) -> Response {
    let review = TokenReview {
        metadata: Default::default(),
        spec: Default::default(),
        status: Some(TokenReviewStatus {
            authenticated: Some(false),
            error: Some(error.to_string()),
            user: None,
            audiences: None,
        }),
    };
    (status_code, Json(review)).into_response()
}

/// Step A: only enforced when `authorized_clients` is non-empty. Returns
/// `Err(response)` to short-circuit the request.
async fn authenticate_caller(
    state: &AppState,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<(), Response> {
    if state.config.authorized_clients.is_empty() {
        return Ok(());
    }

    let Some(TypedHeader(authorization)) = bearer else {
        return Err(unauthenticated_envelope(StatusCode::UNAUTHORIZED, "missing bearer token").into_response());
    };

    let caller_token = authorization.token();
    if caller_token.is_empty() {
        return Err(unauthenticated_envelope(StatusCode::UNAUTHORIZED, "empty bearer token"));
    }

    let mut caller_identity: Option<Claims> = None;
    for cluster in state.verifiers.clusters() {
        if let Ok(claims) = state.verifiers.verify(&cluster.name, caller_token).await {
            caller_identity = Some(claims);
            break;
        }
    }

    let Some(claims) = caller_identity else {
        return Err(unauthenticated_envelope(StatusCode::UNAUTHORIZED, "caller token not verified by any configured cluster"));
    };

    let authorized = whitelist::is_authorized(
        &state.config.authorized_clients,
        &claims.cluster,
        &claims.kubernetes_io.namespace,
        &claims.kubernetes_io.serviceaccount.name,
    );

    if !authorized {
        return Err(unauthenticated_envelope(
            StatusCode::FORBIDDEN,
            "caller not in the authorized client whitelist",
        ));
    }

    Ok(())
}

pub(crate) async fn handle_token_review(
    State(state): State<Arc<AppState>>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    body: Bytes,
) -> Response {
    if let Err(rejection) = authenticate_caller(&state, bearer).await {
        return rejection;
    }

    // Step B: parse and basic validation.
    let review: TokenReview = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(err) => {
            warn!(%err, "failed to parse TokenReview body");
            return unauthenticated_envelope(StatusCode::BAD_REQUEST, "malformed TokenReview body");
        }
    };

    let Some(spec_token) = review.spec.token.as_deref().filter(|t| !t.is_empty()) else {
        return unauthenticated_envelope(StatusCode::BAD_REQUEST, "empty token");
    };

    if state.verifiers.clusters().is_empty() {
        return unauthenticated_envelope(StatusCode::OK, "server not configured");
    }

    // Step C: local cluster detection. No outbound call leaves the process here.
    let mut detected: Option<String> = None;
    for cluster in state.verifiers.clusters() {
        if state.verifiers.verify(&cluster.name, spec_token).await.is_ok() {
            detected = Some(cluster.name.clone());
            break;
        }
    }

    let Some(detected_cluster) = detected else {
        return unauthenticated_envelope(
            StatusCode::OK,
            "token signature does not match any configured cluster",
        );
    };

    // Step D: forward to the detected cluster's own TokenReview API.
    match forward_token_review(&state, &detected_cluster, spec_token).await {
        Ok(mut forwarded) => {
            annotate_cluster_name(&mut forwarded, &detected_cluster);
            info!(cluster = %detected_cluster, "forwarded TokenReview");
            Json(forwarded).into_response()
        }
        Err(err) => {
            warn!(cluster = %detected_cluster, %err, "TokenReview forwarding failed");
            unauthenticated_envelope(StatusCode::OK, &err.to_string())
        }
    }
}

fn annotate_cluster_name(review: &mut TokenReview, cluster: &str) {
    let Some(status) = review.status.as_mut() else { return };
    if status.authenticated != Some(true) {
        return;
    }

    let user = status.user.get_or_insert_with(UserInfo::default);
    let extra = user.extra.get_or_insert_with(Default::default);
    extra.insert(CLUSTER_NAME_EXTRA_KEY.to_string(), vec![cluster.to_string()]);
}

async fn forward_token_review(
    state: &AppState,
    cluster: &str,
    spec_token: &str,
) -> Result<TokenReview, ReviewError> {
    let config = state
        .verifiers
        .clusters()
        .iter()
        .find(|c| c.name == cluster)
        .expect("detected cluster is always one of the configured clusters");

    let client = if config.is_remote() {
        let creds = state
            .store
            .get(cluster)
            .ok_or_else(|| ReviewError::NoCredentials(cluster.to_string()))?;
        k8s_client::remote_client(config, &creds)
            .await
            .map_err(|err| ReviewError::Client(cluster.to_string(), err))?
    } else {
        k8s_client::local_client().await.map_err(|err| ReviewError::Forward(cluster.to_string(), err))?
    };

    let review = TokenReview {
        metadata: Default::default(),
        spec: k8s_openapi::api::authentication::v1::TokenReviewSpec {
            token: Some(spec_token.to_string()),
            ..Default::default()
        },
        status: None,
    };

    let api: Api<TokenReview> = Api::all(client);
    api.create(&PostParams::default(), &review)
        .await
        .map_err(|err| ReviewError::Forward(cluster.to_string(), err))
}
