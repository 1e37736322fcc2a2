//! One long-lived task per remote cluster, renewing its bootstrap/rotated
//! credentials ahead of expiry via TokenRequest.
//!
//! Generalized from a single co-located rotation loop to N independently
//! ticking per-cluster tasks, sharing one process-wide cancellation token.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use k8s_openapi::api::{authentication::v1::TokenRequest, core::v1::ServiceAccount};
use kube::api::{Api, PostParams};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::{
    claims::{parse_service_account_subject, peek_unverified_exp},
    config::{ClusterConfig, RenewalSettings},
    credentials::{Credentials, CredentialStore, StoreError},
    k8s_client, verifier::VerifierManager,
};

#[derive(thiserror::Error, Debug)]
pub enum RenewError {
    #[error("no credentials available for cluster {0} (no store entry and no bootstrap files)")]
    NoCredentials(String),
    #[error("token subject {0:?} is not a well-formed service account subject")]
    MalformedSubject(String),
    #[error("failed to build client for cluster {0}: {1}")]
    Client(String, #[source] k8s_client::ClientError),
    #[error("TokenRequest failed for cluster {0}: {1}")]
    TokenRequest(String, #[source] kube::Error),
    #[error("failed to persist renewed credentials for cluster {0}: {1}")]
    Persist(String, #[source] StoreError),
    #[error("failed to parse current token for cluster {0}: {1}")]
    TokenParse(String, #[source] anyhow::Error),
    #[error("TokenRequest for cluster {0} returned no status")]
    MissingTokenStatus(String),
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// `true` if the current token's `exp` leaves more headroom than `renew_before`.
fn should_skip_renewal(token: &str, renew_before: Duration) -> Result<bool, anyhow::Error> {
    let exp = peek_unverified_exp(token)?;
    let remaining = exp - now_unix();
    Ok(remaining as i64 > renew_before.as_secs() as i64)
}

/// Logs, but never fails, a warning when the CA has less than 20% of its
/// lifetime left. Informational only, per the renewal contract.
fn warn_if_ca_expiring_soon(cluster: &str, ca_pem: &[u8]) {
    let pem = match pem::parse(ca_pem) {
        Ok(pem) => pem,
        Err(err) => {
            warn!(?cluster, %err, "could not parse CA certificate for expiry check");
            return;
        }
    };

    let (_, cert) = match X509Certificate::from_der(&pem.contents) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(?cluster, %err, "could not parse CA certificate DER for expiry check");
            return;
        }
    };

    let validity = cert.validity();
    let total = validity.not_after.timestamp() - validity.not_before.timestamp();
    let remaining = validity.not_after.timestamp() - now_unix();

    if total > 0 && remaining * 5 < total {
        warn!(?cluster, remaining_seconds = remaining, "cluster CA certificate is nearing expiry");
    }
}

struct RenewalContext<'a> {
    cluster: &'a ClusterConfig,
    store: &'a CredentialStore,
    verifiers: &'a VerifierManager,
    settings: &'a RenewalSettings,
}

async fn ensure_seeded(ctx: &RenewalContext<'_>) -> Result<Credentials, RenewError> {
    if let Some(creds) = ctx.store.get(&ctx.cluster.name) {
        return Ok(creds);
    }

    let Some((token_path, ca_path)) = ctx.cluster.bootstrap_paths() else {
        return Err(RenewError::NoCredentials(ctx.cluster.name.clone()));
    };

    ctx.store
        .load_bootstrap_from_files(&ctx.cluster.name, token_path, ca_path)
        .map_err(|err| RenewError::Persist(ctx.cluster.name.clone(), err))?;

    ctx.store.get(&ctx.cluster.name).ok_or_else(|| RenewError::NoCredentials(ctx.cluster.name.clone()))
}

async fn attempt_renewal(ctx: &RenewalContext<'_>, creds: &Credentials) -> Result<(), RenewError> {
    let subject = jsonwebtoken_subject(&creds.token)
        .map_err(|err| RenewError::TokenParse(ctx.cluster.name.clone(), err))?;
    let (namespace, name) = parse_service_account_subject(&subject)
        .ok_or_else(|| RenewError::MalformedSubject(subject.clone()))?;

    warn_if_ca_expiring_soon(&ctx.cluster.name, &creds.ca_cert);

    let client = k8s_client::remote_client(ctx.cluster, creds)
        .await
        .map_err(|err| RenewError::Client(ctx.cluster.name.clone(), err))?;

    let api: Api<ServiceAccount> = Api::namespaced(client, namespace);
    let request = TokenRequest {
        spec: k8s_openapi::api::authentication::v1::TokenRequestSpec {
            expiration_seconds: Some(ctx.settings.token_duration.as_secs() as i64),
            ..Default::default()
        },
        ..Default::default()
    };
    let body = serde_json::to_vec(&request)
        .map_err(|err| RenewError::TokenParse(ctx.cluster.name.clone(), err.into()))?;

    let result: TokenRequest = api
        .create_subresource("token", name, &PostParams::default(), body)
        .await
        .map_err(|err| RenewError::TokenRequest(ctx.cluster.name.clone(), err))?;

    let new_token = result
        .status
        .map(|status| status.token)
        .ok_or_else(|| RenewError::MissingTokenStatus(ctx.cluster.name.clone()))?;

    ctx.store
        .set(&ctx.cluster.name, Credentials { token: new_token, ca_cert: creds.ca_cert.clone() })
        .await
        .map_err(|err| RenewError::Persist(ctx.cluster.name.clone(), err))?;

    ctx.verifiers.invalidate(&ctx.cluster.name);
    info!(cluster = %ctx.cluster.name, "renewed service account token");
    Ok(())
}

/// Extracts `sub` from a JWT without verifying its signature, mirroring the
/// unverified-`exp` peek used for the skip-renewal check.
fn jsonwebtoken_subject(token: &str) -> Result<String, anyhow::Error> {
    use base64::Engine;

    #[derive(serde::Deserialize)]
    struct SubOnly {
        sub: String,
    }

    let mut parts = token.split('.');
    let _header = parts.next().ok_or_else(|| anyhow::anyhow!("malformed token"))?;
    let payload = parts.next().ok_or_else(|| anyhow::anyhow!("malformed token"))?;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload)?;
    let claims: SubOnly = serde_json::from_slice(&decoded)?;
    Ok(claims.sub)
}

async fn renew_once(ctx: &RenewalContext<'_>) -> Result<(), RenewError> {
    let creds = ensure_seeded(ctx).await?;

    match should_skip_renewal(&creds.token, ctx.settings.renew_before) {
        Ok(true) => {
            info!(cluster = %ctx.cluster.name, "renewal skipped, current token still has headroom");
            return Ok(());
        }
        Ok(false) => {}
        Err(err) => {
            warn!(cluster = %ctx.cluster.name, %err, "could not inspect current token expiry, attempting renewal anyway");
        }
    }

    match attempt_renewal(ctx, &creds).await {
        Ok(()) => Ok(()),
        Err(primary_err) => {
            let Some((token_path, ca_path)) = ctx.cluster.bootstrap_paths() else {
                return Err(primary_err);
            };

            warn!(
                cluster = %ctx.cluster.name,
                %primary_err,
                "renewal failed, falling back to bootstrap credentials"
            );

            if let Err(err) = ctx.store.load_from_files(&ctx.cluster.name, token_path, ca_path) {
                error!(
                    cluster = %ctx.cluster.name,
                    token_path = %token_path.display(),
                    ca_path = %ca_path.display(),
                    %err,
                    "bootstrap fallback read failed; check that the bootstrap files are still present and readable"
                );
                return Err(primary_err);
            }

            let Some(fallback_creds) = ctx.store.get(&ctx.cluster.name) else {
                return Err(primary_err);
            };

            attempt_renewal(ctx, &fallback_creds).await.map_err(|retry_err| {
                error!(
                    cluster = %ctx.cluster.name,
                    token_path = %token_path.display(),
                    ca_path = %ca_path.display(),
                    %retry_err,
                    "renewal retry against bootstrap credentials also failed; check the bootstrap files at the paths above"
                );
                primary_err
            })
        }
    }
}

/// Runs the renewal loop for one remote cluster until `cancel` fires. An
/// initial renewal happens immediately, before the ticker engages.
pub async fn run(
    cluster: ClusterConfig,
    store: std::sync::Arc<CredentialStore>,
    verifiers: std::sync::Arc<VerifierManager>,
    settings: RenewalSettings,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let ctx = RenewalContext { cluster: &cluster, store: &store, verifiers: &verifiers, settings: &settings };
        if let Err(err) = renew_once(&ctx).await {
            error!(cluster = %cluster.name, %err, "renewal loop iteration failed");
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!(cluster = %cluster.name, "renewal task cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }
    }
}
