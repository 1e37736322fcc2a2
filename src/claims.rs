//! Normalized claims extracted from a verified ServiceAccount JWT.
//!
//! Carries the standard `kubernetes.io` claim blob plus the cluster that
//! produced the verification.

use base64::Engine;
use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountRef {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KubernetesIo {
    pub namespace: String,
    pub serviceaccount: ServiceAccountRef,
}

/// `aud` is usually an array but some issuers emit a bare string; accept both.
fn deserialize_aud<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Aud {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Aud::deserialize(deserializer)? {
        Aud::One(s) => vec![s],
        Aud::Many(v) => v,
    })
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawClaims {
    pub iss: String,
    pub sub: String,
    #[serde(default, deserialize_with = "deserialize_aud")]
    pub aud: Vec<String>,
    pub exp: i64,
    pub iat: i64,
    #[serde(default)]
    pub nbf: i64,
    #[serde(rename = "kubernetes.io")]
    pub kubernetes_io: KubernetesIo,
}

/// Claims normalized out of a verified token, tagged with the cluster whose
/// verifier accepted it.
#[derive(Debug, Clone)]
pub struct Claims {
    pub cluster: String,
    pub iss: String,
    pub sub: String,
    pub aud: Vec<String>,
    pub exp: i64,
    pub iat: i64,
    pub nbf: i64,
    pub kubernetes_io: KubernetesIo,
}

impl Claims {
    pub(crate) fn from_raw(cluster: &str, raw: RawClaims) -> Self {
        Self {
            cluster: cluster.to_string(),
            iss: raw.iss,
            sub: raw.sub,
            aud: raw.aud,
            exp: raw.exp,
            iat: raw.iat,
            nbf: raw.nbf,
            kubernetes_io: raw.kubernetes_io,
        }
    }
}

/// Subject shape required by the Renewer: `system:serviceaccount:<ns>:<name>`.
pub fn parse_service_account_subject(sub: &str) -> Option<(&str, &str)> {
    let rest = sub.strip_prefix("system:serviceaccount:")?;
    let (ns, name) = rest.split_once(':')?;
    if ns.is_empty() || name.is_empty() {
        return None;
    }
    Some((ns, name))
}

/// Local, unverified peek at a JWT's `exp` claim: base64url-decode the
/// payload without checking the signature. Used by the Renewer purely as a
/// scheduling hint, never as an authentication decision.
pub fn peek_unverified_exp(token: &str) -> anyhow::Result<i64> {
    #[derive(Deserialize)]
    struct ExpOnly {
        exp: i64,
    }

    let mut parts = token.split('.');
    let _header = parts.next().ok_or_else(|| anyhow::anyhow!("malformed token"))?;
    let payload = parts.next().ok_or_else(|| anyhow::anyhow!("malformed token"))?;

    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload)?;
    let claims: ExpOnly = serde_json::from_slice(&decoded)?;
    Ok(claims.exp)
}
