//! Caller authorization: `{cluster}/{namespace}/{serviceaccount}` patterns
//! with `*` wildcard segments.

use crate::config::AuthorizedClient;

fn segment_matches(pattern: &str, value: &str) -> bool {
    pattern == "*" || pattern == value
}

/// A malformed entry (not exactly three segments) never matches anything,
/// per the Store's "silently ignored" contract — it isn't rejected at load
/// time, it just never contributes a match.
fn matches_one(pattern: &str, cluster: &str, namespace: &str, serviceaccount: &str) -> bool {
    let mut segments = pattern.split('/');
    let (Some(c), Some(ns), Some(sa)) = (segments.next(), segments.next(), segments.next()) else {
        return false;
    };
    if segments.next().is_some() {
        return false;
    }

    segment_matches(c, cluster) && segment_matches(ns, namespace) && segment_matches(sa, serviceaccount)
}

pub fn is_authorized(
    whitelist: &[AuthorizedClient],
    cluster: &str,
    namespace: &str,
    serviceaccount: &str,
) -> bool {
    whitelist.iter().any(|entry| matches_one(&entry.0, cluster, namespace, serviceaccount))
}
