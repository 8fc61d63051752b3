use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use url::Url;

/// Build identifier stamped by `build.rs`; doubles as the cache-busting token
/// on the worker install URL.
pub const BUILD_ID: &str = env!("TRANSFER_BUILD_ID");

/// What `start` does when the id already names a live transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Close the live transfer (trigger, TRANSFER_CLOSE, writer), then start anew.
    #[default]
    Replace,
    /// Fail the new `start`; the live transfer keeps streaming.
    Reject,
}

impl DuplicatePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicatePolicy::Replace => "replace",
            DuplicatePolicy::Reject => "reject",
        }
    }
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(DuplicatePolicy::Replace),
            "reject" => Ok(DuplicatePolicy::Reject),
            other => Err(format!("unknown duplicate policy `{other}`")),
        }
    }
}

/// Intercept contexts are only installed for `https` pages or pages served
/// from `localhost`.
pub fn is_trusted_origin(origin: &str) -> bool {
    match Url::parse(origin) {
        Ok(url) => url.scheme() == "https" || url.host_str() == Some("localhost"),
        Err(_) => false,
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Origin of the page that owns the coordinator.
    pub origin: String,
    /// Registration scope the intercept context answers for.
    pub scope: String,
    pub public_path: String,
    pub worker_script: String,
    pub build_id: String,
    /// Chunks a session may buffer before `post` waits on the consumer.
    pub stream_buffer: usize,
    /// Upper bound on one `post` waiting for sink capacity; `None` waits forever.
    pub post_timeout: Option<Duration>,
    pub activation_timeout: Duration,
    pub duplicate_policy: DuplicatePolicy,
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup; unset or unparsable
    /// values fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &str| lookup(key).and_then(|val| val.trim().parse::<u64>().ok());

        let post_timeout = match millis("TRANSFER_POST_TIMEOUT_MS") {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => defaults.post_timeout,
        };
        let duplicate_policy = match lookup("TRANSFER_DUPLICATE_POLICY") {
            Some(raw) => raw.parse().unwrap_or_else(|err: String| {
                warn!(error = %err, "falling back to default duplicate policy");
                defaults.duplicate_policy
            }),
            None => defaults.duplicate_policy,
        };

        Self {
            origin: lookup("TRANSFER_ORIGIN").unwrap_or(defaults.origin),
            scope: lookup("TRANSFER_SCOPE").unwrap_or(defaults.scope),
            public_path: lookup("TRANSFER_PUBLIC_PATH").unwrap_or(defaults.public_path),
            worker_script: lookup("TRANSFER_WORKER_SCRIPT").unwrap_or(defaults.worker_script),
            build_id: lookup("TRANSFER_BUILD_ID")
                .filter(|id| !id.trim().is_empty())
                .unwrap_or(defaults.build_id),
            stream_buffer: lookup("TRANSFER_STREAM_BUFFER")
                .and_then(|val| val.trim().parse::<usize>().ok())
                .map(|chunks| chunks.max(1))
                .unwrap_or(defaults.stream_buffer),
            post_timeout,
            activation_timeout: millis("TRANSFER_ACTIVATION_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.activation_timeout),
            duplicate_policy,
        }
    }

    /// Versioned install location of the intercept worker.
    pub fn script_url(&self) -> String {
        format!("{}{}?{}", self.public_path, self.worker_script, self.build_id)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost".to_string(),
            scope: "./".to_string(),
            public_path: "/".to_string(),
            worker_script: "worker.js".to_string(),
            build_id: BUILD_ID.to_string(),
            stream_buffer: 1,
            post_timeout: Some(Duration::from_secs(30)),
            activation_timeout: Duration::from_secs(10),
            duplicate_policy: DuplicatePolicy::Replace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test_timeout::timeout]
    fn defaults_when_nothing_is_set() {
        let config = CoordinatorConfig::from_lookup(|_| None);
        assert_eq!(config.scope, "./");
        assert_eq!(config.stream_buffer, 1);
        assert_eq!(config.post_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.duplicate_policy, DuplicatePolicy::Replace);
        assert_eq!(config.build_id, BUILD_ID);
    }

    #[test_timeout::timeout]
    fn overrides_apply_per_field() {
        let config = CoordinatorConfig::from_lookup(lookup_from(&[
            ("TRANSFER_PUBLIC_PATH", "/static/"),
            ("TRANSFER_BUILD_ID", "fa28d9d7"),
            ("TRANSFER_STREAM_BUFFER", "8"),
            ("TRANSFER_ACTIVATION_TIMEOUT_MS", "250"),
            ("TRANSFER_DUPLICATE_POLICY", "Reject"),
        ]));
        assert_eq!(config.script_url(), "/static/worker.js?fa28d9d7");
        assert_eq!(config.stream_buffer, 8);
        assert_eq!(config.activation_timeout, Duration::from_millis(250));
        assert_eq!(config.duplicate_policy, DuplicatePolicy::Reject);
    }

    #[test_timeout::timeout]
    fn zero_post_timeout_disables_the_bound() {
        let config =
            CoordinatorConfig::from_lookup(lookup_from(&[("TRANSFER_POST_TIMEOUT_MS", "0")]));
        assert_eq!(config.post_timeout, None);
    }

    #[test_timeout::timeout]
    fn only_secure_or_local_origins_are_trusted() {
        assert!(is_trusted_origin("https://drop.example"));
        assert!(is_trusted_origin("http://localhost:8080"));
        assert!(!is_trusted_origin("http://drop.example"));
        assert!(!is_trusted_origin("http://127.0.0.1:8080"));
        assert!(!is_trusted_origin("not a url"));

        let config = CoordinatorConfig::from_lookup(|_| None);
        assert!(is_trusted_origin(&config.origin));
    }

    #[test_timeout::timeout]
    fn bad_values_fall_back() {
        let config = CoordinatorConfig::from_lookup(lookup_from(&[
            ("TRANSFER_STREAM_BUFFER", "0"),
            ("TRANSFER_POST_TIMEOUT_MS", "soon"),
            ("TRANSFER_DUPLICATE_POLICY", "overwrite"),
            ("TRANSFER_BUILD_ID", "  "),
        ]));
        assert_eq!(config.stream_buffer, 1);
        assert_eq!(config.post_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.duplicate_policy, DuplicatePolicy::Replace);
        assert_eq!(config.build_id, BUILD_ID);
    }
}
