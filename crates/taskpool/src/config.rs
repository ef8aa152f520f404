//! Manager configuration.
//!
//! Built on the host, then shipped to the manager process inside its `Init`
//! frame so both sides agree on pool size and timeouts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_NAME: &str = "manager";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Used for process names and log fields.
    pub name: String,
    pub pool_size: usize,
    /// Re-poll cadence for pending replies and worker drain checks.
    pub poll_interval: Duration,
    /// Deadline for control requests made without an explicit one.
    pub request_timeout: Duration,
    /// Bound on a spawned process answering `Init`.
    pub setup_timeout: Duration,
    /// Bound on a worker acknowledging `JOIN` before it is replaced.
    pub worker_join_timeout: Duration,
    pub terminate_timeout: Duration,
    pub kill_timeout: Duration,
    /// Stop the manager after this long without submissions, completions or requests.
    pub idle_shutdown: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            pool_size: default_pool_size(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            worker_join_timeout: DEFAULT_WORKER_JOIN_TIMEOUT,
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            idle_shutdown: None,
        }
    }
}

/// Host logical core count, at least one.
fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl ManagerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Defaults with overrides from `TASKPOOL_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults with overrides read through `lookup`. Unparsable values are
    /// logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(n) = parse_var::<usize>(&lookup, "TASKPOOL_POOL_SIZE") {
            config = config.with_pool_size(n);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "TASKPOOL_REQUEST_TIMEOUT_MS") {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "TASKPOOL_JOIN_TIMEOUT_MS") {
            config.worker_join_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "TASKPOOL_IDLE_SHUTDOWN_SECS") {
            config.idle_shutdown = Some(Duration::from_secs(secs));
        }

        config
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Zero is raised to one: a pool always has a worker.
    pub fn with_pool_size(mut self, n: usize) -> Self {
        self.pool_size = n.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    pub fn with_worker_join_timeout(mut self, timeout: Duration) -> Self {
        self.worker_join_timeout = timeout;
        self
    }

    pub fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    pub fn with_idle_shutdown(mut self, after: Option<Duration>) -> Self {
        self.idle_shutdown = after;
        self
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.name, "manager");
        assert!(config.pool_size >= 1);
        assert_eq!(config.poll_interval, Duration::from_millis(1));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.terminate_timeout, Duration::from_millis(500));
        assert_eq!(config.kill_timeout, Duration::from_millis(100));
        assert_eq!(config.idle_shutdown, None);
    }

    #[test]
    fn builder_chains() {
        let config = ManagerConfig::new("pool")
            .with_pool_size(0)
            .with_request_timeout(Duration::from_millis(250))
            .with_idle_shutdown(Some(Duration::from_secs(5)));
        assert_eq!(config.name, "pool");
        assert_eq!(config.pool_size, 1);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.idle_shutdown, Some(Duration::from_secs(5)));
    }

    #[test]
    fn env_overrides_apply() {
        let config = ManagerConfig::from_lookup(lookup(&[
            ("TASKPOOL_POOL_SIZE", "3"),
            ("TASKPOOL_REQUEST_TIMEOUT_MS", "750"),
            ("TASKPOOL_JOIN_TIMEOUT_MS", "1500"),
            ("TASKPOOL_IDLE_SHUTDOWN_SECS", "5"),
        ]));
        assert_eq!(config.pool_size, 3);
        assert_eq!(config.request_timeout, Duration::from_millis(750));
        assert_eq!(config.worker_join_timeout, Duration::from_millis(1500));
        assert_eq!(config.idle_shutdown, Some(Duration::from_secs(5)));
    }

    #[test]
    fn bad_env_values_are_ignored() {
        let config = ManagerConfig::from_lookup(lookup(&[
            ("TASKPOOL_POOL_SIZE", "many"),
            ("TASKPOOL_REQUEST_TIMEOUT_MS", "-1"),
        ]));
        let defaults = ManagerConfig::default();
        assert_eq!(config.pool_size, defaults.pool_size);
        assert_eq!(config.request_timeout, defaults.request_timeout);
    }

    #[test]
    fn config_survives_serde() {
        let config = ManagerConfig::new("x").with_pool_size(2);
        let json = serde_json::to_string(&config).unwrap();
        let back: ManagerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
