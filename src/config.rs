//! Worker pool configuration.
//!
//! # Configuration Precedence
//!
//! 1. **Programmatic**: values set through [`PoolConfig`] builder methods
//! 2. **Environment variables**: values from `CALLTASK_*` env vars, applied
//!    by [`PoolConfig::from_env`] or [`PoolConfig::apply_env_overrides`]
//! 3. **Defaults**: [`PoolConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `CALLTASK_POOL_CACHE_SIZE` | `usize` | `cache_size` |
//! | `CALLTASK_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |

use std::fmt;
use std::sync::Arc;

/// Environment variable name for the idle-thread cache size.
pub const ENV_POOL_CACHE_SIZE: &str = "CALLTASK_POOL_CACHE_SIZE";
/// Environment variable name for the worker thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "CALLTASK_THREAD_NAME_PREFIX";

/// Idle threads kept by default.
pub const DEFAULT_CACHE_SIZE: usize = 5;
/// Worker thread name prefix used by default.
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "calltask-worker";

/// Callback invoked on a worker thread as it starts or stops.
pub type ThreadHook = Arc<dyn Fn() + Send + Sync>;

/// Error returned when configuration input cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable is set to a value that cannot be parsed.
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// What the variable should contain.
        expected: &'static str,
        /// The rejected value.
        value: String,
    },
}

/// Configuration for a [`WorkerPool`](crate::runtime::WorkerPool).
#[derive(Clone)]
pub struct PoolConfig {
    /// Maximum number of idle threads kept for reuse.
    ///
    /// A thread that finishes its work while this many threads are already
    /// idle exits instead of waiting. Zero disables caching.
    pub cache_size: usize,
    /// Prefix for worker thread names; threads are named `{prefix}-{n}`.
    pub thread_name_prefix: String,
    /// Called on each worker thread when it starts.
    pub on_thread_start: Option<ThreadHook>,
    /// Called on each worker thread right before it exits.
    pub on_thread_stop: Option<ThreadHook>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            on_thread_start: None,
            on_thread_stop: None,
        }
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("cache_size", &self.cache_size)
            .field("thread_name_prefix", &self.thread_name_prefix)
            .field("on_thread_start", &self.on_thread_start.is_some())
            .field("on_thread_stop", &self.on_thread_stop.is_some())
            .finish()
    }
}

impl PoolConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the default configuration with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Sets the idle-thread cache size.
    #[must_use]
    pub fn cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    /// Sets the worker thread name prefix.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Sets a callback to run on each worker thread when it starts.
    #[must_use]
    pub fn on_thread_start<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_thread_start = Some(Arc::new(f));
        self
    }

    /// Sets a callback to run on each worker thread before it exits.
    #[must_use]
    pub fn on_thread_stop<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_thread_stop = Some(Arc::new(f));
        self
    }

    /// Replaces unusable values with defaults.
    pub fn normalize(&mut self) {
        if self.thread_name_prefix.trim().is_empty() {
            self.thread_name_prefix = DEFAULT_THREAD_NAME_PREFIX.to_string();
        }
    }

    /// Applies environment variable overrides.
    ///
    /// Only variables that are set are applied. Returns an error if a variable
    /// is set but contains an unparseable value.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(read_env)
    }

    fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup(ENV_POOL_CACHE_SIZE) {
            self.cache_size = parse_usize(ENV_POOL_CACHE_SIZE, &val)?;
        }
        if let Some(val) = lookup(ENV_THREAD_NAME_PREFIX) {
            self.thread_name_prefix = val;
        }
        self.normalize();
        Ok(())
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_usize(var: &'static str, val: &str) -> Result<usize, ConfigError> {
    val.trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidValue {
            var,
            expected: "unsigned integer",
            value: val.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::collections::HashMap;

    fn init_test(test_name: &str) {
        init_test_logging();
        crate::test_phase!(test_name);
    }

    fn lookup_in(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults() {
        init_test("defaults");
        let config = PoolConfig::default();
        crate::assert_with_log!(
            config.cache_size == DEFAULT_CACHE_SIZE,
            "default cache size",
            DEFAULT_CACHE_SIZE,
            config.cache_size
        );
        assert_eq!(config.thread_name_prefix, "calltask-worker");
        assert!(config.on_thread_start.is_none());
        crate::test_complete!("defaults");
    }

    #[test]
    fn builder_methods() {
        init_test("builder_methods");
        let config = PoolConfig::new()
            .cache_size(2)
            .thread_name_prefix("io")
            .on_thread_start(|| {})
            .on_thread_stop(|| {});
        assert_eq!(config.cache_size, 2);
        assert_eq!(config.thread_name_prefix, "io");
        assert!(config.on_thread_start.is_some());
        assert!(config.on_thread_stop.is_some());
        let rendered = format!("{config:?}");
        assert!(rendered.contains("cache_size: 2"), "{rendered}");
        crate::test_complete!("builder_methods");
    }

    #[test]
    fn overrides_apply_when_set() {
        init_test("overrides_apply_when_set");
        let mut config = PoolConfig::default();
        config
            .apply_overrides_from(lookup_in(&[
                (ENV_POOL_CACHE_SIZE, " 12 "),
                (ENV_THREAD_NAME_PREFIX, "fanout"),
            ]))
            .expect("valid overrides");
        assert_eq!(config.cache_size, 12);
        assert_eq!(config.thread_name_prefix, "fanout");
        crate::test_complete!("overrides_apply_when_set");
    }

    #[test]
    fn unset_variables_leave_defaults() {
        init_test("unset_variables_leave_defaults");
        let mut config = PoolConfig::default().cache_size(3);
        config
            .apply_overrides_from(lookup_in(&[]))
            .expect("no overrides");
        assert_eq!(config.cache_size, 3);
        crate::test_complete!("unset_variables_leave_defaults");
    }

    #[test]
    fn invalid_cache_size_is_rejected() {
        init_test("invalid_cache_size_is_rejected");
        for bad in ["abc", "-1", "3.5", ""] {
            let mut config = PoolConfig::default();
            let err = config
                .apply_overrides_from(lookup_in(&[(ENV_POOL_CACHE_SIZE, bad)]))
                .expect_err("invalid value");
            crate::assert_with_log!(
                matches!(err, ConfigError::InvalidValue { var: ENV_POOL_CACHE_SIZE, .. }),
                "invalid value error",
                ENV_POOL_CACHE_SIZE,
                err
            );
        }
        crate::test_complete!("invalid_cache_size_is_rejected");
    }

    #[test]
    fn blank_prefix_normalizes_to_default() {
        init_test("blank_prefix_normalizes_to_default");
        let mut config = PoolConfig::default();
        config
            .apply_overrides_from(lookup_in(&[(ENV_THREAD_NAME_PREFIX, "  ")]))
            .expect("valid overrides");
        assert_eq!(config.thread_name_prefix, DEFAULT_THREAD_NAME_PREFIX);
        crate::test_complete!("blank_prefix_normalizes_to_default");
    }
}
