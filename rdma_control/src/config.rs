/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Configuration for the RDMA control plane.
//!
//! Settings come from defaults, `RDMA_CONTROL_*` environment variables or a
//! YAML file. A process-wide copy lives in [`global`] and is read by the
//! connect manager, the control daemon and the verbs provider.

use std::env;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::RwLock;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(1000);
const DEFAULT_NUM_SOFT_DEVICES: usize = 2;

/// Control plane configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How long a connect manager waits for each RPC reply.
    #[serde(with = "duration_ms")]
    rpc_timeout: Duration,
    /// Sleep between daemon loop iterations that served nothing. `None`
    /// busy-polls.
    #[serde(with = "option_duration_us")]
    daemon_idle_backoff: Option<Duration>,
    /// Number of devices the software verbs fabric exposes.
    num_soft_devices: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            daemon_idle_backoff: None,
            num_soft_devices: DEFAULT_NUM_SOFT_DEVICES,
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("RDMA_CONTROL_RPC_TIMEOUT_MS") {
            if let Ok(parsed) = val.parse::<u64>() {
                config.rpc_timeout = Duration::from_millis(parsed);
            }
        }

        if let Ok(val) = env::var("RDMA_CONTROL_DAEMON_IDLE_BACKOFF_US") {
            if let Ok(parsed) = val.parse::<u64>() {
                config.daemon_idle_backoff = Some(Duration::from_micros(parsed));
            }
        }

        if let Ok(val) = env::var("RDMA_CONTROL_NUM_SOFT_DEVICES") {
            if let Ok(parsed) = val.parse::<usize>() {
                config.num_soft_devices = parsed;
            }
        }

        config
    }

    /// Load configuration from a YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), anyhow::Error> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Merge with another configuration; every value of `other` that differs
    /// from the default takes precedence.
    pub fn merge(&mut self, other: &Self) {
        let defaults = Self::default();
        if other.rpc_timeout != defaults.rpc_timeout {
            self.rpc_timeout = other.rpc_timeout;
        }
        if other.daemon_idle_backoff != defaults.daemon_idle_backoff {
            self.daemon_idle_backoff = other.daemon_idle_backoff;
        }
        if other.num_soft_devices != defaults.num_soft_devices {
            self.num_soft_devices = other.num_soft_devices;
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    pub fn daemon_idle_backoff(&self) -> Option<Duration> {
        self.daemon_idle_backoff
    }

    pub fn num_soft_devices(&self) -> usize {
        self.num_soft_devices
    }

    pub fn set_rpc_timeout(&mut self, value: Duration) {
        self.rpc_timeout = value;
    }

    pub fn set_daemon_idle_backoff(&mut self, value: Option<Duration>) {
        self.daemon_idle_backoff = value;
    }

    pub fn set_num_soft_devices(&mut self, value: usize) {
        self.num_soft_devices = value;
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod option_duration_us {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_micros() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_micros))
    }
}

/// Global configuration functions
///
/// Tests that change global configuration take [`global::lock`] first so
/// that they are serialized and cannot clobber each other's overrides.
pub mod global {
    use std::sync::Mutex;
    use std::sync::MutexGuard;
    use std::sync::PoisonError;
    use std::sync::RwLockReadGuard;

    use super::*;

    /// Global configuration instance, initialized from environment variables.
    static CONFIG: LazyLock<Arc<RwLock<Config>>> =
        LazyLock::new(|| Arc::new(RwLock::new(Config::from_env())));

    fn read() -> RwLockReadGuard<'static, Config> {
        CONFIG.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn replace(config: Config) {
        *CONFIG.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Acquire the global configuration lock for testing.
    ///
    /// The returned guard restores the configuration that was in effect
    /// when it was taken once it is dropped.
    pub fn lock() -> ConfigLock {
        static MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));
        let guard = MUTEX.lock().unwrap_or_else(PoisonError::into_inner);
        ConfigLock {
            orig: read().clone(),
            _guard: guard,
        }
    }

    /// Initialize the global configuration from environment variables
    pub fn init_from_env() {
        replace(Config::from_env());
    }

    /// Initialize the global configuration from a YAML file
    pub fn init_from_yaml<P: AsRef<Path>>(path: P) -> Result<(), anyhow::Error> {
        replace(Config::from_yaml(path)?);
        Ok(())
    }

    /// Get a reference to the global configuration
    pub fn get() -> Arc<RwLock<Config>> {
        CONFIG.clone()
    }

    pub fn rpc_timeout() -> Duration {
        read().rpc_timeout()
    }

    pub fn daemon_idle_backoff() -> Option<Duration> {
        read().daemon_idle_backoff()
    }

    pub fn num_soft_devices() -> usize {
        read().num_soft_devices()
    }

    /// Holds the global configuration lock; see [`lock`].
    pub struct ConfigLock {
        orig: Config,
        _guard: MutexGuard<'static, ()>,
    }

    impl ConfigLock {
        /// Apply `f` to the global configuration until this lock is dropped.
        pub fn update(&self, f: impl FnOnce(&mut Config)) {
            let mut config = CONFIG.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut config);
        }
    }

    impl Drop for ConfigLock {
        fn drop(&mut self) {
            replace(self.orig.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.rpc_timeout(), Duration::from_millis(1000));
        assert_eq!(config.daemon_idle_backoff(), None);
        assert_eq!(config.num_soft_devices(), 2);
    }

    #[test]
    fn test_yaml_round_trip() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yaml");

        let mut config = Config::new();
        config.set_rpc_timeout(Duration::from_millis(250));
        config.set_daemon_idle_backoff(Some(Duration::from_micros(50)));
        config.to_yaml(&path)?;

        let loaded = Config::from_yaml(&path)?;
        assert_eq!(loaded, config);
        Ok(())
    }

    #[test]
    fn test_partial_yaml_uses_defaults() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "rpc_timeout: 20\n")?;

        let loaded = Config::from_yaml(&path)?;
        assert_eq!(loaded.rpc_timeout(), Duration::from_millis(20));
        assert_eq!(loaded.num_soft_devices(), 2);
        Ok(())
    }

    #[test]
    fn test_merge() {
        let mut base = Config::default();
        let mut other = Config::default();
        other.set_num_soft_devices(4);
        base.merge(&other);
        assert_eq!(base.num_soft_devices(), 4);
        assert_eq!(base.rpc_timeout(), Duration::from_millis(1000));
    }

    #[test]
    fn test_global_lock_restores() {
        let before = global::rpc_timeout();
        {
            let config = global::lock();
            config.update(|c| c.set_rpc_timeout(Duration::from_millis(5)));
            assert_eq!(global::rpc_timeout(), Duration::from_millis(5));
        }
        assert_eq!(global::rpc_timeout(), before);
    }
}
