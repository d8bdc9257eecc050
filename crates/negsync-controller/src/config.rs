use crate::error::{ControllerError, Result};
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Interval and hard timeout for one kind of convergence wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl PollConfig {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    fn validate(&self, field: &str) -> Result<()> {
        if self.interval.is_zero() {
            return Err(ControllerError::invalid_config(
                format!("{}.interval must be greater than zero", field),
                "Set the interval to at least one second",
            ));
        }
        if self.timeout < self.interval {
            return Err(ControllerError::invalid_config(
                format!(
                    "{}.timeout ({}s) is shorter than {}.interval ({}s)",
                    field,
                    self.timeout.as_secs(),
                    field,
                    self.interval.as_secs()
                ),
                "Raise the timeout or lower the interval so at least one retry fits in the window",
            ));
        }
        Ok(())
    }
}

/// Readiness reflector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectorConfig {
    /// Time between reflection passes
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    /// Retry policy for backend group lookups within one pass
    pub lookup_retry: RetryConfig,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            lookup_retry: RetryConfig::default(),
        }
    }
}

/// Top-level controller configuration, loadable from YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Prefix for generated backend group names
    pub naming_prefix: String,
    pub provision: PollConfig,
    pub teardown: PollConfig,
    pub garbage_collection: PollConfig,
    pub readiness: ReflectorConfig,
    /// Require every endpoint in a gated backend group to be healthy before
    /// provisioning counts as converged
    pub check_endpoint_health: bool,
    pub expected_forwarding_rules: Option<usize>,
    pub expected_backend_services: Option<usize>,
    /// Total endpoints every backend group must report
    pub expected_endpoints_per_group: Option<usize>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            naming_prefix: negsync_core::namer::DEFAULT_PREFIX.to_string(),
            provision: PollConfig::new(Duration::from_secs(5), Duration::from_secs(120)),
            teardown: PollConfig::new(Duration::from_secs(30), Duration::from_secs(15 * 60)),
            garbage_collection: PollConfig::new(
                Duration::from_secs(5),
                Duration::from_secs(15 * 60),
            ),
            readiness: ReflectorConfig::default(),
            check_endpoint_health: true,
            expected_forwarding_rules: None,
            expected_backend_services: None,
            expected_endpoints_per_group: None,
        }
    }
}

impl ControllerConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(data: &str) -> Result<Self> {
        let config: Self = negsync_core::from_yaml(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            ControllerError::invalid_config(
                format!("failed to read {}: {}", path.display(), e),
                "Check that the config file exists and is readable",
            )
        })?;
        Self::from_yaml(&data)
    }

    pub fn validate(&self) -> Result<()> {
        self.provision.validate("provision")?;
        self.teardown.validate("teardown")?;
        self.garbage_collection.validate("garbage_collection")?;
        if self.readiness.interval.is_zero() {
            return Err(ControllerError::invalid_config(
                "readiness.interval must be greater than zero",
                "Set the interval to at least one second",
            ));
        }
        self.readiness.lookup_retry.validate("readiness.lookup_retry")?;
        if self.naming_prefix.is_empty() {
            return Err(ControllerError::invalid_config(
                "naming_prefix must not be empty",
                "Use a short lowercase prefix such as \"k8s1\"",
            ));
        }
        Ok(())
    }
}

/// Serde helper storing a `Duration` as whole seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Serde helper storing a `Duration` as whole milliseconds
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
