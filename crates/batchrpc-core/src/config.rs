//! Per-operation batching configuration.
//!
//! Rules are keyed by operation patterns of the form
//! `"<inbound resource>.<inbound method>/<outbound resource>.<outbound method>"`
//! or the short form `"<outbound resource>.<outbound method>"`. Any part may
//! be `*`. When several patterns match a call, the most specific one wins,
//! compared in this order:
//!
//! 1. outbound resource
//! 2. inbound resource
//! 3. outbound method
//! 4. inbound method
//!
//! A call with no matching `batching_enabled` rule is never batched.
//!
//! ```
//! use batchrpc_core::config::{BatchingConfig, BatchingConfigProvider, OperationTarget};
//!
//! let config = BatchingConfig::new()
//!     .add_batching_enabled("*.*/*.*", true)?
//!     .add_max_batch_size("*.*/greetings.get", 3)?;
//! let target = OperationTarget::new("greetings", "get");
//! assert!(config.is_batching_enabled(&target));
//! assert_eq!(config.max_batch_size(&target), 3);
//! # Ok::<(), batchrpc_core::ConfigError>(())
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::request::BatchKey;

/// Max batch size used when no rule matches.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1024;

/// The request being served when a scope was opened, if any.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InboundOperation {
    pub resource: String,
    pub method: String,
}

impl InboundOperation {
    pub fn new(resource: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            method: method.into(),
        }
    }
}

/// The operation a policy is resolved for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationTarget {
    pub inbound: Option<InboundOperation>,
    pub resource: String,
    pub method: String,
}

impl OperationTarget {
    pub fn new(resource: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            inbound: None,
            resource: resource.into(),
            method: method.into(),
        }
    }

    /// Target for calls under `key`, issued while serving `inbound`.
    pub fn for_key(key: &BatchKey, inbound: Option<&InboundOperation>) -> Self {
        Self {
            inbound: inbound.cloned(),
            resource: key.resource().to_string(),
            method: key.method().to_string(),
        }
    }

    pub fn inbound(mut self, inbound: InboundOperation) -> Self {
        self.inbound = Some(inbound);
        self
    }
}

/// Resolved batching behaviour for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchingPolicy {
    pub enabled: bool,
    pub max_batch_size: usize,
    /// Default timeout applied to each completion handle.
    pub timeout: Option<Duration>,
}

impl BatchingPolicy {
    /// Policy that issues every call on its own.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_batch_size: 1,
            timeout: None,
        }
    }
}

impl Default for BatchingPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Source of batching policy for operations.
pub trait BatchingConfigProvider: Send + Sync + 'static {
    fn is_batching_enabled(&self, target: &OperationTarget) -> bool;

    fn max_batch_size(&self, target: &OperationTarget) -> usize;

    /// Default per-call timeout. `None` waits indefinitely.
    fn timeout(&self, _target: &OperationTarget) -> Option<Duration> {
        None
    }

    /// Resolve every setting for `target` at once.
    fn policy(&self, target: &OperationTarget) -> BatchingPolicy {
        BatchingPolicy {
            enabled: self.is_batching_enabled(target),
            max_batch_size: self.max_batch_size(target).max(1),
            timeout: self.timeout(target),
        }
    }
}

/// Parsed operation pattern. `None` parts are wildcards.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OperationPattern {
    in_resource: Option<String>,
    in_method: Option<String>,
    out_resource: Option<String>,
    out_method: Option<String>,
}

impl OperationPattern {
    fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let (inbound, outbound) = match pattern.split_once('/') {
            Some((_, rest)) if rest.contains('/') => {
                return Err(invalid("expected at most one '/'"));
            }
            Some((inbound, outbound)) => (inbound, outbound),
            None => ("*.*", pattern),
        };

        let (in_resource, in_method) = parse_part(inbound).ok_or_else(|| {
            invalid("inbound part must look like <resource>.<method>")
        })?;
        let (out_resource, out_method) = parse_part(outbound).ok_or_else(|| {
            invalid("outbound part must look like <resource>.<method>")
        })?;

        Ok(Self {
            in_resource,
            in_method,
            out_resource,
            out_method,
        })
    }

    fn matches(&self, target: &OperationTarget) -> bool {
        let inbound_ok = match (&self.in_resource, &self.in_method, &target.inbound) {
            (None, None, _) => true,
            (_, _, None) => false,
            (res, method, Some(inbound)) => {
                part_matches(res, &inbound.resource) && part_matches(method, &inbound.method)
            }
        };
        inbound_ok
            && part_matches(&self.out_resource, &target.resource)
            && part_matches(&self.out_method, &target.method)
    }

    fn specificity(&self) -> (bool, bool, bool, bool) {
        (
            self.out_resource.is_some(),
            self.in_resource.is_some(),
            self.out_method.is_some(),
            self.in_method.is_some(),
        )
    }
}

/// Split `resource.method` at the last dot; `*` becomes a wildcard.
fn parse_part(part: &str) -> Option<(Option<String>, Option<String>)> {
    let (resource, method) = part.rsplit_once('.')?;
    if resource.is_empty() || method.is_empty() {
        return None;
    }
    let wildcard = |s: &str| (s != "*").then(|| s.to_string());
    Some((wildcard(resource), wildcard(method)))
}

fn part_matches(pattern: &Option<String>, value: &str) -> bool {
    pattern.as_deref().map_or(true, |p| p == value)
}

#[derive(Debug, Clone)]
struct Rules<T> {
    entries: Vec<(OperationPattern, T)>,
}

impl<T> Default for Rules<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T> Rules<T> {
    fn insert(&mut self, pattern: OperationPattern, value: T) {
        match self.entries.iter_mut().find(|(p, _)| *p == pattern) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((pattern, value)),
        }
    }

    fn lookup(&self, target: &OperationTarget) -> Option<&T> {
        self.entries
            .iter()
            .filter(|(p, _)| p.matches(target))
            .max_by_key(|(p, _)| p.specificity())
            .map(|(_, v)| v)
    }
}

/// Pattern-based batching configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(try_from = "RawBatchingConfig")]
pub struct BatchingConfig {
    batching_enabled: Rules<bool>,
    max_batch_size: Rules<usize>,
    timeout_ms: Rules<u64>,
}

impl BatchingConfig {
    /// Empty configuration: batching disabled everywhere.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_batching_enabled(mut self, pattern: &str, enabled: bool) -> Result<Self, ConfigError> {
        self.batching_enabled
            .insert(OperationPattern::parse(pattern)?, enabled);
        Ok(self)
    }

    pub fn add_max_batch_size(mut self, pattern: &str, size: usize) -> Result<Self, ConfigError> {
        if size == 0 {
            return Err(ConfigError::InvalidMaxBatchSize {
                pattern: pattern.to_string(),
            });
        }
        self.max_batch_size
            .insert(OperationPattern::parse(pattern)?, size);
        Ok(self)
    }

    pub fn add_timeout_ms(mut self, pattern: &str, timeout_ms: u64) -> Result<Self, ConfigError> {
        self.timeout_ms
            .insert(OperationPattern::parse(pattern)?, timeout_ms);
        Ok(self)
    }

    /// Parse a JSON document such as
    /// `{"batching_enabled": {"*.*/*.*": true}, "max_batch_size": {"*.*/*.*": 3}}`.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&json)?;
        tracing::debug!(
            path = %path.display(),
            batching_enabled = config.batching_enabled.entries.len(),
            max_batch_size = config.max_batch_size.entries.len(),
            timeout_ms = config.timeout_ms.entries.len(),
            "loaded batching config"
        );
        Ok(config)
    }
}

impl BatchingConfigProvider for BatchingConfig {
    fn is_batching_enabled(&self, target: &OperationTarget) -> bool {
        self.batching_enabled.lookup(target).copied().unwrap_or(false)
    }

    fn max_batch_size(&self, target: &OperationTarget) -> usize {
        self.max_batch_size
            .lookup(target)
            .copied()
            .unwrap_or(DEFAULT_MAX_BATCH_SIZE)
    }

    fn timeout(&self, target: &OperationTarget) -> Option<Duration> {
        self.timeout_ms
            .lookup(target)
            .map(|ms| Duration::from_millis(*ms))
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawBatchingConfig {
    #[serde(default)]
    batching_enabled: BTreeMap<String, bool>,
    #[serde(default)]
    max_batch_size: BTreeMap<String, usize>,
    #[serde(default)]
    timeout_ms: BTreeMap<String, u64>,
}

impl TryFrom<RawBatchingConfig> for BatchingConfig {
    type Error = ConfigError;

    fn try_from(raw: RawBatchingConfig) -> Result<Self, Self::Error> {
        let mut config = BatchingConfig::new();
        for (pattern, enabled) in raw.batching_enabled {
            config = config.add_batching_enabled(&pattern, enabled)?;
        }
        for (pattern, size) in raw.max_batch_size {
            config = config.add_max_batch_size(&pattern, size)?;
        }
        for (pattern, ms) in raw.timeout_ms {
            config = config.add_timeout_ms(&pattern, ms)?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greetings_get() -> OperationTarget {
        OperationTarget::new("greetings", "get")
    }

    #[test]
    fn empty_config_disables_batching() {
        let config = BatchingConfig::new();
        assert!(!config.is_batching_enabled(&greetings_get()));
        assert_eq!(config.max_batch_size(&greetings_get()), DEFAULT_MAX_BATCH_SIZE);
        assert!(config.timeout(&greetings_get()).is_none());
    }

    #[test]
    fn wildcard_enables_everything() {
        let config = BatchingConfig::new()
            .add_batching_enabled("*.*/*.*", true)
            .unwrap()
            .add_max_batch_size("*.*/*.*", 3)
            .unwrap();
        let policy = config.policy(&greetings_get());
        assert!(policy.enabled);
        assert_eq!(policy.max_batch_size, 3);
    }

    #[test]
    fn outbound_resource_beats_outbound_method() {
        let config = BatchingConfig::new()
            .add_max_batch_size("*.*/*.get", 5)
            .unwrap()
            .add_max_batch_size("*.*/greetings.*", 7)
            .unwrap();
        assert_eq!(config.max_batch_size(&greetings_get()), 7);
        assert_eq!(config.max_batch_size(&OperationTarget::new("albums", "get")), 5);
    }

    #[test]
    fn inbound_resource_beats_outbound_method() {
        let config = BatchingConfig::new()
            .add_batching_enabled("*.*/greetings.get", true)
            .unwrap()
            .add_batching_enabled("profiles.*/greetings.*", false)
            .unwrap();
        let served = greetings_get().inbound(InboundOperation::new("profiles", "get"));
        assert!(!config.is_batching_enabled(&served));
        // Without an inbound operation only the first rule can match.
        assert!(config.is_batching_enabled(&greetings_get()));
    }

    #[test]
    fn short_form_pattern() {
        let config = BatchingConfig::new()
            .add_batching_enabled("greetings.get", true)
            .unwrap();
        assert!(config.is_batching_enabled(&greetings_get()));
        assert!(!config.is_batching_enabled(&OperationTarget::new("greetings", "find")));
    }

    #[test]
    fn later_rule_for_same_pattern_replaces_earlier() {
        let config = BatchingConfig::new()
            .add_batching_enabled("*.*/*.*", true)
            .unwrap()
            .add_batching_enabled("*.*", false)
            .unwrap();
        assert!(!config.is_batching_enabled(&greetings_get()));
    }

    #[test]
    fn rejects_bad_patterns() {
        for bad in ["greetings", "a.b/c.d/e.f", ".get", "greetings./x.y"] {
            let err = BatchingConfig::new().add_batching_enabled(bad, true).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidPattern { .. }), "{bad}");
        }
        let err = BatchingConfig::new().add_max_batch_size("*.*", 0).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMaxBatchSize { .. }));
    }

    #[test]
    fn loads_from_json() {
        let config = BatchingConfig::from_json_str(
            r#"{
                "batching_enabled": {"*.*/*.*": true},
                "max_batch_size": {"*.*/greetings.get": 3},
                "timeout_ms": {"*.*": 250}
            }"#,
        )
        .unwrap();
        let policy = config.policy(&greetings_get());
        assert!(policy.enabled);
        assert_eq!(policy.max_batch_size, 3);
        assert_eq!(policy.timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn json_validation_errors_surface() {
        let err = BatchingConfig::from_json_str(r#"{"max_batch_size": {"*.*": 0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join(format!("batchrpc-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"batching_enabled": {"greetings.*": true}}"#).unwrap();
        let config = BatchingConfig::from_path(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(config.is_batching_enabled(&greetings_get()));
        assert!(!config.is_batching_enabled(&OperationTarget::new("albums", "get")));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = BatchingConfig::from_path("/nonexistent/batchrpc.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
