//! Pipeline configuration.
//!
//! [`PipelineConfig`] is plain data; [`PipelineConfigBuilder`] seeds it from
//! defaults or from the standard `OTEL_*` environment variables, and
//! [`PipelineConfig::validate`] rejects misconfiguration before anything is
//! spawned.

use crate::batcher::BatchConfig;
use crate::otlp_http::OTLP_TRACES_PATH;
use crate::resource::{Resource, SERVICE_NAME};
use crate::retry::RetryPolicy;
use crate::span::AttributeValue;
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const OTEL_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";
pub const OTEL_RESOURCE_ATTRIBUTES: &str = "OTEL_RESOURCE_ATTRIBUTES";
pub const OTEL_TRACES_EXPORTER: &str = "OTEL_TRACES_EXPORTER";
pub const OTEL_EXPORTER_OTLP_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
pub const OTEL_EXPORTER_OTLP_TRACES_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_TRACES_ENDPOINT";
pub const OTEL_BSP_MAX_QUEUE_SIZE: &str = "OTEL_BSP_MAX_QUEUE_SIZE";
pub const OTEL_BSP_MAX_EXPORT_BATCH_SIZE: &str = "OTEL_BSP_MAX_EXPORT_BATCH_SIZE";
pub const OTEL_BSP_SCHEDULE_DELAY: &str = "OTEL_BSP_SCHEDULE_DELAY";
pub const OTEL_BSP_EXPORT_TIMEOUT: &str = "OTEL_BSP_EXPORT_TIMEOUT";
pub const OTEL_BSP_MAX_RETRIES: &str = "OTEL_BSP_MAX_RETRIES";

pub const DEFAULT_SERVICE_NAME: &str = "unknown_service";
pub const DEFAULT_ENDPOINT: &str = "http://localhost:4318";
pub const DEFAULT_MAX_BATCH_SIZE: usize = 512;
pub const DEFAULT_MAX_BATCH_DELAY: Duration = Duration::from_millis(5_000);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BUFFER_CAPACITY: usize = 2_048;
pub const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

/// Configuration errors. All are reported before the pipeline starts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("service name must not be empty")]
    EmptyServiceName,
    #[error("invalid exporter endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("unsupported endpoint scheme {0:?} (expected http or https)")]
    UnsupportedScheme(String),
    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },
    #[error("unknown exporter {0:?} (expected otlp, console or none)")]
    UnknownExporter(String),
}

/// Which exporter variant a pipeline drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExporterKind {
    /// OTLP/JSON over HTTP to `exporter_endpoint`.
    #[default]
    Otlp,
    /// Human-readable lines on stdout.
    Console,
    /// Discard everything.
    Null,
}

impl FromStr for ExporterKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "otlp" => Ok(ExporterKind::Otlp),
            "console" | "stdout" => Ok(ExporterKind::Console),
            "none" | "null" => Ok(ExporterKind::Null),
            _ => Err(ConfigError::UnknownExporter(s.to_owned())),
        }
    }
}

impl fmt::Display for ExporterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExporterKind::Otlp => "otlp",
            ExporterKind::Console => "console",
            ExporterKind::Null => "none",
        })
    }
}

/// Validated pipeline settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Value of the `service.name` resource attribute.
    pub service_name: String,
    /// Extra resource attributes merged over the SDK defaults.
    pub resource_attributes: BTreeMap<String, AttributeValue>,
    /// Collector endpoint for the OTLP exporter.
    pub exporter_endpoint: Url,
    /// Exporter variant.
    pub exporter: ExporterKind,
    /// Maximum spans per export batch; also the size flush trigger.
    pub max_batch_size: usize,
    /// Maximum time the first span of a window waits before a flush.
    pub max_batch_delay: Duration,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Span buffer capacity; overflow evicts the oldest span.
    pub buffer_capacity: usize,
    /// Upper bound on one export attempt.
    pub export_timeout: Duration,
    /// Delay before the first retry; doubles per retry.
    pub retry_base_delay: Duration,
    /// Cap on the retry delay.
    pub retry_max_delay: Duration,
}

impl PipelineConfig {
    /// Builder seeded with defaults (environment ignored).
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Checks every field, clamping `max_batch_size` to `buffer_capacity`.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::EmptyServiceName);
        }
        check_endpoint(&self.exporter_endpoint)?;
        if self.max_batch_size == 0 {
            return Err(ConfigError::ZeroValue { field: "max_batch_size" });
        }
        if self.buffer_capacity == 0 {
            return Err(ConfigError::ZeroValue { field: "buffer_capacity" });
        }
        if self.max_batch_delay.is_zero() {
            return Err(ConfigError::ZeroValue { field: "max_batch_delay" });
        }
        if self.export_timeout.is_zero() {
            return Err(ConfigError::ZeroValue { field: "export_timeout" });
        }

        // A batch larger than the buffer could never fill.
        if self.max_batch_size > self.buffer_capacity {
            tracing::warn!(
                max_batch_size = self.max_batch_size,
                buffer_capacity = self.buffer_capacity,
                "max_batch_size exceeds buffer_capacity, clamping"
            );
            self.max_batch_size = self.buffer_capacity;
        }
        if self.retry_max_delay < self.retry_base_delay {
            self.retry_max_delay = self.retry_base_delay;
        }
        Ok(self)
    }

    /// Resource attached to every exported batch.
    ///
    /// `service_name` always wins over a `service.name` entry in
    /// `resource_attributes`; every other entry overrides the SDK defaults.
    pub fn resource(&self) -> Resource {
        self.resource_attributes
            .iter()
            .filter(|(key, _)| key.as_str() != SERVICE_NAME)
            .fold(Resource::new(self.service_name.clone()), |resource, (key, value)| {
                resource.with_attribute(key.clone(), value.clone())
            })
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_batch_size: self.max_batch_size,
            max_batch_delay: self.max_batch_delay,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
            attempt_timeout: self.export_timeout,
        }
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(endpoint.trim()).map_err(|e| ConfigError::InvalidEndpoint {
        endpoint: endpoint.to_owned(),
        reason: e.to_string(),
    })?;
    check_endpoint(&url)?;
    Ok(url)
}

fn check_endpoint(url: &Url) -> Result<(), ConfigError> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::UnsupportedScheme(url.scheme().to_owned()));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ConfigError::InvalidEndpoint {
            endpoint: url.to_string(),
            reason: "missing host".to_owned(),
        });
    }
    Ok(())
}

/// Builder for [`PipelineConfig`].
#[derive(Debug, Clone)]
pub struct PipelineConfigBuilder {
    service_name: String,
    resource_attributes: BTreeMap<String, AttributeValue>,
    exporter_endpoint: String,
    exporter: ExporterKind,
    max_batch_size: usize,
    max_batch_delay: Duration,
    max_retries: u32,
    buffer_capacity: usize,
    export_timeout: Duration,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
}

impl Default for PipelineConfigBuilder {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_owned(),
            resource_attributes: BTreeMap::new(),
            exporter_endpoint: DEFAULT_ENDPOINT.to_owned(),
            exporter: ExporterKind::default(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_batch_delay: DEFAULT_MAX_BATCH_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            export_timeout: DEFAULT_EXPORT_TIMEOUT,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            retry_max_delay: DEFAULT_RETRY_MAX_DELAY,
        }
    }
}

impl PipelineConfigBuilder {
    /// Builder seeded with defaults, then overridden by the supported
    /// environment variables:
    /// * `OTEL_SERVICE_NAME`
    /// * `OTEL_RESOURCE_ATTRIBUTES` (`key=value` pairs separated by commas;
    ///   its `service.name` applies only when `OTEL_SERVICE_NAME` is unset)
    /// * `OTEL_EXPORTER_OTLP_TRACES_ENDPOINT`, used as given
    /// * `OTEL_EXPORTER_OTLP_ENDPOINT`, a base URL that gets `/v1/traces`
    ///   appended, used when the traces endpoint is unset
    /// * `OTEL_TRACES_EXPORTER`
    /// * `OTEL_BSP_MAX_QUEUE_SIZE`
    /// * `OTEL_BSP_MAX_EXPORT_BATCH_SIZE`
    /// * `OTEL_BSP_SCHEDULE_DELAY` (milliseconds)
    /// * `OTEL_BSP_EXPORT_TIMEOUT` (milliseconds)
    /// * `OTEL_BSP_MAX_RETRIES`
    ///
    /// Values that fail to parse are ignored with a warning.
    pub fn from_env() -> Self {
        Self::default().init_from_env_vars()
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Some(raw) = env_string(OTEL_RESOURCE_ATTRIBUTES) {
            for (key, value) in parse_resource_attributes(&raw) {
                if key == SERVICE_NAME {
                    self.service_name = value.clone();
                }
                self.resource_attributes.insert(key, AttributeValue::String(value));
            }
        }
        if let Some(name) = env_string(OTEL_SERVICE_NAME) {
            self.service_name = name;
        }
        if let Some(endpoint) = env_string(OTEL_EXPORTER_OTLP_TRACES_ENDPOINT) {
            self.exporter_endpoint = endpoint;
        } else if let Some(base) = env_string(OTEL_EXPORTER_OTLP_ENDPOINT) {
            self.exporter_endpoint = signal_endpoint(&base);
        }
        if let Some(exporter) = env_parse::<ExporterKind>(OTEL_TRACES_EXPORTER) {
            self.exporter = exporter;
        }
        if let Some(capacity) = env_parse::<usize>(OTEL_BSP_MAX_QUEUE_SIZE) {
            self.buffer_capacity = capacity;
        }
        if let Some(size) = env_parse::<usize>(OTEL_BSP_MAX_EXPORT_BATCH_SIZE) {
            self.max_batch_size = size;
        }
        if let Some(delay) = env_parse::<u64>(OTEL_BSP_SCHEDULE_DELAY) {
            self.max_batch_delay = Duration::from_millis(delay);
        }
        if let Some(timeout) = env_parse::<u64>(OTEL_BSP_EXPORT_TIMEOUT) {
            self.export_timeout = Duration::from_millis(timeout);
        }
        if let Some(retries) = env_parse::<u32>(OTEL_BSP_MAX_RETRIES) {
            self.max_retries = retries;
        }
        self
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    /// Adds one resource attribute; a later value for the same key replaces
    /// an earlier one.
    pub fn with_resource_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.resource_attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_exporter_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.exporter_endpoint = endpoint.into();
        self
    }

    pub fn with_exporter(mut self, exporter: ExporterKind) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_max_batch_delay(mut self, max_batch_delay: Duration) -> Self {
        self.max_batch_delay = max_batch_delay;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_buffer_capacity(mut self, buffer_capacity: usize) -> Self {
        self.buffer_capacity = buffer_capacity;
        self
    }

    pub fn with_export_timeout(mut self, export_timeout: Duration) -> Self {
        self.export_timeout = export_timeout;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_retry_max_delay(mut self, delay: Duration) -> Self {
        self.retry_max_delay = delay;
        self
    }

    /// Parses the endpoint and validates every field.
    pub fn build(self) -> Result<PipelineConfig, ConfigError> {
        let exporter_endpoint = parse_endpoint(&self.exporter_endpoint)?;
        PipelineConfig {
            service_name: self.service_name,
            resource_attributes: self.resource_attributes,
            exporter_endpoint,
            exporter: self.exporter,
            max_batch_size: self.max_batch_size,
            max_batch_delay: self.max_batch_delay,
            max_retries: self.max_retries,
            buffer_capacity: self.buffer_capacity,
            export_timeout: self.export_timeout,
            retry_base_delay: self.retry_base_delay,
            retry_max_delay: self.retry_max_delay,
        }
        .validate()
    }
}

/// Appends the traces path to a base OTLP endpoint, keeping any base path.
fn signal_endpoint(base: &str) -> String {
    format!("{}{}", base.trim().trim_end_matches('/'), OTLP_TRACES_PATH)
}

/// Parses `key=value,key=value`. Malformed entries are skipped with a warning.
fn parse_resource_attributes(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Some((key.trim().to_owned(), value.trim().to_owned()))
            }
            _ => {
                tracing::warn!(
                    variable = OTEL_RESOURCE_ATTRIBUTES,
                    entry,
                    "ignoring malformed resource attribute"
                );
                None
            }
        })
        .collect()
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = env_string(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(variable = key, value = %raw, error = %e, "ignoring unparseable environment variable");
            None
        }
    }
}
