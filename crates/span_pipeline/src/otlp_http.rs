//! OTLP/JSON over HTTP.
//!
//! Each batch becomes one `ExportTraceServiceRequest` POSTed to the collector's
//! traces endpoint. Ids are lowercase hex, timestamps are decimal strings of
//! Unix nanoseconds, and 64-bit integers are strings, as the OTLP JSON mapping
//! requires.

use crate::exporter::{ExportError, ExporterShutdown, SpanExporter};
use crate::resource::Resource;
use crate::span::{AttributeValue, Span, SpanBatch, SpanKind, SpanStatus};
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use url::Url;

/// Path appended to an endpoint that names only a host.
pub const OTLP_TRACES_PATH: &str = "/v1/traces";

const SCOPE_NAME: &str = env!("CARGO_PKG_NAME");
const SCOPE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exporter sending OTLP/JSON to an HTTP collector.
#[derive(Debug)]
pub struct OtlpHttpExporter {
    client: reqwest::Client,
    endpoint: Url,
    shut_down: AtomicBool,
}

impl OtlpHttpExporter {
    /// Creates an exporter for `endpoint`. Requests give up after `timeout`.
    pub fn new(endpoint: &Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(endpoint, client))
    }

    /// Creates an exporter using a caller-supplied client.
    pub fn with_client(endpoint: &Url, client: reqwest::Client) -> Self {
        Self {
            client,
            endpoint: traces_endpoint(endpoint),
            shut_down: AtomicBool::new(false),
        }
    }

    /// The URL batches are POSTed to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// Resolves the traces URL: a bare host gets `/v1/traces`, anything with a
/// path is used as given.
pub fn traces_endpoint(endpoint: &Url) -> Url {
    let mut url = endpoint.clone();
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(OTLP_TRACES_PATH);
    }
    url
}

fn map_reqwest_error(error: reqwest::Error) -> ExportError {
    if error.is_timeout() {
        ExportError::Timeout
    } else {
        ExportError::Transport(error.to_string())
    }
}

impl SpanExporter for OtlpHttpExporter {
    async fn export(&self, batch: &SpanBatch, resource: &Resource) -> Result<(), ExportError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ExportError::ShutDown);
        }

        let body = encode_batch(batch, resource)?;
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if status.is_success() {
            tracing::trace!(spans = batch.len(), status = status.as_u16(), "batch accepted by collector");
            Ok(())
        } else {
            Err(ExportError::Http {
                status: status.as_u16(),
            })
        }
    }

    async fn shutdown(&self, _timeout: Duration) -> ExporterShutdown {
        self.shut_down.store(true, Ordering::Release);
        ExporterShutdown::Flushed
    }

    fn name(&self) -> &str {
        "otlp_http"
    }
}

/// Serializes `batch` as an OTLP/JSON `ExportTraceServiceRequest`.
pub fn encode_batch(batch: &SpanBatch, resource: &Resource) -> Result<Vec<u8>, ExportError> {
    let request = ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            resource: JsonResource {
                attributes: resource.iter().map(|(k, v)| KeyValue::new(k, v)).collect(),
            },
            scope_spans: vec![ScopeSpans {
                scope: InstrumentationScope {
                    name: SCOPE_NAME,
                    version: SCOPE_VERSION,
                },
                spans: batch.iter().map(JsonSpan::from_span).collect(),
            }],
        }],
    };
    serde_json::to_vec(&request).map_err(|e| ExportError::Serialization(e.to_string()))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportTraceServiceRequest<'a> {
    resource_spans: Vec<ResourceSpans<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceSpans<'a> {
    resource: JsonResource<'a>,
    scope_spans: Vec<ScopeSpans<'a>>,
}

#[derive(Serialize)]
struct JsonResource<'a> {
    attributes: Vec<KeyValue<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScopeSpans<'a> {
    scope: InstrumentationScope,
    spans: Vec<JsonSpan<'a>>,
}

#[derive(Serialize)]
struct InstrumentationScope {
    name: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonSpan<'a> {
    trace_id: String,
    span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_span_id: Option<String>,
    name: &'a str,
    kind: u8,
    start_time_unix_nano: String,
    end_time_unix_nano: String,
    attributes: Vec<KeyValue<'a>>,
    status: JsonStatus<'a>,
}

impl<'a> JsonSpan<'a> {
    fn from_span(span: &'a Span) -> Self {
        Self {
            trace_id: span.trace_id().to_string(),
            span_id: span.span_id().to_string(),
            parent_span_id: span.parent_id().map(|p| p.to_string()),
            name: span.name(),
            kind: kind_code(span.kind()),
            start_time_unix_nano: span.start_time().to_string(),
            end_time_unix_nano: span.end_time().to_string(),
            attributes: span
                .attributes()
                .iter()
                .map(|(k, v)| KeyValue::new(k, v))
                .collect(),
            status: JsonStatus::from_status(span.status()),
        }
    }
}

fn kind_code(kind: SpanKind) -> u8 {
    match kind {
        SpanKind::Internal => 1,
        SpanKind::Server => 2,
        SpanKind::Client => 3,
        SpanKind::Producer => 4,
        SpanKind::Consumer => 5,
    }
}

#[derive(Serialize)]
struct JsonStatus<'a> {
    code: u8,
    #[serde(skip_serializing_if = "str::is_empty")]
    message: &'a str,
}

impl<'a> JsonStatus<'a> {
    fn from_status(status: &'a SpanStatus) -> Self {
        match status {
            SpanStatus::Unset => Self { code: 0, message: "" },
            SpanStatus::Ok => Self { code: 1, message: "" },
            SpanStatus::Error { description } => Self {
                code: 2,
                message: description,
            },
        }
    }
}

#[derive(Serialize)]
struct KeyValue<'a> {
    key: &'a str,
    value: AnyValue<'a>,
}

impl<'a> KeyValue<'a> {
    fn new(key: &'a str, value: &'a AttributeValue) -> Self {
        let value = match value {
            AttributeValue::String(s) => AnyValue::StringValue(s),
            AttributeValue::Int(i) => AnyValue::IntValue(i.to_string()),
            AttributeValue::Float(f) => AnyValue::DoubleValue(*f),
            AttributeValue::Bool(b) => AnyValue::BoolValue(*b),
        };
        Self { key, value }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum AnyValue<'a> {
    StringValue(&'a str),
    IntValue(String),
    DoubleValue(f64),
    BoolValue(bool),
}
