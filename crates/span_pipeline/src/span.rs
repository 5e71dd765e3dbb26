use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// 128-bit trace identifier. Zero is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TraceId(u128);

/// 64-bit span identifier. Zero is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpanId(u64);

impl TraceId {
    pub const INVALID: TraceId = TraceId(0);

    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    /// Generates a random, non-zero trace id.
    pub fn random() -> Self {
        loop {
            let id = rand::random::<u128>();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub const fn to_u128(self) -> u128 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl SpanId {
    pub const INVALID: SpanId = SpanId(0);

    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Generates a random, non-zero span id.
    pub fn random() -> Self {
        loop {
            let id = rand::random::<u64>();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub const fn to_u64(self) -> u64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Scalar attribute value attached to a span or resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(s) => write!(f, "{s:?}"),
            AttributeValue::Int(i) => write!(f, "{i}"),
            AttributeValue::Float(v) => write!(f, "{v}"),
            AttributeValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// Span attributes, kept in key order.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Span execution status
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpanStatus {
    /// Span status unknown
    #[default]
    Unset,
    /// Span completed successfully
    Ok,
    /// Span completed with error
    Error { description: String },
}

impl SpanStatus {
    pub fn error(description: impl Into<String>) -> Self {
        SpanStatus::Error {
            description: description.into(),
        }
    }
}

/// Span kind according to OpenTelemetry specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpanKind {
    /// Internal operation span
    #[default]
    Internal,
    /// Server-side RPC span
    Server,
    /// Client-side RPC span
    Client,
    /// Producer span (messaging)
    Producer,
    /// Consumer span (messaging)
    Consumer,
}

/// Current wall-clock time as Unix nanoseconds.
pub fn now_unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

/// A finished span. Immutable once built; only readable through accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    trace_id: TraceId,
    span_id: SpanId,
    parent_id: Option<SpanId>,
    name: String,
    kind: SpanKind,
    start_time: u64,
    end_time: u64,
    attributes: Box<Attributes>,
    status: SpanStatus,
}

impl Span {
    /// Starts building a span with fresh random ids and the current start time.
    pub fn builder(name: impl Into<String>) -> SpanBuilder {
        SpanBuilder::new(name)
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    pub fn parent_id(&self) -> Option<SpanId> {
        self.parent_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SpanKind {
        self.kind
    }

    /// Start time (Unix nanoseconds)
    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    /// End time (Unix nanoseconds)
    pub fn end_time(&self) -> u64 {
        self.end_time
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    pub fn status(&self) -> &SpanStatus {
        &self.status
    }

    /// Duration of the span in nanoseconds
    pub fn duration_nanos(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time)
    }
}

/// In-progress span owned by the instrumented call site.
///
/// `end` consumes the builder, so nothing can change a span after it is handed
/// to the pipeline.
#[derive(Debug, Clone)]
pub struct SpanBuilder {
    trace_id: TraceId,
    span_id: SpanId,
    parent_id: Option<SpanId>,
    name: String,
    kind: SpanKind,
    start_time: u64,
    attributes: Attributes,
    status: SpanStatus,
}

impl SpanBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            trace_id: TraceId::random(),
            span_id: SpanId::random(),
            parent_id: None,
            name: name.into(),
            kind: SpanKind::Internal,
            start_time: now_unix_nanos(),
            attributes: Attributes::new(),
            status: SpanStatus::Unset,
        }
    }

    pub fn with_trace_id(mut self, trace_id: TraceId) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn with_span_id(mut self, span_id: SpanId) -> Self {
        self.span_id = span_id;
        self
    }

    /// Makes this span a child of `parent`, inheriting its trace id.
    pub fn with_parent(mut self, trace_id: TraceId, parent_id: SpanId) -> Self {
        self.trace_id = trace_id;
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_start_time(mut self, start_time: u64) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.set_attribute(key, value);
        self
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn set_status(&mut self, status: SpanStatus) {
        self.status = status;
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// Ends the span now.
    pub fn end(self) -> Span {
        self.end_at(now_unix_nanos())
    }

    /// Ends the span at the given Unix-nanosecond timestamp.
    /// An end before the start is clamped to the start.
    pub fn end_at(self, end_time: u64) -> Span {
        Span {
            trace_id: self.trace_id,
            span_id: self.span_id,
            parent_id: self.parent_id,
            name: self.name,
            kind: self.kind,
            start_time: self.start_time,
            end_time: end_time.max(self.start_time),
            attributes: Box::new(self.attributes),
            status: self.status,
        }
    }
}

/// Batch of spans for export, in recording order.
#[derive(Debug, Clone)]
pub struct SpanBatch {
    /// All spans in this batch
    pub spans: Vec<Span>,
    /// Batch creation timestamp
    pub timestamp: SystemTime,
}

impl SpanBatch {
    /// Creates a new empty span batch
    pub fn new() -> Self {
        Self::with_spans(Vec::new())
    }

    /// Creates a batch with the given spans
    pub fn with_spans(spans: Vec<Span>) -> Self {
        Self {
            spans,
            timestamp: SystemTime::now(),
        }
    }

    /// Adds a span to the batch
    pub fn add(&mut self, span: Span) {
        self.spans.push(span);
    }

    /// Returns the number of spans in the batch
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Returns true if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Span> {
        self.spans.iter()
    }
}

impl Default for SpanBatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_render_as_padded_hex() {
        assert_eq!(
            TraceId::from_u128(0xabc).to_string(),
            "00000000000000000000000000000abc"
        );
        assert_eq!(SpanId::from_u64(0x1f).to_string(), "000000000000001f");
    }

    #[test]
    fn test_random_ids_are_valid() {
        for _ in 0..100 {
            assert!(TraceId::random().is_valid());
            assert!(SpanId::random().is_valid());
        }
        assert!(!TraceId::INVALID.is_valid());
    }

    #[test]
    fn test_builder_produces_immutable_span() {
        let trace = TraceId::from_u128(7);
        let mut builder = Span::builder("GET /")
            .with_parent(trace, SpanId::from_u64(1))
            .with_span_id(SpanId::from_u64(2))
            .with_kind(SpanKind::Server)
            .with_start_time(100)
            .with_attribute("http.status_code", 200_i64);
        builder.set_attribute("http.route", "/");
        builder.set_status(SpanStatus::Ok);

        let span = builder.end_at(350);
        assert_eq!(span.trace_id(), trace);
        assert_eq!(span.parent_id(), Some(SpanId::from_u64(1)));
        assert_eq!(span.kind(), SpanKind::Server);
        assert_eq!(span.duration_nanos(), 250);
        assert_eq!(span.attribute("http.status_code"), Some(&AttributeValue::Int(200)));
        assert_eq!(span.attribute("http.route"), Some(&AttributeValue::from("/")));
        assert_eq!(span.status(), &SpanStatus::Ok);
    }

    #[test]
    fn test_end_before_start_is_clamped() {
        let span = Span::builder("op").with_start_time(500).end_at(10);
        assert_eq!(span.end_time(), 500);
        assert_eq!(span.duration_nanos(), 0);
    }

    #[test]
    fn test_attribute_overwrite_keeps_last() {
        let span = Span::builder("op")
            .with_attribute("k", 1_i64)
            .with_attribute("k", "two")
            .end();
        assert_eq!(span.attributes().len(), 1);
        assert_eq!(span.attribute("k"), Some(&AttributeValue::from("two")));
    }
}
