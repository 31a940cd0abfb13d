use tracing::Span;
use uuid::Uuid;

/// Generate an OpenTelemetry-compatible trace ID (32 hex characters).
pub fn generate_trace_id() -> String {
    // A UUID without hyphens is exactly 128 bits of hex.
    Uuid::new_v4().as_simple().to_string()
}

/// Generate a span ID (16 hex characters).
pub fn generate_span_id() -> String {
    Uuid::new_v4().as_simple().to_string()[..16].to_string()
}

/// Span for one unit of background work (a subsystem tick, a delegation
/// run). Returns the span and its trace id for log correlation.
pub fn create_operation_span(subsystem: &str, operation: &str) -> (Span, String) {
    let trace_id = generate_trace_id();
    let span = tracing::info_span!(
        "operation",
        trace_id = %trace_id,
        span_id = %generate_span_id(),
        subsystem = %subsystem,
        operation = %operation,
    );
    (span, trace_id)
}

/// Child span under an existing trace id (e.g. a delegated sub-conversation).
pub fn create_child_span(trace_id: &str, operation: &str) -> Span {
    tracing::info_span!(
        "operation",
        trace_id = %trace_id,
        span_id = %generate_span_id(),
        operation = %operation,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
