//! Admission control policy
//!
//! Evaluated once per request, at headers-complete. A rejection substitutes
//! a canned 503 for that one request and consumes no handler slot; it never
//! preempts work that has already been dispatched.

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admit,
    Reject,
}

/// Apply the concurrency ceiling against current server load. The ceiling
/// bounds both open connections and in-flight handler tasks; crossing
/// either rejects.
pub fn check(
    ceiling: Option<usize>,
    connections: usize,
    in_flight: usize,
) -> AdmissionDecision {
    match ceiling {
        Some(limit) if connections >= limit || in_flight >= limit => AdmissionDecision::Reject,
        _ => AdmissionDecision::Admit,
    }
}
