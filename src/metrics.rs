//! Process-wide counters, exposed in-process only.
//!
//! There is no Prometheus exporter here — the HTTP surface that would
//! serve `/metrics` is an external collaborator, not part of this
//! crate's job. What's kept is the underlying atomic state a real
//! exporter would read from.

use std::sync::atomic::AtomicU64;

#[derive(Default)]
pub struct Metrics {
    pub connections_total: AtomicU64,
    pub active_connections: AtomicU64,
    pub auth_attempts_total: AtomicU64,
    pub auth_failures_total: AtomicU64,
    pub emails_submitted: AtomicU64,
    pub emails_rejected: AtomicU64,
}
