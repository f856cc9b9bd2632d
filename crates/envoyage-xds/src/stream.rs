//! Stream context and identification.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Unique identifier for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(u64);

impl StreamId {
    /// Generate a new unique stream ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Context for an active xDS stream: identity, node, timing and counters.
#[derive(Debug)]
pub struct StreamContext {
    id: StreamId,
    node_id: Option<String>,
    created_at: Instant,
    requests: AtomicU64,
    responses: AtomicU64,
}

impl StreamContext {
    /// Create a new stream context.
    pub fn new() -> Self {
        Self {
            id: StreamId::new(),
            node_id: None,
            created_at: Instant::now(),
            requests: AtomicU64::new(0),
            responses: AtomicU64::new(0),
        }
    }

    /// Get the stream ID.
    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Get the node ID if the first request has identified it.
    #[inline]
    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    /// Record the node this stream belongs to.
    pub fn set_node(&mut self, node_id: String) {
        self.node_id = Some(node_id);
    }

    /// Get stream duration.
    #[inline]
    pub fn duration(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Record a request.
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a response.
    pub fn record_response(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    /// Total requests received.
    #[inline]
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Total responses sent.
    #[inline]
    pub fn response_count(&self) -> u64 {
        self.responses.load(Ordering::Relaxed)
    }
}

impl Default for StreamContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_unique() {
        assert_ne!(StreamId::new(), StreamId::new());
    }

    #[test]
    fn stream_context_counting() {
        let ctx = StreamContext::new();
        ctx.record_request();
        ctx.record_request();
        ctx.record_response();

        assert_eq!(ctx.request_count(), 2);
        assert_eq!(ctx.response_count(), 1);
    }

    #[test]
    fn stream_context_node() {
        let mut ctx = StreamContext::new();
        assert!(ctx.node_id().is_none());
        ctx.set_node("envoyage-envoy-home".to_string());
        assert_eq!(ctx.node_id(), Some("envoyage-envoy-home"));
    }
}
