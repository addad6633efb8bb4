//! Advice sources consulted by the engine: precomputed packets and live
//! retrieval.
//!
//! Live retrieval runs on a helper thread and the engine waits on a bounded
//! channel with `recv_timeout`. When the deadline passes the engine stops
//! waiting; the retriever call itself is not interrupted and its late result
//! is dropped with the channel. `RetrievalPermits` caps how many of those
//! helper threads may be alive at once, so a hung retriever cannot pile them
//! up; past the cap the call returns `Saturated` without spawning.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::advice::AdviceItem;

/// Inputs handed to a live retriever.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalContext {
    pub trace_id: String,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    pub user_context: Option<String>,
}

/// Result of a live retrieval.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrievalResult {
    Ok(Vec<AdviceItem>),
    Timeout,
    SourceError(String),
    Empty,
    /// Every retrieval permit is held by a thread still running.
    Saturated,
}

impl RetrievalResult {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Ok(_) => "ok",
            Self::Timeout => "timeout",
            Self::SourceError(_) => "source_error",
            Self::Empty => "empty",
            Self::Saturated => "saturated",
        }
    }
}

/// Live advice retrieval (semantic index, remote service, ...).
///
/// `deadline` is advisory: implementations should try to return by then, and
/// the engine will not wait past it.
pub trait AdviceRetriever: Send + Sync {
    fn retrieve(&self, ctx: &RetrievalContext, deadline: Instant) -> RetrievalResult;
}

/// Retriever that never has anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRetriever;

impl AdviceRetriever for NoopRetriever {
    fn retrieve(&self, _ctx: &RetrievalContext, _deadline: Instant) -> RetrievalResult {
        RetrievalResult::Empty
    }
}

/// Longest wait `retrieve_with_deadline` honors; larger requests are cut to it.
pub const MAX_RETRIEVAL_WAIT: Duration = Duration::from_secs(3_600);

/// Bounded pool of retrieval slots, shared by clones.
///
/// A slot is taken before a helper thread is spawned and released when that
/// thread exits, not when the caller stops waiting.
#[derive(Debug, Clone)]
pub struct RetrievalPermits {
    slots: Sender<()>,
    taken: Receiver<()>,
}

impl RetrievalPermits {
    /// A zero cap is clamped to one.
    #[must_use]
    pub fn new(max_inflight: usize) -> Self {
        let (slots, taken) = channel::bounded(max_inflight.max(1));
        Self { slots, taken }
    }

    /// Helper threads currently holding a slot.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }

    fn try_acquire(&self) -> Option<Permit> {
        self.slots.try_send(()).ok().map(|()| Permit {
            taken: self.taken.clone(),
        })
    }
}

struct Permit {
    taken: Receiver<()>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let _ = self.taken.try_recv();
    }
}

/// Run `retriever` on a helper thread and wait at most `wait` for it.
///
/// Returns `Saturated` without spawning when `permits` has no free slot.
pub fn retrieve_with_deadline(
    retriever: &Arc<dyn AdviceRetriever>,
    permits: &RetrievalPermits,
    ctx: &RetrievalContext,
    wait: Duration,
) -> RetrievalResult {
    if wait.is_zero() {
        return RetrievalResult::Timeout;
    }
    let wait = wait.min(MAX_RETRIEVAL_WAIT);
    let Some(permit) = permits.try_acquire() else {
        debug!(
            trace_id = %ctx.trace_id,
            in_flight = permits.in_flight(),
            "Retrieval permits exhausted"
        );
        return RetrievalResult::Saturated;
    };
    let deadline = Instant::now() + wait;
    let (tx, rx) = channel::bounded(1);
    let worker = Arc::clone(retriever);
    let worker_ctx = ctx.clone();

    let spawned = std::thread::Builder::new()
        .name("advice-retrieval".to_string())
        .spawn(move || {
            let _permit = permit;
            let result = worker.retrieve(&worker_ctx, deadline);
            // Receiver is gone when the engine already gave up.
            let _ = tx.send(result);
        });
    if let Err(err) = spawned {
        warn!(error = %err, "Failed to spawn retrieval thread");
        return RetrievalResult::SourceError(format!("spawn failed: {err}"));
    }

    match rx.recv_timeout(wait) {
        Ok(RetrievalResult::Ok(items)) if items.is_empty() => RetrievalResult::Empty,
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            debug!(
                trace_id = %ctx.trace_id,
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                "Live retrieval missed its deadline"
            );
            RetrievalResult::Timeout
        }
        Err(RecvTimeoutError::Disconnected) => {
            RetrievalResult::SourceError("retriever exited without a result".to_string())
        }
    }
}

// =============================================================================
// Packets
// =============================================================================

/// Precomputed advice for a trace and/or tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvicePacket {
    pub packet_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub items: Vec<AdviceItem>,
    pub created_at_ms: u64,
}

/// Lookup of precomputed packets. Must be fast; runs on the critical path.
pub trait PacketSource: Send + Sync {
    fn lookup(&self, trace_id: &str, tool_name: &str) -> Option<AdvicePacket>;
}

/// Packet source with nothing in it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPackets;

impl PacketSource for NoPackets {
    fn lookup(&self, _trace_id: &str, _tool_name: &str) -> Option<AdvicePacket> {
        None
    }
}

/// Capacity-bounded in-memory packet store.
///
/// Lookup prefers a packet for the exact trace (optionally narrowed to the
/// tool), then a tool-only packet. Among matches the newest wins; the oldest
/// packet is evicted when full.
#[derive(Debug)]
pub struct InMemoryPacketStore {
    capacity: usize,
    packets: Mutex<VecDeque<AdvicePacket>>,
}

impl InMemoryPacketStore {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            packets: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn insert(&self, packet: AdvicePacket) {
        let mut packets = lock(&self.packets);
        while packets.len() >= self.capacity {
            packets.pop_front();
        }
        packets.push_back(packet);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.packets).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PacketSource for InMemoryPacketStore {
    fn lookup(&self, trace_id: &str, tool_name: &str) -> Option<AdvicePacket> {
        let packets = lock(&self.packets);
        let tool_ok = |p: &AdvicePacket| p.tool_name.as_deref().is_none_or(|t| t == tool_name);

        packets
            .iter()
            .rev()
            .filter(|p| !p.items.is_empty())
            .find(|p| p.trace_id.as_deref() == Some(trace_id) && tool_ok(p))
            .or_else(|| {
                packets
                    .iter()
                    .rev()
                    .filter(|p| !p.items.is_empty())
                    .find(|p| p.trace_id.is_none() && p.tool_name.as_deref() == Some(tool_name))
            })
            .cloned()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advice::AdviceSource;
    use serde_json::json;

    fn ctx() -> RetrievalContext {
        RetrievalContext {
            trace_id: "t-1".into(),
            tool_name: "Bash".into(),
            tool_input: json!({}),
            user_context: None,
        }
    }

    fn permits() -> RetrievalPermits {
        RetrievalPermits::new(4)
    }

    struct Sleepy(Duration);

    impl AdviceRetriever for Sleepy {
        fn retrieve(&self, _ctx: &RetrievalContext, _deadline: Instant) -> RetrievalResult {
            std::thread::sleep(self.0);
            RetrievalResult::Ok(vec![AdviceItem::new("late", 0.9, AdviceSource::Live, "k")])
        }
    }

    struct Panicky;

    impl AdviceRetriever for Panicky {
        fn retrieve(&self, _ctx: &RetrievalContext, _deadline: Instant) -> RetrievalResult {
            panic!("index offline");
        }
    }

    fn packet(id: &str, trace: Option<&str>, tool: Option<&str>) -> AdvicePacket {
        AdvicePacket {
            packet_id: id.into(),
            trace_id: trace.map(str::to_string),
            tool_name: tool.map(str::to_string),
            items: vec![AdviceItem::new(id, 0.8, AdviceSource::Packet, id)],
            created_at_ms: 0,
        }
    }

    #[test]
    fn fast_retriever_result_is_returned() {
        let r: Arc<dyn AdviceRetriever> = Arc::new(Sleepy(Duration::from_millis(1)));
        let result = retrieve_with_deadline(&r, &permits(), &ctx(), Duration::from_secs(5));
        assert!(matches!(result, RetrievalResult::Ok(items) if items.len() == 1));
    }

    #[test]
    fn slow_retriever_times_out_without_blocking() {
        let r: Arc<dyn AdviceRetriever> = Arc::new(Sleepy(Duration::from_secs(3)));
        let start = Instant::now();
        let result = retrieve_with_deadline(&r, &permits(), &ctx(), Duration::from_millis(30));
        assert_eq!(result, RetrievalResult::Timeout);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn panicking_retriever_is_a_source_error() {
        let r: Arc<dyn AdviceRetriever> = Arc::new(Panicky);
        let result = retrieve_with_deadline(&r, &permits(), &ctx(), Duration::from_secs(5));
        assert!(matches!(result, RetrievalResult::SourceError(_)));
    }

    #[test]
    fn noop_and_zero_wait() {
        let r: Arc<dyn AdviceRetriever> = Arc::new(NoopRetriever);
        assert_eq!(
            retrieve_with_deadline(&r, &permits(), &ctx(), Duration::from_secs(1)),
            RetrievalResult::Empty
        );
        assert_eq!(
            retrieve_with_deadline(&r, &permits(), &ctx(), Duration::ZERO),
            RetrievalResult::Timeout
        );
    }

    #[test]
    fn hung_retrievers_are_capped_by_permits() {
        let r: Arc<dyn AdviceRetriever> = Arc::new(Sleepy(Duration::from_secs(2)));
        let permits = RetrievalPermits::new(1);

        let first = retrieve_with_deadline(&r, &permits, &ctx(), Duration::from_millis(20));
        assert_eq!(first, RetrievalResult::Timeout);
        assert_eq!(permits.in_flight(), 1);

        let start = Instant::now();
        let second = retrieve_with_deadline(&r, &permits, &ctx(), Duration::from_secs(5));
        assert_eq!(second, RetrievalResult::Saturated);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn permit_is_released_when_the_thread_exits() {
        let permits = RetrievalPermits::new(1);
        let quick: Arc<dyn AdviceRetriever> = Arc::new(Sleepy(Duration::from_millis(1)));
        let result = retrieve_with_deadline(&quick, &permits, &ctx(), Duration::from_secs(5));
        assert!(matches!(result, RetrievalResult::Ok(_)));

        // The worker drops its permit just after sending; allow it to exit.
        let deadline = Instant::now() + Duration::from_secs(2);
        while permits.in_flight() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(permits.in_flight(), 0);

        let panicky: Arc<dyn AdviceRetriever> = Arc::new(Panicky);
        let result = retrieve_with_deadline(&panicky, &permits, &ctx(), Duration::from_secs(5));
        assert!(matches!(result, RetrievalResult::SourceError(_)));
        let deadline = Instant::now() + Duration::from_secs(2);
        while permits.in_flight() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(permits.in_flight(), 0);
    }

    #[test]
    fn packet_lookup_prefers_trace_then_tool_and_newest() {
        let store = InMemoryPacketStore::new(8);
        store.insert(packet("tool-old", None, Some("Bash")));
        store.insert(packet("tool-new", None, Some("Bash")));
        assert_eq!(store.lookup("t-9", "Bash").unwrap().packet_id, "tool-new");

        store.insert(packet("trace", Some("t-9"), None));
        assert_eq!(store.lookup("t-9", "Bash").unwrap().packet_id, "trace");
        assert_eq!(store.lookup("t-1", "Bash").unwrap().packet_id, "tool-new");
        assert!(store.lookup("t-1", "Edit").is_none());

        // Trace packet narrowed to another tool does not match.
        store.insert(packet("trace-edit", Some("t-5"), Some("Edit")));
        assert_eq!(store.lookup("t-5", "Bash").unwrap().packet_id, "tool-new");
    }

    #[test]
    fn packet_store_is_capacity_bounded() {
        let store = InMemoryPacketStore::new(2);
        store.insert(packet("a", Some("a"), None));
        store.insert(packet("b", Some("b"), None));
        store.insert(packet("c", Some("c"), None));
        assert_eq!(store.len(), 2);
        assert!(store.lookup("a", "Bash").is_none());
        assert!(store.lookup("c", "Bash").is_some());
    }
}
