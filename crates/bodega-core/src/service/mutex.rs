//! Ricart-Agrawala distributed mutual exclusion
//!
//! At most one node in the configured peer set holds the critical section for
//! a given resource at any time, ordered globally by `(timestamp, node id)`.
//! The engine never references the coordinator; it is handed an
//! `EnvelopeSender` capability for its replies and requests.

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use bodega_api::message::{Envelope, MessageKind};

use crate::clock::LamportClock;
use crate::service::transport::EnvelopeSender;

/// Resource used when an envelope names none
pub const GLOBAL_RESOURCE: &str = "global";

/// Result of an acquire attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted,
    TimedOut,
    Rejected,
}

#[derive(Debug, Default)]
struct ResourceState {
    requesting: bool,
    in_cs: bool,
    my_req_ts: u64,
    replies_pending: HashSet<String>,
    deferred: HashSet<String>,
}

struct ResourceMutex {
    state: Mutex<ResourceState>,
    granted: Notify,
}

impl ResourceMutex {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ResourceState::default()),
            granted: Notify::new(),
        })
    }
}

/// Engine statistics
#[derive(Clone, Copy, Debug, Default)]
pub struct MutexStats {
    pub requests: u64,
    pub grants: u64,
}

/// Ricart-Agrawala state machines, one per resource
pub struct MutexEngine {
    node_id: String,
    clock: Arc<LamportClock>,
    peers: Arc<RwLock<HashSet<String>>>,
    sender: Arc<dyn EnvelopeSender>,
    resources: DashMap<String, Arc<ResourceMutex>>,
    shutting_down: AtomicBool,
    requests: AtomicU64,
    grants: AtomicU64,
}

impl MutexEngine {
    /// `peers` is the shared known-peer set, self excluded by the coordinator
    pub fn new(
        node_id: &str,
        clock: Arc<LamportClock>,
        peers: Arc<RwLock<HashSet<String>>>,
        sender: Arc<dyn EnvelopeSender>,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            clock,
            peers,
            sender,
            resources: DashMap::new(),
            shutting_down: AtomicBool::new(false),
            requests: AtomicU64::new(0),
            grants: AtomicU64::new(0),
        }
    }

    /// Request the critical section for `resource`
    ///
    /// Returns `Granted` once every peer has replied, `TimedOut` when the
    /// window elapses (state is reset to not-requesting), and `Rejected` when
    /// a request for the same resource is already in flight. Re-entrant: a
    /// holder is granted again immediately.
    pub async fn acquire(&self, resource: &str, timeout: Duration) -> AcquireOutcome {
        if self.shutting_down.load(Ordering::SeqCst) {
            return AcquireOutcome::TimedOut;
        }

        let res = self.resource(resource);
        let peer_snapshot: Vec<String> = {
            let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
            peers.iter().cloned().collect()
        };

        let my_req_ts;
        {
            let mut state = res.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.in_cs {
                debug!(node = %self.node_id, resource, "Already in critical section");
                return AcquireOutcome::Granted;
            }
            if state.requesting {
                debug!(node = %self.node_id, resource, "Already requesting critical section");
                return AcquireOutcome::Rejected;
            }

            state.requesting = true;
            state.my_req_ts = self.clock.tick();
            state.replies_pending = peer_snapshot.iter().cloned().collect();
            state.deferred.clear();
            my_req_ts = state.my_req_ts;
        }
        self.requests.fetch_add(1, Ordering::Relaxed);
        debug!(node = %self.node_id, resource, ts = my_req_ts, "Requesting critical section");

        for peer in &peer_snapshot {
            let request = Envelope::for_resource(
                MessageKind::MutexRequest,
                &self.node_id,
                Some(peer),
                resource,
                my_req_ts,
            );
            if let Err(e) = self.sender.send_to(peer, request) {
                // A silent peer is not running its own critical section;
                // count the missing reply as received to avoid deadlock.
                warn!(
                    node = %self.node_id,
                    peer = %peer,
                    "Request send failed, treating reply as implicit: {}",
                    e
                );
                let mut state = res.state.lock().unwrap_or_else(|e| e.into_inner());
                state.replies_pending.remove(peer);
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut state = res.state.lock().unwrap_or_else(|e| e.into_inner());
                if !state.requesting {
                    // Shutdown raced the wait
                    return AcquireOutcome::TimedOut;
                }
                if state.replies_pending.is_empty() {
                    state.in_cs = true;
                    drop(state);
                    self.grants.fetch_add(1, Ordering::Relaxed);
                    info!(node = %self.node_id, resource, ts = my_req_ts, "Entered critical section");
                    return AcquireOutcome::Granted;
                }
            }

            if tokio::time::timeout_at(deadline, res.granted.notified())
                .await
                .is_err()
            {
                break;
            }
        }

        // Timed out: reset and reply to anyone we deferred so they
        // are not blocked on a request we abandoned.
        let deferred = {
            let mut state = res.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.requesting && state.replies_pending.is_empty() {
                state.in_cs = true;
                drop(state);
                self.grants.fetch_add(1, Ordering::Relaxed);
                return AcquireOutcome::Granted;
            }
            state.requesting = false;
            state.replies_pending.clear();
            std::mem::take(&mut state.deferred)
        };
        for peer in deferred {
            self.send_reply(&peer, resource);
        }

        info!(node = %self.node_id, resource, "Timed out waiting for critical section");
        AcquireOutcome::TimedOut
    }

    /// Acquire with a guard that releases on every exit path
    pub async fn acquire_scoped(
        self: &Arc<Self>,
        resource: &str,
        timeout: Duration,
    ) -> Option<CriticalSection> {
        match self.acquire(resource, timeout).await {
            AcquireOutcome::Granted => Some(CriticalSection {
                engine: self.clone(),
                resource: resource.to_string(),
            }),
            _ => None,
        }
    }

    /// Leave the critical section and flush deferred replies
    ///
    /// A release that follows a timed-out acquire is a no-op.
    pub fn release(&self, resource: &str) {
        let Some(res) = self.resources.get(resource).map(|r| r.clone()) else {
            return;
        };

        let deferred = {
            let mut state = res.state.lock().unwrap_or_else(|e| e.into_inner());
            if !state.in_cs {
                return;
            }
            state.in_cs = false;
            state.requesting = false;
            std::mem::take(&mut state.deferred)
        };

        let count = deferred.len();
        for peer in deferred {
            self.send_reply(&peer, resource);
        }
        info!(node = %self.node_id, resource, deferred = count, "Released critical section");
    }

    /// Route an inbound mutex envelope
    ///
    /// The caller has already merged the envelope timestamp into the clock.
    pub fn handle(&self, envelope: &Envelope) {
        let resource = envelope.resource_id.as_deref().unwrap_or(GLOBAL_RESOURCE);
        match envelope.kind {
            MessageKind::MutexRequest => {
                self.on_request(&envelope.sender_id, resource, envelope.timestamp)
            }
            MessageKind::MutexReply => self.on_reply(&envelope.sender_id, resource),
            _ => {}
        }
    }

    fn on_request(&self, sender_id: &str, resource: &str, their_ts: u64) {
        let res = self.resource(resource);

        let reply_now = {
            let mut state = res.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.in_cs {
                // Never reply while holding the section.
                state.deferred.insert(sender_id.to_string());
                false
            } else if state.requesting {
                let mine = (state.my_req_ts, self.node_id.as_str());
                let theirs = (their_ts, sender_id);
                if theirs < mine {
                    true
                } else {
                    debug!(node = %self.node_id, peer = sender_id, resource, "Deferring reply");
                    state.deferred.insert(sender_id.to_string());
                    false
                }
            } else {
                true
            }
        };

        if reply_now {
            self.send_reply(sender_id, resource);
        }
    }

    fn on_reply(&self, sender_id: &str, resource: &str) {
        let Some(res) = self.resources.get(resource).map(|r| r.clone()) else {
            return;
        };

        let mut state = res.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.requesting {
            // A reply that outlives its acquire is silently discarded.
            return;
        }
        if state.replies_pending.remove(sender_id) {
            debug!(
                node = %self.node_id,
                peer = sender_id,
                resource,
                pending = state.replies_pending.len(),
                "Received mutex reply"
            );
            if state.replies_pending.is_empty() {
                res.granted.notify_one();
            }
        }
    }

    /// Release anything held and wake waiting acquirers with a failure
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let resources: Vec<(String, Arc<ResourceMutex>)> = self
            .resources
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (resource, res) in resources {
            let deferred = {
                let mut state = res.state.lock().unwrap_or_else(|e| e.into_inner());
                state.in_cs = false;
                state.requesting = false;
                state.replies_pending.clear();
                std::mem::take(&mut state.deferred)
            };
            for peer in deferred {
                self.send_reply(&peer, &resource);
            }
            res.granted.notify_one();
        }

        info!(node = %self.node_id, "Mutex engine shut down");
    }

    pub fn is_in_cs(&self, resource: &str) -> bool {
        self.resources.get(resource).is_some_and(|r| {
            r.state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .in_cs
        })
    }

    pub fn is_requesting(&self, resource: &str) -> bool {
        self.resources.get(resource).is_some_and(|r| {
            r.state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .requesting
        })
    }

    pub fn stats(&self) -> MutexStats {
        MutexStats {
            requests: self.requests.load(Ordering::Relaxed),
            grants: self.grants.load(Ordering::Relaxed),
        }
    }

    fn resource(&self, resource: &str) -> Arc<ResourceMutex> {
        self.resources
            .entry(resource.to_string())
            .or_insert_with(ResourceMutex::new)
            .clone()
    }

    fn send_reply(&self, peer: &str, resource: &str) {
        let reply = Envelope::for_resource(
            MessageKind::MutexReply,
            &self.node_id,
            Some(peer),
            resource,
            self.clock.tick(),
        );
        if let Err(e) = self.sender.send_to(peer, reply) {
            warn!(node = %self.node_id, peer, "Failed to send mutex reply: {}", e);
        }
    }
}

impl std::fmt::Debug for MutexEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexEngine")
            .field("node_id", &self.node_id)
            .field("resources", &self.resources.len())
            .finish()
    }
}

/// Scoped critical section; dropping it releases the mutex
pub struct CriticalSection {
    engine: Arc<MutexEngine>,
    resource: String,
}

impl CriticalSection {
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        self.engine.release(&self.resource);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use bodega_common::{BodegaError, Result};

    use super::*;

    /// Records outbound envelopes; peers listed in `dead` fail to send
    struct RecordingSender {
        sent: StdMutex<Vec<Envelope>>,
        dead: HashSet<String>,
    }

    impl RecordingSender {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
                dead: HashSet::new(),
            })
        }

        fn with_dead(peers: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
                dead: peers.iter().map(|p| p.to_string()).collect(),
            })
        }

        fn sent_to(&self, peer: &str, kind: MessageKind) -> usize {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.receiver_id.as_deref() == Some(peer) && e.kind == kind)
                .count()
        }
    }

    impl EnvelopeSender for RecordingSender {
        fn send_to(&self, peer_id: &str, mut envelope: Envelope) -> Result<()> {
            if self.dead.contains(peer_id) {
                return Err(BodegaError::PeerUnavailable(peer_id.to_string()));
            }
            envelope.receiver_id = Some(peer_id.to_string());
            self.sent.lock().unwrap().push(envelope);
            Ok(())
        }
    }

    fn engine_with(
        node_id: &str,
        peers: &[&str],
        sender: Arc<RecordingSender>,
    ) -> Arc<MutexEngine> {
        let peer_set: HashSet<String> = peers.iter().map(|p| p.to_string()).collect();
        Arc::new(MutexEngine::new(
            node_id,
            Arc::new(LamportClock::new()),
            Arc::new(RwLock::new(peer_set)),
            sender,
        ))
    }

    #[tokio::test]
    async fn test_acquire_with_no_peers_is_immediate() {
        let engine = engine_with("branch-a", &[], RecordingSender::new());
        let outcome = engine.acquire("P001", Duration::from_secs(1)).await;
        assert_eq!(outcome, AcquireOutcome::Granted);
        assert!(engine.is_in_cs("P001"));

        engine.release("P001");
        assert!(!engine.is_in_cs("P001"));
    }

    #[tokio::test]
    async fn test_acquire_is_reentrant_and_release_is_tolerant() {
        let engine = engine_with("branch-a", &[], RecordingSender::new());
        assert_eq!(
            engine.acquire("P001", Duration::from_secs(1)).await,
            AcquireOutcome::Granted
        );
        assert_eq!(
            engine.acquire("P001", Duration::from_secs(1)).await,
            AcquireOutcome::Granted
        );

        engine.release("P001");
        // Second release is a no-op.
        engine.release("P001");
        assert!(!engine.is_in_cs("P001"));
    }

    #[tokio::test]
    async fn test_acquire_waits_for_all_replies() {
        let sender = RecordingSender::new();
        let engine = engine_with("branch-a", &["branch-b", "branch-c"], sender.clone());

        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.acquire("P001", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.is_requesting("P001"));
        assert_eq!(sender.sent_to("branch-b", MessageKind::MutexRequest), 1);
        assert_eq!(sender.sent_to("branch-c", MessageKind::MutexRequest), 1);

        engine.on_reply("branch-b", "P001");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!engine.is_in_cs("P001"));

        engine.on_reply("branch-c", "P001");
        assert_eq!(waiter.await.unwrap(), AcquireOutcome::Granted);
        assert!(engine.is_in_cs("P001"));
    }

    #[tokio::test]
    async fn test_dead_peer_counts_as_implicit_reply() {
        let sender = RecordingSender::with_dead(&["branch-c"]);
        let engine = engine_with("branch-a", &["branch-b", "branch-c"], sender.clone());

        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.acquire("P001", Duration::from_secs(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.on_reply("branch-b", "P001");

        assert_eq!(waiter.await.unwrap(), AcquireOutcome::Granted);
    }

    #[tokio::test]
    async fn test_acquire_timeout_resets_state() {
        let engine = engine_with("branch-a", &["branch-b"], RecordingSender::new());
        let outcome = engine.acquire("P001", Duration::from_millis(100)).await;
        assert_eq!(outcome, AcquireOutcome::TimedOut);
        assert!(!engine.is_requesting("P001"));
        assert!(!engine.is_in_cs("P001"));
    }

    #[tokio::test]
    async fn test_second_acquire_is_rejected_while_requesting() {
        let engine = engine_with("branch-a", &["branch-b"], RecordingSender::new());

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.acquire("P001", Duration::from_millis(300)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            engine.acquire("P001", Duration::from_millis(50)).await,
            AcquireOutcome::Rejected
        );
        assert_eq!(first.await.unwrap(), AcquireOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_request_priority_tie_break() {
        let sender = RecordingSender::new();
        let engine = engine_with("branch-b", &["branch-a", "branch-c"], sender.clone());

        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.acquire("P001", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Same timestamp as ours: lexicographically smaller id wins.
        let my_ts = {
            // Request was stamped at ts=1 on a fresh clock.
            1u64
        };
        engine.on_request("branch-a", "P001", my_ts);
        assert_eq!(sender.sent_to("branch-a", MessageKind::MutexReply), 1);

        // Larger id with the same timestamp loses and is deferred.
        engine.on_request("branch-c", "P001", my_ts);
        assert_eq!(sender.sent_to("branch-c", MessageKind::MutexReply), 0);

        engine.on_reply("branch-a", "P001");
        engine.on_reply("branch-c", "P001");
        assert_eq!(waiter.await.unwrap(), AcquireOutcome::Granted);

        // Release flushes the deferred reply to branch-c.
        engine.release("P001");
        assert_eq!(sender.sent_to("branch-c", MessageKind::MutexReply), 1);
    }

    #[tokio::test]
    async fn test_requests_deferred_while_in_cs() {
        let sender = RecordingSender::new();
        let engine = engine_with("branch-a", &[], sender.clone());
        engine.acquire("P001", Duration::from_secs(1)).await;

        engine.on_request("branch-b", "P001", 99);
        assert_eq!(sender.sent_to("branch-b", MessageKind::MutexReply), 0);

        engine.release("P001");
        assert_eq!(sender.sent_to("branch-b", MessageKind::MutexReply), 1);
    }

    #[tokio::test]
    async fn test_idle_node_replies_immediately() {
        let sender = RecordingSender::new();
        let engine = engine_with("branch-a", &["branch-b"], sender.clone());

        engine.on_request("branch-b", "P001", 7);
        assert_eq!(sender.sent_to("branch-b", MessageKind::MutexReply), 1);
    }

    #[tokio::test]
    async fn test_stale_reply_is_discarded() {
        let engine = engine_with("branch-a", &["branch-b"], RecordingSender::new());
        // No acquire in flight; the reply must not create state.
        engine.on_reply("branch-b", "P001");
        assert!(!engine.is_requesting("P001"));
        assert!(!engine.is_in_cs("P001"));
    }

    #[tokio::test]
    async fn test_scoped_guard_releases_on_drop() {
        let engine = engine_with("branch-a", &[], RecordingSender::new());
        {
            let guard = engine
                .acquire_scoped("P001", Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(guard.resource(), "P001");
            assert!(engine.is_in_cs("P001"));
        }
        assert!(!engine.is_in_cs("P001"));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_acquirers() {
        let engine = engine_with("branch-a", &["branch-b"], RecordingSender::new());

        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.acquire("P001", Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        engine.shutdown();
        assert_eq!(waiter.await.unwrap(), AcquireOutcome::TimedOut);
    }
}
