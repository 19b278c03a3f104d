//! Framed TCP peer transport
//!
//! Owns the listening socket and every peer link. Each link runs one reader
//! task and one writer task; outbound envelopes are enqueued and flushed in
//! order, so per-peer FIFO holds end-to-end. Delivery is best-effort: a dead
//! link drops the envelope, marks the peer not-live and reports upward.
//!
//! Frames are a 4-byte little-endian length prefix followed by the JSON
//! encoded envelope. Inbound links are anonymous (keyed by socket address)
//! until a PEER_HELLO rebinds them to the canonical peer id; links are
//! bidirectional thereafter.

use std::{
    net::SocketAddr,
    sync::{
        Arc, RwLock as StdRwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{RwLock, mpsc, watch},
};
use tracing::{debug, info, warn};

use bodega_api::message::{Envelope, KEY_PEER_PORT, MessageKind};
use bodega_common::{BodegaError, Result};

use crate::clock::LamportClock;

pub const FRAME_HEADER_LEN: usize = 4;

/// Prefix marking a link that has not yet identified itself with PEER_HELLO
const ANONYMOUS_PREFIX: char = '@';

/// Transport configuration
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Upper bound for a single frame body
    pub max_frame_bytes: usize,
    /// Timeout for outbound dials
    pub connect_timeout: Duration,
    /// Per-link outbound queue depth
    pub send_queue_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 1024 * 1024,
            connect_timeout: Duration::from_secs(5),
            send_queue_size: 256,
        }
    }
}

/// Callback invoked once per delivered inbound envelope
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope);
}

/// Non-blocking envelope enqueue capability
///
/// Injected into subsystems that originate peer traffic (the mutex engine in
/// particular) so they never hold a reference to the coordinator or the full
/// transport surface.
pub trait EnvelopeSender: Send + Sync {
    fn send_to(&self, peer_id: &str, envelope: Envelope) -> Result<()>;
}

struct PeerLink {
    outbound: mpsc::Sender<Envelope>,
    live: Arc<AtomicBool>,
}

/// TCP transport for one branch node
pub struct PeerTransport {
    node_id: String,
    clock: Arc<LamportClock>,
    config: TransportConfig,
    links: Arc<DashMap<String, PeerLink>>,
    handler: Arc<RwLock<Option<Arc<dyn MessageHandler>>>>,
    running: Arc<RwLock<bool>>,
    local_addr: StdRwLock<Option<SocketAddr>>,
    shutdown_tx: watch::Sender<bool>,
}

impl PeerTransport {
    pub fn new(node_id: &str, clock: Arc<LamportClock>, config: TransportConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            node_id: node_id.to_string(),
            clock,
            config,
            links: Arc::new(DashMap::new()),
            handler: Arc::new(RwLock::new(None)),
            running: Arc::new(RwLock::new(false)),
            local_addr: StdRwLock::new(None),
            shutdown_tx,
        }
    }

    /// Register the inbound message handler
    pub async fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        let mut guard = self.handler.write().await;
        *guard = Some(handler);
    }

    /// Begin accepting peer links on `bind_port` (0 picks an ephemeral port)
    ///
    /// Idempotent: a second call returns the already-bound address. A failed
    /// bind aborts startup of this node only.
    pub async fn start(&self, bind_port: u16) -> Result<SocketAddr> {
        let mut running = self.running.write().await;
        if *running {
            return self
                .local_addr()
                .ok_or_else(|| BodegaError::Internal("transport running without an address".into()));
        }
        if *self.shutdown_tx.borrow() {
            return Err(BodegaError::ShuttingDown);
        }

        let listener = TcpListener::bind(("0.0.0.0", bind_port)).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.write().unwrap_or_else(|e| e.into_inner()) = Some(addr);

        let links = self.links.clone();
        let handler = self.handler.clone();
        let max_frame = self.config.max_frame_bytes;
        let queue_size = self.config.send_queue_size;
        let shutdown_tx = self.shutdown_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let node_id = self.node_id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, remote)) => {
                                let key = format!("{}{}", ANONYMOUS_PREFIX, remote);
                                debug!(node = %node_id, peer = %key, "Accepted inbound peer link");
                                spawn_link(
                                    stream,
                                    key,
                                    links.clone(),
                                    handler.clone(),
                                    max_frame,
                                    queue_size,
                                    &shutdown_tx,
                                );
                            }
                            Err(e) => {
                                warn!(node = %node_id, "Error accepting peer link: {}", e);
                            }
                        }
                    }
                }
            }
            debug!(node = %node_id, "Listener task stopped");
        });

        *running = true;
        info!(node = %self.node_id, %addr, "Peer transport started");
        Ok(addr)
    }

    /// Dial an outbound link and announce ourselves with PEER_HELLO
    ///
    /// No-op when a live link to `peer_id` already exists.
    pub async fn connect(&self, peer_id: &str, host: &str, port: u16) -> Result<bool> {
        if let Some(link) = self.links.get(peer_id)
            && link.live.load(Ordering::SeqCst)
        {
            return Ok(true);
        }

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| BodegaError::Timeout(self.config.connect_timeout))?
        .map_err(|e| BodegaError::Network(format!("failed to connect to {}: {}", peer_id, e)))?;

        spawn_link(
            stream,
            peer_id.to_string(),
            self.links.clone(),
            self.handler.clone(),
            self.config.max_frame_bytes,
            self.config.send_queue_size,
            &self.shutdown_tx,
        );

        let mut hello = Envelope::to(
            MessageKind::PeerHello,
            &self.node_id,
            peer_id,
            self.clock.tick(),
        );
        if let Some(addr) = *self.local_addr.read().unwrap_or_else(|e| e.into_inner()) {
            hello.put(KEY_PEER_PORT, addr.port());
        }
        self.send(peer_id, hello)?;

        info!(node = %self.node_id, peer = peer_id, "Connected to peer");
        Ok(true)
    }

    /// Enqueue an envelope for `peer_id`; never blocks the caller
    pub fn send(&self, peer_id: &str, mut envelope: Envelope) -> Result<()> {
        envelope.receiver_id = Some(peer_id.to_string());

        let Some(link) = self.links.get(peer_id) else {
            return Err(BodegaError::PeerUnavailable(peer_id.to_string()));
        };
        if !link.live.load(Ordering::SeqCst) {
            return Err(BodegaError::PeerUnavailable(peer_id.to_string()));
        }

        link.outbound.try_send(envelope).map_err(|_| {
            link.live.store(false, Ordering::SeqCst);
            BodegaError::PeerUnavailable(peer_id.to_string())
        })
    }

    /// Send one independent copy to every live, identified peer
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        let mut delivered = 0;
        for entry in self.links.iter() {
            let peer_id = entry.key();
            if peer_id.starts_with(ANONYMOUS_PREFIX) || !entry.value().live.load(Ordering::SeqCst)
            {
                continue;
            }
            let mut copy = envelope.clone();
            copy.receiver_id = Some(peer_id.clone());
            if entry.value().outbound.try_send(copy).is_ok() {
                delivered += 1;
            } else {
                entry.value().live.store(false, Ordering::SeqCst);
            }
        }
        delivered
    }

    /// Identified peers whose links are live
    pub fn live_peers(&self) -> Vec<String> {
        self.links
            .iter()
            .filter(|e| {
                !e.key().starts_with(ANONYMOUS_PREFIX) && e.value().live.load(Ordering::SeqCst)
            })
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.links
            .get(peer_id)
            .is_some_and(|l| l.live.load(Ordering::SeqCst))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Stop accepting, close every link and end the I/O tasks
    ///
    /// Idempotent; the transport cannot be restarted afterwards.
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        if !*running {
            return;
        }
        *running = false;

        let _ = self.shutdown_tx.send(true);
        for entry in self.links.iter() {
            entry.value().live.store(false, Ordering::SeqCst);
        }
        self.links.clear();

        info!(node = %self.node_id, "Peer transport stopped");
    }
}

impl EnvelopeSender for PeerTransport {
    fn send_to(&self, peer_id: &str, envelope: Envelope) -> Result<()> {
        self.send(peer_id, envelope)
    }
}

impl std::fmt::Debug for PeerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerTransport")
            .field("node_id", &self.node_id)
            .field("links", &self.links.len())
            .finish()
    }
}

/// Register a link and spawn its reader and writer tasks
fn spawn_link(
    stream: TcpStream,
    key: String,
    links: Arc<DashMap<String, PeerLink>>,
    handler: Arc<RwLock<Option<Arc<dyn MessageHandler>>>>,
    max_frame: usize,
    queue_size: usize,
    shutdown_tx: &watch::Sender<bool>,
) {
    let (read_half, write_half) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Envelope>(queue_size);
    let live = Arc::new(AtomicBool::new(true));

    if let Some(previous) = links.insert(
        key.clone(),
        PeerLink {
            outbound: outbound_tx,
            live: live.clone(),
        },
    ) {
        previous.live.store(false, Ordering::SeqCst);
    }

    tokio::spawn(write_loop(
        write_half,
        outbound_rx,
        live.clone(),
        max_frame,
        shutdown_tx.subscribe(),
    ));
    tokio::spawn(read_loop(
        read_half,
        key,
        links,
        handler,
        live,
        max_frame,
        shutdown_tx.subscribe(),
    ));
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    live: Arc<AtomicBool>,
    max_frame: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            maybe = outbound_rx.recv() => {
                let Some(envelope) = maybe else { break };
                let frame = match encode_frame(&envelope, max_frame) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Dropping unencodable envelope {}: {}", envelope, e);
                        continue;
                    }
                };
                if let Err(e) = write_half.write_all(&frame).await {
                    debug!("Peer link write failed: {}", e);
                    live.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
    }
    let _ = write_half.shutdown().await;
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    initial_key: String,
    links: Arc<DashMap<String, PeerLink>>,
    handler: Arc<RwLock<Option<Arc<dyn MessageHandler>>>>,
    live: Arc<AtomicBool>,
    max_frame: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut key = initial_key;
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            frame = read_frame(&mut read_half, max_frame) => {
                match frame {
                    Ok(Some(bytes)) => {
                        let envelope: Envelope = match serde_json::from_slice(&bytes) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                warn!(peer = %key, "Discarding malformed envelope: {}", e);
                                continue;
                            }
                        };

                        // PEER_HELLO installs the canonical peer id for an
                        // anonymous inbound link.
                        if envelope.kind == MessageKind::PeerHello && envelope.sender_id != key {
                            if let Some((_, link)) = links.remove(&key) {
                                key = envelope.sender_id.clone();
                                if let Some(replaced) = links.insert(key.clone(), link) {
                                    replaced.live.store(false, Ordering::SeqCst);
                                }
                                debug!(peer = %key, "Rebound anonymous link to peer id");
                            }
                        }

                        let registered = { handler.read().await.clone() };
                        match registered {
                            Some(h) => h.handle(envelope).await,
                            None => debug!(peer = %key, "No handler registered, dropping {}", envelope),
                        }
                    }
                    Ok(None) => {
                        debug!(peer = %key, "Peer closed the link");
                        break;
                    }
                    Err(e) => {
                        debug!(peer = %key, "Peer link read failed: {}", e);
                        break;
                    }
                }
            }
        }
    }

    live.store(false, Ordering::SeqCst);
    links.remove_if(&key, |_, link| !link.live.load(Ordering::SeqCst));
}

/// Read one length-prefixed frame; `None` on a clean remote close
async fn read_frame(read_half: &mut OwnedReadHalf, max_frame: usize) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match read_half.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_le_bytes(header) as usize;
    if length == 0 || length > max_frame {
        return Err(BodegaError::Network(format!(
            "invalid frame length {} (max {})",
            length, max_frame
        )));
    }

    let mut body = vec![0u8; length];
    read_half.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Encode one envelope as a length-prefixed frame
pub fn encode_frame(envelope: &Envelope, max_frame: usize) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(envelope)?;
    if body.len() > max_frame {
        return Err(BodegaError::Network(format!(
            "frame of {} bytes exceeds max {}",
            body.len(),
            max_frame
        )));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct RecordingHandler {
        received: Mutex<Vec<Envelope>>,
        notify: tokio::sync::Notify,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
                notify: tokio::sync::Notify::new(),
            })
        }

        fn kinds(&self) -> Vec<MessageKind> {
            self.received
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.kind)
                .collect()
        }

        async fn wait_for(&self, count: usize) {
            for _ in 0..200 {
                if self.received.lock().unwrap().len() >= count {
                    return;
                }
                let _ = tokio::time::timeout(
                    Duration::from_millis(50),
                    self.notify.notified(),
                )
                .await;
            }
            panic!("timed out waiting for {} envelopes", count);
        }
    }

    #[async_trait::async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, envelope: Envelope) {
            self.received.lock().unwrap().push(envelope);
            self.notify.notify_waiters();
        }
    }

    fn transport(node_id: &str) -> Arc<PeerTransport> {
        Arc::new(PeerTransport::new(
            node_id,
            Arc::new(LamportClock::new()),
            TransportConfig::default(),
        ))
    }

    #[test]
    fn test_frame_roundtrip() {
        let envelope = Envelope::to(MessageKind::Ping, "branch-1", "branch-2", 9);
        let frame = encode_frame(&envelope, 1024).unwrap();

        let length = u32::from_le_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(length, frame.len() - FRAME_HEADER_LEN);

        let decoded: Envelope = serde_json::from_slice(&frame[4..]).unwrap();
        assert_eq!(decoded.kind, MessageKind::Ping);
        assert_eq!(decoded.timestamp, 9);
    }

    #[test]
    fn test_encode_frame_enforces_limit() {
        let mut envelope = Envelope::new(MessageKind::Ack, "branch-1", 1);
        envelope.put("blob", "x".repeat(512));
        assert!(encode_frame(&envelope, 64).is_err());
    }

    #[test]
    fn test_send_to_unknown_peer_fails() {
        let transport = transport("branch-1");
        let envelope = Envelope::new(MessageKind::Ping, "branch-1", 1);
        let err = transport.send("branch-9", envelope).unwrap_err();
        assert!(matches!(err, BodegaError::PeerUnavailable(_)));
    }

    #[tokio::test]
    async fn test_hello_rebinds_inbound_link() {
        let a = transport("branch-a");
        let b = transport("branch-b");

        let handler_a = RecordingHandler::new();
        let handler_b = RecordingHandler::new();
        a.set_handler(handler_a.clone()).await;
        b.set_handler(handler_b.clone()).await;

        let addr_a = a.start(0).await.unwrap();
        b.start(0).await.unwrap();

        assert!(b.connect("branch-a", "127.0.0.1", addr_a.port()).await.unwrap());
        handler_a.wait_for(1).await;
        assert_eq!(handler_a.kinds(), vec![MessageKind::PeerHello]);

        // After the hello, A can reach B over the same inbound link.
        assert!(a.live_peers().contains(&"branch-b".to_string()));
        a.send("branch-b", Envelope::new(MessageKind::Ping, "branch-a", 2))
            .unwrap();
        handler_b.wait_for(1).await;
        assert_eq!(handler_b.kinds(), vec![MessageKind::Ping]);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_per_peer_fifo_order() {
        let a = transport("branch-a");
        let b = transport("branch-b");

        let handler_a = RecordingHandler::new();
        a.set_handler(handler_a.clone()).await;
        b.set_handler(RecordingHandler::new()).await;

        let addr_a = a.start(0).await.unwrap();
        b.start(0).await.unwrap();
        b.connect("branch-a", "127.0.0.1", addr_a.port()).await.unwrap();

        for ts in 1..=20u64 {
            b.send("branch-a", Envelope::new(MessageKind::Ping, "branch-b", ts))
                .unwrap();
        }
        handler_a.wait_for(21).await; // hello + 20 pings

        let timestamps: Vec<u64> = handler_a
            .received
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == MessageKind::Ping)
            .map(|e| e.timestamp)
            .collect();
        assert_eq!(timestamps, (1..=20).collect::<Vec<u64>>());

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_skips_anonymous_links() {
        let a = transport("branch-a");
        let handler_a = RecordingHandler::new();
        a.set_handler(handler_a.clone()).await;
        let addr_a = a.start(0).await.unwrap();

        // A raw client that never sends PEER_HELLO stays anonymous.
        let _raw = TcpStream::connect(("127.0.0.1", addr_a.port())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(a.live_peers().is_empty());
        let heartbeat = Envelope::new(MessageKind::BranchHeartbeat, "branch-a", 1);
        assert_eq!(a.broadcast(&heartbeat), 0);

        a.stop().await;
    }
}
