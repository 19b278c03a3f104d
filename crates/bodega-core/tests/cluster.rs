//! Multi-node cluster tests over real TCP on ephemeral ports

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use config::Config;

use bodega_core::service::mutex::AcquireOutcome;
use bodega_core::{BranchNode, Configuration, MessageHandler};
use bodega_inventory::Product;

use bodega_api::message::{Envelope, MessageKind};

fn node_configuration(branch_id: &str) -> Configuration {
    let config = Config::builder()
        .set_default("bodega.branch.id", branch_id)
        .unwrap()
        .set_default("bodega.peer.port", 0)
        .unwrap()
        .set_default("bodega.sync.interval.secs", 1)
        .unwrap()
        .build()
        .unwrap();
    Configuration::from_config(config)
}

async fn wait_until<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Start two connected nodes; `a` dials `b`, `b` learns `a` from the hello.
async fn connected_pair() -> (BranchNode, BranchNode) {
    let a = BranchNode::new(&node_configuration("branch-a")).unwrap();
    let b = BranchNode::new(&node_configuration("branch-b")).unwrap();

    a.start().await.unwrap();
    let addr_b = b.start().await.unwrap();

    a.coordinator()
        .connect_peer("branch-b", "127.0.0.1", addr_b.port())
        .await
        .unwrap();

    wait_until("hello handshake", || {
        b.coordinator().known_peers().contains(&"branch-a".to_string())
            && b.transport().is_connected("branch-a")
    })
    .await;

    (a, b)
}

#[tokio::test]
async fn test_replenishment_transfer_between_branches() {
    let (a, b) = connected_pair().await;

    a.inventory()
        .add(Product::new("P001", "Laptop", "High-performance laptop", 999.99, 2, 3));
    b.inventory()
        .add(Product::new("P001", "Laptop", "High-performance laptop", 999.99, 20, 3));

    // needed = 2 * min_stock - qty = 4
    let needed = a.inventory().get("P001").unwrap().replenishment_needed();
    assert_eq!(needed, 4);
    a.coordinator().request_replenishment("P001", needed);

    wait_until("transfer to complete", || {
        a.inventory().get("P001").unwrap().quantity == 6
            && b.inventory().get("P001").unwrap().quantity == 16
            && b.coordinator().open_reservations() == 0
    })
    .await;

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_transfer_refused_when_supplier_is_low() {
    let (a, b) = connected_pair().await;

    a.inventory()
        .add(Product::new("P001", "Laptop", "High-performance laptop", 999.99, 2, 3));
    b.inventory()
        .add(Product::new("P001", "Laptop", "High-performance laptop", 999.99, 3, 3));

    a.coordinator().request_replenishment("P001", 4);
    tokio::time::sleep(Duration::from_secs(2)).await;

    // The supplier cannot fulfill; nothing moved on either side.
    assert_eq!(a.inventory().get("P001").unwrap().quantity, 2);
    assert_eq!(b.inventory().get("P001").unwrap().quantity, 3);
    assert_eq!(b.coordinator().open_reservations(), 0);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_mirror_transfers_restore_quantities() {
    let (a, b) = connected_pair().await;

    a.inventory()
        .add(Product::new("P002", "Mouse", "Wireless mouse", 29.99, 10, 2));
    b.inventory()
        .add(Product::new("P002", "Mouse", "Wireless mouse", 29.99, 10, 2));

    a.coordinator().request_replenishment("P002", 3);
    wait_until("first transfer", || {
        a.inventory().get("P002").unwrap().quantity == 13
            && b.inventory().get("P002").unwrap().quantity == 7
    })
    .await;

    b.coordinator().request_replenishment("P002", 3);
    wait_until("mirror transfer", || {
        a.inventory().get("P002").unwrap().quantity == 10
            && b.inventory().get("P002").unwrap().quantity == 10
    })
    .await;

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_concurrent_acquires_serialize() {
    let (a, b) = connected_pair().await;

    let holders = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    async fn contend(
        engine: Arc<bodega_core::MutexEngine>,
        holders: Arc<AtomicUsize>,
        max_inside: Arc<AtomicUsize>,
    ) -> AcquireOutcome {
        let outcome = engine.acquire("P001", Duration::from_secs(10)).await;
        if outcome == AcquireOutcome::Granted {
            let inside = holders.fetch_add(1, Ordering::SeqCst) + 1;
            max_inside.fetch_max(inside, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(150)).await;
            holders.fetch_sub(1, Ordering::SeqCst);
            engine.release("P001");
        }
        outcome
    }

    let (outcome_a, outcome_b) = tokio::join!(
        contend(a.mutex().clone(), holders.clone(), max_inside.clone()),
        contend(b.mutex().clone(), holders.clone(), max_inside.clone()),
    );

    assert_eq!(outcome_a, AcquireOutcome::Granted);
    assert_eq!(outcome_b, AcquireOutcome::Granted);
    // Never both inside the critical section at once.
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_acquire_grants_despite_dead_peer() {
    let (a, b) = connected_pair().await;

    // branch-c joins the peer set but has no live link: sends to it fail and
    // count as implicit replies.
    let mut ghost_hello = Envelope::to(MessageKind::PeerHello, "branch-c", "branch-a", 1);
    ghost_hello.put("peerPort", 1u16);
    a.coordinator().handle(ghost_hello).await;
    assert!(a.coordinator().known_peers().contains(&"branch-c".to_string()));

    let outcome = a.mutex().acquire("P001", Duration::from_secs(5)).await;
    assert_eq!(outcome, AcquireOutcome::Granted);
    a.mutex().release("P001");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_offline_peer_catches_up_from_log() {
    let a = BranchNode::new(&node_configuration("branch-a")).unwrap();
    let addr_a = a.start().await.unwrap();

    a.inventory()
        .add(Product::new("P001", "Laptop", "High-performance laptop", 999.99, 10, 3));

    // Two operations logged while branch-b is still offline.
    assert!(a.coordinator().restock("P001", 5)); // qty 15
    assert!(a.coordinator().record_sale("P001", 2)); // qty 13
    assert_eq!(a.replication().log_len(), 2);

    // branch-b comes online and reconciles through the periodic sync.
    let b = BranchNode::new(&node_configuration("branch-b")).unwrap();
    b.start().await.unwrap();
    b.coordinator()
        .connect_peer("branch-a", "127.0.0.1", addr_a.port())
        .await
        .unwrap();

    wait_until("catch-up to apply", || {
        b.coordinator().peer_stock("branch-a", "P001") == Some(13)
    })
    .await;

    // branch-a saw the acks and advanced its high-water mark for branch-b.
    wait_until("ack high-water mark", || {
        a.replication()
            .sync_status()
            .get("branch-b")
            .is_some_and(|ts| *ts > 0)
    })
    .await;

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_clocks_advance_across_the_wire() {
    let (a, b) = connected_pair().await;

    let before = b.clock().peek();
    a.inventory()
        .add(Product::new("P003", "Keyboard", "Mechanical keyboard", 79.99, 5, 1));
    assert!(a.coordinator().restock("P003", 1));

    // The broadcast LOG_ENTRY carries a fresh tick; branch-b's clock must
    // land strictly above it.
    wait_until("clock propagation", || b.clock().peek() > before).await;

    a.stop().await;
    b.stop().await;
}
