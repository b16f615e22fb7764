//! Per-peer ordering and isolation of the inbound dispatcher.

use std::{sync::Arc, time::Duration};

use meshframe_node::InboundDispatcher;
use proptest::prelude::*;
use tokio::sync::{Notify, mpsc};

/// Dispatcher whose handler sleeps `item % 4` ms, then reports `(peer, item)`.
fn recording() -> (InboundDispatcher<u32>, mpsc::UnboundedReceiver<(String, u32)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let dispatcher = InboundDispatcher::new(move |peer: String, item: u32| {
        let tx = tx.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(u64::from(item % 4))).await;
            let _ = tx.send((peer, item));
        }
    });
    (dispatcher, rx)
}

async fn collect(rx: &mut mpsc::UnboundedReceiver<(String, u32)>, n: usize) -> Vec<(String, u32)> {
    let mut seen = Vec::with_capacity(n);
    while seen.len() < n {
        seen.push(rx.recv().await.unwrap());
    }
    seen
}

fn for_peer(seen: &[(String, u32)], peer: &str) -> Vec<u32> {
    seen.iter().filter(|(p, _)| p == peer).map(|(_, item)| *item).collect()
}

#[tokio::test(start_paused = true)]
async fn items_for_one_peer_run_in_arrival_order() {
    let (dispatcher, mut rx) = recording();

    for item in (0..20).rev() {
        dispatcher.enqueue("alice", item);
    }

    let seen = collect(&mut rx, 20).await;
    assert_eq!(for_peer(&seen, "alice"), (0..20).rev().collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn a_blocked_peer_does_not_stall_others() {
    let gate = Arc::new(Notify::new());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let dispatcher = {
        let gate = Arc::clone(&gate);
        InboundDispatcher::new(move |peer: String, item: u32| {
            let (gate, tx) = (Arc::clone(&gate), tx.clone());
            async move {
                if peer == "slow" {
                    gate.notified().await;
                }
                let _ = tx.send((peer, item));
            }
        })
    };

    dispatcher.enqueue("slow", 1);
    dispatcher.enqueue("fast", 2);
    dispatcher.enqueue("fast", 3);

    assert_eq!(rx.recv().await, Some(("fast".to_string(), 2)));
    assert_eq!(rx.recv().await, Some(("fast".to_string(), 3)));
    assert_eq!(dispatcher.active_peers(), 2);

    gate.notify_one();
    assert_eq!(rx.recv().await, Some(("slow".to_string(), 1)));
}

#[tokio::test(start_paused = true)]
async fn items_after_close_run_after_the_drained_queue() {
    let (dispatcher, mut rx) = recording();

    dispatcher.enqueue("bob", 3);
    dispatcher.enqueue("bob", 7);
    assert!(dispatcher.close_peer("bob"));
    assert!(!dispatcher.close_peer("bob"));
    assert_eq!(dispatcher.active_peers(), 0);

    dispatcher.enqueue("bob", 0);

    let seen = collect(&mut rx, 3).await;
    assert_eq!(for_peer(&seen, "bob"), vec![3, 7, 0]);
}

#[tokio::test(start_paused = true)]
async fn reconnect_churn_does_not_accumulate_queues() {
    let (dispatcher, mut rx) = recording();

    // Every reconnect arrives under a fresh connection id
    for cycle in 0..50 {
        let peer = format!("bob-{cycle}");
        dispatcher.enqueue(&peer, cycle);
        assert!(dispatcher.close_peer(&peer));
    }
    collect(&mut rx, 50).await;

    tokio::time::timeout(Duration::from_secs(1), async {
        while dispatcher.tracked_peers() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(dispatcher.active_peers(), 0);
}

#[tokio::test(start_paused = true)]
async fn reopened_peer_keeps_its_entry_until_drained() {
    let (dispatcher, mut rx) = recording();

    dispatcher.enqueue("bob", 1);
    dispatcher.close_peer("bob");
    dispatcher.enqueue("bob", 2);
    collect(&mut rx, 2).await;

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(dispatcher.tracked_peers(), 1);
    assert_eq!(dispatcher.active_peers(), 1);

    dispatcher.close_peer("bob");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(dispatcher.tracked_peers(), 0);
}

#[test]
fn closing_an_unknown_peer_is_a_no_op() {
    let (dispatcher, _rx) = recording();
    assert!(!dispatcher.close_peer("nobody"));
}

proptest! {
    #[test]
    fn per_peer_order_survives_interleaving(
        arrivals in prop::collection::vec((0u8..3, 0u32..1000), 1..60),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        let seen = runtime.block_on(async {
            let (dispatcher, mut rx) = recording();
            for (peer, item) in &arrivals {
                dispatcher.enqueue(&format!("peer-{peer}"), *item);
            }
            collect(&mut rx, arrivals.len()).await
        });

        for peer in 0u8..3 {
            let name = format!("peer-{peer}");
            let expected: Vec<u32> =
                arrivals.iter().filter(|(p, _)| *p == peer).map(|(_, item)| *item).collect();
            prop_assert_eq!(for_peer(&seen, &name), expected);
        }
    }
}
