//! Concurrency tests
//!
//! These tests verify thread-safety and concurrent operation:
//! - Concurrent publishers lose no messages
//! - Members of one group share the stream without duplicates
//! - Every group sees the full stream regardless of the others
//! - Many producers feeding a small pool queue

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use telemetry_pipeline::bus::runner::{ConsumerHandle, handler_fn};
use telemetry_pipeline::bus::{Message, MessageBus};
use telemetry_pipeline::pool::{Collector, PoolOptions, WorkerPool};

use crate::helpers::*;

type Seen = Arc<Mutex<Vec<String>>>;

fn recording_handler(
    seen: Seen,
) -> impl telemetry_pipeline::bus::runner::MessageHandler + 'static {
    handler_fn(move |msg: Message| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push(msg.payload_str()?.to_string());
            Ok(())
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publishers_lose_nothing() {
    let bus = create_test_bus();
    let seen: Seen = Arc::default();
    let runner = ConsumerHandle::spawn(&bus, "t", "g", recording_handler(seen.clone()))
        .await
        .unwrap();

    let mut publishers = vec![];
    for p in 0..8 {
        let bus = bus.clone();
        publishers.push(tokio::spawn(async move {
            for i in 0..50 {
                bus.publish("t", Message::new(format!("{p}-{i}"))).await.unwrap();
            }
        }));
    }
    for publisher in publishers {
        publisher.await.unwrap();
    }

    eventually(|| seen.lock().unwrap().len() == 400).await;
    let unique: HashSet<_> = seen.lock().unwrap().iter().cloned().collect();
    assert_eq!(unique.len(), 400);

    // Each publisher's messages keep their relative order.
    let seen = seen.lock().unwrap().clone();
    for p in 0..8 {
        let prefix = format!("{p}-");
        let order: Vec<u32> = seen
            .iter()
            .filter_map(|m| m.strip_prefix(&prefix))
            .map(|i| i.parse().unwrap())
            .collect();
        assert_eq!(order, (0..50).collect::<Vec<_>>());
    }

    runner.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_group_members_share_without_duplicates() {
    let bus = create_test_bus();
    let seen: Seen = Arc::default();

    let mut members = vec![];
    for _ in 0..3 {
        members.push(
            ConsumerHandle::spawn(&bus, "t", "workers", recording_handler(seen.clone()))
                .await
                .unwrap(),
        );
    }

    for i in 0..90 {
        bus.publish("t", Message::new(i.to_string())).await.unwrap();
    }

    eventually(|| seen.lock().unwrap().len() >= 90).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 90);
    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 90);

    for member in &members {
        member.shutdown();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_groups_progress_independently() {
    let bus = create_test_bus();
    let fast: Seen = Arc::default();
    let slow_count = Arc::new(AtomicUsize::new(0));

    let fast_runner = ConsumerHandle::spawn(&bus, "t", "fast", recording_handler(fast.clone()))
        .await
        .unwrap();

    let counter = slow_count.clone();
    let slow_runner = ConsumerHandle::spawn(
        &bus,
        "t",
        "slow",
        handler_fn(move |_msg| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    )
    .await
    .unwrap();

    for i in 0..20 {
        bus.publish("t", Message::new(i.to_string())).await.unwrap();
    }

    // The fast group finishes long before the slow one.
    eventually(|| fast.lock().unwrap().len() == 20).await;
    assert!(slow_count.load(Ordering::SeqCst) < 20);

    eventually(|| slow_count.load(Ordering::SeqCst) == 20).await;
    eventually(|| bus.retained("t") == 0).await;

    fast_runner.shutdown();
    slow_runner.shutdown();
}

struct Counting(AtomicUsize);

#[async_trait::async_trait]
impl Collector<u64> for Counting {
    async fn collect(&self, _task: &u64) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_producers_small_queue() {
    let collector = Arc::new(Counting(AtomicUsize::new(0)));
    let options = PoolOptions {
        capacity: 4,
        workers: 4,
        ..Default::default()
    };
    let (pool, _dead) = WorkerPool::spawn(collector.clone(), options);

    let mut producers = vec![];
    for p in 0..10u64 {
        let pool = pool.clone();
        producers.push(tokio::spawn(async move {
            for i in 0..20 {
                pool.send(p * 100 + i).await.unwrap();
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    eventually(|| pool.stats().succeeded == 200).await;
    assert_eq!(collector.0.load(Ordering::SeqCst), 200);
    let stats = pool.stats();
    assert_eq!(stats.submitted, 200);
    assert_eq!(stats.succeeded, 200);

    pool.shutdown();
    pool.join().await;
}
