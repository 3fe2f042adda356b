// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use std::{sync::Arc, time::Duration};
use tracker_mq::{
    connection::{Connection, Revive},
    exchange::ExchangeDefinition,
    queue::QueueDefinition,
    retry::RetryPolicy,
    topology::{maybe_declare, maybe_declare_with_retry, Entity, Topology},
    transport::memory::MemoryBroker,
};

fn policy() -> RetryPolicy {
    RetryPolicy::new(Some(3))
        .interval_start(Duration::from_millis(1))
        .interval_max(Duration::from_millis(5))
}

async fn connect(broker: &MemoryBroker) -> Connection {
    Connection::connect(Arc::new(broker.clone()), policy())
        .await
        .unwrap()
}

#[tokio::test]
async fn durable_queue_is_declared_once_per_connection() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker).await;
    let queue = Entity::from(QueueDefinition::new("torrents").durable());

    assert!(maybe_declare(&queue, &conn).await.unwrap());
    assert!(!maybe_declare(&queue, &conn).await.unwrap());
    assert!(!maybe_declare(&queue, &conn).await.unwrap());

    assert_eq!(broker.queue_declare_count("torrents"), 1);
}

#[tokio::test]
async fn auto_delete_queue_is_declared_every_time() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker).await;
    let queue = Entity::from(QueueDefinition::new("replies.1").delete());

    for _ in 0..3 {
        assert!(maybe_declare(&queue, &conn).await.unwrap());
    }
    assert_eq!(broker.queue_declare_count("replies.1"), 3);
}

#[tokio::test]
async fn other_connections_keep_their_own_cache() {
    let broker = MemoryBroker::new();
    let first = connect(&broker).await;
    let second = connect(&broker).await;
    let queue = Entity::from(QueueDefinition::new("torrents"));

    maybe_declare(&queue, &first).await.unwrap();
    maybe_declare(&queue, &second).await.unwrap();
    maybe_declare(&queue, &second).await.unwrap();

    assert_eq!(broker.queue_declare_count("torrents"), 2);
}

#[tokio::test]
async fn retried_declaration_replays_topology_after_reconnect() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker).await;
    let exchange = ExchangeDefinition::new("tasks").direct().durable();
    let queue = QueueDefinition::new("torrents")
        .durable()
        .with_dlq()
        .bind(&exchange, "torrent.process");
    let topology = Topology::new().exchange(&exchange).queue(&queue);
    topology.install(&conn).await.unwrap();

    broker.fail_next_operations(1);
    let reports = QueueDefinition::new("reports").durable();
    let declared = maybe_declare_with_retry(
        &Entity::from(reports),
        &conn,
        None,
        Some(&topology as &dyn Revive),
    )
    .await
    .unwrap();

    assert!(declared);
    assert!(broker.has_queue("reports"));
    assert_eq!(broker.exchange_declare_count("tasks"), 2);
    assert_eq!(broker.queue_declare_count("torrents"), 2);
    assert!(broker.has_binding("torrents", "tasks", "torrent.process"));
}
