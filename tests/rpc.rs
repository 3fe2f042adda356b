// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use futures_util::StreamExt;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tracker_mq::{
    connection::Connection,
    eventloop::{itermessages, EventLoopOptions},
    exchange::ExchangeDefinition,
    message::Properties,
    pool::ConnectionPool,
    publisher::{Producer, PublishOptions},
    queue::QueueDefinition,
    retry::RetryPolicy,
    rpc::{collect_replies, isend_reply, reply_queue, send_reply, CollectOptions},
    serialization::Body,
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

fn bounded(limit: usize) -> EventLoopOptions {
    EventLoopOptions::new()
        .limit(limit)
        .timeout(Duration::from_millis(20))
}

#[tokio::test]
async fn replies_carry_the_request_correlation_id() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    let server = connect(&broker).await;
    let requests = QueueDefinition::new("rpc.lookup");
    let replies = reply_queue("reply.client-1", Some(Duration::from_secs(30)));

    tracker_mq::topology::maybe_declare(&replies.clone().into(), &client)
        .await
        .unwrap();
    Producer::new(&client)
        .publish(
            &Body::Json(json!({"torrent": "a"})),
            &PublishOptions::new("rpc.lookup")
                .declare(requests.clone())
                .reply_to("reply.client-1")
                .correlation_id("req-7"),
        )
        .await
        .unwrap();

    let served: Vec<_> = itermessages(&server, &requests, false, bounded(5), Vec::new())
        .take(1)
        .collect()
        .await;
    let (body, request) = served.into_iter().next().unwrap().unwrap();
    assert_eq!(body, Body::Json(json!({"torrent": "a"})));

    send_reply(
        &ExchangeDefinition::default_exchange(),
        &request,
        &Body::Json(json!({"files": 2})),
        &Producer::new(&server),
    )
    .await
    .unwrap();
    request.ack().await.unwrap();

    let answered: Vec<_> = itermessages(&client, &replies, true, bounded(5), Vec::new())
        .take(1)
        .collect()
        .await;
    let (reply, message) = answered.into_iter().next().unwrap().unwrap();
    assert_eq!(reply, Body::Json(json!({"files": 2})));
    assert_eq!(message.properties().correlation_id(), Some("req-7"));
    assert_eq!(message.properties().content_type(), Some("application/json"));
}

#[tokio::test]
async fn isend_reply_outlasts_a_disconnect() {
    let broker = MemoryBroker::new();
    let pool = ConnectionPool::new(
        Arc::new(broker.clone()),
        policy(),
        2,
        Duration::from_millis(100),
    );
    let client = connect(&broker).await;
    let replies = reply_queue("reply.client-2", None);
    tracker_mq::topology::maybe_declare(&replies.clone().into(), &client)
        .await
        .unwrap();

    let request = Properties::default()
        .with_content_type("text/plain")
        .with_reply_to("reply.client-2")
        .with_correlation_id("req-8");
    broker.fail_next_operations(1);
    isend_reply(
        &pool,
        &ExchangeDefinition::default_exchange(),
        &request,
        &Body::Text("ok".to_owned()),
        None,
    )
    .await
    .unwrap();

    let collected: Vec<_> = collect_replies(
        &client,
        &replies,
        CollectOptions {
            eventloop: bounded(3),
            ..CollectOptions::default()
        },
    )
    .collect()
    .await;

    assert_eq!(collected, vec![Ok(Body::Text("ok".to_owned()))]);
    assert_eq!(broker.reply_notifications(), vec!["reply.client-2".to_owned()]);
}
