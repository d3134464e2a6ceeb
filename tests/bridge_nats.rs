//! NATS JetStream bridge integration tests using testcontainers.
//!
//! Run with: cargo test --test bridge_nats --features nats -- --nocapture
//!
//! These tests spin up NATS with JetStream in a container using testcontainers-rs.

use std::time::Duration;

use async_nats::jetstream;
use bytes::Bytes;
use jetstream_bridge::broker::{connect, AckPolicy, DeliverPolicy};
use jetstream_bridge::config::ConnectionConfig;
use jetstream_bridge::destination::WriteError;
use jetstream_bridge::source::IteratorError;
use jetstream_bridge::{
    IteratorParams, Position, PositionToken, ReadIterator, Record, Writer, WriterParams,
};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};
use tokio::sync::watch;

/// Start NATS container with JetStream enabled.
async fn start_nats() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("nats", "2.10")
        .with_exposed_port(4222.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "Listening for client connections",
        ))
        .with_cmd(vec!["-js"]); // Enable JetStream

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start NATS container");

    let host_port = container
        .get_host_port_ipv4(4222)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let url = format!("nats://{}:{}", host, host_port);
    println!("NATS available at: {}", url);

    (container, url)
}

fn test_prefix() -> String {
    format!(
        "test_{}",
        uuid::Uuid::new_v4().to_string().replace('-', "")[..8].to_string()
    )
}

fn connection_config(url: &str) -> ConnectionConfig {
    ConnectionConfig {
        urls: vec![url.to_string()],
        connection_name: Some("bridge-test".to_string()),
        ..Default::default()
    }
}

/// Create a stream capturing `<prefix>.>` and publish `payloads` to it.
async fn seed_stream(url: &str, stream: &str, subject: &str, payloads: &[&str]) -> jetstream::Context {
    let client = async_nats::connect(url)
        .await
        .expect("Failed to connect to NATS");
    let context = jetstream::new(client);

    context
        .create_stream(jetstream::stream::Config {
            name: stream.to_string(),
            subjects: vec![subject.to_string()],
            ..Default::default()
        })
        .await
        .expect("Failed to create stream");

    for payload in payloads {
        context
            .publish(subject.to_string(), Bytes::from(payload.to_string()))
            .await
            .expect("Failed to publish")
            .await
            .expect("Publish not acknowledged");
    }

    context
}

fn iterator_params(prefix: &str, position: PositionToken) -> IteratorParams {
    IteratorParams {
        buffer_size: 64,
        durable: format!("{}_durable", prefix),
        stream: prefix.to_uppercase(),
        subject: format!("{}.orders", prefix),
        position,
        deliver_policy: DeliverPolicy::All,
        ack_policy: AckPolicy::Explicit,
    }
}

async fn open_iterator(url: &str, params: IteratorParams) -> ReadIterator {
    let connection = connect(&connection_config(url))
        .await
        .expect("Failed to connect");
    ReadIterator::new(Box::new(connection), params)
        .await
        .expect("Failed to open iterator")
}

async fn next_record(iterator: &ReadIterator, cancel: &mut watch::Receiver<bool>) -> Record {
    tokio::time::timeout(Duration::from_secs(10), iterator.next(cancel))
        .await
        .expect("Timed out waiting for record")
        .expect("Failed to read record")
}

#[tokio::test]
async fn test_read_and_ack_in_order() {
    let (_container, url) = start_nats().await;
    let prefix = test_prefix();
    let params = iterator_params(&prefix, PositionToken::default());
    let context = seed_stream(&url, &params.stream, &params.subject, &["one", "two", "three"]).await;

    let iterator = open_iterator(&url, params.clone()).await;
    let (_cancel_tx, mut cancel) = watch::channel(false);

    let mut records = Vec::new();
    for _ in 0..3 {
        records.push(next_record(&iterator, &mut cancel).await);
    }

    let payloads: Vec<&[u8]> = records.iter().map(|r| r.payload.after.as_ref()).collect();
    assert_eq!(payloads, vec![&b"one"[..], b"two", b"three"]);

    let sequences: Vec<u64> = records
        .iter()
        .map(|r| Position::decode(&r.position).unwrap().opt_seq)
        .collect();
    assert_eq!(sequences, vec![2, 3, 4]);

    let result = iterator.ack(&records[1].position).await;
    assert!(matches!(result, Err(IteratorError::OutOfOrderAck { .. })));

    for record in &records {
        iterator.ack(&record.position).await.expect("Failed to ack");
    }
    assert_eq!(iterator.unacknowledged().await, 0);

    iterator.stop().await.expect("Failed to stop");

    let stream = context.get_stream(&params.stream).await.unwrap();
    assert!(
        stream.consumer_info(&params.durable).await.is_err(),
        "durable consumer should be deleted on stop"
    );
}

#[tokio::test]
async fn test_resume_from_position() {
    let (_container, url) = start_nats().await;
    let prefix = test_prefix();
    let params = iterator_params(&prefix, PositionToken::default());
    seed_stream(&url, &params.stream, &params.subject, &["a", "b", "c"]).await;

    let (_cancel_tx, mut cancel) = watch::channel(false);

    let first = open_iterator(&url, params.clone()).await;
    let a = next_record(&first, &mut cancel).await;
    first.ack(&a.position).await.unwrap();
    let b = next_record(&first, &mut cancel).await;
    first.ack(&b.position).await.unwrap();
    first.stop().await.unwrap();

    let resumed = open_iterator(&url, iterator_params(&prefix, b.position.clone())).await;
    let c = next_record(&resumed, &mut cancel).await;
    assert_eq!(c.payload.after, Bytes::from_static(b"c"));
    resumed.stop().await.unwrap();
}

#[tokio::test]
async fn test_cancel_unblocks_next() {
    let (_container, url) = start_nats().await;
    let prefix = test_prefix();
    let params = iterator_params(&prefix, PositionToken::default());
    seed_stream(&url, &params.stream, &params.subject, &[]).await;

    let iterator = open_iterator(&url, params).await;
    let (cancel_tx, mut cancel) = watch::channel(false);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = cancel_tx.send(true);
    });

    let result = tokio::time::timeout(Duration::from_secs(5), iterator.next(&mut cancel))
        .await
        .expect("next should return after cancel");
    assert!(matches!(result, Err(IteratorError::Cancelled)));

    iterator.stop().await.unwrap();
}

#[tokio::test]
async fn test_writer_publishes_to_stream() {
    let (_container, url) = start_nats().await;
    let prefix = test_prefix();
    let stream_name = prefix.to_uppercase();
    let subject = format!("{}.mirror", prefix);
    let context = seed_stream(&url, &stream_name, &subject, &[]).await;

    let connection = connect(&connection_config(&url)).await.unwrap();
    let writer = Writer::new(
        Box::new(connection),
        WriterParams {
            subject: subject.clone(),
            batch_size: 1,
            retry_wait: Duration::from_millis(100),
            retry_attempts: 1,
        },
    )
    .unwrap();

    writer.write(&Record::with_payload("first")).await.unwrap();
    writer.write(&Record::with_payload("second")).await.unwrap();
    writer.close().await.unwrap();

    let late = writer.write(&Record::with_payload("late")).await;
    assert!(late.is_err(), "publish after close should fail");

    let message = context
        .get_stream(&stream_name)
        .await
        .unwrap()
        .get_raw_message(2)
        .await
        .expect("Second message should be stored");
    assert_eq!(message.payload, Bytes::from_static(b"second"));
}

#[tokio::test]
async fn test_writer_fails_without_stream() {
    let (_container, url) = start_nats().await;
    let prefix = test_prefix();

    let connection = connect(&connection_config(&url)).await.unwrap();
    let writer = Writer::new(
        Box::new(connection),
        WriterParams {
            subject: format!("{}.nowhere", prefix),
            batch_size: 1,
            retry_wait: Duration::from_millis(50),
            retry_attempts: 2,
        },
    )
    .unwrap();

    let result = writer.write(&Record::with_payload("lost")).await;
    assert!(matches!(result, Err(WriteError::Publish(_))));
}
