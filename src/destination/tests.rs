use std::time::Duration;

use bytes::Bytes;

use super::*;
use crate::broker::{BrokerError, MockBroker, PublishOption};
use crate::record::Record;

fn params(batch_size: usize) -> WriterParams {
    WriterParams {
        subject: "orders.mirror".to_string(),
        batch_size,
        retry_wait: Duration::from_secs(5),
        retry_attempts: 3,
    }
}

fn writer(broker: &MockBroker, params: WriterParams) -> Writer {
    Writer::new(Box::new(broker.clone()), params).unwrap()
}

// ============================================================================
// Publish options
// ============================================================================

#[test]
fn test_publish_options_empty_for_zero_values() {
    let options = publish_options(Duration::ZERO, 0);
    assert!(options.is_empty());
}

#[test]
fn test_publish_options_both_values() {
    let options = publish_options(Duration::from_secs(5), 3);
    let collected: Vec<PublishOption> = options.iter().copied().collect();
    assert_eq!(
        collected,
        vec![
            PublishOption::RetryWait(Duration::from_secs(5)),
            PublishOption::RetryAttempts(3),
        ]
    );
}

#[test]
fn test_publish_options_omit_zero_wait() {
    let options = publish_options(Duration::ZERO, 2);
    assert_eq!(options.len(), 1);
    assert_eq!(options.retry_attempts(), Some(2));
    assert!(options.retry_wait().is_none());
}

#[test]
fn test_publish_options_omit_zero_attempts() {
    let options = publish_options(Duration::from_millis(100), 0);
    assert_eq!(options.len(), 1);
    assert_eq!(options.retry_wait(), Some(Duration::from_millis(100)));
}

// ============================================================================
// Writing
// ============================================================================

#[tokio::test]
async fn test_write_publishes_after_payload() {
    let broker = MockBroker::new();
    let writer = writer(&broker, params(1));

    writer
        .write(&Record::with_payload(Bytes::from_static(b"{\"id\":1}")))
        .await
        .unwrap();

    let published = broker.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].subject, "orders.mirror");
    assert_eq!(published[0].payload, Bytes::from_static(b"{\"id\":1}"));
    assert_eq!(&published[0].options, writer.options());
    assert_eq!(published[0].options.len(), 2);
}

#[tokio::test]
async fn test_write_with_batch_size_is_not_implemented() {
    let broker = MockBroker::new();
    let writer = writer(&broker, params(5));

    for _ in 0..3 {
        let result = writer.write(&Record::with_payload("payload")).await;
        assert!(matches!(
            result,
            Err(WriteError::NotImplemented { batch_size: 5 })
        ));
    }

    assert!(broker.published().await.is_empty());
}

#[tokio::test]
async fn test_write_wraps_publish_failure() {
    let broker = MockBroker::new();
    broker.set_fail_on_publish(true).await;
    let writer = writer(&broker, params(1));

    let result = writer.write(&Record::with_payload("payload")).await;
    assert!(matches!(result, Err(WriteError::Publish(_))));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let broker = MockBroker::new();
    let writer = writer(&broker, params(1));

    writer.close().await.unwrap();
    writer.close().await.unwrap();

    assert_eq!(broker.close_count().await, 1);
}

#[tokio::test]
async fn test_write_after_close_fails() {
    let broker = MockBroker::new();
    let writer = writer(&broker, params(1));

    writer.close().await.unwrap();

    let result = writer.write(&Record::with_payload("late")).await;
    assert!(matches!(result, Err(WriteError::Publish(BrokerError::Closed))));
    assert!(broker.published().await.is_empty());
}
