//! End-to-end tests: producer -> embedded channel -> consumer loop -> blob sink.

mod common;

use common::{FlakySink, RunningWorker, TestFixture, SUBSCRIPTION, TABLE};
use serde_json::{Map, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

use tributary::event::{EventRecord, NewEvent};
use tributary::observability::ConsumerStatus;
use tributary::producer::AnalyticsOutcome;
use tributary::sink::{processed_key, BlobSink};

fn click(button: &str) -> NewEvent {
    let mut payload = Map::new();
    payload.insert("button".to_string(), Value::String(button.to_string()));
    NewEvent::new("click", payload).with_user("u-1")
}

async fn wait_for_backlog(channel: &tributary::channel::SqliteChannel, expected: u64) -> bool {
    for _ in 0..200 {
        if channel.backlog(SUBSCRIPTION).await.ok() == Some(expected) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_events_flow_to_blob_sink_and_warehouse() {
    let fixture = TestFixture::new();
    let channel = fixture.open_channel().await;
    let producer = fixture.producer(Arc::clone(&channel));

    // Published before any worker is running; the subscription retains them.
    let mut receipts = Vec::new();
    for button in ["signup", "login", "logout"] {
        let receipt = assert_ok!(producer.submit(click(button)).await);
        assert_eq!(receipt.analytics, AnalyticsOutcome::Stored);
        receipts.push(receipt);
    }
    assert!(wait_for_backlog(&channel, 3).await);

    let sink = Arc::new(fixture.sink());
    let worker = RunningWorker::start(Arc::clone(&channel), sink.clone(), 2);
    let register = Arc::clone(&worker.register);
    assert!(
        common::wait_for(Duration::from_secs(5), || {
            register.snapshot().total_processed == 3
        })
        .await
    );

    for receipt in &receipts {
        let bytes = sink
            .get(&processed_key(&receipt.delivery_id))
            .await
            .unwrap()
            .expect("blob missing for delivery");
        let record = EventRecord::from_wire(&bytes).unwrap();
        assert_eq!(record.event_id, receipt.event_id);
        assert_eq!(record.event_type, "click");
        assert_eq!(record.user_id.as_deref(), Some("u-1"));
    }
    assert_eq!(sink.list("processed").await.unwrap().len(), 3);
    assert!(wait_for_backlog(&channel, 0).await);

    let recent = producer.analytics().recent_events(TABLE, 10).await.unwrap();
    assert_eq!(recent.len(), 3);

    assert_ok!(worker.stop().await);
    let snapshot = register.snapshot();
    assert_eq!(snapshot.status, ConsumerStatus::Stopped);
    assert_eq!(snapshot.total_errors, 0);
    assert!(snapshot.last_message_time.is_some());

    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_sink_failure_is_redelivered_and_written_once() {
    let fixture = TestFixture::new();
    let channel = fixture.open_channel().await;
    let producer = fixture.producer(Arc::clone(&channel));

    let sink = Arc::new(FlakySink::new(fixture.sink(), 1));
    let worker = RunningWorker::start(Arc::clone(&channel), sink.clone(), 1);
    let register = Arc::clone(&worker.register);

    let receipt = producer.submit(click("retry")).await.unwrap();

    assert!(
        common::wait_for(Duration::from_secs(5), || {
            register.snapshot().total_processed == 1
        })
        .await
    );
    let snapshot = register.snapshot();
    assert_eq!(snapshot.total_errors, 1);
    assert_eq!(sink.puts.load(Ordering::SeqCst), 2);

    let keys = fixture.sink().list("processed").await.unwrap();
    assert_eq!(keys, vec![processed_key(&receipt.delivery_id)]);
    assert!(wait_for_backlog(&channel, 0).await);

    assert_ok!(worker.stop().await);
    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_unprocessed_events_survive_restart() {
    let fixture = TestFixture::new();

    let delivery_id = {
        let channel = fixture.open_channel().await;
        let producer = fixture.producer(Arc::clone(&channel));
        let receipt = producer.submit(click("durable")).await.unwrap();
        channel.close().await.unwrap();
        receipt.delivery_id
    };

    let channel = fixture.open_channel().await;
    assert!(wait_for_backlog(&channel, 1).await);

    let sink = Arc::new(fixture.sink());
    let worker = RunningWorker::start(Arc::clone(&channel), sink.clone(), 1);
    let register = Arc::clone(&worker.register);
    assert!(
        common::wait_for(Duration::from_secs(5), || {
            register.snapshot().total_processed == 1
        })
        .await
    );
    assert!(sink.get(&processed_key(&delivery_id)).await.unwrap().is_some());

    assert_ok!(worker.stop().await);
    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_payload_is_nacked_not_written() {
    use std::collections::HashMap;
    use tributary::channel::DurableChannel;

    let fixture = TestFixture::new();
    let channel = fixture.open_channel().await;
    channel
        .publish(common::TOPIC, b"not json".to_vec(), HashMap::new())
        .await
        .unwrap();

    let sink = Arc::new(fixture.sink());
    let worker = RunningWorker::start(Arc::clone(&channel), sink.clone(), 1);
    let register = Arc::clone(&worker.register);
    assert!(
        common::wait_for(Duration::from_secs(5), || {
            register.snapshot().total_errors >= 2
        })
        .await
    );

    let snapshot = register.snapshot();
    assert_eq!(snapshot.total_processed, 0);
    assert!(sink.list("processed").await.unwrap().is_empty());
    // Still owed to the subscription.
    assert_eq!(channel.backlog(SUBSCRIPTION).await.unwrap(), 1);

    assert_ok!(worker.stop().await);
    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_closing_channel_fails_the_worker() {
    let fixture = TestFixture::new();
    let channel = fixture.open_channel().await;

    let worker = RunningWorker::start(Arc::clone(&channel), Arc::new(fixture.sink()), 1);
    let register = Arc::clone(&worker.register);
    tokio::time::sleep(Duration::from_millis(50)).await;

    channel.close().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), worker.task)
        .await
        .expect("worker did not stop")
        .expect("consumer task panicked");
    assert!(result.is_err());
    assert_eq!(register.status(), ConsumerStatus::Error);
}
