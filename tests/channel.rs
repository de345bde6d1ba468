// Integration tests for the broadcast channel.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use overseer::channel::BroadcastChannel;
use overseer::error::ChannelError;

// ── Helpers ─────────────────────────────────────────────────────────

fn channel() -> BroadcastChannel<u32> {
    BroadcastChannel::new("test")
}

async fn read_now(channel: &BroadcastChannel<u32>, id: Uuid) -> Result<u32, ChannelError> {
    let cancel = CancellationToken::new();
    tokio::time::timeout(Duration::from_secs(1), channel.read(id, &cancel))
        .await
        .expect("read should not block when items are pending")
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn every_subscriber_sees_items_in_publish_order() {
    let channel = channel();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    channel.subscribe(first);
    channel.subscribe(second);

    for item in [1, 2, 3] {
        channel.publish(item);
    }

    for id in [first, second] {
        assert_eq!(read_now(&channel, id).await.unwrap(), 1);
        assert_eq!(read_now(&channel, id).await.unwrap(), 2);
        assert_eq!(read_now(&channel, id).await.unwrap(), 3);
    }
}

#[tokio::test]
async fn late_subscriber_only_sees_later_items() {
    let channel = channel();
    let early = Uuid::new_v4();
    channel.subscribe(early);
    channel.publish(1);

    let late = Uuid::new_v4();
    channel.subscribe(late);
    channel.publish(2);

    assert_eq!(read_now(&channel, late).await.unwrap(), 2);
    assert_eq!(read_now(&channel, early).await.unwrap(), 1);
    assert_eq!(read_now(&channel, early).await.unwrap(), 2);
}

#[tokio::test]
async fn publish_without_subscribers_is_discarded() {
    let channel = channel();
    channel.publish(1);
    assert_eq!(channel.retained(), 0);

    let id = Uuid::new_v4();
    assert_eq!(channel.try_read(id).unwrap(), None);
}

#[tokio::test]
async fn subscribe_twice_keeps_position() {
    let channel = channel();
    let id = Uuid::new_v4();
    channel.subscribe(id);
    channel.publish(7);
    channel.subscribe(id);

    assert_eq!(channel.subscriber_count(), 1);
    assert_eq!(channel.try_read(id).unwrap(), Some(7));
}

#[tokio::test]
async fn slow_subscriber_holds_items_until_read() {
    let channel = channel();
    let fast = Uuid::new_v4();
    let slow = Uuid::new_v4();
    channel.subscribe(fast);
    channel.subscribe(slow);

    channel.publish(1);
    channel.publish(2);
    assert_eq!(channel.try_read(fast).unwrap(), Some(1));
    assert_eq!(channel.try_read(fast).unwrap(), Some(2));
    assert_eq!(channel.retained(), 2);

    assert_eq!(channel.try_read(slow).unwrap(), Some(1));
    assert_eq!(channel.retained(), 1);
    assert_eq!(channel.try_read(slow).unwrap(), Some(2));
    assert_eq!(channel.retained(), 0);
}

#[tokio::test]
async fn unsubscribe_releases_retained_items() {
    let channel = channel();
    let reader = Uuid::new_v4();
    let idle = Uuid::new_v4();
    channel.subscribe(reader);
    channel.subscribe(idle);

    channel.publish(1);
    channel.publish(2);
    channel.try_read(reader).unwrap();
    channel.try_read(reader).unwrap();
    assert_eq!(channel.retained(), 2);

    channel.unsubscribe(idle);
    assert_eq!(channel.retained(), 0);
    assert_eq!(channel.subscriber_count(), 1);
}

#[tokio::test]
async fn read_waits_for_publish() {
    let channel = channel();
    let id = Uuid::new_v4();
    channel.subscribe(id);

    let publisher = channel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.publish(42);
    });

    let cancel = CancellationToken::new();
    let item = tokio::time::timeout(Duration::from_secs(2), channel.read(id, &cancel))
        .await
        .expect("publish should wake the reader");
    assert_eq!(item.unwrap(), 42);
}

#[tokio::test]
async fn read_returns_cancelled_when_token_fires() {
    let channel = channel();
    let id = Uuid::new_v4();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(2), channel.read(id, &cancel))
        .await
        .expect("cancellation should end the read");
    assert!(matches!(result, Err(ChannelError::Cancelled)));
}

#[tokio::test]
async fn close_fails_pending_and_future_reads() {
    let channel = channel();
    let id = Uuid::new_v4();
    channel.subscribe(id);

    let waiting = {
        let channel = channel.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            channel.read(id, &cancel).await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    channel.close();
    let pending = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .expect("close should wake the reader")
        .unwrap();
    assert!(matches!(pending, Err(ChannelError::Closed)));

    channel.publish(1);
    assert!(channel.is_closed());
    assert!(matches!(channel.try_read(id), Err(ChannelError::Closed)));
    assert!(matches!(read_now(&channel, Uuid::new_v4()).await, Err(ChannelError::Closed)));
}
