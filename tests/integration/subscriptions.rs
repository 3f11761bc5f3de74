// Subscription-path coverage: name rewriting, ack bookkeeping, message and
// pattern dispatch, local timers, and initialization edge cases.

mod support;

use keywatch::{Config, Error, Reply, Topic};
use support::*;
use tokio::io::AsyncWriteExt;

const MYKEY: &str = "__keyspace@0__:mykey";

#[tokio::test]
async fn subscribe_rewrites_names_and_swallows_the_ack() {
    let (client, _command, mut subscription, _server) = default_client().await;
    let (handler, mut rx) = capture();
    client.subscribe(["mykey"], handler).unwrap();

    expect_wire(&mut subscription, &command_frame(&["subscribe", MYKEY])).await;
    subscription
        .write_all(&ack_frame("subscribe", MYKEY, 1))
        .await
        .unwrap();
    subscription
        .write_all(&message_frame(MYKEY, "set"))
        .await
        .unwrap();

    // The ack was swallowed; the first delivery is the rewritten event.
    assert_eq!(recv(&mut rx).await, Ok(array(vec![s("mykey"), s("set")])));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn ack_is_delivered_when_not_ignored() {
    let (client, _command, mut subscription, _server) = connected_client(|path| {
        let mut config = Config::new(path);
        config.ignore_sub_ack = false;
        config
    })
    .await;

    let (handler, mut rx) = capture();
    client.subscribe(["mykey"], handler).unwrap();
    expect_wire(&mut subscription, &command_frame(&["subscribe", MYKEY])).await;
    subscription
        .write_all(&ack_frame("subscribe", MYKEY, 1))
        .await
        .unwrap();

    assert_eq!(
        recv(&mut rx).await,
        Ok(array(vec![s("mykey"), Reply::Integer(1)]))
    );
}

#[tokio::test]
async fn notification_event_names_map_to_keyevent_channels() {
    let (client, _command, mut subscription, _server) = default_client().await;
    let (handler, mut rx) = capture();
    client.subscribe(["del"], handler).unwrap();

    let channel = "__keyevent@0__:del";
    expect_wire(&mut subscription, &command_frame(&["subscribe", channel])).await;
    subscription
        .write_all(&ack_frame("subscribe", channel, 1))
        .await
        .unwrap();
    subscription
        .write_all(&message_frame(channel, "mykey"))
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await, Ok(array(vec![s("del"), s("mykey")])));
}

#[tokio::test]
async fn timer_only_subscription_fires_without_touching_the_wire() {
    let (client, _command, mut subscription, _server) = default_client().await;
    let (handler, mut rx) = capture();
    client.subscribe([Topic::from(25u64)], handler).unwrap();

    for _ in 0..2 {
        match recv(&mut rx).await {
            Ok(Reply::Array(items)) => {
                assert_eq!(items[0], s("timer"));
                assert_eq!(items[1], Reply::Integer(25));
                assert!(matches!(items[2], Reply::Integer(n) if n >= 0));
            }
            other => panic!("expected timer event, got {other:?}"),
        }
    }
    expect_silence(&mut subscription).await;
}

#[tokio::test]
async fn mixed_subscription_starts_its_timer_on_the_ack() {
    let (client, _command, mut subscription, _server) = default_client().await;
    let (handler, mut rx) = capture();
    client
        .subscribe(vec![Topic::from("mykey"), Topic::from(25u64)], handler)
        .unwrap();

    // Only the name goes on the wire; the timer stays local.
    expect_wire(&mut subscription, &command_frame(&["subscribe", MYKEY])).await;

    // Before the ack nothing is initialized and no timer runs.
    tokio::time::sleep(std::time::Duration::from_millis(120)).await;
    assert!(rx.try_recv().is_err());

    subscription
        .write_all(&ack_frame("subscribe", MYKEY, 1))
        .await
        .unwrap();

    match recv(&mut rx).await {
        Ok(Reply::Array(items)) => {
            assert_eq!(items[0], s("timer"));
            assert_eq!(items[1], Reply::Integer(25));
        }
        other => panic!("expected timer event, got {other:?}"),
    }
}

#[tokio::test]
async fn events_before_initialization_deliver_the_distinguished_error() {
    let (client, _command, mut subscription, _server) = default_client().await;
    let (handler, mut rx) = capture();
    client.subscribe(["alpha", "beta"], handler).unwrap();

    let alpha = "__keyspace@0__:alpha";
    let beta = "__keyspace@0__:beta";
    expect_wire(
        &mut subscription,
        &command_frame(&["subscribe", alpha, beta]),
    )
    .await;

    // Ack only the first channel, then push an event on it.
    subscription
        .write_all(&ack_frame("subscribe", alpha, 1))
        .await
        .unwrap();
    subscription
        .write_all(&message_frame(alpha, "set"))
        .await
        .unwrap();
    assert_eq!(recv(&mut rx).await, Err(Error::NotInitialized));

    // Complete the handshake; deliveries turn into real events.
    subscription
        .write_all(&ack_frame("subscribe", beta, 2))
        .await
        .unwrap();
    subscription
        .write_all(&message_frame(alpha, "del"))
        .await
        .unwrap();
    assert_eq!(recv(&mut rx).await, Ok(array(vec![s("alpha"), s("del")])));
}

#[tokio::test]
async fn patterns_live_in_their_own_registry() {
    let (client, _command, mut subscription, _server) = default_client().await;
    let (handler, mut rx) = capture();
    let pattern = "__keyspace@0__:sensor:*";
    client
        .command(["psubscribe", pattern], Some(handler))
        .unwrap();

    expect_wire(&mut subscription, &command_frame(&["psubscribe", pattern])).await;
    subscription
        .write_all(&ack_frame("psubscribe", pattern, 1))
        .await
        .unwrap();
    subscription
        .write_all(&pmessage_frame(
            pattern,
            "__keyspace@0__:sensor:42",
            "set",
        ))
        .await
        .unwrap();

    assert_eq!(
        recv(&mut rx).await,
        Ok(array(vec![s("sensor:*"), s("sensor:42"), s("set")]))
    );
}

#[tokio::test]
async fn unsubscribe_confirmations_are_ignored() {
    let (client, _command, mut subscription, _server) = default_client().await;
    let (handler, mut rx) = capture();
    client.subscribe(["mykey"], handler).unwrap();

    expect_wire(&mut subscription, &command_frame(&["subscribe", MYKEY])).await;
    subscription
        .write_all(&ack_frame("subscribe", MYKEY, 1))
        .await
        .unwrap();
    subscription
        .write_all(&ack_frame("unsubscribe", MYKEY, 0))
        .await
        .unwrap();
    subscription
        .write_all(&message_frame(MYKEY, "expire"))
        .await
        .unwrap();

    // The unsubscribe confirmation produced nothing; the record survived.
    assert_eq!(recv(&mut rx).await, Ok(array(vec![s("mykey"), s("expire")])));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn same_channel_records_initialize_and_dispatch_in_subscribe_order() {
    let (client, _command, mut subscription, _server) = default_client().await;
    let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

    for tag in ["first", "second"] {
        let order = std::sync::Arc::clone(&order);
        let done_tx = done_tx.clone();
        client
            .subscribe(
                ["mykey"],
                Box::new(move |result| {
                    if result.is_ok() {
                        order.lock().unwrap().push(tag);
                        let _ = done_tx.send(());
                    }
                }),
            )
            .unwrap();
        expect_wire(&mut subscription, &command_frame(&["subscribe", MYKEY])).await;
    }

    // One ack per record: the first initializes the first record, the
    // second the second.
    for count in 1..=2 {
        subscription
            .write_all(&ack_frame("subscribe", MYKEY, count))
            .await
            .unwrap();
    }
    subscription
        .write_all(&message_frame(MYKEY, "set"))
        .await
        .unwrap();

    for _ in 0..2 {
        tokio::time::timeout(RECV_TIMEOUT, done_rx.recv())
            .await
            .expect("delivery within timeout")
            .expect("handler ran");
    }
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
}
