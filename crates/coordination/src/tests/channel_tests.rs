use super::*;
use shared::domain::{ActionId, ConversationId};
use tokio::sync::mpsc as test_mpsc;

struct TestLink {
    inbound_tx: mpsc::Sender<String>,
    outbound_rx: mpsc::Receiver<String>,
}

struct ScriptedTransport {
    link_tx: test_mpsc::Sender<TestLink>,
}

#[async_trait]
impl ChannelTransport for ScriptedTransport {
    async fn open(&self, _url: &str) -> Result<TransportLink> {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        self.link_tx
            .send(TestLink {
                inbound_tx: in_tx,
                outbound_rx: out_rx,
            })
            .await
            .map_err(|_| anyhow!("test dropped the link receiver"))?;
        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

struct FailingTransport;

#[async_trait]
impl ChannelTransport for FailingTransport {
    async fn open(&self, _url: &str) -> Result<TransportLink> {
        Err(anyhow!("transport refused"))
    }
}

fn scripted() -> (Arc<ScriptedTransport>, test_mpsc::Receiver<TestLink>) {
    let (link_tx, link_rx) = test_mpsc::channel(8);
    (Arc::new(ScriptedTransport { link_tx }), link_rx)
}

fn fast_config() -> ChannelConfig {
    ChannelConfig {
        outbound_queue: 8,
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(10),
    }
}

async fn next_link(link_rx: &mut test_mpsc::Receiver<TestLink>) -> TestLink {
    tokio::time::timeout(Duration::from_secs(2), link_rx.recv())
        .await
        .expect("timed out waiting for transport open")
        .expect("transport closed")
}

async fn next_status(statuses: &mut broadcast::Receiver<ChannelStatus>) -> ChannelStatus {
    tokio::time::timeout(Duration::from_secs(2), statuses.recv())
        .await
        .expect("timed out waiting for status")
        .expect("status stream closed")
}

fn thinking_frame(is_thinking: bool) -> String {
    serde_json::to_string(&ServerEvent::Thinking { is_thinking }).expect("encode frame")
}

#[tokio::test]
async fn registering_same_handler_pair_twice_delivers_once() {
    let (transport, mut link_rx) = scripted();
    let channel = EventChannel::new("ws://test/ws", fast_config(), transport);
    let (seen_tx, mut seen_rx) = test_mpsc::channel::<()>(8);

    let tx = seen_tx.clone();
    channel.on(
        EventKind::Thinking,
        "ui",
        Arc::new(move |_| {
            let _ = tx.try_send(());
        }),
    );
    let tx = seen_tx.clone();
    channel.on(
        EventKind::Thinking,
        "ui",
        Arc::new(move |_| {
            let _ = tx.try_send(());
        }),
    );

    channel.connect();
    let link = next_link(&mut link_rx).await;
    link.inbound_tx
        .send(thinking_frame(true))
        .await
        .expect("feed frame");

    tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
        .await
        .expect("handler never invoked");
    let second = tokio::time::timeout(Duration::from_millis(100), seen_rx.recv()).await;
    assert!(second.is_err(), "handler invoked more than once");
}

#[tokio::test]
async fn off_unregisters_the_handler() {
    let (transport, mut link_rx) = scripted();
    let channel = EventChannel::new("ws://test/ws", fast_config(), transport);
    let (seen_tx, mut seen_rx) = test_mpsc::channel::<()>(8);

    // Keep `seen_tx` alive in the test scope: dropping the handler must not
    // close the channel, or the recv below would resolve instead of timing
    // out.
    let handler_tx = seen_tx.clone();
    channel.on(
        EventKind::Thinking,
        "ui",
        Arc::new(move |_| {
            let _ = handler_tx.try_send(());
        }),
    );
    channel.off(EventKind::Thinking, "ui");
    // Removing an absent pair is a no-op.
    channel.off(EventKind::Thinking, "ui");

    channel.connect();
    let link = next_link(&mut link_rx).await;
    link.inbound_tx
        .send(thinking_frame(true))
        .await
        .expect("feed frame");

    let delivered = tokio::time::timeout(Duration::from_millis(100), seen_rx.recv()).await;
    assert!(delivered.is_err(), "handler invoked after off");
}

#[tokio::test]
async fn send_before_connect_is_queued_and_flushed() {
    let (transport, mut link_rx) = scripted();
    let channel = EventChannel::new("ws://test/ws", fast_config(), transport);

    channel
        .send(&ClientRequest::UserMessage {
            message: "hello".into(),
            conversation_id: ConversationId::new("c1"),
        })
        .expect("queue before connect");

    channel.connect();
    let mut link = next_link(&mut link_rx).await;
    let frame = tokio::time::timeout(Duration::from_secs(2), link.outbound_rx.recv())
        .await
        .expect("no flushed frame")
        .expect("outbound closed");
    let request: ClientRequest = serde_json::from_str(&frame).expect("decode frame");
    assert!(matches!(request, ClientRequest::UserMessage { message, .. } if message == "hello"));
}

#[tokio::test]
async fn send_fails_fast_when_queue_is_full() {
    let (transport, _link_rx) = scripted();
    let config = ChannelConfig {
        outbound_queue: 1,
        ..fast_config()
    };
    let channel = EventChannel::new("ws://test/ws", config, transport);
    let request = ClientRequest::UserRequestUndo {
        action_id: ActionId::new("a1"),
    };

    channel.send(&request).expect("first frame queued");
    let err = channel.send(&request).expect_err("queue should be full");
    assert!(matches!(err, ChannelError::QueueFull { capacity: 1 }));
}

#[tokio::test]
async fn send_after_dispose_fails_fast() {
    let (transport, _link_rx) = scripted();
    let channel = EventChannel::new("ws://test/ws", fast_config(), transport);
    channel.dispose();

    let err = channel
        .send(&ClientRequest::UserRequestUndo {
            action_id: ActionId::new("a1"),
        })
        .expect_err("disposed channel must reject sends");
    assert!(matches!(err, ChannelError::Disposed));
}

#[tokio::test]
async fn decode_failure_is_surfaced_and_does_not_stop_dispatch() {
    let (transport, mut link_rx) = scripted();
    let channel = EventChannel::new("ws://test/ws", fast_config(), transport);
    let mut failures = channel.subscribe_decode_failures();
    let (seen_tx, mut seen_rx) = test_mpsc::channel::<()>(8);

    channel.on(
        EventKind::Thinking,
        "ui",
        Arc::new(move |_| {
            let _ = seen_tx.try_send(());
        }),
    );
    channel.connect();
    let link = next_link(&mut link_rx).await;

    link.inbound_tx
        .send("{\"type\":\"unknown_event\",\"payload\":{}}".into())
        .await
        .expect("feed garbage");
    link.inbound_tx
        .send(thinking_frame(true))
        .await
        .expect("feed valid frame");

    tokio::time::timeout(Duration::from_secs(2), failures.recv())
        .await
        .expect("decode failure not surfaced")
        .expect("failure stream closed");
    tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
        .await
        .expect("valid frame not dispatched after decode failure");
}

#[tokio::test]
async fn events_dispatch_in_arrival_order() {
    let (transport, mut link_rx) = scripted();
    let channel = EventChannel::new("ws://test/ws", fast_config(), transport);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, mut done_rx) = test_mpsc::channel::<()>(8);

    let sink = Arc::clone(&seen);
    channel.on(
        EventKind::Token,
        "ui",
        Arc::new(move |event| {
            if let ServerEvent::Token { content } = event {
                sink.lock().push(content.clone());
                let _ = done_tx.try_send(());
            }
        }),
    );
    channel.connect();
    let link = next_link(&mut link_rx).await;

    for content in ["one", "two", "three"] {
        let frame = serde_json::to_string(&ServerEvent::Token {
            content: content.into(),
        })
        .expect("encode");
        link.inbound_tx.send(frame).await.expect("feed frame");
    }
    for _ in 0..3 {
        tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
            .await
            .expect("token not dispatched");
    }
    assert_eq!(*seen.lock(), vec!["one", "two", "three"]);
}

#[tokio::test]
async fn reconnects_after_transport_loss() {
    let (transport, mut link_rx) = scripted();
    let channel = EventChannel::new("ws://test/ws", fast_config(), transport);
    let mut statuses = channel.subscribe_status();
    let (seen_tx, mut seen_rx) = test_mpsc::channel::<()>(8);

    channel.on(
        EventKind::Thinking,
        "ui",
        Arc::new(move |_| {
            let _ = seen_tx.try_send(());
        }),
    );
    channel.connect();

    assert_eq!(next_status(&mut statuses).await, ChannelStatus::Connecting);
    let first = next_link(&mut link_rx).await;
    assert_eq!(next_status(&mut statuses).await, ChannelStatus::Connected);

    drop(first);
    assert_eq!(
        next_status(&mut statuses).await,
        ChannelStatus::Reconnecting { attempt: 1 }
    );

    let second = next_link(&mut link_rx).await;
    assert_eq!(next_status(&mut statuses).await, ChannelStatus::Connected);
    second
        .inbound_tx
        .send(thinking_frame(true))
        .await
        .expect("feed frame on second connection");
    tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
        .await
        .expect("dispatch dead after reconnect");
}

#[tokio::test]
async fn failed_connects_back_off_with_increasing_attempts() {
    let channel = EventChannel::new("ws://test/ws", fast_config(), Arc::new(FailingTransport));
    let mut statuses = channel.subscribe_status();
    channel.connect();

    assert_eq!(next_status(&mut statuses).await, ChannelStatus::Connecting);
    assert_eq!(
        next_status(&mut statuses).await,
        ChannelStatus::Reconnecting { attempt: 1 }
    );
    assert_eq!(
        next_status(&mut statuses).await,
        ChannelStatus::Reconnecting { attempt: 2 }
    );
    channel.dispose();
}

#[test]
fn backoff_delay_doubles_and_caps() {
    let config = ChannelConfig {
        outbound_queue: 8,
        backoff_base: Duration::from_millis(500),
        backoff_cap: Duration::from_secs(4),
    };
    assert_eq!(backoff_delay(&config, 1), Duration::from_millis(500));
    assert_eq!(backoff_delay(&config, 2), Duration::from_secs(1));
    assert_eq!(backoff_delay(&config, 3), Duration::from_secs(2));
    assert_eq!(backoff_delay(&config, 4), Duration::from_secs(4));
    assert_eq!(backoff_delay(&config, 10), Duration::from_secs(4));
}
