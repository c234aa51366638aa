use classroom_rtc::signaling::{MemoryConnector, MemoryListener, MemoryServerEnd, PongPayload};
use classroom_rtc::{
    CandidateInit, ChannelMessage, ChannelState, ClientEvent, ClientEventKind, Identity,
    MessageKind, SignalingClient, SignalingConfig, SignalingError,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn config() -> SignalingConfig {
    SignalingConfig {
        url: "http://relay.test/ws/signaling".into(),
        heartbeat_interval_ms: 1_000,
        pong_timeout_ms: 500,
        max_missed_heartbeats: 3,
        reconnect_base_delay_ms: 100,
        reconnect_max_delay_ms: 2_000,
        ..SignalingConfig::default()
    }
}

fn client_with(config: SignalingConfig) -> (SignalingClient, MemoryConnector, MemoryListener) {
    let (connector, listener) = MemoryConnector::new();
    let client = SignalingClient::with_connector(
        config,
        Identity::new("alice", "lecture-1"),
        Arc::new(connector.clone()),
    )
    .unwrap();
    (client, connector, listener)
}

fn offer(n: u32) -> ChannelMessage {
    ChannelMessage::Offer {
        sdp: format!("v=0 #{n}"),
        from: Some("alice".into()),
        to: Some("bob".into()),
    }
}

fn pong(timestamp: i64) -> ChannelMessage {
    ChannelMessage::Pong {
        payload: PongPayload {
            timestamp,
            server_time: Some(timestamp + 1),
        },
    }
}

fn reconnect_log(client: &SignalingClient) -> Arc<Mutex<Vec<(u32, Duration)>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    client.on(ClientEventKind::Reconnecting, move |event| {
        if let ClientEvent::Reconnecting { attempt, delay } = event {
            sink.lock().push((*attempt, *delay));
        }
        Ok(())
    });
    log
}

async fn expect_join(server: &mut MemoryServerEnd) {
    assert_eq!(
        server.recv().await,
        Some(ChannelMessage::JoinLecture {
            participant_id: "alice".into(),
            session_id: "lecture-1".into(),
        })
    );
}

#[tokio::test(start_paused = true)]
async fn queued_messages_follow_join_in_order() {
    let (client, _connector, mut listener) = client_with(config());

    client.send(&offer(1)).unwrap();
    client.send(&offer(2)).unwrap();
    assert_eq!(client.pending_len(), 2);

    let mut server = listener.accept().await.unwrap();
    expect_join(&mut server).await;
    assert_eq!(server.recv().await, Some(offer(1)));
    assert_eq!(server.recv().await, Some(offer(2)));

    assert_eq!(client.state(), ChannelState::Open);
    assert_eq!(client.pending_len(), 0);

    client.send(&offer(3)).unwrap();
    assert_eq!(server.recv().await, Some(offer(3)));
}

#[tokio::test(start_paused = true)]
async fn flushed_queue_survives_connection_lost_before_delivery() {
    let (client, connector, mut listener) = client_with(config());
    client.send(&offer(1)).unwrap();
    client.send(&offer(2)).unwrap();

    // relay пропал, не прочитав ни одного кадра
    drop(listener.accept().await.unwrap());

    let mut second = listener.accept().await.unwrap();
    expect_join(&mut second).await;
    assert_eq!(second.recv().await, Some(offer(1)));
    assert_eq!(second.recv().await, Some(offer(2)));
    assert_eq!(connector.attempts(), 2);
    assert_eq!(client.pending_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn send_on_dead_connection_is_delivered_after_reconnect() {
    let (client, _connector, mut listener) = client_with(config());
    client.connect();
    let mut first = listener.accept().await.unwrap();
    expect_join(&mut first).await;

    drop(first);
    client.send(&offer(7)).unwrap();

    let mut second = listener.accept().await.unwrap();
    expect_join(&mut second).await;
    assert_eq!(second.recv().await, Some(offer(7)));
}

#[tokio::test(start_paused = true)]
async fn frames_confirmed_by_pong_are_not_replayed() {
    let (client, _connector, mut listener) = client_with(config());
    client.connect();
    let mut first = listener.accept().await.unwrap();
    expect_join(&mut first).await;

    client.send(&offer(1)).unwrap();
    assert_eq!(first.recv().await, Some(offer(1)));
    let Some(ChannelMessage::Ping { payload }) = first.recv().await else {
        panic!("expected ping");
    };
    first.send(&pong(payload.timestamp));
    drop(first);

    let mut second = listener.accept().await.unwrap();
    expect_join(&mut second).await;
    // следующий ping только через heartbeat interval
    assert!(timeout(Duration::from_millis(500), second.recv()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn full_queue_drops_oldest() {
    let (client, connector, mut listener) = client_with(SignalingConfig {
        max_pending_messages: 2,
        ..config()
    });
    connector.set_refusing(true);

    for n in 1..=3 {
        client.send(&offer(n)).unwrap();
    }
    assert_eq!(client.pending_len(), 2);

    connector.set_refusing(false);
    let mut server = listener.accept().await.unwrap();
    expect_join(&mut server).await;
    assert_eq!(server.recv().await, Some(offer(2)));
    assert_eq!(server.recv().await, Some(offer(3)));
}

#[tokio::test(start_paused = true)]
async fn missed_heartbeats_force_reconnect() {
    let (client, connector, mut listener) = client_with(config());
    let reconnects = reconnect_log(&client);
    client.connect();

    let mut first = listener.accept().await.unwrap();
    expect_join(&mut first).await;
    for _ in 0..3 {
        assert!(matches!(first.recv().await, Some(ChannelMessage::Ping { .. })));
    }
    // прежнее соединение закрыто до новой попытки
    assert_eq!(first.recv().await, None);

    let mut second = listener.accept().await.unwrap();
    expect_join(&mut second).await;

    assert_eq!(*reconnects.lock(), vec![(1, Duration::from_millis(100))]);
    assert_eq!(connector.attempts(), 2);
    assert_eq!(client.reconnect_attempts(), 0);
    assert_eq!(client.state(), ChannelState::Open);
    assert_eq!(client.identity(), &Identity::new("alice", "lecture-1"));
}

#[tokio::test(start_paused = true)]
async fn pongs_keep_channel_open() {
    let (client, connector, mut listener) = client_with(config());
    let reconnects = reconnect_log(&client);
    client.connect();

    let mut server = listener.accept().await.unwrap();
    expect_join(&mut server).await;
    for _ in 0..6 {
        let Some(ChannelMessage::Ping { payload }) = server.recv().await else {
            panic!("expected ping");
        };
        server.send(&pong(payload.timestamp));
    }

    assert_eq!(client.state(), ChannelState::Open);
    assert_eq!(connector.attempts(), 1);
    assert!(reconnects.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn backoff_grows_while_relay_refuses() {
    let (client, connector, _listener) = client_with(config());
    let reconnects = reconnect_log(&client);
    connector.set_refusing(true);
    client.connect();

    sleep(Duration::from_secs(20)).await;

    let log = reconnects.lock().clone();
    assert!(log.len() >= 6, "only {} reconnects", log.len());
    let delays: Vec<Duration> = log.iter().map(|(_, d)| *d).collect();
    for pair in delays.windows(2) {
        assert!(pair[1] > pair[0] || pair[1] == Duration::from_millis(2_000));
    }
    assert_eq!(delays[0], Duration::from_millis(100));
    assert_eq!(delays[5], Duration::from_millis(2_000));
    assert_eq!(
        log.iter().map(|(a, _)| *a).take(4).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
    // каждая отклонённая попытка планирует следующую
    assert_eq!(connector.attempts(), log.len());
    assert_eq!(client.state(), ChannelState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_stops_reconnection() {
    let (client, connector, mut listener) = client_with(config());
    let reconnects = reconnect_log(&client);
    client.connect();

    let mut server = listener.accept().await.unwrap();
    expect_join(&mut server).await;

    client.disconnect();
    assert_eq!(client.state(), ChannelState::Closed);
    assert_eq!(server.recv().await, None);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.attempts(), 1);
    assert!(reconnects.lock().is_empty());
    assert_eq!(client.send(&offer(1)), Err(SignalingError::ChannelClosed));
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_backoff_cancels_retry() {
    let (client, connector, _listener) = client_with(config());
    connector.set_refusing(true);
    client.connect();

    sleep(Duration::from_millis(50)).await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(client.state(), ChannelState::Disconnected);

    client.disconnect();
    sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(client.state(), ChannelState::Closed);
}

#[tokio::test(start_paused = true)]
async fn connect_after_disconnect_reopens() {
    let (client, connector, mut listener) = client_with(config());
    client.connect();
    let mut first = listener.accept().await.unwrap();
    expect_join(&mut first).await;

    client.disconnect();
    client.connect();
    let mut second = listener.accept().await.unwrap();
    // новая эпоха подключается только после закрытия прежнего соединения
    assert!(first.is_closed());
    expect_join(&mut second).await;
    assert_eq!(connector.attempts(), 2);
    assert_eq!(client.state(), ChannelState::Open);
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_dropped() {
    let (client, connector, mut listener) = client_with(config());
    let (tx, mut joined) = mpsc::unbounded_channel();
    client.on(MessageKind::PeerJoined, move |event| {
        if let ClientEvent::Message(ChannelMessage::PeerJoined { participant_id }) = event {
            tx.send(participant_id.clone())?;
        }
        Ok(())
    });
    client.connect();

    let mut server = listener.accept().await.unwrap();
    expect_join(&mut server).await;
    server.send_raw("not json at all");
    server.send_raw(r#"{"type":"mystery","payload":1}"#);
    server.send_raw(r#"{"type":"candidate","candidate":"oops"}"#);
    server.send(&ChannelMessage::PeerJoined {
        participant_id: "bob".into(),
    });

    assert_eq!(joined.recv().await.as_deref(), Some("bob"));
    assert_eq!(client.state(), ChannelState::Open);
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn relay_ping_is_answered() {
    let (client, _connector, mut listener) = client_with(config());
    client.connect();

    let mut server = listener.accept().await.unwrap();
    expect_join(&mut server).await;
    server.send(&ChannelMessage::ping(42));

    let Some(ChannelMessage::Pong { payload }) = server.recv().await else {
        panic!("expected pong");
    };
    assert_eq!(payload.timestamp, 42);
}

#[tokio::test(start_paused = true)]
async fn listeners_see_messages_in_order_and_in_isolation() {
    let (client, _connector, mut listener) = client_with(config());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let s = Arc::clone(&seen);
    client.on(MessageKind::Candidate, move |_| {
        s.lock().push("first");
        Ok(())
    });
    client.on(MessageKind::Candidate, |_| Err("listener failure".into()));
    let s = Arc::clone(&seen);
    let (tx, mut done) = mpsc::unbounded_channel();
    let last = client.on(MessageKind::Candidate, move |_| {
        s.lock().push("last");
        tx.send(())?;
        Ok(())
    });
    client.connect();

    let mut server = listener.accept().await.unwrap();
    expect_join(&mut server).await;
    server.send(&ChannelMessage::Candidate {
        candidate: CandidateInit {
            candidate: "candidate:1 1 udp 2130706431 192.0.2.10 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        },
        from: Some("bob".into()),
        to: Some("alice".into()),
    });
    done.recv().await.unwrap();
    assert_eq!(*seen.lock(), vec!["first", "last"]);

    assert!(client.off(MessageKind::Candidate, last));
    assert!(!client.off(MessageKind::Candidate, last));
}
