//! Loopback end-to-end scenarios: two peer connections in one process
//! exchanging SDP and candidates in memory, with real ICE, DTLS and SCTP
//! underneath.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use rtcdc::{
    Configuration, DataChannel, DataChannelInit, DataChannelState, Message, PeerConnection,
    PeerConnectionState,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Forwards descriptions and candidates from `from` into `to`.
fn wire(from: &Arc<PeerConnection>, to: &Arc<PeerConnection>) {
    let (desc_tx, mut desc_rx) = mpsc::unbounded_channel();
    from.on_local_description(Box::new(move |description| {
        let desc_tx = desc_tx.clone();
        Box::pin(async move {
            let _ = desc_tx.send(description);
        })
    }));
    let target = Arc::clone(to);
    tokio::spawn(async move {
        while let Some(description) = desc_rx.recv().await {
            if let Err(e) = target.set_remote_description(description).await {
                log::warn!("loopback set_remote_description: {e}");
            }
        }
    });

    let (cand_tx, mut cand_rx) = mpsc::unbounded_channel();
    from.on_local_candidate(Box::new(move |candidate| {
        let cand_tx = cand_tx.clone();
        Box::pin(async move {
            let _ = cand_tx.send(candidate);
        })
    }));
    let target = Arc::clone(to);
    tokio::spawn(async move {
        while let Some(candidate) = cand_rx.recv().await {
            if let Err(e) = target.add_remote_candidate(candidate).await {
                log::warn!("loopback add_remote_candidate: {e}");
            }
        }
    });
}

fn watch_state(pc: &Arc<PeerConnection>) -> mpsc::UnboundedReceiver<PeerConnectionState> {
    let (state_tx, state_rx) = mpsc::unbounded_channel();
    pc.on_state_change(Box::new(move |state| {
        let state_tx = state_tx.clone();
        Box::pin(async move {
            let _ = state_tx.send(state);
        })
    }));
    state_rx
}

async fn wait_for_state(
    rx: &mut mpsc::UnboundedReceiver<PeerConnectionState>,
    wanted: PeerConnectionState,
) {
    let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
    loop {
        let state = timeout(deadline - tokio::time::Instant::now(), rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for state {wanted}"))
            .expect("state channel open");
        if state == wanted {
            return;
        }
        assert_ne!(
            state,
            PeerConnectionState::Failed,
            "connection failed while waiting for {wanted}"
        );
    }
}

fn collect_messages(channel: &Arc<DataChannel>) -> mpsc::UnboundedReceiver<Message> {
    let (message_tx, message_rx) = mpsc::unbounded_channel();
    channel.on_message(Box::new(move |message| {
        let message_tx = message_tx.clone();
        Box::pin(async move {
            let _ = message_tx.send(message);
        })
    }));
    message_rx
}

#[tokio::test]
async fn test_loopback_data_exchange() {
    let _ = env_logger::try_init();
    let _ = rustls::crypto::ring::default_provider().install_default();

    let a = PeerConnection::new(Configuration::default()).await.expect("a");
    let b = PeerConnection::new(Configuration::default()).await.expect("b");
    wire(&a, &b);
    wire(&b, &a);

    let mut a_states = watch_state(&a);
    let mut b_states = watch_state(&b);

    let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel::<Arc<DataChannel>>();
    b.on_data_channel(Box::new(move |channel| {
        let incoming_tx = incoming_tx.clone();
        Box::pin(async move {
            let _ = incoming_tx.send(channel);
        })
    }));

    // creating the channel kicks off negotiation
    let a_channel = a
        .create_data_channel("test", DataChannelInit::default())
        .await
        .expect("channel");

    wait_for_state(&mut a_states, PeerConnectionState::Connected).await;
    wait_for_state(&mut b_states, PeerConnectionState::Connected).await;

    let b_channel = timeout(CONNECT_TIMEOUT, incoming_rx.recv())
        .await
        .expect("incoming channel")
        .expect("channel open");
    assert_eq!(b_channel.label(), "test");

    let mut b_messages = collect_messages(&b_channel);
    let mut a_messages = collect_messages(&a_channel);

    // wait until the DCEP ACK opened A's side
    let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
    while !a_channel.is_open() {
        assert!(tokio::time::Instant::now() < deadline, "channel never opened");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    a_channel
        .send(Message::binary(Bytes::from_static(b"Hello from 1")))
        .await
        .expect("a send");
    let received = timeout(RECV_TIMEOUT, b_messages.recv())
        .await
        .expect("b message")
        .expect("channel open");
    assert_eq!(&received.data[..], b"Hello from 1");

    b_channel
        .send(Message::binary(Bytes::from_static(b"Hello from 2")))
        .await
        .expect("b send");
    let received = timeout(RECV_TIMEOUT, a_messages.recv())
        .await
        .expect("a message")
        .expect("channel open");
    assert_eq!(&received.data[..], b"Hello from 2");

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_precreated_channel_ids_repair_on_role_flip() {
    let _ = env_logger::try_init();
    let _ = rustls::crypto::ring::default_provider().install_default();

    // manual negotiation so all three channels exist before the offer
    let a = PeerConnection::new(Configuration {
        disable_auto_negotiation: true,
        ..Default::default()
    })
    .await
    .expect("a");
    let b = PeerConnection::new(Configuration::default()).await.expect("b");
    wire(&a, &b);
    wire(&b, &a);

    let mut a_states = watch_state(&a);

    let mut channels = Vec::new();
    for i in 0..3 {
        channels.push(
            a.create_data_channel(format!("ch{i}"), DataChannelInit::default())
                .await
                .expect("channel"),
        );
    }
    let ids: Vec<u16> = channels.iter().map(|c| c.stream_id()).collect();
    assert_eq!(ids, vec![0, 2, 4]);

    a.set_local_description(None).await.expect("offer");
    wait_for_state(&mut a_states, PeerConnectionState::Connected).await;

    // the answer made A the DTLS server, so ids re-paired odd
    let ids: Vec<u16> = channels.iter().map(|c| c.stream_id()).collect();
    assert_eq!(ids, vec![1, 3, 5]);
    for channel in &channels {
        assert_eq!(channel.stream_id() % 2, 1);
    }

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_ordered_delivery_and_buffered_amount_low() {
    let _ = env_logger::try_init();
    let _ = rustls::crypto::ring::default_provider().install_default();

    let a = PeerConnection::new(Configuration::default()).await.expect("a");
    let b = PeerConnection::new(Configuration::default()).await.expect("b");
    wire(&a, &b);
    wire(&b, &a);

    let mut a_states = watch_state(&a);

    let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel::<Arc<DataChannel>>();
    b.on_data_channel(Box::new(move |channel| {
        let incoming_tx = incoming_tx.clone();
        Box::pin(async move {
            let _ = incoming_tx.send(channel);
        })
    }));

    let a_channel = a
        .create_data_channel("flood", DataChannelInit::default())
        .await
        .expect("channel");
    a_channel.set_buffered_amount_low_threshold(16 * 1024).await;

    let (low_tx, mut low_rx) = mpsc::unbounded_channel::<()>();
    a_channel.on_buffered_amount_low(Box::new(move || {
        let low_tx = low_tx.clone();
        Box::pin(async move {
            let _ = low_tx.send(());
        })
    }));

    wait_for_state(&mut a_states, PeerConnectionState::Connected).await;
    let b_channel = timeout(CONNECT_TIMEOUT, incoming_rx.recv())
        .await
        .expect("incoming channel")
        .expect("channel open");
    let mut b_messages = collect_messages(&b_channel);

    let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
    while !a_channel.is_open() {
        assert!(tokio::time::Instant::now() < deadline, "channel never opened");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // 16 ordered reliable messages of 64 KiB; none may be dropped
    let payload_len = 64 * 1024usize;
    for i in 0..16u8 {
        let payload = vec![i; payload_len];
        a_channel
            .send(Message::binary(payload))
            .await
            .expect("send never drops");
    }

    for i in 0..16u8 {
        let received = timeout(RECV_TIMEOUT, b_messages.recv())
            .await
            .expect("message arrives")
            .expect("channel open");
        assert_eq!(received.len(), payload_len, "message {i} size");
        // in order with no gaps
        assert!(received.data.iter().all(|&byte| byte == i), "message {i} order");
    }

    // the queue drained below the threshold at least once
    timeout(RECV_TIMEOUT, low_rx.recv())
        .await
        .expect("buffered amount low fired")
        .expect("channel open");
    assert!(a_channel.buffered_amount().await <= 16 * 1024);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_stream_reset_closes_remote_channel() {
    let _ = env_logger::try_init();
    let _ = rustls::crypto::ring::default_provider().install_default();

    let a = PeerConnection::new(Configuration::default()).await.expect("a");
    let b = PeerConnection::new(Configuration::default()).await.expect("b");
    wire(&a, &b);
    wire(&b, &a);

    let mut a_states = watch_state(&a);

    let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel::<Arc<DataChannel>>();
    b.on_data_channel(Box::new(move |channel| {
        let incoming_tx = incoming_tx.clone();
        Box::pin(async move {
            let _ = incoming_tx.send(channel);
        })
    }));

    let a_channel = a
        .create_data_channel("closing", DataChannelInit::default())
        .await
        .expect("channel");

    wait_for_state(&mut a_states, PeerConnectionState::Connected).await;
    let b_channel = timeout(CONNECT_TIMEOUT, incoming_rx.recv())
        .await
        .expect("incoming channel")
        .expect("channel open");

    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<()>();
    b_channel.on_close(Box::new(move || {
        let closed_tx = closed_tx.clone();
        Box::pin(async move {
            let _ = closed_tx.send(());
        })
    }));

    a_channel.close().await.expect("close");

    timeout(RECV_TIMEOUT, closed_rx.recv())
        .await
        .expect("remote observed the reset")
        .expect("channel open");
    assert_eq!(b_channel.ready_state(), DataChannelState::Closed);

    // sending on the closed channel is a state error
    let result = b_channel.send(Message::binary(vec![1u8])).await;
    assert!(result.is_err());

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_fingerprint_mismatch_fails_connection() {
    let _ = env_logger::try_init();
    let _ = rustls::crypto::ring::default_provider().install_default();

    let a = PeerConnection::new(Configuration {
        disable_auto_negotiation: true,
        ..Default::default()
    })
    .await
    .expect("a");
    let b = PeerConnection::new(Configuration::default()).await.expect("b");

    // candidates still flow both ways; descriptions are tampered by hand
    let (cand_tx, mut cand_rx) = mpsc::unbounded_channel();
    a.on_local_candidate(Box::new(move |candidate| {
        let cand_tx = cand_tx.clone();
        Box::pin(async move {
            let _ = cand_tx.send(candidate);
        })
    }));
    let to_b = Arc::clone(&b);
    tokio::spawn(async move {
        while let Some(candidate) = cand_rx.recv().await {
            let _ = to_b.add_remote_candidate(candidate).await;
        }
    });
    let (cand_tx, mut cand_rx) = mpsc::unbounded_channel();
    b.on_local_candidate(Box::new(move |candidate| {
        let cand_tx = cand_tx.clone();
        Box::pin(async move {
            let _ = cand_tx.send(candidate);
        })
    }));
    let to_a = Arc::clone(&a);
    tokio::spawn(async move {
        while let Some(candidate) = cand_rx.recv().await {
            let _ = to_a.add_remote_candidate(candidate).await;
        }
    });

    let (b_desc_tx, mut b_desc_rx) = mpsc::unbounded_channel();
    b.on_local_description(Box::new(move |description| {
        let b_desc_tx = b_desc_tx.clone();
        Box::pin(async move {
            let _ = b_desc_tx.send(description);
        })
    }));

    let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel::<Arc<DataChannel>>();
    b.on_data_channel(Box::new(move |channel| {
        let incoming_tx = incoming_tx.clone();
        Box::pin(async move {
            let _ = incoming_tx.send(channel);
        })
    }));

    let mut b_states = watch_state(&b);

    a.create_data_channel("never", DataChannelInit::default())
        .await
        .expect("channel");
    let mut offer = a.set_local_description(None).await.expect("offer");

    // tamper with the announced fingerprint
    if let Some(fingerprint) = offer.fingerprint.as_mut() {
        let mut bytes: Vec<String> = fingerprint
            .value
            .split(':')
            .map(str::to_owned)
            .collect();
        bytes[0] = if bytes[0] == "00" { "FF".to_owned() } else { "00".to_owned() };
        fingerprint.value = bytes.join(":");
    }

    b.set_remote_description(offer).await.expect("tampered offer accepted at SDP level");
    let answer = timeout(CONNECT_TIMEOUT, b_desc_rx.recv())
        .await
        .expect("answer produced")
        .expect("channel open");
    a.set_remote_description(answer).await.expect("set answer");

    // DTLS must fail on B, and no data channel may ever open
    let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
    loop {
        let state = timeout(deadline - tokio::time::Instant::now(), b_states.recv())
            .await
            .expect("failed state before timeout")
            .expect("state channel open");
        match state {
            PeerConnectionState::Failed => break,
            PeerConnectionState::Connected => panic!("connected despite bad fingerprint"),
            _ => {}
        }
    }
    assert!(incoming_rx.try_recv().is_err());

    a.close().await;
    b.close().await;
}
