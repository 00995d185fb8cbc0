use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use deaddrop::connection::{
    memory_link, ChannelRendezvous, ConnectError, ConnectionConfig, ConnectionManager, Phase,
    TransportSession,
};
use deaddrop::crypto::derive_conversation_key;
use deaddrop::protocol::{seal_message, Frame, Message, MessageKind};

fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        ping_interval: Duration::from_millis(20),
        pong_timeout: Duration::from_millis(500),
    }
}

async fn wait_for_phase(conn: &ConnectionManager, want: Phase) {
    let mut rx = conn.subscribe_phase();
    timeout(Duration::from_secs(2), rx.wait_for(|phase| *phase == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {want:?}, still {:?}", conn.phase()))
        .expect("phase channel closed");
}

async fn expect_ping(far: &mut TransportSession) {
    let frame = timeout(Duration::from_secs(1), far.inbound.recv())
        .await
        .expect("no frame before timeout")
        .expect("transport closed");
    assert_eq!(frame, Frame::LivenessPing);
}

/// Receive frames until one matches, skipping heartbeat noise.
async fn expect_frame<F: Fn(&Frame) -> bool>(far: &mut TransportSession, matches: F) -> Frame {
    loop {
        let frame = timeout(Duration::from_secs(1), far.inbound.recv())
            .await
            .expect("no matching frame before timeout")
            .expect("transport closed");
        if matches(&frame) {
            return frame;
        }
    }
}

fn test_envelope(body: &str) -> Frame {
    let key = derive_conversation_key("secret", "AAAAAA", "BBBBBB");
    let message = Message::new("BBBBBB", "AAAAAA", MessageKind::Text, body, 1_700_000_000_000);
    let envelope = seal_message(&key, &message).expect("seal");
    Frame::Message { envelope }
}

#[tokio::test]
async fn connect_promotes_through_open_to_verified() {
    let rendezvous = Arc::new(ChannelRendezvous::new());
    let (conn, _frames_rx) = ConnectionManager::new("AAAAAA", rendezvous.clone(), fast_config());
    assert_eq!(conn.phase(), Phase::Disconnected);

    let (near, mut far) = memory_link();
    rendezvous.push_session(near).await;
    conn.connect_to_peer("BBBBBB").await.expect("connect");

    // An open socket alone is not a usable link.
    assert_eq!(conn.phase(), Phase::Open);
    assert_eq!(conn.peer_id().as_deref(), Some("BBBBBB"));

    expect_ping(&mut far).await;
    far.outbound.send(Frame::LivenessPong).await.expect("pong");
    wait_for_phase(&conn, Phase::Verified).await;
}

#[tokio::test]
async fn broker_failure_marks_broken_and_retry_recovers() {
    let rendezvous = Arc::new(ChannelRendezvous::new());
    let (conn, _frames_rx) = ConnectionManager::new("AAAAAA", rendezvous.clone(), fast_config());

    // Nothing queued at the rendezvous: the connect attempt fails.
    assert!(conn.connect_to_peer("BBBBBB").await.is_err());
    assert_eq!(conn.phase(), Phase::Broken);

    let (near, mut far) = memory_link();
    rendezvous.push_session(near).await;
    conn.retry_connection().await.expect("retry");
    expect_ping(&mut far).await;
    far.outbound.send(Frame::LivenessPong).await.expect("pong");
    wait_for_phase(&conn, Phase::Verified).await;
}

#[tokio::test]
async fn missed_liveness_replies_demote_to_broken() {
    let rendezvous = Arc::new(ChannelRendezvous::new());
    let config = ConnectionConfig {
        ping_interval: Duration::from_millis(20),
        pong_timeout: Duration::from_millis(60),
    };
    let (conn, _frames_rx) = ConnectionManager::new("AAAAAA", rendezvous.clone(), config);

    let (near, mut far) = memory_link();
    rendezvous.push_session(near).await;
    conn.connect_to_peer("BBBBBB").await.expect("connect");
    expect_ping(&mut far).await;
    far.outbound.send(Frame::LivenessPong).await.expect("pong");
    wait_for_phase(&conn, Phase::Verified).await;

    // Go silent; the heartbeat must notice without any close event.
    wait_for_phase(&conn, Phase::Broken).await;
}

#[tokio::test]
async fn transport_close_demotes_to_broken() {
    let rendezvous = Arc::new(ChannelRendezvous::new());
    let (conn, _frames_rx) = ConnectionManager::new("AAAAAA", rendezvous.clone(), fast_config());

    let (near, mut far) = memory_link();
    rendezvous.push_session(near).await;
    conn.connect_to_peer("BBBBBB").await.expect("connect");
    expect_ping(&mut far).await;
    far.outbound.send(Frame::LivenessPong).await.expect("pong");
    wait_for_phase(&conn, Phase::Verified).await;

    drop(far);
    wait_for_phase(&conn, Phase::Broken).await;
}

#[tokio::test]
async fn send_failure_demotes_to_broken() {
    let rendezvous = Arc::new(ChannelRendezvous::new());
    let config = ConnectionConfig {
        // Keep the heartbeat out of the way.
        ping_interval: Duration::from_secs(30),
        pong_timeout: Duration::from_secs(60),
    };
    let (conn, _frames_rx) = ConnectionManager::new("AAAAAA", rendezvous.clone(), config);

    let (near, far) = memory_link();
    rendezvous.push_session(near).await;
    conn.connect_to_peer("BBBBBB").await.expect("connect");

    let TransportSession {
        outbound: far_tx,
        inbound: far_rx,
    } = far;
    drop(far_rx); // the peer's read side is gone; writes must fail
    let _keep_inbound_open = far_tx;

    assert!(conn.send_frame(test_envelope("x")).await.is_err());
    wait_for_phase(&conn, Phase::Broken).await;
}

#[tokio::test]
async fn peer_pings_are_answered_and_frames_are_forwarded() {
    let rendezvous = Arc::new(ChannelRendezvous::new());
    let (conn, mut frames_rx) = ConnectionManager::new("AAAAAA", rendezvous.clone(), fast_config());

    let (near, mut far) = memory_link();
    rendezvous.push_session(near).await;
    conn.connect_to_peer("BBBBBB").await.expect("connect");
    expect_ping(&mut far).await;
    far.outbound.send(Frame::LivenessPong).await.expect("pong");
    wait_for_phase(&conn, Phase::Verified).await;

    far.outbound.send(Frame::LivenessPing).await.expect("ping");
    expect_frame(&mut far, |frame| *frame == Frame::LivenessPong).await;

    let envelope_frame = test_envelope("for the pipeline");
    far.outbound
        .send(envelope_frame.clone())
        .await
        .expect("send envelope");
    let forwarded = timeout(Duration::from_secs(1), frames_rx.recv())
        .await
        .expect("no forwarded frame")
        .expect("frames channel closed");
    assert_eq!(forwarded, envelope_frame);
}

#[tokio::test]
async fn unlink_is_terminal_until_a_new_connect() {
    let rendezvous = Arc::new(ChannelRendezvous::new());
    let (conn, _frames_rx) = ConnectionManager::new("AAAAAA", rendezvous.clone(), fast_config());

    let (near, mut far) = memory_link();
    rendezvous.push_session(near).await;
    conn.connect_to_peer("BBBBBB").await.expect("connect");
    expect_ping(&mut far).await;
    far.outbound.send(Frame::LivenessPong).await.expect("pong");
    wait_for_phase(&conn, Phase::Verified).await;

    conn.unlink();
    assert_eq!(conn.phase(), Phase::Disconnected);
    assert!(conn.peer_id().is_none());
    assert!(conn.send_frame(test_envelope("late")).await.is_err());
    assert!(matches!(
        conn.retry_connection().await,
        Err(ConnectError::NoPeer)
    ));

    // A late failure report from the dead session must not resurrect it.
    conn.notify_resumed();
    assert_eq!(conn.phase(), Phase::Disconnected);
}

#[tokio::test]
async fn resume_with_a_dead_session_forces_broken() {
    let rendezvous = Arc::new(ChannelRendezvous::new());
    let (conn, frames_rx) = ConnectionManager::new("AAAAAA", rendezvous.clone(), ConnectionConfig {
        ping_interval: Duration::from_secs(30),
        pong_timeout: Duration::from_secs(60),
    });
    // The pipeline is gone, as after the host app was backgrounded.
    drop(frames_rx);

    let (near, mut far) = memory_link();
    rendezvous.push_session(near).await;
    conn.connect_to_peer("BBBBBB").await.expect("connect");
    expect_ping(&mut far).await;
    far.outbound.send(Frame::LivenessPong).await.expect("pong");
    wait_for_phase(&conn, Phase::Verified).await;

    // Delivering a frame with no pipeline kills the session task silently.
    far.outbound
        .send(test_envelope("undeliverable"))
        .await
        .expect("send");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(conn.phase(), Phase::Verified, "silent death leaves a stale phase");

    conn.notify_resumed();
    assert_eq!(conn.phase(), Phase::Broken);
}
