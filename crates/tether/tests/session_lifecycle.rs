use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use test_timeout::session_test;
use tether::frame::{read_header, start_frame, Decoder, MessageType};
use tether::journal::{encode_update, JournalDocument, JournalProtocol};
use tether::transport::memory::{MemoryConnector, MemoryListener, MemoryPeer};
use tether::{
    ConnectionManager, ConnectionManagerBuilder, ConnectionStatus, Origin, SessionConfig, SessionPhase,
    StatusEvent, SyncProtocol, Synced,
};
use tokio::time::Instant;

type Log = Arc<Mutex<Vec<&'static str>>>;

struct Fixture {
    doc: Arc<JournalDocument>,
    manager: ConnectionManager<JournalProtocol>,
    listener: MemoryListener,
    log: Log,
}

fn start(config: SessionConfig) -> Fixture {
    start_with(config, |builder| builder)
}

fn start_with(
    config: SessionConfig,
    customize: impl FnOnce(ConnectionManagerBuilder<JournalProtocol>) -> ConnectionManagerBuilder<JournalProtocol>,
) -> Fixture {
    let doc = Arc::new(JournalDocument::new());
    let (connector, listener) = MemoryConnector::new();
    let builder = ConnectionManager::builder(Arc::clone(&doc), JournalProtocol, connector).config(config);
    let manager = customize(builder).build();
    let log = record(&manager);
    Fixture {
        doc,
        manager,
        listener,
        log,
    }
}

fn record(manager: &ConnectionManager<JournalProtocol>) -> Log {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let status_log = Arc::clone(&log);
    manager.on_status(move |event: &StatusEvent| {
        status_log.lock().push(match event.status {
            ConnectionStatus::Connected => "status:connected",
            ConnectionStatus::Disconnected => "status:disconnected",
        })
    });
    let synced_log = Arc::clone(&log);
    manager.on_synced(move |_: &Synced| synced_log.lock().push("synced"));
    log
}

/// Lets the pump and timer tasks run without advancing the clock.
async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// The peer's side of one sync frame: applies it to `remote` and returns the
/// reply frame.
fn answer(remote: &JournalDocument, frame: &[u8]) -> Vec<u8> {
    let mut decoder = Decoder::new(frame);
    assert_eq!(read_header(&mut decoder, None), Ok(MessageType::Sync));
    let (mut reply, _) = start_frame(None, MessageType::Sync);
    JournalProtocol
        .read_message(remote, &mut decoder, &mut reply, Origin::Local)
        .expect("peer decodes frame");
    reply
}

async fn open_and_sync(peer: &mut MemoryPeer, remote: &JournalDocument) {
    peer.open();
    let step1 = peer.recv().await.expect("handshake step 1");
    peer.deliver(answer(remote, &step1));
}

fn assert_delay(actual: Duration, expected_ms: f64) {
    let actual_ms = actual.as_secs_f64() * 1000.0;
    assert!(
        (actual_ms - expected_ms).abs() < 2.0,
        "expected ~{expected_ms:.1}ms, got {actual_ms:.1}ms"
    );
}

#[session_test(timeout = 10, start_paused)]
async fn handshake_emits_connected_then_synced() {
    let mut fx = start(SessionConfig::default());
    let remote = JournalDocument::new();
    remote.append("hello");

    let mut peer = fx.listener.accept().await.expect("first attempt");
    assert_eq!(fx.manager.phase(), SessionPhase::Connecting);
    open_and_sync(&mut peer, &remote).await;
    fx.manager.wait_synced().await;

    assert_eq!(*fx.log.lock(), vec!["status:connected", "synced"]);
    assert_eq!(fx.manager.phase(), SessionPhase::Synced);
    assert_eq!(fx.doc.entries(), remote.entries());
}

#[session_test(timeout = 10, start_paused)]
async fn vetoed_close_stops_reconnecting() {
    let mut fx = start_with(SessionConfig::default(), |builder| builder.should_reconnect(|_| false));

    let mut peer = fx.listener.accept().await.expect("first attempt");
    peer.open();
    let _ = peer.recv().await;
    peer.close(Some(1000), "bye");
    settle().await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(*fx.log.lock(), vec!["status:connected", "status:disconnected"]);
    assert_eq!(fx.listener.attempts(), 1);
    assert!(fx.listener.try_accept().is_none());
    assert_eq!(fx.manager.phase(), SessionPhase::Disconnected);
}

#[session_test(timeout = 10, start_paused)]
async fn veto_on_failed_first_attempt_announces_disconnected() {
    let mut fx = start_with(SessionConfig::default(), |builder| builder.should_reconnect(|_| false));

    let peer = fx.listener.accept().await.expect("first attempt");
    peer.fail("refused");
    settle().await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(*fx.log.lock(), vec!["status:disconnected"]);
    assert_eq!(fx.listener.attempts(), 1);
    assert_eq!(fx.manager.phase(), SessionPhase::Disconnected);
}

#[session_test(timeout = 10, start_paused)]
async fn veto_during_retry_loop_announces_final_disconnected() {
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closes);
    let mut fx = start_with(SessionConfig::default(), move |builder| {
        builder.should_reconnect(move |_| counter.fetch_add(1, Ordering::SeqCst) < 2)
    });

    let mut peer = fx.listener.accept().await.expect("first attempt");
    peer.open();
    let _ = peer.recv().await;
    peer.close(Some(1006), "abnormal");
    let retry = fx.listener.accept().await.expect("allowed retry");
    retry.fail("still down");
    let last = fx.listener.accept().await.expect("second retry");
    last.fail("still down");
    settle().await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(closes.load(Ordering::SeqCst), 3);
    assert_eq!(fx.listener.attempts(), 3);
    assert_eq!(
        *fx.log.lock(),
        vec!["status:connected", "status:disconnected", "status:disconnected"]
    );
}

#[session_test(timeout = 10, start_paused)]
async fn failed_opens_back_off_logarithmically() {
    let started = Instant::now();
    let mut fx = start(SessionConfig::default());

    let mut attempt_times = Vec::new();
    for _ in 0..3 {
        let peer = fx.listener.accept().await.expect("attempt");
        attempt_times.push(started.elapsed());
        peer.fail("connection refused");
    }
    let _fourth = fx.listener.accept().await.expect("fourth attempt");
    attempt_times.push(started.elapsed());

    let delays: Vec<Duration> = attempt_times.windows(2).map(|pair| pair[1] - pair[0]).collect();
    assert_delay(delays[0], 0.0);
    assert_delay(delays[1], 1200.0 * 2f64.log10());
    assert_delay(delays[2], 1200.0 * 3f64.log10());

    assert_eq!(fx.manager.snapshot().unsuccessful_reconnects, 3);
    // Never connected, so nothing to announce.
    assert!(fx.log.lock().is_empty());
}

#[session_test(timeout = 10, start_paused)]
async fn disconnected_is_announced_once_across_failed_attempts() {
    let mut fx = start(SessionConfig::default());

    let mut peer = fx.listener.accept().await.expect("first attempt");
    peer.open();
    let _ = peer.recv().await;
    peer.close(Some(1006), "abnormal");

    for _ in 0..4 {
        let retry = fx.listener.accept().await.expect("retry");
        retry.fail("still down");
    }
    settle().await;

    assert_eq!(*fx.log.lock(), vec!["status:connected", "status:disconnected"]);
}

#[session_test(timeout = 10, start_paused)]
async fn dropped_session_reconnects_and_resyncs() {
    let mut fx = start(SessionConfig::default());
    let remote = JournalDocument::new();
    remote.append("a");

    let mut first = fx.listener.accept().await.expect("first attempt");
    open_and_sync(&mut first, &remote).await;
    fx.manager.wait_synced().await;

    first.close(Some(1006), "network lost");
    remote.append("b");
    let mut second = fx.listener.accept().await.expect("reconnect attempt");
    assert!(!fx.manager.is_synced());
    open_and_sync(&mut second, &remote).await;
    fx.manager.wait_synced().await;

    assert_eq!(
        *fx.log.lock(),
        vec![
            "status:connected",
            "synced",
            "status:disconnected",
            "status:connected",
            "synced",
        ]
    );
    assert_eq!(fx.doc.entries(), remote.entries());
    assert_eq!(fx.manager.snapshot().unsuccessful_reconnects, 0);
}

#[session_test(timeout = 10, start_paused)]
async fn malformed_frame_keeps_session_synced() {
    let mut fx = start(SessionConfig::default());
    let mut peer = fx.listener.accept().await.expect("first attempt");
    open_and_sync(&mut peer, &JournalDocument::new()).await;
    fx.manager.wait_synced().await;

    peer.deliver(Bytes::from_static(&[0, 7, 1]));
    settle().await;

    assert_eq!(fx.doc.errors().len(), 1);
    assert!(fx.manager.is_synced());
    assert!(!peer.is_closed());
    assert_eq!(*fx.log.lock(), vec!["status:connected", "synced"]);
}

#[session_test(timeout = 10, start_paused)]
async fn destroy_cancels_pending_reconnect() {
    let mut fx = start(SessionConfig::default());
    for _ in 0..2 {
        let peer = fx.listener.accept().await.expect("attempt");
        peer.fail("refused");
    }
    settle().await;

    fx.manager.destroy();
    fx.manager.destroy();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(fx.listener.attempts(), 2);
    assert!(fx.listener.try_accept().is_none());
    assert_eq!(fx.manager.phase(), SessionPhase::Disconnected);
}

#[session_test(timeout = 10, start_paused)]
async fn destroy_closes_channel_and_stops_resync() {
    let mut fx = start(SessionConfig::default().with_resync_interval(Duration::from_secs(1)));
    let mut peer = fx.listener.accept().await.expect("first attempt");
    peer.open();
    let _ = peer.recv().await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(peer.drain().len(), 1, "one periodic resync");

    fx.manager.destroy();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(peer.is_closed());
    assert!(peer.drain().is_empty());
    assert_eq!(fx.listener.attempts(), 1);
    assert_eq!(*fx.log.lock(), vec!["status:connected", "status:disconnected"]);
}

#[session_test(timeout = 10, start_paused)]
async fn manual_disconnect_and_connect() {
    let mut fx = start(SessionConfig::default());
    let mut first = fx.listener.accept().await.expect("first attempt");
    first.open();
    let _ = first.recv().await;

    fx.manager.disconnect();
    settle().await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(first.is_closed());
    assert_eq!(fx.manager.phase(), SessionPhase::Disconnected);
    assert_eq!(fx.listener.attempts(), 1);

    fx.manager.connect();
    let second = fx.listener.accept().await.expect("resumed attempt");
    // Notices from the superseded channel are ignored.
    first.deliver(Bytes::from_static(&[9, 9]));
    second.open();
    settle().await;

    assert!(fx.manager.is_connected());
    assert!(fx.doc.errors().is_empty());
    assert_eq!(
        *fx.log.lock(),
        vec!["status:connected", "status:disconnected", "status:connected"]
    );
}

#[session_test(timeout = 10, start_paused)]
async fn silent_channel_is_recycled_by_watchdog() {
    let mut fx = start(SessionConfig::default().with_message_timeout(Duration::from_secs(1)));
    let mut peer = fx.listener.accept().await.expect("first attempt");
    peer.open();
    let _ = peer.recv().await;

    let _replacement = fx.listener.accept().await.expect("attempt after watchdog close");

    assert!(peer.is_closed());
    assert_eq!(*fx.log.lock(), vec!["status:connected", "status:disconnected"]);
}

#[session_test(timeout = 10, start_paused)]
async fn local_updates_reach_peer_and_side_channel() {
    let side: Arc<Mutex<Vec<(bool, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&side);
    let mut fx = start_with(SessionConfig::default(), move |builder| {
        builder.on_broadcast(move |snapshot, bytes| sink.lock().push((snapshot.connected, bytes.to_vec())))
    });
    let mut peer = fx.listener.accept().await.expect("first attempt");
    open_and_sync(&mut peer, &JournalDocument::new()).await;
    fx.manager.wait_synced().await;

    let (mut remote_update, _) = start_frame(None, MessageType::Sync);
    JournalProtocol.write_update(&encode_update(0, b"theirs"), &mut remote_update);
    peer.deliver(remote_update);
    settle().await;
    fx.doc.append("ours");
    let sent = peer.recv().await.expect("local update");

    let (mut expected, _) = start_frame(None, MessageType::Sync);
    JournalProtocol.write_update(&encode_update(1, b"ours"), &mut expected);
    assert_eq!(&sent[..], &expected[..]);
    assert!(peer.try_recv().is_none(), "remote update is not echoed");
    assert_eq!(*side.lock(), vec![(true, expected)]);
}

#[session_test(timeout = 10, start_paused)]
async fn document_destruction_tears_down_manager() {
    let mut fx = start(SessionConfig::default());
    let mut peer = fx.listener.accept().await.expect("first attempt");
    peer.open();
    let _ = peer.recv().await;

    fx.doc.destroy();
    settle().await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(fx.manager.is_destroyed());
    assert!(peer.is_closed());
    assert_eq!(fx.listener.attempts(), 1);
}
