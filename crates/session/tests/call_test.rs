use relay::{CallKind, Envelope, SignalBody};
use session::{
    CallEvent, CallManager, CallState, CaptureError, EndReason, LocalMedia, MediaCapture, Outbound,
    SampleCapture, SessionConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,webrtc=off,webrtc_sctp=off,webrtc_ice=off")
        .try_init();
}

/// Capture that always refuses, as a user denying the permission prompt.
struct DenyCapture;

impl MediaCapture for DenyCapture {
    fn acquire(&self, _kind: CallKind) -> Result<LocalMedia, CaptureError> {
        Err(CaptureError::PermissionDenied)
    }
}

/// Counts acquisitions so tests can assert media was never touched.
#[derive(Default)]
struct CountingCapture {
    acquired: AtomicUsize,
}

impl MediaCapture for CountingCapture {
    fn acquire(&self, kind: CallKind) -> Result<LocalMedia, CaptureError> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        SampleCapture.acquire(kind)
    }
}

async fn recv_matching(
    rx: &mut mpsc::UnboundedReceiver<Outbound>,
    mut pred: impl FnMut(&Outbound) -> bool,
) -> Outbound {
    loop {
        let out = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for outbound")
            .expect("outbound channel closed");
        if pred(&out) {
            return out;
        }
    }
}

async fn recv_event(rx: &mut mpsc::UnboundedReceiver<CallEvent>) -> CallEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for call event")
        .expect("event channel closed")
}

/// Drives `start_call` through the presence wait and returns the offer SDP.
async fn dial(
    caller: &Arc<CallManager>,
    caller_out: &mut mpsc::UnboundedReceiver<Outbound>,
    remote_id: &str,
    kind: CallKind,
) -> String {
    let c = Arc::clone(caller);
    let remote = remote_id.to_string();
    let dialing = tokio::spawn(async move { c.start_call(&remote, kind).await });

    recv_matching(caller_out, |o| matches!(o, Outbound::WatchStatus { .. })).await;
    caller.handle_peer_online(remote_id.to_string()).await;
    dialing.await.expect("dial task panicked").expect("start_call failed");

    let offer = recv_matching(caller_out, |o| {
        matches!(
            o,
            Outbound::Signal { envelope: Envelope { body: SignalBody::CallOffer { .. }, .. }, .. }
        )
    })
    .await;
    match offer {
        Outbound::Signal { to, envelope: Envelope { body: SignalBody::CallOffer { sdp, media }, .. } } => {
            assert_eq!(to, remote_id);
            assert_eq!(media, kind);
            sdp
        }
        other => panic!("expected call offer, got {:?}", other),
    }
}

async fn recv_signal_body(
    rx: &mut mpsc::UnboundedReceiver<Outbound>,
    mut pred: impl FnMut(&SignalBody) -> bool,
) -> (String, SignalBody) {
    loop {
        match recv_matching(rx, |o| matches!(o, Outbound::Signal { .. })).await {
            Outbound::Signal { to, envelope: Envelope { body, .. } } if pred(&body) => {
                return (to, body)
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_video_call_reaches_active_on_both_sides() {
    init_tracing();

    let (caller, mut caller_ev, mut caller_out) =
        CallManager::start("alice".to_string(), SessionConfig::default(), Arc::new(SampleCapture));
    let (callee, mut callee_ev, mut callee_out) =
        CallManager::start("bob".to_string(), SessionConfig::default(), Arc::new(SampleCapture));

    let offer_sdp = dial(&caller, &mut caller_out, "bob", CallKind::Video).await;
    assert_eq!(caller.state().await, CallState::OutgoingRinging);
    assert!(matches!(recv_event(&mut caller_ev).await, CallEvent::OutgoingRinging { .. }));

    callee
        .handle_signal(Envelope {
            from: "alice".to_string(),
            body: SignalBody::CallOffer { sdp: offer_sdp, media: CallKind::Video },
        })
        .await;
    assert_eq!(callee.state().await, CallState::IncomingRinging);
    match recv_event(&mut callee_ev).await {
        CallEvent::IncomingCall { from, kind } => {
            assert_eq!(from, "alice");
            assert_eq!(kind, CallKind::Video);
        }
        other => panic!("expected incoming call, got {:?}", other),
    }

    callee.accept_call().await.expect("accept failed");
    assert_eq!(callee.state().await, CallState::Active);
    match recv_event(&mut callee_ev).await {
        CallEvent::Activated { remote_id, media_unavailable } => {
            assert_eq!(remote_id, "alice");
            assert!(!media_unavailable);
        }
        other => panic!("expected activation, got {:?}", other),
    }

    let (to, body) =
        recv_signal_body(&mut callee_out, |b| matches!(b, SignalBody::CallAnswer { .. })).await;
    assert_eq!(to, "alice");
    caller.handle_signal(Envelope { from: "bob".to_string(), body }).await;
    assert_eq!(caller.state().await, CallState::Active);
    assert!(matches!(recv_event(&mut caller_ev).await, CallEvent::Activated { .. }));
}

#[tokio::test]
async fn test_reject_returns_caller_to_idle_without_callee_media() {
    init_tracing();

    let (caller, _caller_ev, mut caller_out) =
        CallManager::start("alice".to_string(), SessionConfig::default(), Arc::new(SampleCapture));
    let counting = Arc::new(CountingCapture::default());
    let (callee, mut callee_ev, mut callee_out) = CallManager::start(
        "bob".to_string(),
        SessionConfig::default(),
        Arc::clone(&counting) as Arc<dyn MediaCapture>,
    );

    let offer_sdp = dial(&caller, &mut caller_out, "bob", CallKind::Voice).await;
    callee
        .handle_signal(Envelope {
            from: "alice".to_string(),
            body: SignalBody::CallOffer { sdp: offer_sdp, media: CallKind::Voice },
        })
        .await;
    let _ = recv_event(&mut callee_ev).await;

    callee.reject_call().await.expect("reject failed");
    assert_eq!(callee.state().await, CallState::Idle);
    assert_eq!(counting.acquired.load(Ordering::SeqCst), 0);
    match recv_event(&mut callee_ev).await {
        CallEvent::Ended { reason, .. } => assert_eq!(reason, EndReason::Declined),
        other => panic!("expected end event, got {:?}", other),
    }

    let (to, _) = recv_signal_body(&mut callee_out, |b| matches!(b, SignalBody::CallEnd)).await;
    assert_eq!(to, "alice");
    caller.handle_signal(Envelope { from: "bob".to_string(), body: SignalBody::CallEnd }).await;
    assert_eq!(caller.state().await, CallState::Idle);
}

#[tokio::test]
async fn test_permission_denial_still_activates_marked_degraded() {
    init_tracing();

    // Denied on the caller side: the call is still announced.
    let (caller, _caller_ev, mut caller_out) =
        CallManager::start("alice".to_string(), SessionConfig::default(), Arc::new(DenyCapture));
    let offer_sdp = dial(&caller, &mut caller_out, "bob", CallKind::Video).await;
    assert_eq!(caller.state().await, CallState::OutgoingRinging);

    // Denied on the callee side: accept still reaches Active, flagged.
    let (callee, mut callee_ev, _callee_out) =
        CallManager::start("bob".to_string(), SessionConfig::default(), Arc::new(DenyCapture));
    callee
        .handle_signal(Envelope {
            from: "alice".to_string(),
            body: SignalBody::CallOffer { sdp: offer_sdp, media: CallKind::Video },
        })
        .await;
    let _ = recv_event(&mut callee_ev).await;
    callee.accept_call().await.expect("degraded accept failed");
    assert_eq!(callee.state().await, CallState::Active);
    match recv_event(&mut callee_ev).await {
        CallEvent::Activated { media_unavailable, .. } => assert!(media_unavailable),
        other => panic!("expected activation, got {:?}", other),
    }
}

#[tokio::test]
async fn test_hangup_cleanup_is_idempotent() {
    init_tracing();

    let (caller, mut caller_ev, mut caller_out) =
        CallManager::start("alice".to_string(), SessionConfig::default(), Arc::new(SampleCapture));
    let _ = dial(&caller, &mut caller_out, "bob", CallKind::Voice).await;
    let _ = recv_event(&mut caller_ev).await; // OutgoingRinging

    caller.hang_up().await;
    assert_eq!(caller.state().await, CallState::Idle);
    match recv_event(&mut caller_ev).await {
        CallEvent::Ended { reason, .. } => assert_eq!(reason, EndReason::LocalHangup),
        other => panic!("expected end event, got {:?}", other),
    }

    // Second and third invocations find the slot idle and do nothing.
    caller.hang_up().await;
    caller.hang_up().await;
    assert_eq!(caller.state().await, CallState::Idle);
    assert!(caller_ev.try_recv().is_err(), "cleanup must not emit a second end event");
}

#[tokio::test]
async fn test_remote_hangup_forces_active_call_idle() {
    init_tracing();

    let (caller, mut caller_ev, mut caller_out) =
        CallManager::start("alice".to_string(), SessionConfig::default(), Arc::new(SampleCapture));
    let (callee, mut callee_ev, mut callee_out) =
        CallManager::start("bob".to_string(), SessionConfig::default(), Arc::new(SampleCapture));

    let offer_sdp = dial(&caller, &mut caller_out, "bob", CallKind::Voice).await;
    callee
        .handle_signal(Envelope {
            from: "alice".to_string(),
            body: SignalBody::CallOffer { sdp: offer_sdp, media: CallKind::Voice },
        })
        .await;
    let _ = recv_event(&mut callee_ev).await;
    callee.accept_call().await.expect("accept failed");
    let (_, body) =
        recv_signal_body(&mut callee_out, |b| matches!(b, SignalBody::CallAnswer { .. })).await;
    caller.handle_signal(Envelope { from: "bob".to_string(), body }).await;
    assert_eq!(caller.state().await, CallState::Active);

    caller.handle_signal(Envelope { from: "bob".to_string(), body: SignalBody::CallEnd }).await;
    assert_eq!(caller.state().await, CallState::Idle);
    loop {
        match recv_event(&mut caller_ev).await {
            CallEvent::Ended { reason, .. } => {
                assert_eq!(reason, EndReason::RemoteHangup);
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_stale_candidate_after_teardown_is_a_noop() {
    init_tracing();

    let (caller, _caller_ev, mut caller_out) =
        CallManager::start("alice".to_string(), SessionConfig::default(), Arc::new(SampleCapture));
    let _ = dial(&caller, &mut caller_out, "bob", CallKind::Voice).await;
    caller.hang_up().await;

    caller
        .handle_signal(Envelope {
            from: "bob".to_string(),
            body: SignalBody::Candidate { candidate: "candidate:1 1 udp 2130706431 198.51.100.7 3478 typ host".to_string() },
        })
        .await;
    assert_eq!(caller.state().await, CallState::Idle);

    // A candidate with no call at all is equally harmless.
    caller
        .handle_signal(Envelope {
            from: "carol".to_string(),
            body: SignalBody::Candidate { candidate: "garbage".to_string() },
        })
        .await;
    assert_eq!(caller.state().await, CallState::Idle);
}

#[tokio::test]
async fn test_unanswered_call_times_out() {
    init_tracing();

    let config = SessionConfig { ring_timeout: Duration::from_millis(200), ..Default::default() };
    let (caller, mut caller_ev, mut caller_out) =
        CallManager::start("alice".to_string(), config, Arc::new(SampleCapture));
    let _ = dial(&caller, &mut caller_out, "bob", CallKind::Voice).await;

    loop {
        match recv_event(&mut caller_ev).await {
            CallEvent::Ended { reason, .. } => {
                assert_eq!(reason, EndReason::RingTimeout);
                break;
            }
            _ => continue,
        }
    }
    assert_eq!(caller.state().await, CallState::Idle);

    // The remote side is told the call is over.
    let (to, _) = recv_signal_body(&mut caller_out, |b| matches!(b, SignalBody::CallEnd)).await;
    assert_eq!(to, "bob");
}

#[tokio::test]
async fn test_second_offer_while_busy_is_declined() {
    init_tracing();

    let (callee, mut callee_ev, mut callee_out) =
        CallManager::start("bob".to_string(), SessionConfig::default(), Arc::new(SampleCapture));
    let (caller, _caller_ev, mut caller_out) =
        CallManager::start("alice".to_string(), SessionConfig::default(), Arc::new(SampleCapture));

    let offer_sdp = dial(&caller, &mut caller_out, "bob", CallKind::Voice).await;
    callee
        .handle_signal(Envelope {
            from: "alice".to_string(),
            body: SignalBody::CallOffer { sdp: offer_sdp.clone(), media: CallKind::Voice },
        })
        .await;
    let _ = recv_event(&mut callee_ev).await;

    callee
        .handle_signal(Envelope {
            from: "carol".to_string(),
            body: SignalBody::CallOffer { sdp: offer_sdp, media: CallKind::Voice },
        })
        .await;

    let (to, _) = recv_signal_body(&mut callee_out, |b| matches!(b, SignalBody::CallEnd)).await;
    assert_eq!(to, "carol");
    assert_eq!(callee.state().await, CallState::IncomingRinging);
}

#[tokio::test]
async fn test_peer_offline_ends_call() {
    init_tracing();

    let (caller, mut caller_ev, mut caller_out) =
        CallManager::start("alice".to_string(), SessionConfig::default(), Arc::new(SampleCapture));
    let _ = dial(&caller, &mut caller_out, "bob", CallKind::Voice).await;

    caller.handle_peer_offline("bob".to_string()).await;
    assert_eq!(caller.state().await, CallState::Idle);
    loop {
        match recv_event(&mut caller_ev).await {
            CallEvent::Ended { reason, .. } => {
                assert_eq!(reason, EndReason::PeerOffline);
                break;
            }
            _ => continue,
        }
    }
}
