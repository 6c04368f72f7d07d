use relay::{CallKind, Envelope, Relay, RelayConfig, RelayEvent, RoomEvent, RoomRole, SignalBody};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::info;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).try_init();
}

fn test_config() -> RelayConfig {
    RelayConfig { broker_host: "127.0.0.1".to_string(), broker_port: 1883, ..Default::default() }
}

async fn wait_connected(event_rx: &mut mpsc::UnboundedReceiver<RelayEvent>, who: &str) {
    loop {
        match timeout(Duration::from_secs(5), event_rx.recv()).await {
            Ok(Some(RelayEvent::Connected)) => {
                info!("{} connected", who);
                break;
            }
            Ok(Some(event)) => info!("{}: unrelated event: {:?}", who, event),
            Ok(None) => panic!("Channel closed unexpectedly"),
            Err(_) => panic!("Timed out waiting for {} to connect", who),
        }
    }
}

#[tokio::test]
#[ignore = "requires a local MQTT broker on 127.0.0.1:1883"]
async fn test_signal_round_trip() {
    init_tracing();

    let (caller, mut caller_rx) =
        Relay::connect("rt_caller".to_string(), test_config()).await.expect("caller connect");
    let (callee, mut callee_rx) =
        Relay::connect("rt_callee".to_string(), test_config()).await.expect("callee connect");

    wait_connected(&mut caller_rx, "caller").await;
    wait_connected(&mut callee_rx, "callee").await;

    let offer = Envelope {
        from: "rt_caller".to_string(),
        body: SignalBody::CallOffer { sdp: "offer_sdp".to_string(), media: CallKind::Voice },
    };
    caller.send_signal("rt_callee", &offer).await.expect("send offer");

    match timeout(Duration::from_secs(5), callee_rx.recv()).await {
        Ok(Some(RelayEvent::Signal(env))) => {
            assert_eq!(env, offer);
            info!("Callee received offer");
        }
        other => panic!("Callee didn't receive offer: {:?}", other),
    }

    let answer = Envelope {
        from: "rt_callee".to_string(),
        body: SignalBody::CallAnswer { sdp: "answer_sdp".to_string() },
    };
    callee.send_signal("rt_caller", &answer).await.expect("send answer");

    match timeout(Duration::from_secs(5), caller_rx.recv()).await {
        Ok(Some(RelayEvent::Signal(env))) => assert_eq!(env, answer),
        other => panic!("Caller didn't receive answer: {:?}", other),
    }
}

#[tokio::test]
#[ignore = "requires a local MQTT broker on 127.0.0.1:1883"]
async fn test_presence_and_room_events() {
    init_tracing();

    let (host, mut host_rx) =
        Relay::connect("rt_host".to_string(), test_config()).await.expect("host connect");
    let (viewer, mut viewer_rx) =
        Relay::connect("rt_viewer".to_string(), test_config()).await.expect("viewer connect");

    wait_connected(&mut host_rx, "host").await;
    wait_connected(&mut viewer_rx, "viewer").await;

    host.join_room("rt_host").await.expect("host join");
    viewer.join_room("rt_host").await.expect("viewer join");
    viewer
        .publish_room(
            "rt_host",
            &RoomEvent::Joined { id: "rt_viewer".to_string(), role: RoomRole::Viewer },
        )
        .await
        .expect("announce join");

    loop {
        match timeout(Duration::from_secs(5), host_rx.recv()).await {
            Ok(Some(RelayEvent::Room { room, event: RoomEvent::Joined { id, role } })) => {
                assert_eq!(room, "rt_host");
                assert_eq!(id, "rt_viewer");
                assert_eq!(role, RoomRole::Viewer);
                break;
            }
            Ok(Some(event)) => info!("host: unrelated event: {:?}", event),
            other => panic!("Host didn't see the viewer join: {:?}", other),
        }
    }

    // Offline detection via the Last Will.
    host.watch_peer_status("rt_viewer").await.expect("watch status");
    loop {
        match timeout(Duration::from_secs(5), host_rx.recv()).await {
            Ok(Some(RelayEvent::PeerOnline(id))) if id == "rt_viewer" => break,
            Ok(Some(event)) => info!("host: unrelated event: {:?}", event),
            other => panic!("Host didn't see viewer online: {:?}", other),
        }
    }
    drop(viewer);
    loop {
        match timeout(Duration::from_secs(10), host_rx.recv()).await {
            Ok(Some(RelayEvent::PeerOffline(id))) if id == "rt_viewer" => break,
            Ok(Some(event)) => info!("host: unrelated event: {:?}", event),
            other => panic!("Host didn't see viewer offline: {:?}", other),
        }
    }
}
