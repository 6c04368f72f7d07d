use crate::chat::ChatLog;
use crate::config::SessionConfig;
use crate::link::{LinkEvent, PeerLink};
use crate::outbound::{deliver, Outbound};
use anyhow::{anyhow, Result};
use relay::{ChatMessage, Envelope, Relay, RelayConfig, RelayEvent, RoomEvent, RoomRole, SignalBody};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone)]
pub enum ViewerEvent {
    /// The room join was announced (only after the relay confirmed the
    /// connection).
    Joined,
    /// First remote track arrived; the stream is watchable.
    Live { kind: String },
    ViewerCount { count: u32 },
    Chat { message: ChatMessage },
    /// The host ended the stream (or the connection died). No reconnection
    /// is attempted.
    StreamEnded,
}

/// Joins one host's broadcast as a receiver with an outbound chat channel.
///
/// The peer connection and its handlers are prepared up front; the room
/// join is gated on the relay's connection confirmation — announcing before
/// the relay is up would be a lost message.
pub struct BroadcastViewer {
    pub viewer_id: String,
    pub host_id: String,
    link: RwLock<Option<Arc<PeerLink>>>,
    chat_log: Mutex<ChatLog>,
    joined: AtomicBool,
    live: AtomicBool,
    done: AtomicBool,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    event_tx: mpsc::UnboundedSender<ViewerEvent>,
}

/// Builder for BroadcastViewer
#[derive(Default)]
pub struct BroadcastViewerBuilder {
    viewer_id: Option<String>,
    host_id: Option<String>,
    relay_config: Option<RelayConfig>,
    session_config: Option<SessionConfig>,
}

impl BroadcastViewerBuilder {
    pub fn viewer_id(mut self, id: impl Into<String>) -> Self {
        self.viewer_id = Some(id.into());
        self
    }

    pub fn host_id(mut self, id: impl Into<String>) -> Self {
        self.host_id = Some(id.into());
        self
    }

    pub fn relay(mut self, config: RelayConfig) -> Self {
        self.relay_config = Some(config);
        self
    }

    pub fn session(mut self, config: SessionConfig) -> Self {
        self.session_config = Some(config);
        self
    }

    /// Connect the relay, prepare the viewer, and spawn the pump.
    pub async fn run(
        self,
    ) -> Result<(Arc<BroadcastViewer>, mpsc::UnboundedReceiver<ViewerEvent>, JoinHandle<()>)> {
        let viewer_id = self.viewer_id.ok_or_else(|| anyhow!("viewer_id is required"))?;
        let host_id = self.host_id.ok_or_else(|| anyhow!("host_id is required"))?;
        let relay_config = self.relay_config.ok_or_else(|| anyhow!("relay config is required"))?;
        let session_config = self.session_config.unwrap_or_default();

        let (relay, relay_rx) = Relay::connect(viewer_id.clone(), relay_config).await?;
        let (viewer, event_rx, outbound_rx) =
            BroadcastViewer::start(viewer_id, host_id, session_config).await?;

        let v = Arc::clone(&viewer);
        let handle = tokio::spawn(async move {
            v.pump(relay, relay_rx, outbound_rx).await;
        });

        Ok((viewer, event_rx, handle))
    }
}

impl BroadcastViewer {
    /// Create a builder for BroadcastViewer
    pub fn builder() -> BroadcastViewerBuilder {
        BroadcastViewerBuilder::default()
    }

    /// Construct the viewer with its connection prepared but the room not
    /// yet joined; see [`CallManager::start`] for the transport-boundary
    /// convention.
    ///
    /// [`CallManager::start`]: crate::call::CallManager::start
    pub async fn start(
        viewer_id: String,
        host_id: String,
        config: SessionConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ViewerEvent>, mpsc::UnboundedReceiver<Outbound>)>
    {
        let (link_tx, mut link_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let link =
            PeerLink::prepare(viewer_id.clone(), host_id.clone(), None, true, &config, link_tx)
                .await?;

        let viewer = Arc::new(Self {
            viewer_id,
            host_id,
            link: RwLock::new(Some(link)),
            chat_log: Mutex::new(ChatLog::new()),
            joined: AtomicBool::new(false),
            live: AtomicBool::new(false),
            done: AtomicBool::new(false),
            outbound_tx,
            event_tx,
        });

        let weak = Arc::downgrade(&viewer);
        tokio::spawn(async move {
            while let Some(event) = link_rx.recv().await {
                let Some(viewer) = weak.upgrade() else { break };
                viewer.handle_link_event(event).await;
            }
        });

        Ok((viewer, event_rx, outbound_rx))
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// The relay confirmed the connection: announce ourselves to the room.
    pub async fn handle_relay_connected(&self) {
        if self.done.load(Ordering::SeqCst) || self.joined.swap(true, Ordering::SeqCst) {
            return;
        }
        self.send_outbound(Outbound::JoinRoom { room: self.host_id.clone() });
        self.send_outbound(Outbound::Room {
            room: self.host_id.clone(),
            event: RoomEvent::Joined { id: self.viewer_id.clone(), role: RoomRole::Viewer },
        });
        info!("Joined broadcast room of {}", self.host_id);
        let _ = self.event_tx.send(ViewerEvent::Joined);
    }

    /// Entry point for decoded point-to-point signaling.
    pub async fn handle_signal(&self, envelope: Envelope) {
        let Envelope { from, body } = envelope;
        if from != self.host_id {
            warn!("Signal from {} is not our host, ignoring", from);
            return;
        }
        match body {
            SignalBody::BroadcastOffer { sdp } => {
                let link = self.link.read().await.clone();
                let Some(link) = link else {
                    debug!("Offer after teardown, ignoring");
                    return;
                };
                match link.accept_offer(sdp).await {
                    Ok(answer_sdp) => {
                        self.send_signal(SignalBody::BroadcastAnswer { sdp: answer_sdp });
                    }
                    Err(e) => error!("Failed to answer offer from {}: {}", from, e),
                }
            }
            SignalBody::Candidate { candidate } => {
                let link = self.link.read().await.clone();
                match link {
                    Some(link) => link.add_candidate(candidate).await,
                    None => trace!("Candidate after teardown, ignoring"),
                }
            }
            other => warn!("Unexpected signal from host: {:?}", other),
        }
    }

    /// Entry point for events on the broadcast room topic.
    pub async fn handle_room_event(&self, event: RoomEvent) {
        match event {
            RoomEvent::ViewerCount { count } => {
                let _ = self.event_tx.send(ViewerEvent::ViewerCount { count });
            }
            RoomEvent::Chat { message } => self.on_chat(message).await,
            RoomEvent::StreamEnded => {
                info!("Host ended the stream");
                self.shutdown(false).await;
            }
            // Other viewers coming and going is the host's concern.
            RoomEvent::Joined { .. } | RoomEvent::Left { .. } => {}
        }
    }

    pub async fn send_chat(&self, text: &str) {
        let message = ChatMessage::new(self.host_id.clone(), self.viewer_id.clone(), text);
        self.chat_log.lock().await.insert(&message.id);
        // Optimistic local append; the room echo is deduped by id.
        let _ = self.event_tx.send(ViewerEvent::Chat { message: message.clone() });
        self.send_outbound(Outbound::Room {
            room: self.host_id.clone(),
            event: RoomEvent::Chat { message },
        });
    }

    /// Leave the room and tear down. Idempotent.
    pub async fn leave(&self) {
        self.shutdown(true).await;
    }

    async fn shutdown(&self, announce: bool) {
        // The link slot doubles as the idempotence token.
        let Some(link) = self.link.write().await.take() else { return };
        if announce {
            self.send_outbound(Outbound::Room {
                room: self.host_id.clone(),
                event: RoomEvent::Left { id: self.viewer_id.clone() },
            });
        }
        self.send_outbound(Outbound::LeaveRoom { room: self.host_id.clone() });
        link.close_detached();
        self.live.store(false, Ordering::SeqCst);
        // Set last: the pump drains queued outbound before observing it.
        self.done.store(true, Ordering::SeqCst);
        if !announce {
            let _ = self.event_tx.send(ViewerEvent::StreamEnded);
        }
    }

    async fn on_chat(&self, message: ChatMessage) {
        if !self.chat_log.lock().await.insert(&message.id) {
            return;
        }
        let _ = self.event_tx.send(ViewerEvent::Chat { message });
    }

    async fn handle_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Candidate { candidate, .. } => {
                self.send_signal(SignalBody::Candidate { candidate });
            }
            LinkEvent::Track { kind, .. } => {
                if !self.live.swap(true, Ordering::SeqCst) {
                    let _ = self.event_tx.send(ViewerEvent::Live { kind });
                }
            }
            LinkEvent::Connected { .. } => debug!("Connected to host"),
            LinkEvent::Closed { .. } => {
                if !self.done.load(Ordering::SeqCst) {
                    warn!("Connection to host closed");
                    self.shutdown(false).await;
                }
            }
        }
    }

    fn send_signal(&self, body: SignalBody) {
        let envelope = Envelope { from: self.viewer_id.clone(), body };
        self.send_outbound(Outbound::Signal { to: self.host_id.clone(), envelope });
    }

    fn send_outbound(&self, outbound: Outbound) {
        if self.outbound_tx.send(outbound).is_err() {
            warn!("Outbound channel closed");
        }
    }

    async fn pump(
        self: Arc<Self>,
        relay: Relay,
        mut relay_rx: mpsc::UnboundedReceiver<RelayEvent>,
        mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    ) {
        loop {
            tokio::select! {
                Some(event) = relay_rx.recv() => match event {
                    RelayEvent::Connected => self.handle_relay_connected().await,
                    RelayEvent::Signal(envelope) => self.handle_signal(envelope).await,
                    RelayEvent::Room { room, event } if room == self.host_id => {
                        self.handle_room_event(event).await;
                    }
                    RelayEvent::Room { room, .. } => trace!("Event for foreign room {}", room),
                    RelayEvent::Disconnected => {
                        warn!("Relay disconnected, viewer exiting");
                        break;
                    }
                    RelayEvent::PeerOnline(_) | RelayEvent::PeerOffline(_) => {}
                },
                Some(outbound) = outbound_rx.recv() => {
                    if let Err(e) = deliver(&relay, outbound).await {
                        error!("Relay publish failed: {}", e);
                    }
                }
                else => break,
            }
            if self.done.load(Ordering::SeqCst) {
                while let Ok(outbound) = outbound_rx.try_recv() {
                    if let Err(e) = deliver(&relay, outbound).await {
                        error!("Relay publish failed: {}", e);
                    }
                }
                break;
            }
        }
        debug!("BroadcastViewer pump exited");
    }
}
