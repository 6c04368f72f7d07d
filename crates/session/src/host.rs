use crate::chat::ChatLog;
use crate::config::SessionConfig;
use crate::link::{LinkEvent, PeerLink};
use crate::media::{LocalMedia, MediaCapture, SampleCapture};
use crate::outbound::{deliver, Outbound};
use anyhow::{anyhow, Result};
use relay::{
    CallKind, ChatMessage, Envelope, Relay, RelayConfig, RelayEvent, RoomEvent, RoomRole,
    SignalBody,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone)]
pub enum HostEvent {
    Live,
    ViewerJoined { viewer_id: String, count: u32 },
    ViewerLeft { viewer_id: String, count: u32 },
    Chat { message: ChatMessage },
    Ended,
}

/// Runs one outbound broadcast fanned out to a dynamically changing set of
/// viewers, each on its own independently negotiated connection.
///
/// All viewer links share the host's local track references, so a mute is
/// instantaneously visible on every one of them. The registry holds at most
/// one link per viewer identity; a repeat join replaces (and closes) the
/// prior entry, and one viewer's failure never affects the others.
pub struct BroadcastHost {
    pub host_id: String,
    config: SessionConfig,
    capture: Arc<dyn MediaCapture>,
    media: RwLock<Option<LocalMedia>>,
    viewers: RwLock<HashMap<String, Arc<PeerLink>>>,
    live: AtomicBool,
    chat_log: Mutex<ChatLog>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    event_tx: mpsc::UnboundedSender<HostEvent>,
}

/// Builder for BroadcastHost
#[derive(Default)]
pub struct BroadcastHostBuilder {
    host_id: Option<String>,
    relay_config: Option<RelayConfig>,
    session_config: Option<SessionConfig>,
    capture: Option<Arc<dyn MediaCapture>>,
}

impl BroadcastHostBuilder {
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

    pub fn capture(mut self, capture: Arc<dyn MediaCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Connect the relay, start the host, and spawn the pump.
    pub async fn run(
        self,
    ) -> Result<(Arc<BroadcastHost>, mpsc::UnboundedReceiver<HostEvent>, JoinHandle<()>)> {
        let host_id = self.host_id.ok_or_else(|| anyhow!("host_id is required"))?;
        let relay_config = self.relay_config.ok_or_else(|| anyhow!("relay config is required"))?;
        let session_config = self.session_config.unwrap_or_default();
        let capture = self.capture.unwrap_or_else(|| Arc::new(SampleCapture));

        let (relay, relay_rx) = Relay::connect(host_id.clone(), relay_config).await?;
        let (host, event_rx, outbound_rx) = BroadcastHost::start(host_id, session_config, capture);

        let h = Arc::clone(&host);
        let handle = tokio::spawn(async move {
            h.pump(relay, relay_rx, outbound_rx).await;
        });

        Ok((host, event_rx, handle))
    }
}

impl BroadcastHost {
    /// Create a builder for BroadcastHost
    pub fn builder() -> BroadcastHostBuilder {
        BroadcastHostBuilder::default()
    }

    /// Construct the host without a relay; see [`CallManager::start`] for
    /// the transport-boundary convention.
    ///
    /// [`CallManager::start`]: crate::call::CallManager::start
    pub fn start(
        host_id: String,
        config: SessionConfig,
        capture: Arc<dyn MediaCapture>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<HostEvent>, mpsc::UnboundedReceiver<Outbound>) {
        let (link_tx, mut link_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let host = Arc::new(Self {
            host_id,
            config,
            capture,
            media: RwLock::new(None),
            viewers: RwLock::new(HashMap::new()),
            live: AtomicBool::new(false),
            chat_log: Mutex::new(ChatLog::new()),
            link_tx,
            outbound_tx,
            event_tx,
        });

        let weak = Arc::downgrade(&host);
        tokio::spawn(async move {
            while let Some(event) = link_rx.recv().await {
                let Some(host) = weak.upgrade() else { break };
                host.handle_link_event(event).await;
            }
        });

        (host, event_rx, outbound_rx)
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub async fn viewer_count(&self) -> usize {
        self.viewers.read().await.len()
    }

    pub async fn viewer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.viewers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Acquire audio+video and announce the broadcast. A host cannot
    /// broadcast nothing, so capture failure here is an error rather than
    /// the degraded mode calls fall back to.
    pub async fn go_live(&self) -> Result<()> {
        if self.live.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("already live"));
        }
        let media = match self.capture.acquire(CallKind::Video) {
            Ok(media) => media,
            Err(e) => {
                self.live.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        *self.media.write().await = Some(media);

        self.send_outbound(Outbound::JoinRoom { room: self.host_id.clone() });
        self.send_outbound(Outbound::Room {
            room: self.host_id.clone(),
            event: RoomEvent::Joined { id: self.host_id.clone(), role: RoomRole::Host },
        });
        let _ = self.event_tx.send(HostEvent::Live);
        info!("Live as {}", self.host_id);
        Ok(())
    }

    /// Stop the broadcast: notify the room, close every viewer connection,
    /// stop local media. Idempotent. The destructive-action confirmation
    /// belongs to the caller.
    pub async fn end_live(&self) {
        if !self.live.swap(false, Ordering::SeqCst) {
            return;
        }
        self.send_outbound(Outbound::Room {
            room: self.host_id.clone(),
            event: RoomEvent::StreamEnded,
        });

        let drained: Vec<(String, Arc<PeerLink>)> =
            self.viewers.write().await.drain().collect();
        for (_, link) in &drained {
            link.close_detached();
        }
        if let Some(media) = self.media.write().await.take() {
            media.stop();
        }
        self.send_outbound(Outbound::LeaveRoom { room: self.host_id.clone() });
        let _ = self.event_tx.send(HostEvent::Ended);
        info!("Stream ended, {} viewer connections closed", drained.len());
    }

    /// Mute/unmute for every viewer at once; the links share the track refs.
    pub async fn set_audio_enabled(&self, enabled: bool) {
        if let Some(media) = &*self.media.read().await {
            media.set_audio_enabled(enabled);
        }
    }

    pub async fn set_video_enabled(&self, enabled: bool) {
        if let Some(media) = &*self.media.read().await {
            media.set_video_enabled(enabled);
        }
    }

    pub async fn send_chat(&self, text: &str) {
        let message = ChatMessage::new(self.host_id.clone(), self.host_id.clone(), text);
        self.chat_log.lock().await.insert(&message.id);
        let _ = self.event_tx.send(HostEvent::Chat { message: message.clone() });
        self.send_outbound(Outbound::Room {
            room: self.host_id.clone(),
            event: RoomEvent::Chat { message },
        });
    }

    /// Entry point for events on the broadcast room topic.
    pub async fn handle_room_event(&self, event: RoomEvent) {
        match event {
            RoomEvent::Joined { id, role: RoomRole::Viewer } => self.add_viewer(id).await,
            RoomEvent::Joined { .. } => {}
            RoomEvent::Left { id } => self.remove_viewer(&id, "left").await,
            RoomEvent::Chat { message } => self.on_chat(message).await,
            // We publish these ourselves; the echo carries nothing new.
            RoomEvent::ViewerCount { .. } | RoomEvent::StreamEnded => {}
        }
    }

    /// Entry point for decoded point-to-point signaling.
    pub async fn handle_signal(&self, envelope: Envelope) {
        let Envelope { from, body } = envelope;
        match body {
            SignalBody::BroadcastAnswer { sdp } => {
                let link = self.viewers.read().await.get(&from).map(Arc::clone);
                match link {
                    Some(link) => {
                        if let Err(e) = link.set_remote_answer(sdp).await {
                            error!("Failed to apply answer from viewer {}: {}", from, e);
                            self.remove_viewer(&from, "bad answer").await;
                        }
                    }
                    // Viewer already left; the late answer is a no-op.
                    None => debug!("Answer from unknown viewer {}, ignoring", from),
                }
            }
            SignalBody::Candidate { candidate } => {
                let link = self.viewers.read().await.get(&from).map(Arc::clone);
                match link {
                    Some(link) => link.add_candidate(candidate).await,
                    None => trace!("Candidate from unknown viewer {}, ignoring", from),
                }
            }
            other => warn!("Unexpected signal from {}: {:?}", from, other),
        }
    }

    async fn add_viewer(&self, viewer_id: String) {
        if !self.live.load(Ordering::SeqCst) {
            debug!("Ignoring viewer {} while not live", viewer_id);
            return;
        }
        let media = self.media.read().await.clone();
        let Some(media) = media else {
            warn!("No local media, cannot serve viewer {}", viewer_id);
            return;
        };

        let link = match PeerLink::prepare(
            self.host_id.clone(),
            viewer_id.clone(),
            Some(&media),
            true,
            &self.config,
            self.link_tx.clone(),
        )
        .await
        {
            Ok(link) => link,
            Err(e) => {
                error!("Failed to create connection for viewer {}: {}", viewer_id, e);
                return;
            }
        };
        let offer_sdp = match link.start_offer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                error!("Failed to create offer for viewer {}: {}", viewer_id, e);
                link.close_detached();
                return;
            }
        };

        let count = {
            let mut viewers = self.viewers.write().await;
            if let Some(old) = viewers.insert(viewer_id.clone(), Arc::clone(&link)) {
                debug!("Viewer {} rejoined, replacing previous connection", viewer_id);
                old.close_detached();
            }
            viewers.len() as u32
        };

        self.send_signal(&viewer_id, SignalBody::BroadcastOffer { sdp: offer_sdp });
        self.publish_count(count);
        info!("Viewer {} joined, total: {}", viewer_id, count);
        let _ = self.event_tx.send(HostEvent::ViewerJoined { viewer_id, count });
    }

    async fn remove_viewer(&self, viewer_id: &str, why: &str) {
        let removed = {
            let mut viewers = self.viewers.write().await;
            viewers.remove(viewer_id).map(|link| (link, viewers.len() as u32))
        };
        if let Some((link, count)) = removed {
            link.close_detached();
            self.publish_count(count);
            info!("Viewer {} removed ({}), total: {}", viewer_id, why, count);
            let _ = self
                .event_tx
                .send(HostEvent::ViewerLeft { viewer_id: viewer_id.to_string(), count });
        }
    }

    async fn on_chat(&self, message: ChatMessage) {
        if !self.chat_log.lock().await.insert(&message.id) {
            return;
        }
        let _ = self.event_tx.send(HostEvent::Chat { message });
    }

    async fn handle_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Candidate { remote_id, candidate } => {
                self.send_signal(&remote_id, SignalBody::Candidate { candidate });
            }
            LinkEvent::Connected { remote_id } => debug!("Viewer {} connected", remote_id),
            LinkEvent::Closed { remote_id } => self.try_remove_closed(&remote_id).await,
            LinkEvent::Track { .. } => {}
        }
    }

    /// Close events also fire for links we already replaced or tore down;
    /// only drop an entry that is still registered and actually dead.
    async fn try_remove_closed(&self, viewer_id: &str) {
        let dead = self
            .viewers
            .read()
            .await
            .get(viewer_id)
            .map(|link| !link.is_active())
            .unwrap_or(false);
        if dead {
            self.remove_viewer(viewer_id, "connection closed").await;
        } else {
            debug!("Close event for {} ignored, link replaced or gone", viewer_id);
        }
    }

    fn publish_count(&self, count: u32) {
        self.send_outbound(Outbound::Room {
            room: self.host_id.clone(),
            event: RoomEvent::ViewerCount { count },
        });
    }

    fn send_signal(&self, to: &str, body: SignalBody) {
        let envelope = Envelope { from: self.host_id.clone(), body };
        self.send_outbound(Outbound::Signal { to: to.to_string(), envelope });
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
                    RelayEvent::Signal(envelope) => self.handle_signal(envelope).await,
                    RelayEvent::Room { room, event } if room == self.host_id => {
                        self.handle_room_event(event).await;
                    }
                    RelayEvent::Room { room, .. } => trace!("Event for foreign room {}", room),
                    RelayEvent::Connected => debug!("Relay connected"),
                    RelayEvent::Disconnected => {
                        warn!("Relay disconnected, host exiting");
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
        }
        self.end_live().await;
        debug!("BroadcastHost pump exited");
    }
}
