use crate::config::SessionConfig;
use crate::link::{LinkEvent, PeerLink};
use crate::media::{LocalMedia, MediaCapture, SampleCapture};
use crate::outbound::{deliver, Outbound};
use anyhow::{anyhow, Result};
use relay::{CallKind, Envelope, Relay, RelayConfig, RelayEvent, SignalBody};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// UI-facing view of the call slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    OutgoingRinging,
    IncomingRinging,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    Declined,
    RingTimeout,
    PeerOffline,
    LinkFailed,
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    IncomingCall { from: String, kind: CallKind },
    OutgoingRinging { to: String, kind: CallKind },
    /// Both sides reach this when the answer lands. `media_unavailable`
    /// means the local side runs degraded (no capture permission) and the
    /// UI should say so.
    Activated { remote_id: String, media_unavailable: bool },
    RemoteMedia { remote_id: String, kind: String },
    Ended { remote_id: String, reason: EndReason },
}

enum CallSlot {
    Idle,
    Outgoing {
        remote_id: String,
        kind: CallKind,
        link: Arc<PeerLink>,
        media: LocalMedia,
        ring: AbortHandle,
    },
    Incoming {
        remote_id: String,
        kind: CallKind,
        offer_sdp: String,
        ring: AbortHandle,
    },
    Active {
        remote_id: String,
        kind: CallKind,
        link: Arc<PeerLink>,
        media: LocalMedia,
    },
}

/// Negotiates and runs at most one 1:1 call.
///
/// State machine: `Idle -> OutgoingRinging -> Active -> Idle` and
/// `Idle -> IncomingRinging -> {Active | Idle}`. Every termination trigger
/// (local hangup, remote hangup, decline, ring timeout, peer offline, link
/// failure) funnels through one idempotent `cleanup`.
pub struct CallManager {
    pub local_id: String,
    config: SessionConfig,
    capture: Arc<dyn MediaCapture>,
    slot: RwLock<CallSlot>,
    /// Bumped on every teardown; awaits re-check it so media acquired for a
    /// call that ended mid-flight is discarded, never attached.
    generation: AtomicU64,
    online_notify: RwLock<Option<(String, Arc<Notify>)>>,
    /// Handed to spawned timers so they never keep the manager alive.
    weak_self: Weak<CallManager>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    event_tx: mpsc::UnboundedSender<CallEvent>,
}

/// Builder for CallManager
#[derive(Default)]
pub struct CallManagerBuilder {
    local_id: Option<String>,
    relay_config: Option<RelayConfig>,
    session_config: Option<SessionConfig>,
    capture: Option<Arc<dyn MediaCapture>>,
}

impl CallManagerBuilder {
    pub fn local_id(mut self, id: impl Into<String>) -> Self {
        self.local_id = Some(id.into());
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

    /// Connect the relay, start the manager, and spawn the pump.
    pub async fn run(
        self,
    ) -> Result<(Arc<CallManager>, mpsc::UnboundedReceiver<CallEvent>, JoinHandle<()>)> {
        let local_id = self.local_id.ok_or_else(|| anyhow!("local_id is required"))?;
        let relay_config = self.relay_config.ok_or_else(|| anyhow!("relay config is required"))?;
        let session_config = self.session_config.unwrap_or_default();
        let capture = self.capture.unwrap_or_else(|| Arc::new(SampleCapture));

        let (relay, relay_rx) = Relay::connect(local_id.clone(), relay_config).await?;
        let (manager, event_rx, outbound_rx) = CallManager::start(local_id, session_config, capture);

        let m = Arc::clone(&manager);
        let handle = tokio::spawn(async move {
            m.pump(relay, relay_rx, outbound_rx).await;
        });

        Ok((manager, event_rx, handle))
    }
}

impl CallManager {
    /// Create a builder for CallManager
    pub fn builder() -> CallManagerBuilder {
        CallManagerBuilder::default()
    }

    /// Construct the manager without a relay; the caller owns both ends of
    /// the outbound channel and the decoded-event entry points. This is the
    /// transport boundary — the pump wires it to a [`Relay`].
    pub fn start(
        local_id: String,
        config: SessionConfig,
        capture: Arc<dyn MediaCapture>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CallEvent>, mpsc::UnboundedReceiver<Outbound>) {
        let (link_tx, mut link_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let manager = Arc::new_cyclic(|weak| Self {
            local_id,
            config,
            capture,
            slot: RwLock::new(CallSlot::Idle),
            generation: AtomicU64::new(0),
            online_notify: RwLock::new(None),
            weak_self: weak.clone(),
            link_tx,
            outbound_tx,
            event_tx,
        });

        let weak = Arc::downgrade(&manager);
        tokio::spawn(async move {
            while let Some(event) = link_rx.recv().await {
                let Some(manager) = weak.upgrade() else { break };
                manager.handle_link_event(event).await;
            }
        });

        (manager, event_rx, outbound_rx)
    }

    pub async fn state(&self) -> CallState {
        match &*self.slot.read().await {
            CallSlot::Idle => CallState::Idle,
            CallSlot::Outgoing { .. } => CallState::OutgoingRinging,
            CallSlot::Incoming { .. } => CallState::IncomingRinging,
            CallSlot::Active { .. } => CallState::Active,
        }
    }

    /// Dial `remote_id`. Waits for their presence, acquires local media
    /// (degrading on permission denial), sends the offer, and rings until
    /// answered or `ring_timeout`.
    pub async fn start_call(&self, remote_id: &str, kind: CallKind) -> Result<()> {
        if !matches!(&*self.slot.read().await, CallSlot::Idle) {
            return Err(anyhow!("a call is already in progress"));
        }
        let gen = self.generation.load(Ordering::SeqCst);

        self.wait_remote_online(remote_id, gen).await?;

        let media = self.acquire_or_degrade(kind);
        if self.generation.load(Ordering::SeqCst) != gen {
            media.stop();
            return Err(anyhow!("call canceled while acquiring media"));
        }

        let link = PeerLink::prepare(
            self.local_id.clone(),
            remote_id.to_string(),
            Some(&media),
            kind.wants_video(),
            &self.config,
            self.link_tx.clone(),
        )
        .await?;
        let offer_sdp = link.start_offer().await?;

        {
            let mut slot = self.slot.write().await;
            if self.generation.load(Ordering::SeqCst) != gen
                || !matches!(&*slot, CallSlot::Idle)
            {
                drop(slot);
                media.stop();
                link.close_detached();
                return Err(anyhow!("call canceled during setup"));
            }
            let ring = self.arm_ring_timer(gen);
            *slot = CallSlot::Outgoing {
                remote_id: remote_id.to_string(),
                kind,
                link,
                media,
                ring,
            };
        }

        self.send_signal(remote_id, SignalBody::CallOffer { sdp: offer_sdp, media: kind });
        let _ = self.event_tx.send(CallEvent::OutgoingRinging { to: remote_id.to_string(), kind });
        info!("Calling {} ({})", remote_id, kind);
        Ok(())
    }

    /// Accept the ringing incoming call. Acquires local media with the same
    /// degraded fallback, answers, and goes active.
    pub async fn accept_call(&self) -> Result<()> {
        let (remote_id, kind, offer_sdp) = match &*self.slot.read().await {
            CallSlot::Incoming { remote_id, kind, offer_sdp, .. } => {
                (remote_id.clone(), *kind, offer_sdp.clone())
            }
            _ => return Err(anyhow!("no incoming call to accept")),
        };
        let gen = self.generation.load(Ordering::SeqCst);

        let media = self.acquire_or_degrade(kind);
        if self.generation.load(Ordering::SeqCst) != gen {
            media.stop();
            return Err(anyhow!("call ended while acquiring media"));
        }

        let link = PeerLink::prepare(
            self.local_id.clone(),
            remote_id.clone(),
            Some(&media),
            kind.wants_video(),
            &self.config,
            self.link_tx.clone(),
        )
        .await?;
        let answer_sdp = link.accept_offer(offer_sdp).await?;

        let media_unavailable = media.is_unavailable();
        {
            let mut slot = self.slot.write().await;
            match std::mem::replace(&mut *slot, CallSlot::Idle) {
                CallSlot::Incoming { remote_id: ref rid, ref ring, .. } if *rid == remote_id => {
                    ring.abort();
                    *slot = CallSlot::Active { remote_id: remote_id.clone(), kind, link, media };
                }
                other => {
                    *slot = other;
                    drop(slot);
                    media.stop();
                    link.close_detached();
                    return Err(anyhow!("call ended during accept"));
                }
            }
        }

        self.send_signal(&remote_id, SignalBody::CallAnswer { sdp: answer_sdp });
        let _ = self.event_tx.send(CallEvent::Activated {
            remote_id: remote_id.clone(),
            media_unavailable,
        });
        info!("Accepted call from {}", remote_id);
        Ok(())
    }

    /// Decline the ringing incoming call. No media is ever acquired.
    pub async fn reject_call(&self) -> Result<()> {
        if !matches!(&*self.slot.read().await, CallSlot::Incoming { .. }) {
            return Err(anyhow!("no incoming call to reject"));
        }
        self.cleanup(EndReason::Declined, true).await;
        Ok(())
    }

    /// Hang up whatever call is in progress. Safe to call at any time.
    pub async fn hang_up(&self) {
        self.cleanup(EndReason::LocalHangup, true).await;
    }

    pub async fn set_audio_enabled(&self, enabled: bool) {
        if let CallSlot::Outgoing { media, .. } | CallSlot::Active { media, .. } =
            &*self.slot.read().await
        {
            media.set_audio_enabled(enabled);
        }
    }

    pub async fn set_video_enabled(&self, enabled: bool) {
        if let CallSlot::Outgoing { media, .. } | CallSlot::Active { media, .. } =
            &*self.slot.read().await
        {
            media.set_video_enabled(enabled);
        }
    }

    /// Entry point for decoded point-to-point signaling.
    pub async fn handle_signal(&self, envelope: Envelope) {
        let Envelope { from, body } = envelope;
        match body {
            SignalBody::CallOffer { sdp, media } => self.on_incoming_offer(from, sdp, media).await,
            SignalBody::CallAnswer { sdp } => self.on_answer(from, sdp).await,
            SignalBody::Candidate { candidate } => self.on_candidate(from, candidate).await,
            SignalBody::CallEnd => self.on_remote_end(from).await,
            other => warn!("Unexpected signal from {}: {:?}", from, other),
        }
    }

    pub async fn handle_peer_online(&self, peer_id: String) {
        if let Some((id, notify)) = &*self.online_notify.read().await {
            if *id == peer_id {
                notify.notify_one();
            }
        }
    }

    pub async fn handle_peer_offline(&self, peer_id: String) {
        let is_current = matches!(&*self.slot.read().await,
            CallSlot::Outgoing { remote_id, .. }
            | CallSlot::Incoming { remote_id, .. }
            | CallSlot::Active { remote_id, .. } if *remote_id == peer_id);
        if is_current {
            warn!("{} went offline, ending call", peer_id);
            self.cleanup(EndReason::PeerOffline, false).await;
        }
    }

    async fn on_incoming_offer(&self, from: String, sdp: String, kind: CallKind) {
        {
            let mut slot = self.slot.write().await;
            if !matches!(&*slot, CallSlot::Idle) {
                drop(slot);
                debug!("Busy, declining call from {}", from);
                self.send_signal(&from, SignalBody::CallEnd);
                return;
            }
            let gen = self.generation.load(Ordering::SeqCst);
            let ring = self.arm_ring_timer(gen);
            *slot = CallSlot::Incoming { remote_id: from.clone(), kind, offer_sdp: sdp, ring };
        }
        info!("Incoming {} call from {}", kind, from);
        let _ = self.event_tx.send(CallEvent::IncomingCall { from, kind });
    }

    async fn on_answer(&self, from: String, sdp: String) {
        let promoted = {
            let mut slot = self.slot.write().await;
            match std::mem::replace(&mut *slot, CallSlot::Idle) {
                CallSlot::Outgoing { remote_id, kind, link, media, ring } if remote_id == from => {
                    ring.abort();
                    let media_unavailable = media.is_unavailable();
                    *slot = CallSlot::Active {
                        remote_id,
                        kind,
                        link: Arc::clone(&link),
                        media,
                    };
                    Some((link, media_unavailable))
                }
                other => {
                    *slot = other;
                    None
                }
            }
        };
        let Some((link, media_unavailable)) = promoted else {
            debug!("Ignoring answer from {} with no matching outgoing call", from);
            return;
        };

        if let Err(e) = link.set_remote_answer(sdp).await {
            error!("Failed to apply answer from {}: {}", from, e);
            self.cleanup(EndReason::LinkFailed, true).await;
            return;
        }
        let _ = self.event_tx.send(CallEvent::Activated { remote_id: from.clone(), media_unavailable });
        info!("Call with {} active", from);
    }

    async fn on_candidate(&self, from: String, candidate: String) {
        let link = match &*self.slot.read().await {
            CallSlot::Outgoing { remote_id, link, .. }
            | CallSlot::Active { remote_id, link, .. }
                if *remote_id == from =>
            {
                Some(Arc::clone(link))
            }
            _ => None,
        };
        match link {
            Some(link) => link.add_candidate(candidate).await,
            None => trace!("Ignoring candidate from {} with no live connection", from),
        }
    }

    async fn on_remote_end(&self, from: String) {
        let reason = match &*self.slot.read().await {
            CallSlot::Outgoing { remote_id, .. } if *remote_id == from => Some(EndReason::Declined),
            CallSlot::Incoming { remote_id, .. } if *remote_id == from => {
                Some(EndReason::RemoteHangup)
            }
            CallSlot::Active { remote_id, .. } if *remote_id == from => Some(EndReason::RemoteHangup),
            _ => None,
        };
        match reason {
            Some(reason) => self.cleanup(reason, false).await,
            None => debug!("Ignoring end from {} with no matching call", from),
        }
    }

    async fn handle_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Candidate { remote_id, candidate } => {
                self.send_signal(&remote_id, SignalBody::Candidate { candidate });
            }
            LinkEvent::Track { remote_id, kind } => {
                let _ = self.event_tx.send(CallEvent::RemoteMedia { remote_id, kind });
            }
            LinkEvent::Connected { remote_id } => debug!("{} connected", remote_id),
            LinkEvent::Closed { remote_id } => {
                // Only react when the current call's link died underneath us;
                // closes triggered by our own cleanup find the slot idle.
                let is_current = matches!(&*self.slot.read().await,
                    CallSlot::Outgoing { remote_id: r, link, .. }
                    | CallSlot::Active { remote_id: r, link, .. }
                        if *r == remote_id && !link.is_active());
                if is_current {
                    self.cleanup(EndReason::LinkFailed, false).await;
                }
            }
        }
    }

    /// The single teardown path. Invoked from every termination trigger and
    /// idempotent: a second invocation finds the slot idle and returns.
    async fn cleanup(&self, reason: EndReason, notify_remote: bool) {
        let (remote_id, link, media) = {
            let mut slot = self.slot.write().await;
            match std::mem::replace(&mut *slot, CallSlot::Idle) {
                CallSlot::Idle => return,
                CallSlot::Outgoing { remote_id, link, media, ring, .. } => {
                    ring.abort();
                    (remote_id, Some(link), Some(media))
                }
                CallSlot::Incoming { remote_id, ring, .. } => {
                    ring.abort();
                    (remote_id, None, None)
                }
                CallSlot::Active { remote_id, link, media, .. } => {
                    (remote_id, Some(link), Some(media))
                }
            }
        };
        self.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(media) = media {
            media.stop();
        }
        if let Some(link) = link {
            link.close_detached();
        }
        if notify_remote {
            self.send_signal(&remote_id, SignalBody::CallEnd);
        }
        self.send_outbound(Outbound::UnwatchStatus { peer: remote_id.clone() });
        info!("Call with {} ended: {:?}", remote_id, reason);
        let _ = self.event_tx.send(CallEvent::Ended { remote_id, reason });
    }

    fn arm_ring_timer(&self, gen: u64) -> AbortHandle {
        let weak = self.weak_self.clone();
        let ring_timeout = self.config.ring_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ring_timeout).await;
            if let Some(manager) = weak.upgrade() {
                if manager.generation.load(Ordering::SeqCst) == gen {
                    debug!("Ring timeout");
                    manager.cleanup(EndReason::RingTimeout, true).await;
                }
            }
        });
        handle.abort_handle()
    }

    async fn wait_remote_online(&self, remote_id: &str, gen: u64) -> Result<()> {
        let notify = Arc::new(Notify::new());
        *self.online_notify.write().await = Some((remote_id.to_string(), notify.clone()));
        self.send_outbound(Outbound::WatchStatus { peer: remote_id.to_string() });

        let result = match timeout(self.config.online_timeout, notify.notified()).await {
            Ok(_) => Ok(()),
            Err(_) => Err(anyhow!(
                "Timeout waiting for {} to come online ({}s)",
                remote_id,
                self.config.online_timeout.as_secs()
            )),
        };
        *self.online_notify.write().await = None;
        if result.is_err() {
            self.send_outbound(Outbound::UnwatchStatus { peer: remote_id.to_string() });
        }
        if result.is_ok() && self.generation.load(Ordering::SeqCst) != gen {
            return Err(anyhow!("call canceled"));
        }
        result
    }

    fn acquire_or_degrade(&self, kind: CallKind) -> LocalMedia {
        match self.capture.acquire(kind) {
            Ok(media) => media,
            Err(e) => {
                warn!("Capture failed ({}), continuing without local media", e);
                LocalMedia::unavailable()
            }
        }
    }

    fn send_signal(&self, to: &str, body: SignalBody) {
        let envelope = Envelope { from: self.local_id.clone(), body };
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
                    RelayEvent::PeerOnline(id) => self.handle_peer_online(id).await,
                    RelayEvent::PeerOffline(id) => self.handle_peer_offline(id).await,
                    RelayEvent::Connected => debug!("Relay connected"),
                    RelayEvent::Disconnected => {
                        warn!("Relay disconnected, call manager exiting");
                        break;
                    }
                    RelayEvent::Room { .. } => {}
                },
                Some(outbound) = outbound_rx.recv() => {
                    if let Err(e) = deliver(&relay, outbound).await {
                        error!("Relay publish failed: {}", e);
                    }
                }
                else => break,
            }
        }
        self.cleanup(EndReason::LinkFailed, false).await;
        debug!("CallManager pump exited");
    }
}
