use crate::config::{SessionConfig, RTC_API};
use crate::media::LocalMedia;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::TrackLocal;

#[derive(Debug, Clone)]
pub enum LinkEvent {
    Candidate { remote_id: String, candidate: String },
    Track { remote_id: String, kind: String },
    Connected { remote_id: String },
    Closed { remote_id: String },
}

/// One wrapped peer connection toward one remote party.
///
/// The single connection module shared by the call, host, and viewer
/// controllers: callbacks forward ICE candidates, remote tracks, and state
/// changes as [`LinkEvent`]s; SDP is produced on demand by `start_offer` /
/// `accept_offer`. Owned exclusively by the controller that created it.
pub struct PeerLink {
    pub local_id: String,
    pub remote_id: String,
    config: SessionConfig,
    pc: Arc<RTCPeerConnection>,
    connected_notify: Arc<Notify>,
    closed: AtomicBool,
}

impl PeerLink {
    /// Creates the connection, attaches local tracks, and registers
    /// callbacks. Adds receive-only transceivers for whatever we do not
    /// send, so a media-less (degraded) side still negotiates inbound
    /// media. No SDP is produced yet.
    pub async fn prepare(
        local_id: String,
        remote_id: String,
        media: Option<&LocalMedia>,
        want_video: bool,
        config: &SessionConfig,
        event_tx: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<Self>> {
        let pc = Arc::new(RTC_API.new_peer_connection(config.to_rtc_configuration()).await?);
        let connected_notify = Arc::new(Notify::new());

        Self::setup_ice_candidate_callback(&pc, event_tx.clone(), remote_id.clone());
        Self::setup_connection_state_callback(
            &pc,
            connected_notify.clone(),
            event_tx.clone(),
            remote_id.clone(),
        );
        Self::setup_track_callback(&pc, event_tx, remote_id.clone());

        let mut sends_audio = false;
        let mut sends_video = false;
        if let Some(media) = media {
            if let Some(track) = media.audio_track() {
                let sender =
                    pc.add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>).await?;
                Self::drain_rtcp(sender);
                sends_audio = true;
            }
            if let Some(track) = media.video_track() {
                let sender =
                    pc.add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>).await?;
                Self::drain_rtcp(sender);
                sends_video = true;
            }
        }
        if !sends_audio {
            pc.add_transceiver_from_kind(RTPCodecType::Audio, Some(Self::recvonly())).await?;
        }
        if want_video && !sends_video {
            pc.add_transceiver_from_kind(RTPCodecType::Video, Some(Self::recvonly())).await?;
        }

        let link = Arc::new(Self {
            local_id,
            remote_id,
            config: config.clone(),
            pc,
            connected_notify,
            closed: AtomicBool::new(false),
        });

        debug!("Link created for {}", link.remote_id);
        Ok(link)
    }

    pub async fn start_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        trace!("Offer created for {}", self.remote_id);
        Ok(offer.sdp)
    }

    pub async fn accept_offer(&self, remote_sdp: String) -> Result<String> {
        let offer = RTCSessionDescription::offer(remote_sdp)?;
        self.pc.set_remote_description(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        trace!("Answer created for {}", self.remote_id);
        Ok(answer.sdp)
    }

    pub async fn set_remote_answer(&self, remote_sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(remote_sdp)?;
        self.pc.set_remote_description(answer).await?;
        trace!("Answer set for {}", self.remote_id);
        Ok(())
    }

    /// Late, duplicate, and stale candidates are expected; failures are
    /// swallowed.
    pub async fn add_candidate(&self, candidate: String) {
        let init = RTCIceCandidateInit { candidate, ..Default::default() };
        if let Err(e) = self.pc.add_ice_candidate(init).await {
            debug!("Ignoring candidate for {}: {}", self.remote_id, e);
        }
    }

    pub async fn wait_connected(&self) -> Result<()> {
        match timeout(self.config.connect_timeout, self.connected_notify.notified()).await {
            Ok(_) => Ok(()),
            Err(_) => Err(anyhow::anyhow!(
                "Timeout waiting for connection to {} ({}s)",
                self.remote_id,
                self.config.connect_timeout.as_secs()
            )),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && !matches!(
                self.pc.connection_state(),
                RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed
                    | RTCPeerConnectionState::Disconnected
            )
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            warn!("Failed to close connection for {}: {}", self.remote_id, e);
        }
        debug!("Closed connection for {}", self.remote_id);
    }

    /// Fire-and-forget close for callers that must not await (teardown
    /// fan-out, drop paths).
    pub fn close_detached(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pc = Arc::clone(&self.pc);
        let remote_id = self.remote_id.clone();
        tokio::spawn(async move {
            if let Err(e) = pc.close().await {
                warn!("Failed to close connection for {}: {}", remote_id, e);
            }
            debug!("Closed connection for {}", remote_id);
        });
    }

    fn recvonly() -> RTCRtpTransceiverInit {
        RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        }
    }

    fn drain_rtcp(sender: Arc<RTCRtpSender>) {
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
    }

    fn setup_ice_candidate_callback(
        pc: &RTCPeerConnection,
        event_tx: mpsc::UnboundedSender<LinkEvent>,
        remote_id: String,
    ) {
        pc.on_ice_candidate(Box::new(move |c| {
            let event_tx = event_tx.clone();
            let remote_id = remote_id.clone();
            Box::pin(async move {
                if let Some(candidate) = c {
                    if let Ok(json) = candidate.to_json() {
                        let _ = event_tx
                            .send(LinkEvent::Candidate { remote_id, candidate: json.candidate });
                    }
                }
            })
        }));
    }

    fn setup_connection_state_callback(
        pc: &RTCPeerConnection,
        notify: Arc<Notify>,
        event_tx: mpsc::UnboundedSender<LinkEvent>,
        remote_id: String,
    ) {
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let notify = notify.clone();
            let event_tx = event_tx.clone();
            let rid = remote_id.clone();
            Box::pin(async move {
                trace!("Connection state for {}: {:?}", rid, state);
                match state {
                    RTCPeerConnectionState::Connected => {
                        notify.notify_one();
                        let _ = event_tx.send(LinkEvent::Connected { remote_id: rid });
                    }
                    RTCPeerConnectionState::Disconnected => {
                        debug!("Connection disconnected for {}", rid);
                        let _ = event_tx.send(LinkEvent::Closed { remote_id: rid });
                    }
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                        let _ = event_tx.send(LinkEvent::Closed { remote_id: rid.clone() });
                        if state == RTCPeerConnectionState::Failed {
                            warn!("Connection failed for {}", rid);
                        }
                    }
                    _ => {}
                }
            })
        }));
    }

    fn setup_track_callback(
        pc: &RTCPeerConnection,
        event_tx: mpsc::UnboundedSender<LinkEvent>,
        remote_id: String,
    ) {
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let event_tx = event_tx.clone();
            let remote_id = remote_id.clone();
            Box::pin(async move {
                debug!("Remote {} track from {}", track.kind(), remote_id);
                let _ = event_tx.send(LinkEvent::Track { remote_id, kind: track.kind().to_string() });
            })
        }));
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pc = Arc::clone(&self.pc);
        let remote_id = self.remote_id.clone();
        tokio::spawn(async move {
            if let Err(e) = pc.close().await {
                warn!("Failed to close connection for {}: {}", remote_id, e);
            }
        });
        debug!("Link dropped for {}", self.remote_id);
    }
}
