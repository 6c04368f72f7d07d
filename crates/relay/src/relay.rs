use anyhow::Result;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::RelayConfig;
use crate::message::{Envelope, PeerStatus, RoomEvent};
use crate::topics;

#[derive(Debug)]
pub enum RelayEvent {
    Signal(Envelope),
    Room { room: String, event: RoomEvent },
    PeerOnline(String),
    PeerOffline(String),
    Connected,
    Disconnected,
}

/// Client for the external signaling relay (an MQTT broker, treated as a
/// black-box publish/subscribe transport).
///
/// On broker ConnAck the client publishes retained online presence,
/// subscribes its own signal topic, and emits [`RelayEvent::Connected`].
/// Consumers that join rooms must gate the join on that event.
pub struct Relay {
    id: String,
    client: AsyncClient,
    event_loop_handle: JoinHandle<()>,
}

impl Relay {
    pub async fn connect(
        id: String,
        config: RelayConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RelayEvent>)> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let status_topic = topics::status_topic(&id);
        let signal_topic = topics::signal_topic(&id);

        let mut mqtt_options = MqttOptions::new(&id, &config.broker_host, config.broker_port);
        mqtt_options.set_keep_alive(std::time::Duration::from_secs(config.keep_alive));
        mqtt_options.set_clean_session(config.clean_session);

        if let (Some(ref user), Some(ref pass)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(user, pass);
        }

        mqtt_options.set_last_will(rumqttc::LastWill {
            topic: status_topic.clone(),
            message: PeerStatus::Offline.as_ref().as_bytes().to_vec().into(),
            qos: QoS::ExactlyOnce,
            retain: true,
        });

        let (client, event_loop) = AsyncClient::new(mqtt_options, 10);

        let event_loop_handle = Self::start_event_loop(
            event_loop,
            event_tx,
            client.clone(),
            status_topic,
            signal_topic,
        );

        Ok((Self { id, client, event_loop_handle }, event_rx))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn watch_peer_status(&self, peer_id: &str) -> Result<()> {
        self.client.subscribe(topics::status_topic(peer_id), QoS::ExactlyOnce).await?;
        Ok(())
    }

    pub async fn unwatch_peer_status(&self, peer_id: &str) -> Result<()> {
        self.client.unsubscribe(topics::status_topic(peer_id)).await?;
        Ok(())
    }

    pub async fn send_signal(&self, to: &str, envelope: &Envelope) -> Result<()> {
        let payload = serde_json::to_string(envelope)?;
        self.client
            .publish(topics::signal_topic(to), QoS::ExactlyOnce, false, payload.into_bytes())
            .await?;
        Ok(())
    }

    pub async fn join_room(&self, room_id: &str) -> Result<()> {
        self.client.subscribe(topics::room_topic(room_id), QoS::ExactlyOnce).await?;
        Ok(())
    }

    pub async fn leave_room(&self, room_id: &str) -> Result<()> {
        self.client.unsubscribe(topics::room_topic(room_id)).await?;
        Ok(())
    }

    pub async fn publish_room(&self, room_id: &str, event: &RoomEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        self.client
            .publish(topics::room_topic(room_id), QoS::ExactlyOnce, false, payload.into_bytes())
            .await?;
        Ok(())
    }

    fn start_event_loop(
        mut event_loop: EventLoop,
        event_tx: mpsc::UnboundedSender<RelayEvent>,
        client: AsyncClient,
        status_topic: String,
        signal_topic: String,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(event) => match event {
                        Event::Incoming(Packet::ConnAck(_)) => {
                            if let Err(e) = client
                                .publish(
                                    &status_topic,
                                    QoS::ExactlyOnce,
                                    true,
                                    PeerStatus::Online.as_ref().as_bytes(),
                                )
                                .await
                            {
                                tracing::error!("Failed to publish online status: {}", e);
                                break;
                            }
                            if let Err(e) = client.subscribe(&signal_topic, QoS::ExactlyOnce).await
                            {
                                tracing::error!("Failed to subscribe signal topic: {}", e);
                                break;
                            }
                            let _ = event_tx.send(RelayEvent::Connected);
                        }
                        Event::Incoming(Packet::Publish(p)) => {
                            Self::handle_publish(&event_tx, p);
                        }
                        Event::Incoming(Packet::Disconnect) => {
                            tracing::warn!("Disconnected from relay broker");
                            let _ = event_tx.send(RelayEvent::Disconnected);
                        }
                        _ => {}
                    },
                    Err(e) => {
                        tracing::error!("Relay event loop error: {}", e);
                        break;
                    }
                }
            }
            tracing::error!("Relay event loop exited");
            let _ = event_tx.send(RelayEvent::Disconnected);
        })
    }

    fn handle_publish(event_tx: &mpsc::UnboundedSender<RelayEvent>, p: rumqttc::Publish) {
        if let Some(peer_id) = topics::split_status_topic(&p.topic) {
            let status = String::from_utf8_lossy(&p.payload);
            let event = match status.parse::<PeerStatus>() {
                Ok(PeerStatus::Online) => RelayEvent::PeerOnline(peer_id),
                Ok(PeerStatus::Offline) => RelayEvent::PeerOffline(peer_id),
                Err(_) => return,
            };
            let _ = event_tx.send(event);
        } else if topics::split_signal_topic(&p.topic).is_some() {
            match serde_json::from_slice::<Envelope>(&p.payload) {
                Ok(envelope) => {
                    let _ = event_tx.send(RelayEvent::Signal(envelope));
                }
                Err(e) => warn!("Dropping undecodable signal on {}: {}", p.topic, e),
            }
        } else if let Some(room) = topics::split_room_topic(&p.topic) {
            match serde_json::from_slice::<RoomEvent>(&p.payload) {
                Ok(event) => {
                    let _ = event_tx.send(RelayEvent::Room { room, event });
                }
                Err(e) => warn!("Dropping undecodable room event on {}: {}", p.topic, e),
            }
        } else {
            warn!("Unknown topic: {}", &p.topic);
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        tracing::info!("Dropping relay client for {}", self.id);
        self.event_loop_handle.abort();
    }
}
