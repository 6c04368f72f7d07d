use anyhow::Result;
use relay::{Envelope, Relay, RoomEvent};

/// Commands a controller emits toward the relay. Controllers stay
/// transport-free: they consume decoded relay events and push these; each
/// manager's pump drains them into the connected [`Relay`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Signal { to: String, envelope: Envelope },
    Room { room: String, event: RoomEvent },
    JoinRoom { room: String },
    LeaveRoom { room: String },
    WatchStatus { peer: String },
    UnwatchStatus { peer: String },
}

pub(crate) async fn deliver(relay: &Relay, outbound: Outbound) -> Result<()> {
    match outbound {
        Outbound::Signal { to, envelope } => relay.send_signal(&to, &envelope).await,
        Outbound::Room { room, event } => relay.publish_room(&room, &event).await,
        Outbound::JoinRoom { room } => relay.join_room(&room).await,
        Outbound::LeaveRoom { room } => relay.leave_room(&room).await,
        Outbound::WatchStatus { peer } => relay.watch_peer_status(&peer).await,
        Outbound::UnwatchStatus { peer } => relay.unwatch_peer_status(&peer).await,
    }
}
