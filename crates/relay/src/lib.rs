mod config;
mod message;
mod relay;
mod topics;

pub use config::RelayConfig;
pub use message::{CallKind, ChatMessage, Envelope, PeerStatus, RoomEvent, RoomRole, SignalBody};
pub use relay::{Relay, RelayEvent};
