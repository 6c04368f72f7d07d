mod chat;
mod link;
mod outbound;

pub mod call;
pub mod config;
pub mod host;
pub mod media;
pub mod viewer;

pub use call::{CallEvent, CallManager, CallManagerBuilder, CallState, EndReason};
pub use chat::ChatLog;
pub use config::{IceServer, SessionConfig};
pub use host::{BroadcastHost, BroadcastHostBuilder, HostEvent};
pub use media::{CaptureError, LocalMedia, MediaCapture, SampleCapture};
pub use outbound::Outbound;
pub use viewer::{BroadcastViewer, BroadcastViewerBuilder, ViewerEvent};
