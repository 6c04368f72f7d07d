pub mod common;

pub use common::{init_runtime, RelayArgs, RtcArgs};
