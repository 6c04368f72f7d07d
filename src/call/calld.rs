use anyhow::Result;
use astra_rtc::{init_runtime, RelayArgs, RtcArgs};
use clap::Parser;
use relay::CallKind;
use session::{CallEvent, CallManager};

#[derive(Parser, Debug)]
#[command(name = "calld")]
#[command(about = "Astra call daemon - place or answer a 1:1 consultation call")]
struct Args {
    /// Local user ID for signaling
    #[arg(short, long)]
    local_id: String,

    /// Remote user ID to call; waits for an incoming call when omitted
    #[arg(short, long)]
    remote_id: Option<String>,

    /// Place a video call instead of voice
    #[arg(long)]
    video: bool,

    /// Accept incoming calls without prompting
    #[arg(long)]
    auto_accept: bool,

    #[command(flatten)]
    relay: RelayArgs,

    #[command(flatten)]
    rtc: RtcArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_runtime();

    let args = Args::parse();

    let (manager, mut events, pump) = CallManager::builder()
        .local_id(&args.local_id)
        .relay(args.relay.to_config()?)
        .session(args.rtc.to_config())
        .run()
        .await?;
    let mut pump = pump;

    if let Some(remote_id) = &args.remote_id {
        let kind = if args.video { CallKind::Video } else { CallKind::Voice };
        manager.start_call(remote_id, kind).await?;
    } else {
        tracing::info!("Waiting for incoming calls as {}", args.local_id);
    }

    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                CallEvent::IncomingCall { from, kind } => {
                    tracing::info!("Incoming {} call from {}", kind, from);
                    if args.auto_accept {
                        manager.accept_call().await?;
                    } else {
                        tracing::info!("Not accepting (run with --auto-accept), declining");
                        manager.reject_call().await?;
                    }
                }
                CallEvent::OutgoingRinging { to, .. } => tracing::info!("Ringing {}...", to),
                CallEvent::Activated { remote_id, media_unavailable } => {
                    if media_unavailable {
                        tracing::warn!("In call with {} - local audio/video unavailable", remote_id);
                    } else {
                        tracing::info!("In call with {}", remote_id);
                    }
                }
                CallEvent::RemoteMedia { remote_id, kind } => {
                    tracing::info!("Receiving {} from {}", kind, remote_id);
                }
                CallEvent::Ended { remote_id, reason } => {
                    tracing::info!("Call with {} ended: {:?}", remote_id, reason);
                    if args.remote_id.is_some() {
                        break;
                    }
                }
            },
            _ = &mut pump => {
                tracing::info!("Relay connection lost");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Hanging up...");
                manager.hang_up().await;
                break;
            }
        }
    }

    Ok(())
}
