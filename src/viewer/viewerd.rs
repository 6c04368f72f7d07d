use anyhow::Result;
use astra_rtc::{init_runtime, RelayArgs, RtcArgs};
use clap::Parser;
use session::{BroadcastViewer, ViewerEvent};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "viewerd")]
#[command(about = "Astra viewer daemon - watch a live broadcast and chat")]
struct Args {
    /// Local viewer ID for signaling
    #[arg(short, long)]
    viewer_id: String,

    /// Host whose broadcast to join
    #[arg(short = 'i', long)]
    host_id: String,

    #[command(flatten)]
    relay: RelayArgs,

    #[command(flatten)]
    rtc: RtcArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_runtime();

    let args = Args::parse();

    let (viewer, mut events, pump) = BroadcastViewer::builder()
        .viewer_id(&args.viewer_id)
        .host_id(&args.host_id)
        .relay(args.relay.to_config()?)
        .session(args.rtc.to_config())
        .run()
        .await?;
    let mut pump = pump;

    tracing::info!("Type a line to chat, Ctrl-C to leave");
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                ViewerEvent::Joined => tracing::info!("Joined {}'s room", args.host_id),
                ViewerEvent::Live { kind } => tracing::info!("Stream is live ({})", kind),
                ViewerEvent::ViewerCount { count } => tracing::info!("{} watching", count),
                ViewerEvent::Chat { message } => {
                    tracing::info!("[{}] {}", message.user, message.text);
                }
                ViewerEvent::StreamEnded => {
                    tracing::info!("The host ended the stream");
                    break;
                }
            },
            line = stdin.next_line() => match line {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    viewer.send_chat(line.trim()).await;
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => {
                    viewer.leave().await;
                    break;
                }
            },
            _ = &mut pump => {
                tracing::info!("Relay connection lost");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                viewer.leave().await;
                break;
            }
        }
    }

    Ok(())
}
