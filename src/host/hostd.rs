use anyhow::Result;
use astra_rtc::{init_runtime, RelayArgs, RtcArgs};
use clap::Parser;
use session::{BroadcastHost, HostEvent};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "hostd")]
#[command(about = "Astra broadcast daemon - go live and fan out to viewers")]
struct Args {
    /// Host ID; doubles as the broadcast room ID
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

    let (host, mut events, pump) = BroadcastHost::builder()
        .host_id(&args.host_id)
        .relay(args.relay.to_config()?)
        .session(args.rtc.to_config())
        .run()
        .await?;
    let mut pump = pump;

    host.go_live().await?;

    let mut confirm = BufReader::new(tokio::io::stdin());
    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                HostEvent::Live => tracing::info!("Broadcasting as {}", args.host_id),
                HostEvent::ViewerJoined { viewer_id, count } => {
                    tracing::info!("{} joined, {} watching", viewer_id, count);
                }
                HostEvent::ViewerLeft { viewer_id, count } => {
                    tracing::info!("{} left, {} watching", viewer_id, count);
                }
                HostEvent::Chat { message } => {
                    tracing::info!("[{}] {}", message.user, message.text);
                }
                HostEvent::Ended => {
                    tracing::info!("Stream ended");
                    break;
                }
            },
            _ = &mut pump => {
                tracing::info!("Relay connection lost");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                // Ending the stream kicks every viewer; ask first.
                eprintln!("End the live stream for everyone? [y/N]");
                let mut line = String::new();
                confirm.read_line(&mut line).await?;
                if line.trim().eq_ignore_ascii_case("y") {
                    host.end_live().await;
                } else {
                    tracing::info!("Still live");
                }
            }
        }
    }

    Ok(())
}
