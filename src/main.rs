use anyhow::Context;
use callrelay::calls::{
    CallContext, CallManager, InMemorySignalingChannel, LoopbackPeerFactory, MediaEndpoint,
    SimulatedDevices,
};
use callrelay::{CallConfig, CallEvent, CallStatus, MediaKind};
use chrono::Local;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// Runs one call between two in-process parties over the in-memory store.
//
// Usage:
//   cargo run                              # voice call, default config
//   cargo run -- --video --talk-ms 2000    # video call, hang up after 2s
//   cargo run -- --config call.json        # load ICE servers and timeouts

#[derive(Parser, Debug)]
#[command(about = "Place a loopback call between two local parties")]
struct Args {
    /// Request a camera track as well as the microphone.
    #[arg(long)]
    video: bool,

    /// JSON file with a `CallConfig`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// How long the call stays up once connected.
    #[arg(long, default_value_t = 1000)]
    talk_ms: u64,

    #[arg(long, default_value = "alice")]
    caller: String,

    #[arg(long, default_value = "bob")]
    receiver: String,
}

fn party(config: &CallConfig, channel: &InMemorySignalingChannel) -> (CallManager, mpsc::UnboundedReceiver<CallEvent>) {
    let ctx = CallContext::new(
        config.clone(),
        Arc::new(channel.clone()),
        MediaEndpoint::new(Arc::new(SimulatedDevices::new())),
        Arc::new(LoopbackPeerFactory::new()),
    );
    CallManager::new(ctx)
}

fn log_events(name: &'static str, mut events: mpsc::UnboundedReceiver<CallEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!("[{}] {:?}", name, event);
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => CallConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => CallConfig::default(),
    };
    let media_kind = if args.video {
        MediaKind::Video
    } else {
        MediaKind::Voice
    };

    let channel = InMemorySignalingChannel::new();
    let (caller, caller_events) = party(&config, &channel);
    let (receiver, receiver_events) = party(&config, &channel);
    log_events("caller", caller_events);
    log_events("receiver", receiver_events);

    let outgoing = caller
        .start_call(&args.caller, &args.receiver, media_kind)
        .await?;

    let ringing = receiver.incoming_calls(&args.receiver).await?;
    let session = ringing
        .first()
        .context("receiver sees no ringing call")?;
    info!("{} is calling {}", session.caller_id, session.receiver_id);
    let incoming = receiver.answer_call(&session.id).await?;

    let connected = tokio::time::timeout(config.connect_timeout(), async {
        outgoing.wait_connected().await && incoming.wait_connected().await
    })
    .await
    .unwrap_or(false);
    if !connected {
        warn!("Call did not connect");
    } else {
        info!(
            "Connected; caller hears {} remote track(s)",
            outgoing.snapshot().remote_tracks.len()
        );
        tokio::time::sleep(Duration::from_millis(args.talk_ms)).await;
    }

    let status = outgoing.end_call().await?;
    let remote = incoming.wait_for_status(CallStatus::Ended).await;
    info!("Caller finished as {}, receiver as {:?}", status, remote);
    Ok(())
}
