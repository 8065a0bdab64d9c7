use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::{Parser, ValueEnum};
use kvs_webrtc::{MasterSession, SessionEvent, SessionOptions, SyntheticMedia, ViewerSession};
use log::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PeerRole {
    Master,
    Viewer,
}

/// Native master or viewer peer for a Kinesis Video signalling channel
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    #[arg(value_enum)]
    role: PeerRole,
    /// Config endpoint serving `GET /getConfig`
    #[arg(long, env = "KVS_CONFIG_SERVER", default_value = "http://localhost:3003")]
    server: String,
    /// Send generated audio/video instead of running receive-only
    #[arg(long)]
    synthetic_media: bool,
    /// Statistics period in milliseconds
    #[arg(long, default_value_t = 1000)]
    stats_interval_ms: u64,
}

fn log_events(events: flume::Receiver<SessionEvent>) {
    tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            match event {
                SessionEvent::RemoteTrack { client_id, track, in_view } => {
                    info!("remote {} track from {client_id} (in view: {in_view})", track.kind())
                }
                SessionEvent::DataMessage { client_id, data } => {
                    info!("data from {client_id}: {}", String::from_utf8_lossy(&data))
                }
                SessionEvent::PeerStateChange { client_id, state } => info!("peer {client_id} is {state}"),
                SessionEvent::Stats { client_id, report } => {
                    debug!("stats for {client_id}: {} entries", report.reports.len())
                }
            }
        }
    });
}

async fn run_master(options: SessionOptions, server: &str) -> Result<()> {
    let mut master = MasterSession::new(options);
    log_events(master.events());
    master.start(server).await?;
    loop {
        tokio::select! {
            running = master.step() => if !running? { break },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    master.stop().await;
    Ok(())
}

async fn run_viewer(options: SessionOptions, server: &str) -> Result<()> {
    let mut viewer = ViewerSession::new(options);
    log_events(viewer.events());
    viewer.start(server).await?;
    info!("viewing as client {}", viewer.client_id().unwrap_or_default());
    loop {
        tokio::select! {
            running = viewer.step() => if !running? { break },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    viewer.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::try_init()?;
    let args = Args::parse();

    let mut options = SessionOptions::default().set_stats_interval(Duration::from_millis(args.stats_interval_ms));
    if args.synthetic_media {
        options = options.set_media(Arc::new(SyntheticMedia::default()));
    }
    info!("starting native {:?} peer!", args.role);
    match args.role {
        PeerRole::Master => run_master(options, &args.server).await,
        PeerRole::Viewer => run_viewer(options, &args.server).await,
    }
}
