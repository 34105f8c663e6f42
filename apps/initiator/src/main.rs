//! mtp-initiator: watches for MTP devices, negotiates permission, opens a
//! session and runs a write/read round trip on it.

use log::{error, info, warn};
use std::sync::Arc;

use mtp_initiator::demo::run_round_trip;
use mtp_initiator::session::{
    ChannelSink, EventFeed, EventSink, FanoutSink, LogSink, PolicyPrompt, SessionEvent, SessionManager, event_feed,
};
use mtp_initiator::settings::{Settings, load_settings};

#[cfg(any(target_os = "macos", target_os = "linux"))]
fn platform_backend(settings: &Settings) -> mtp_initiator::backend::MtpRsBackend {
    mtp_initiator::backend::MtpRsBackend::new(settings.manager_options().open_timeout)
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn platform_backend(_settings: &Settings) -> mtp_initiator::backend::UnsupportedBackend {
    mtp_initiator::backend::UnsupportedBackend
}

#[cfg(any(target_os = "macos", target_os = "linux"))]
fn start_watcher(feed: EventFeed) {
    mtp_initiator::device::DeviceWatcher::new(feed).start();
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn start_watcher(_feed: EventFeed) {
    warn!("MTP device watching is not supported on this platform");
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = load_settings();
    info!(
        "Starting mtp-initiator (auto open: {}, permission policy: {:?})",
        settings.auto_open, settings.permission
    );

    let (feed, mut queue) = event_feed();
    let prompt = Arc::new(PolicyPrompt::new(settings.permission.clone(), feed.clone()));
    let (channel_sink, mut events) = ChannelSink::new();
    let sink: Arc<dyn EventSink> = Arc::new(FanoutSink::new(vec![Box::new(LogSink), Box::new(channel_sink)]));

    let mut manager = SessionManager::new(platform_backend(&settings), prompt, sink, feed.clone())
        .with_options(settings.manager_options());
    let slot = manager.slot();

    // Runs the round trip whenever a session opens
    let demo = settings.demo.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let SessionEvent::SessionOpened { device_id, .. } = event else {
                continue;
            };
            if !demo.enabled {
                continue;
            }
            let Some(store) = slot.current() else {
                warn!("Session on {} closed before the round trip started", device_id);
                continue;
            };
            match run_round_trip(&store, &demo).await {
                Ok(report) => match serde_json::to_string(&report) {
                    Ok(json) => info!("Round trip complete: {}", json),
                    Err(e) => info!("Round trip complete: {:?} ({})", report, e),
                },
                Err(e) => error!("Round trip on {} failed: {}", device_id, e.user_message()),
            }
        }
    });

    start_watcher(feed);

    tokio::select! {
        _ = manager.run(&mut queue) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Interrupted, shutting down");
        }
    }
    manager.shutdown().await;
}
